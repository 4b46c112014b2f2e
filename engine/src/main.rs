// eVOLVER fleet daemon
// Main entry point for the evolverd binary

use std::sync::Arc;

use clap::Parser;
use evolver_engine::cli::{Cli, Command};
use evolver_engine::config::Config;
use evolver_engine::daemon::Daemon;
use evolver_engine::device::SocketIoConnector;
use evolver_engine::manager::wall_clock;
use evolver_engine::protocol::DaemonClient;
use evolver_engine::staging::{FragmentName, StagingQueue};
use evolver_engine::telemetry::{init_client_telemetry, init_telemetry_with_level};
use sdk::types::{ExperimentAnnouncement, Request, Response};
use sdk::EvolverErrorExt;
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the config file; RUST_LOG wins over both
    let log_level = cli
        .log
        .clone()
        .unwrap_or_else(|| config.core.log_level.clone());

    if !matches!(cli.command, Command::Serve) {
        init_client_telemetry(&log_level);
    }
    let client = DaemonClient::new(
        format!("{}:{}", config.daemon.host, config.daemon.port),
        config.daemon.client_timeout(),
    );

    let response = match cli.command {
        Command::Serve => {
            init_telemetry_with_level(&log_level);
            tracing::info!("evolverd v{}", env!("CARGO_PKG_VERSION"));

            let connector = SocketIoConnector::new(
                config.device.namespace.clone(),
                config.device.connect_timeout(),
            );
            let daemon = Arc::new(Daemon::new(config, Arc::new(connector)));
            daemon.serve().await?;
            return Ok(());
        }

        Command::Initialize { name, fragments } => {
            match client
                .initialize(&ExperimentAnnouncement { name, fragments })
                .await
            {
                Ok(path) => Response::with_path(path),
                Err(e) => Response::error(format!("{} ({})", e, e.user_hint())),
            }
        }

        Command::Refill { volumes } => {
            let request = volumes
                .into_iter()
                .fold(Request::new("refill"), |request, (fluid, volume)| {
                    request.with_arg(fluid, json!(volume))
                });
            send(&client, &request).await
        }

        Command::Pause => send(&client, &Request::new("pause")).await,

        Command::Unpause => send(&client, &Request::new("unpause")).await,

        Command::Stop { name } => {
            send(&client, &Request::new("stop_exp").with_arg("name", json!(name))).await
        }

        Command::Stage { name, mode, file } => {
            let body = tokio::fs::read(&file).await?;
            let queue = StagingQueue::new(config.core.staging_dir.clone());
            let fragment = FragmentName::new(name, mode, wall_clock() as u64);
            match queue.stage_raw(&fragment, &body).await {
                Ok(path) => Response::with_path(path.display().to_string()),
                Err(e) => Response::error(format!("{} ({})", e, e.user_hint())),
            }
        }
    };

    print_response(&response, cli.json)?;
    if !response.is_ok() {
        std::process::exit(1);
    }
    Ok(())
}

async fn send(client: &DaemonClient, request: &Request) -> Response {
    match client.send(request).await {
        Ok(response) => response,
        Err(e) => Response::error(format!("{} ({})", e, e.user_hint())),
    }
}

fn print_response(response: &Response, as_json: bool) -> anyhow::Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }
    match (response.is_ok(), &response.path, &response.msg) {
        (true, Some(path), _) => println!("ok: {}", path),
        (true, None, _) => println!("ok"),
        (false, _, Some(msg)) => eprintln!("error: {}", msg),
        (false, _, None) => eprintln!("error"),
    }
    Ok(())
}
