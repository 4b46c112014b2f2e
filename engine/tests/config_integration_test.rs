//! Integration tests for configuration management
//!
//! These tests verify that the Config struct can be properly loaded,
//! validated, and processed with path expansion and directory creation.

use evolver_engine::config::Config;
use std::time::Duration;
use tempfile::TempDir;

fn write_config(temp_dir: &TempDir, body: &str) -> std::path::PathBuf {
    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(&config_path, body).unwrap();
    config_path
}

#[test]
fn test_full_config_parsing() {
    let temp_dir = TempDir::new().unwrap();
    let toml_content = format!(
        r#"
[core]
log_level = "debug"
data_dir = '{data}'
staging_dir = '{staging}'

[daemon]
host = "0.0.0.0"
port = 9100
cycle_secs = 2.5
idle_cycles = 4
client_timeout_secs = 3
min_fluid_volume = 250.0

[device]
namespace = "/dpu-evolver"
num_vials = 8
connect_timeout_secs = 7
request_timeout_secs = 2

[dilution]
bolus_volume_min = 0.4
bolus_repeat_max = 4.0
bolus_volume_max = 12.0

[alerts.custodians]
media = ["lab@example.org", "+15550100"]
"#,
        data = temp_dir.path().join("data").display(),
        staging = temp_dir.path().join("staging").display(),
    );

    let config = Config::load_from_path(&write_config(&temp_dir, &toml_content)).unwrap();

    assert_eq!(config.core.log_level, "debug");
    assert!(config.core.data_dir.is_dir());
    assert!(config.core.staging_dir.is_dir());

    assert_eq!(config.daemon.host, "0.0.0.0");
    assert_eq!(config.daemon.port, 9100);
    assert_eq!(config.daemon.cycle(), Duration::from_millis(2500));
    assert_eq!(config.daemon.client_timeout(), Duration::from_secs(3));
    assert_eq!(config.daemon.pending_deadline(), Duration::from_secs(10));
    assert_eq!(config.daemon.min_fluid_volume, 250.0);

    assert_eq!(config.device.namespace, "/dpu-evolver");
    assert_eq!(config.device.num_vials, 8);
    assert_eq!(config.device.connect_timeout(), Duration::from_secs(7));
    assert_eq!(config.device.request_timeout(), Duration::from_secs(2));

    assert_eq!(config.dilution.bolus_volume_min, 0.4);
    assert_eq!(config.dilution.bolus_repeat_max, 4.0);
    assert_eq!(config.dilution.bolus_volume_max, 12.0);

    assert_eq!(config.alerts.custodians["media"].len(), 2);
}

#[test]
fn test_minimal_config_with_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let toml_content = format!(
        "[core]\ndata_dir = '{}'\nstaging_dir = '{}'\n",
        temp_dir.path().join("data").display(),
        temp_dir.path().join("staging").display(),
    );

    let config = Config::load_from_path(&write_config(&temp_dir, &toml_content)).unwrap();

    assert_eq!(config.core.log_level, "info");
    assert_eq!(config.daemon.port, 8800);
    assert_eq!(config.daemon.idle_cycles, 10);
    assert_eq!(config.device.num_vials, 16);
    assert!(config.alerts.custodians.is_empty());
}

#[test]
fn test_invalid_log_level_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_config(&temp_dir, "[core]\nlog_level = \"chatty\"\n");

    let err = Config::load_from_path(&path).unwrap_err();
    assert!(err.to_string().contains("Invalid log level"));
}

#[test]
fn test_bad_timings_are_rejected() {
    let temp_dir = TempDir::new().unwrap();
    for daemon in ["cycle_secs = 0.0", "cycle_secs = -1.0", "idle_cycles = 0"] {
        let body = format!(
            "[core]\ndata_dir = '{}'\n\n[daemon]\n{}\n",
            temp_dir.path().display(),
            daemon
        );
        let path = write_config(&temp_dir, &body);
        assert!(Config::load_from_path(&path).is_err(), "{} accepted", daemon);
    }
}

#[test]
fn test_inconsistent_bolus_limits_are_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let body = format!(
        "[core]\ndata_dir = '{}'\n\n[dilution]\nbolus_volume_min = 5.0\nbolus_repeat_max = 1.0\n",
        temp_dir.path().display()
    );
    let path = write_config(&temp_dir, &body);
    assert!(Config::load_from_path(&path).is_err());
}

#[test]
fn test_missing_file_is_a_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let err = Config::load_from_path(&temp_dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}
