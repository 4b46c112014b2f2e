//! Integration tests for device sessions
//!
//! Feeds loopback broadcasts through a `DeviceSession` and checks what the
//! bioreactors send back and write to disk.

use evolver_engine::config::Config;
use evolver_engine::device::{DeviceEvent, LoopbackConnector};
use evolver_engine::manager::{wall_clock, DeviceSession};
use evolver_engine::reactor::{BaseSettings, Bioreactor, ReactorSpec};
use sdk::device::{Broadcast, CalibrationBundle};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

fn identity_calibration() -> CalibrationBundle {
    let linear = |param: &str| {
        json!({
            "type": "linear",
            "params": [param],
            "coefficients": [[0.0, 1.0], [0.0, 1.0]]
        })
    };
    serde_json::from_value(json!({
        "od": linear("od_90"),
        "temp": linear("temp"),
        "pump": {"type": "constant", "coefficients": [[1.0], [1.0], [1.0], [1.0], [1.0], [1.0]]}
    }))
    .unwrap()
}

fn turbidostat(name: &str, calibration: &CalibrationBundle, special: &Value) -> Bioreactor {
    let base: BaseSettings = serde_json::from_value(json!({
        "vials": [0, 1],
        "volumes": 25.0,
        "mem_len": 3,
        "temp": 30.0,
        "stir": 8,
        "power": 4095
    }))
    .unwrap();
    let config = Config::default();
    Bioreactor::build(
        ReactorSpec {
            name,
            mode: "turbidostat",
            base: &base,
            special,
            calibration,
        },
        2,
        &config.dilution,
        wall_clock(),
    )
    .unwrap()
}

fn broadcast(od: [f64; 2]) -> Broadcast {
    serde_json::from_value(json!({
        "data": {
            "od_90": [od[0], od[1]],
            "temp": [30.0, 30.0]
        },
        "config": {
            "temp": {"value": ["30", "30"]}
        }
    }))
    .unwrap()
}

fn log_lines(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|text| text.lines().count())
        .unwrap_or(0)
}

async fn settle() {
    sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_turbidostat_dilutes_once_above_upper_bound() {
    let temp_dir = TempDir::new().unwrap();
    let connector = LoopbackConnector::new();
    let mut config = Config::default();
    config.device.num_vials = 2;

    let session = DeviceSession::attach(&connector, "http://unit", &config)
        .await
        .unwrap();
    let device = connector.device("http://unit").unwrap();
    let reactor = turbidostat(
        "turbido",
        &identity_calibration(),
        &json!({"lower_thresh": 0.2, "upper_thresh": 0.6}),
    );
    session
        .manager()
        .lock()
        .await
        .add_experiment("exp", reactor, temp_dir.path().to_path_buf())
        .unwrap();
    device.clear();

    // below the upper bound: nothing to pump
    for _ in 0..3 {
        device
            .push(DeviceEvent::Broadcast(Box::new(broadcast([0.3, 0.3]))))
            .await
            .unwrap();
    }
    settle().await;
    assert!(device.commands().iter().all(|c| c.param != "pump"));

    // vial 1 crosses the bound once its median does
    for _ in 0..3 {
        device
            .push(DeviceEvent::Broadcast(Box::new(broadcast([0.3, 0.9]))))
            .await
            .unwrap();
    }
    settle().await;

    let pumps: Vec<_> = device
        .commands()
        .into_iter()
        .filter(|c| c.param == "pump")
        .collect();
    assert!(!pumps.is_empty());
    let last = pumps.last().unwrap();
    // vial 0 untouched on every channel
    for channel in 0..3 {
        assert_eq!(last.value[channel * 2], "--");
    }
    assert_ne!(last.value[1], "--");

    assert_eq!(log_lines(&temp_dir.path().join("OD").join("0")), 6);
    assert_eq!(log_lines(&temp_dir.path().join("temp").join("1")), 6);
    assert_eq!(
        log_lines(&temp_dir.path().join("raw_data").join("od_90").join("1")),
        6
    );

    let mut manager = session.manager().lock_owned().await;
    assert!(manager.has_updates());
    let updates = manager.drain_updates();
    assert!(updates.iter().all(|u| u.url == "http://unit"));
    drop(manager);

    session.detach();
    assert!(device.is_closed());
}

#[tokio::test]
async fn test_locked_session_holds_pumps() {
    let temp_dir = TempDir::new().unwrap();
    let connector = LoopbackConnector::new();
    let mut config = Config::default();
    config.device.num_vials = 2;

    let session = DeviceSession::attach(&connector, "http://unit", &config)
        .await
        .unwrap();
    let device = connector.device("http://unit").unwrap();
    let reactor = turbidostat(
        "turbido",
        &identity_calibration(),
        &json!({"lower_thresh": 0.2, "upper_thresh": 0.6}),
    );
    {
        let manager = session.manager();
        let mut manager = manager.lock().await;
        manager
            .add_experiment("exp", reactor, temp_dir.path().to_path_buf())
            .unwrap();
        manager.lock().unwrap();
        assert!(manager.controls().is_locked());
    }
    device.clear();

    for _ in 0..4 {
        device
            .push(DeviceEvent::Broadcast(Box::new(broadcast([0.9, 0.9]))))
            .await
            .unwrap();
    }
    settle().await;

    // only the all-stop lock command may reach the pumps
    for command in device.commands().iter().filter(|c| c.param == "pump") {
        assert!(command.value.iter().all(|v| v == "0" || v == "--"), "{:?}", command);
    }

    session.detach();
}
