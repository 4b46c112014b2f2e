//! Device wire types
//!
//! Shapes of the events exchanged with an eVOLVER unit: the periodic sensor
//! broadcast, the pump/temperature/stir command, and the calibration bundle
//! returned by calibration queries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Pump channel on a vial
///
/// Every vial has two inflow pumps and one efflux pump. Command arrays are
/// laid out channel-major: index = `channel.index() * num_vials + vial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpChannel {
    In1,
    In2,
    Out,
}

impl PumpChannel {
    pub const ALL: [PumpChannel; 3] = [PumpChannel::In1, PumpChannel::In2, PumpChannel::Out];

    pub fn index(self) -> usize {
        match self {
            Self::In1 => 0,
            Self::In2 => 1,
            Self::Out => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::In1 => "in1",
            Self::In2 => "in2",
            Self::Out => "out",
        }
    }
}

impl fmt::Display for PumpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Echo of one configured parameter in a broadcast
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamEcho {
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring: Option<bool>,
}

impl ParamEcho {
    /// Per-channel values, empty when the device echoed a scalar
    pub fn values(&self) -> &[Value] {
        self.value.as_array().map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Periodic sensor snapshot pushed by a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    /// Raw sensor series keyed by sensor name (`od_90`, `temp`, ...)
    #[serde(default)]
    pub data: HashMap<String, Vec<Value>>,
    /// Echo of the device's current parameter settings
    #[serde(default)]
    pub config: HashMap<String, ParamEcho>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl Broadcast {
    /// Raw reading of `sensor` for `vial`, if present and numeric
    pub fn reading(&self, sensor: &str, vial: usize) -> Option<f64> {
        self.data.get(sensor)?.get(vial).and_then(numeric)
    }

    /// Echoed setting of `param` at `index`
    pub fn echo(&self, param: &str, index: usize) -> Option<&Value> {
        self.config.get(param)?.values().get(index)
    }
}

/// Outbound `command` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub param: String,
    pub value: Vec<String>,
    pub recurring: bool,
    pub immediate: bool,
}

/// One sensor's calibration entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorCalibration {
    /// Fit type name (`linear`, `sigmoid`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Broadcast series the fit reads from
    #[serde(default)]
    pub params: Vec<String>,
    /// One coefficient vector per row (per vial, or per vial and channel for pumps)
    pub coefficients: Vec<Vec<f64>>,
}

/// Calibration bundle for a whole device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBundle {
    pub od: SensorCalibration,
    pub temp: SensorCalibration,
    pub pump: SensorCalibration,
}

/// Interpret a JSON value as a number, accepting numeric strings
///
/// Devices report readings either as numbers or as their string form.
pub fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_broadcast_readings_accept_strings() {
        let broadcast: Broadcast = serde_json::from_value(json!({
            "data": {"od_90": ["1020", 998.5, null]},
            "config": {"temp": {"value": ["2100", "2100", "2100"]}}
        }))
        .unwrap();

        assert_eq!(broadcast.reading("od_90", 0), Some(1020.0));
        assert_eq!(broadcast.reading("od_90", 1), Some(998.5));
        assert_eq!(broadcast.reading("od_90", 2), None);
        assert_eq!(broadcast.reading("od_135", 0), None);
        assert_eq!(broadcast.echo("temp", 1), Some(&json!("2100")));
    }

    #[test]
    fn test_scalar_echo_has_no_values() {
        let echo = ParamEcho {
            value: json!(5),
            recurring: None,
        };
        assert!(echo.values().is_empty());
    }

    #[test]
    fn test_pump_channel_layout() {
        assert_eq!(PumpChannel::from_index(2), Some(PumpChannel::Out));
        assert_eq!(PumpChannel::from_index(3), None);
        assert_eq!(PumpChannel::In2.to_string(), "in2");
    }
}
