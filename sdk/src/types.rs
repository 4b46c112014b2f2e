//! Operator protocol message types
//!
//! Requests carry a command name and an argument object; responses carry a
//! status plus an optional message or command-specific payload.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::EngineError;

/// Request sent by an operator client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub args: BTreeMap<String, serde_json::Value>,
}

impl Request {
    /// Create a new request with no arguments
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: BTreeMap::new(),
        }
    }

    /// Add an argument
    pub fn with_arg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    /// Get a string argument
    pub fn arg_str(&self, key: &str) -> Result<&str, EngineError> {
        self.args
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Protocol(format!("missing string argument '{}'", key)))
    }

    /// Get a non-negative integer argument
    pub fn arg_u64(&self, key: &str) -> Result<u64, EngineError> {
        self.args
            .get(key)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| EngineError::Protocol(format!("missing integer argument '{}'", key)))
    }
}

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Response sent back by the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Response {
    /// Plain success
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            msg: None,
            path: None,
        }
    }

    /// Failure with a message
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            msg: Some(msg.into()),
            path: None,
        }
    }

    /// Success carrying a staging path
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            msg: None,
            path: Some(path.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Second message of the `initialize` handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentAnnouncement {
    pub name: String,
    pub fragments: u32,
}
