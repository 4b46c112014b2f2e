//! socket.io device transport
//!
//! eVOLVER units serve socket.io (engine.io v4) on their HTTP port. Only the
//! websocket transport is used, so the framing is small enough to speak
//! directly over `tokio-tungstenite`:
//!
//! - engine.io: `0` open, `1` close, `2` ping, `3` pong, `4` message
//! - socket.io (inside `4`): `0` connect, `1` disconnect, `2` event,
//!   `4` connect error, optionally followed by `/namespace,`
//!
//! An event frame looks like `42/dpu-evolver,["broadcast",{...}]`.

use async_trait::async_trait;
use futures::stream::StreamExt;
use futures::SinkExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use sdk::errors::EngineError;

use super::{DeviceChannel, DeviceConnector, DeviceEvent, DeviceLink};

/// Decoded transport frame
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Packet {
    Open,
    Close,
    Ping,
    Pong,
    Connect { namespace: String },
    Disconnect { namespace: String },
    ConnectError { namespace: String, detail: String },
    Event {
        namespace: String,
        name: String,
        payload: Value,
    },
    Unknown,
}

/// Split `"/ns,rest"` into namespace and rest; the default namespace is `/`
fn split_namespace(body: &str) -> (String, &str) {
    if body.starts_with('/') {
        match body.find(',') {
            Some(comma) => (body[..comma].to_string(), &body[comma + 1..]),
            None => (body.to_string(), ""),
        }
    } else {
        ("/".to_string(), body)
    }
}

pub(crate) fn parse_packet(text: &str) -> Packet {
    let mut chars = text.chars();
    match chars.next() {
        Some('0') => Packet::Open,
        Some('1') => Packet::Close,
        Some('2') => Packet::Ping,
        Some('3') => Packet::Pong,
        Some('4') => {
            let kind = chars.next();
            let (namespace, rest) = split_namespace(chars.as_str());
            match kind {
                Some('0') => Packet::Connect { namespace },
                Some('1') => Packet::Disconnect { namespace },
                Some('4') => Packet::ConnectError {
                    namespace,
                    detail: rest.to_string(),
                },
                Some('2') => {
                    // skip an optional ack id
                    let json = rest.trim_start_matches(|c: char| c.is_ascii_digit());
                    match serde_json::from_str::<Value>(json) {
                        Ok(Value::Array(mut items)) if !items.is_empty() => {
                            let payload = if items.len() > 1 {
                                items.swap_remove(1)
                            } else {
                                Value::Null
                            };
                            match items.first().and_then(Value::as_str) {
                                Some(name) => Packet::Event {
                                    namespace,
                                    name: name.to_string(),
                                    payload,
                                },
                                None => Packet::Unknown,
                            }
                        }
                        _ => Packet::Unknown,
                    }
                }
                _ => Packet::Unknown,
            }
        }
        _ => Packet::Unknown,
    }
}

fn namespace_prefix(namespace: &str) -> String {
    if namespace == "/" {
        String::new()
    } else {
        format!("{},", namespace)
    }
}

pub(crate) fn encode_event(namespace: &str, name: &str, payload: &Value) -> String {
    let body = Value::Array(vec![Value::String(name.to_string()), payload.clone()]);
    format!("42{}{}", namespace_prefix(namespace), body)
}

pub(crate) fn encode_connect(namespace: &str) -> String {
    format!("40{}", namespace_prefix(namespace))
}

/// Turn a device address into its socket.io websocket endpoint
pub(crate) fn websocket_url(url: &str) -> String {
    let base = if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if url.starts_with("ws://") || url.starts_with("wss://") {
        url.to_string()
    } else {
        format!("ws://{}", url)
    };
    format!(
        "{}/socket.io/?EIO=4&transport=websocket",
        base.trim_end_matches('/')
    )
}

struct SocketIoLink {
    url: String,
    namespace: String,
    outbound: mpsc::UnboundedSender<String>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceLink for SocketIoLink {
    fn url(&self) -> &str {
        &self.url
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Device(format!("{} is disconnected", self.url)));
        }
        self.outbound
            .send(encode_event(&self.namespace, event, &payload))
            .map_err(|_| EngineError::Device(format!("{} is disconnected", self.url)))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(device = %self.url, "Closing device connection");
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            task.abort();
        }
    }
}

/// Connector for real units
pub struct SocketIoConnector {
    namespace: String,
    connect_timeout: Duration,
}

impl SocketIoConnector {
    pub fn new(namespace: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            namespace: namespace.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl DeviceConnector for SocketIoConnector {
    async fn attach(&self, url: &str) -> Result<DeviceChannel, EngineError> {
        let endpoint = websocket_url(url);
        info!(device = %url, "Connecting to {}", endpoint);

        let (ws_stream, _response) =
            match timeout(self.connect_timeout, tokio_tungstenite::connect_async(&endpoint)).await
            {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(EngineError::DeviceUnreachable(format!("{}: {}", url, e))),
                Err(_) => {
                    return Err(EngineError::DeviceUnreachable(format!(
                        "{}: connect timed out",
                        url
                    )))
                }
            };

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::channel::<DeviceEvent>(64);

        // join the namespace before anything else goes out
        out_tx
            .send(encode_connect(&self.namespace))
            .map_err(|_| EngineError::Device(format!("{}: writer unavailable", url)))?;

        let device = url.to_string();
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    warn!(device = %device, "Failed to send to device: {}", e);
                    break;
                }
            }
        });

        let device = url.to_string();
        let namespace = self.namespace.clone();
        let pong_tx = out_tx.clone();
        let reader = tokio::spawn(async move {
            loop {
                let text = match read.next().await {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!(device = %device, "Device connection closed");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(device = %device, "Device read error: {}", e);
                        break;
                    }
                    _ => continue, // Binary, Ping, Pong, Frame
                };

                match parse_packet(&text) {
                    Packet::Ping => {
                        let _ = pong_tx.send("3".to_string());
                    }
                    Packet::Event {
                        namespace: ns,
                        name,
                        payload,
                    } if ns == namespace => match DeviceEvent::decode(&name, payload) {
                        Some(Ok(event)) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => warn!(device = %device, event = %name, "Malformed event: {}", e),
                        None => debug!(device = %device, event = %name, "Ignoring event"),
                    },
                    Packet::Connect { namespace: ns } if ns == namespace => {
                        info!(device = %device, "Joined namespace {}", ns);
                    }
                    Packet::ConnectError { detail, .. } => {
                        warn!(device = %device, "Namespace refused: {}", detail);
                        break;
                    }
                    Packet::Close => break,
                    Packet::Disconnect { namespace: ns } if ns == namespace => break,
                    _ => {}
                }
            }
            let _ = event_tx.send(DeviceEvent::Disconnected).await;
        });

        Ok(DeviceChannel {
            link: Arc::new(SocketIoLink {
                url: url.to_string(),
                namespace: self.namespace.clone(),
                outbound: out_tx,
                closed: AtomicBool::new(false),
                tasks: Mutex::new(vec![writer, reader]),
            }),
            events: event_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_namespaced_event() {
        let packet = parse_packet(r#"42/dpu-evolver,["broadcast",{"data":{}}]"#);
        assert_eq!(
            packet,
            Packet::Event {
                namespace: "/dpu-evolver".to_string(),
                name: "broadcast".to_string(),
                payload: json!({"data": {}}),
            }
        );
    }

    #[test]
    fn test_parse_event_with_ack_id_and_default_namespace() {
        let packet = parse_packet(r#"4217["calibrationnames",["a"]]"#);
        assert_eq!(
            packet,
            Packet::Event {
                namespace: "/".to_string(),
                name: "calibrationnames".to_string(),
                payload: json!(["a"]),
            }
        );
    }

    #[test]
    fn test_parse_control_packets() {
        assert_eq!(parse_packet("2"), Packet::Ping);
        assert_eq!(parse_packet(r#"0{"sid":"x"}"#), Packet::Open);
        assert_eq!(
            parse_packet(r#"40/dpu-evolver,{"sid":"y"}"#),
            Packet::Connect {
                namespace: "/dpu-evolver".to_string()
            }
        );
        assert_eq!(parse_packet("42/dpu-evolver,not json"), Packet::Unknown);
    }

    #[test]
    fn test_encode_event_roundtrips() {
        let text = encode_event("/dpu-evolver", "command", &json!({"param": "pump"}));
        assert_eq!(text, r#"42/dpu-evolver,["command",{"param":"pump"}]"#);
        assert!(matches!(parse_packet(&text), Packet::Event { name, .. } if name == "command"));
        assert_eq!(encode_connect("/"), "40");
    }

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            websocket_url("http://192.168.1.2:8081"),
            "ws://192.168.1.2:8081/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(
            websocket_url("https://unit.lab/"),
            "wss://unit.lab/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(
            websocket_url("10.0.0.3:8081"),
            "ws://10.0.0.3:8081/socket.io/?EIO=4&transport=websocket"
        );
    }
}
