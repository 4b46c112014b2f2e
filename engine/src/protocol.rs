//! Operator protocol framing
//!
//! Wire format:
//! ```text
//! ┌────────────┬──────────────────────────┐
//! │ Length (4B)│ UTF-8 JSON body (N B)    │
//! │ BE u32     │                          │
//! └────────────┴──────────────────────────┘
//! ```
//!
//! One request and one response per connection, except `initialize`, which
//! takes a second client message announcing the experiment.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use sdk::errors::EngineError;
use sdk::types::{ExperimentAnnouncement, Request, Response};

/// Maximum frame body size.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame header size (4-byte big-endian length).
const HEADER_SIZE: usize = 4;

/// Encode a message into a length-prefixed frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, EngineError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(EngineError::FrameTooLarge {
            size: body.len(),
            limit: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one complete frame held in `bytes`.
///
/// The buffer must contain exactly one frame; short or trailing bytes are a
/// protocol violation.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EngineError> {
    if bytes.len() < HEADER_SIZE {
        return Err(EngineError::Protocol("short frame header".to_string()));
    }
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&bytes[..HEADER_SIZE]);
    let expected = u32::from_be_bytes(header) as usize;
    let body = &bytes[HEADER_SIZE..];
    if body.len() != expected {
        return Err(EngineError::Protocol(format!(
            "frame declares {} bytes, got {}",
            expected,
            body.len()
        )));
    }
    Ok(serde_json::from_slice(body)?)
}

/// Read one frame from a stream and parse its JSON body.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, EngineError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let expected = u32::from_be_bytes(header) as usize;
    if expected > MAX_FRAME_SIZE {
        return Err(EngineError::FrameTooLarge {
            size: expected,
            limit: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; expected];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Serialize a message and write it as one frame.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), EngineError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Client side of the protocol
///
/// Used by the CLI subcommands and by integration tests.
pub struct DaemonClient {
    addr: String,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    /// Send one request and wait for its response
    pub async fn send(&self, request: &Request) -> Result<Response, EngineError> {
        timeout(self.timeout, async {
            let mut stream = self.connect().await?;
            write_message(&mut stream, request).await?;
            read_message(&mut stream).await
        })
        .await
        .map_err(|_| EngineError::Timeout)?
    }

    /// Run the `initialize` handshake
    ///
    /// Returns the staging directory the fragments must be written to. The
    /// daemon only records the pending start once the announcement has been
    /// acknowledged.
    pub async fn initialize(
        &self,
        announcement: &ExperimentAnnouncement,
    ) -> Result<String, EngineError> {
        timeout(self.timeout, async {
            let mut stream = self.connect().await?;
            write_message(&mut stream, &Request::new("initialize")).await?;
            let first: Response = read_message(&mut stream).await?;
            let path = match (first.is_ok(), first.path) {
                (true, Some(path)) => path,
                _ => {
                    return Err(EngineError::Protocol(
                        first.msg.unwrap_or_else(|| "initialize refused".to_string()),
                    ))
                }
            };

            write_message(&mut stream, announcement).await?;
            let second: Response = read_message(&mut stream).await?;
            if second.is_ok() {
                Ok(path)
            } else {
                Err(EngineError::Protocol(
                    second.msg.unwrap_or_else(|| "announcement refused".to_string()),
                ))
            }
        })
        .await
        .map_err(|_| EngineError::Timeout)?
    }

    async fn connect(&self) -> Result<TcpStream, EngineError> {
        Ok(TcpStream::connect(&self.addr).await?)
    }
}
