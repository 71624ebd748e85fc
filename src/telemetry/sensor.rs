//! Sensor feeds
//!
//! The scanning itself happens outside this process; readings arrive either
//! in-process through a channel or as newline-delimited JSON, e.g. piped from
//! a BLE scanner:
//!
//! ```text
//! {"address": "AA:2C:6A:1E:59:3D", "data": {"temperature": 23.5}}
//! {"address": "FE:36:EA:1E:62:AF", "data": "23.5"}
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;
use tracing::{error, warn};

/// One reading from a physical sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorReading {
    pub address: String,
    pub payload: Bytes,
}

impl SensorReading {
    pub fn new(address: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            address: address.into(),
            payload: payload.into(),
        }
    }
}

/// A feed of sensor readings
#[async_trait]
pub trait SensorSource: Send {
    /// Next reading, or `None` once the feed has ended
    async fn next_reading(&mut self) -> Option<SensorReading>;
}

/// In-process feed backed by an `mpsc` channel
pub struct ChannelSensorSource {
    rx: mpsc::Receiver<SensorReading>,
}

impl ChannelSensorSource {
    /// Create the feed and the sender scanners push into
    pub fn new(capacity: usize) -> (mpsc::Sender<SensorReading>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl SensorSource for ChannelSensorSource {
    async fn next_reading(&mut self) -> Option<SensorReading> {
        self.rx.recv().await
    }
}

#[derive(Debug, Error)]
pub enum LineError {
    #[error("not a reading object: {0}")]
    Json(#[from] serde_json::Error),
    #[error("empty sensor address")]
    EmptyAddress,
}

#[derive(Deserialize)]
struct RawReading {
    address: String,
    data: serde_json::Value,
}

/// Parse one JSON line. String data is taken verbatim, anything else is
/// re-serialized.
pub fn parse_line(line: &str) -> Result<SensorReading, LineError> {
    let raw: RawReading = serde_json::from_str(line)?;
    if raw.address.trim().is_empty() {
        return Err(LineError::EmptyAddress);
    }
    let payload = match raw.data {
        serde_json::Value::String(text) => Bytes::from(text),
        other => Bytes::from(serde_json::to_vec(&other)?),
    };
    Ok(SensorReading {
        address: raw.address,
        payload,
    })
}

/// Newline-delimited JSON feed over any buffered reader
pub struct LineSensorSource<R> {
    lines: Lines<R>,
    line_number: u64,
}

impl<R: AsyncBufRead + Unpin + Send> LineSensorSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_number: 0,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> SensorSource for LineSensorSource<R> {
    async fn next_reading(&mut self) -> Option<SensorReading> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    error!("Sensor feed read failed, closing feed: {}", e);
                    return None;
                }
            };
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            match parse_line(&line) {
                Ok(reading) => return Some(reading),
                Err(e) => warn!(line = self.line_number, "Skipping malformed sensor line: {}", e),
            }
        }
    }
}
