//! Driving-process side of log forwarding.

use super::{CONNECT, DISCONNECT, STOP};
use crate::error::{PipeError, Result};
use crate::ipc::socket;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::thread::JoinHandle;

/// Receives worker log records and re-emits them through `tracing`.
pub struct LogCollector {
    port: u16,
    stopper: zmq::Socket,
    thread: Option<JoinHandle<Result<()>>>,
    _context: zmq::Context,
}

impl LogCollector {
    /// Bind the info socket and start the collector thread.
    pub fn start() -> Result<Self> {
        let context = zmq::Context::new();
        let (info, port) = socket::bind_socket(&context, zmq::PULL)?;
        let records = socket::new_socket(&context, zmq::SUB)?;
        records.set_subscribe(b"")?;
        let stopper = socket::connect_socket(&context, zmq::PUSH, port)?;
        let thread = std::thread::Builder::new()
            .name("log-collector".into())
            .spawn(move || collect(info, records))?;
        Ok(Self {
            port,
            stopper,
            thread: Some(thread),
            _context: context,
        })
    }

    /// Port workers announce themselves on (`--log-port`).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop the collector thread and wait for it.
    pub fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.stopper.send(STOP.as_bytes(), 0)?;
        thread
            .join()
            .unwrap_or_else(|_| Err(PipeError::Protocol("log collector panicked".into())))
    }
}

impl Drop for LogCollector {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::debug!(error = %e, "Log collector ended with error");
        }
    }
}

/// A control message on the info socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InfoMessage {
    Connect(u16),
    Disconnect(u16),
    Stop,
}

fn parse_info(message: &[u8]) -> Option<InfoMessage> {
    let text = std::str::from_utf8(message).ok()?;
    let mut parts = text.split_whitespace();
    let verb = parts.next()?;
    let port = parts.next().and_then(|p| p.parse().ok());
    match (verb, port) {
        (CONNECT, Some(port)) => Some(InfoMessage::Connect(port)),
        (DISCONNECT, Some(port)) => Some(InfoMessage::Disconnect(port)),
        (STOP, None) => Some(InfoMessage::Stop),
        _ => None,
    }
}

fn collect(info: zmq::Socket, records: zmq::Socket) -> Result<()> {
    loop {
        let (info_ready, records_ready) = {
            let mut items = [
                info.as_poll_item(zmq::POLLIN),
                records.as_poll_item(zmq::POLLIN),
            ];
            match zmq::poll(&mut items, -1) {
                Ok(_) => {}
                Err(zmq::Error::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
            (items[0].is_readable(), items[1].is_readable())
        };

        if records_ready {
            let frames = socket::recv_multipart(&records)?;
            if let [name, record] = frames.as_slice() {
                emit_record(&String::from_utf8_lossy(name), record);
            }
        }

        if info_ready {
            let message = socket::recv_bytes(&info)?;
            match parse_info(&message) {
                Some(InfoMessage::Connect(port)) => records.connect(&socket::endpoint(port))?,
                Some(InfoMessage::Disconnect(port)) => {
                    // The worker may already be gone.
                    let _ = records.disconnect(&socket::endpoint(port));
                }
                Some(InfoMessage::Stop) => return Ok(()),
                None => tracing::debug!(
                    message = %String::from_utf8_lossy(&message),
                    "Ignoring unknown log collector message"
                ),
            }
        }
    }
}

/// The subset of a `tracing-subscriber` JSON record that is re-emitted.
#[derive(Debug, Deserialize)]
struct ForwardedRecord {
    level: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

impl ForwardedRecord {
    /// The message, followed by any other fields as `key=value`.
    fn text(&self) -> String {
        let mut text = match self.fields.get("message") {
            Some(Value::String(message)) => message.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        for (key, value) in self.fields.iter().filter(|(k, _)| k.as_str() != "message") {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            text.push_str(&format!(" {}={}", key, value));
        }
        text
    }
}

/// Re-emit one forwarded record, tagged with the worker it came from.
fn emit_record(worker: &str, record: &[u8]) {
    let record: ForwardedRecord = match serde_json::from_slice(record) {
        Ok(record) => record,
        Err(e) => {
            tracing::debug!(worker, error = %e, "Malformed log record");
            return;
        }
    };
    let text = record.text();
    let origin = record.target.as_str();
    match record.level.as_str() {
        "ERROR" => tracing::error!(target: "workerpipe::worker", worker, origin, "{}", text),
        "WARN" => tracing::warn!(target: "workerpipe::worker", worker, origin, "{}", text),
        "INFO" => tracing::info!(target: "workerpipe::worker", worker, origin, "{}", text),
        "DEBUG" => tracing::debug!(target: "workerpipe::worker", worker, origin, "{}", text),
        _ => tracing::trace!(target: "workerpipe::worker", worker, origin, "{}", text),
    }
}
