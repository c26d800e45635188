//! Worker side of log forwarding.
//!
//! A worker binds a PUB socket for its records and announces the port to the
//! collector with `CONNECT <port>`. Each record is published as
//! `[worker name, JSON record]`.

use super::{CONNECT, DISCONNECT};
use crate::error::Result;
use crate::ipc::socket;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use tracing_subscriber::fmt::MakeWriter;

struct PublisherInner {
    name: Vec<u8>,
    records: Mutex<zmq::Socket>,
    info: Mutex<zmq::Socket>,
    port: u16,
    _context: zmq::Context,
}

/// Publishes JSON log records to the collector of the driving process.
///
/// Usable directly as the writer of a `tracing-subscriber` fmt layer.
#[derive(Clone)]
pub struct LogPublisher {
    inner: Arc<PublisherInner>,
}

impl LogPublisher {
    /// Bind the record socket and announce it to the collector listening on
    /// `collector_port`.
    pub fn connect(name: &str, collector_port: u16) -> Result<Self> {
        let context = zmq::Context::new();
        let (records, port) = socket::bind_socket(&context, zmq::PUB)?;
        let info = socket::connect_socket(&context, zmq::PUSH, collector_port)?;
        info.send(format!("{} {}", CONNECT, port).as_bytes(), 0)?;
        Ok(Self {
            inner: Arc::new(PublisherInner {
                name: name.as_bytes().to_vec(),
                records: Mutex::new(records),
                info: Mutex::new(info),
                port,
                _context: context,
            }),
        })
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Publish one serialized record.
    pub fn publish(&self, record: &[u8]) -> Result<()> {
        let socket = self
            .inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        socket.send_multipart([self.inner.name.as_slice(), record], zmq::DONTWAIT)?;
        Ok(())
    }

    /// Withdraw the record socket from the collector.
    pub fn disconnect(&self) -> Result<()> {
        let info = self.inner.info.lock().unwrap_or_else(PoisonError::into_inner);
        info.send(format!("{} {}", DISCONNECT, self.inner.port).as_bytes(), 0)?;
        Ok(())
    }
}

/// Buffers one formatted record and publishes it when dropped.
pub struct RecordWriter<'a> {
    publisher: &'a LogPublisher,
    buffer: Vec<u8>,
}

impl io::Write for RecordWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for RecordWriter<'_> {
    fn drop(&mut self) {
        let record = self.buffer.trim_ascii_end();
        if record.is_empty() {
            return;
        }
        // Logging must never take the worker down.
        let _ = self.publisher.publish(record);
    }
}

impl<'a> MakeWriter<'a> for LogPublisher {
    type Writer = RecordWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RecordWriter {
            publisher: self,
            buffer: Vec::new(),
        }
    }
}
