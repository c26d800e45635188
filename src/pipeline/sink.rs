//! The sink: one PULL socket that every worker of a manager reports to.
//!
//! The sink runs on its own named thread. It demultiplexes messages by the
//! worker identity frame, keeps the live-worker registry current and
//! re-emits data as typed [`SinkEvent`]s on a crossbeam channel.

use crate::error::{PipeError, Result};
use crate::ipc::protocol::{self, Command, Content, WorkerId, decode_payload};
use crate::ipc::socket::{self, SendOutcome};
use crate::process::SharedRegistry;
use crossbeam_channel::Sender;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// How long the sink waits for a message before checking for workers that
/// exited without signing off (ms).
const IDLE_CHECK_MS: i64 = 250;

/// Event raised to the consumer of a manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent<T> {
    /// A worker produced a result.
    Data { worker_id: WorkerId, data: T },
    /// A worker completed its work and is about to exit.
    WorkerFinished(WorkerId),
}

/// Turns raw sink data into the manager's result type.
pub trait SinkDecoder: Send + 'static {
    type Output: Send + 'static;

    fn process_sink_data(&mut self, worker_id: WorkerId, data: &[u8]) -> Result<Self::Output>;
}

/// Decoder for JSON payloads of type `T`.
pub struct JsonDecoder<T>(PhantomData<fn() -> T>);

impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + Send + 'static> SinkDecoder for JsonDecoder<T> {
    type Output = T;

    fn process_sink_data(&mut self, _worker_id: WorkerId, data: &[u8]) -> Result<T> {
        decode_payload(data)
    }
}

/// Flag shared between a manager and its sink thread.
#[derive(Debug, Clone, Default)]
pub struct Terminating(Arc<AtomicBool>);

impl Terminating {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sends the bypass KILL to a sink, at most once.
pub struct SinkTerminator {
    socket: zmq::Socket,
    kill_sent: bool,
}

impl SinkTerminator {
    /// Ask the sink to exit. Returns false if that was already requested.
    pub fn terminate(&mut self) -> Result<bool> {
        if self.kill_sent {
            return Ok(false);
        }
        self.kill_sent = true;
        let frames = protocol::addressed(WorkerId::new(0), Content::Command(Command::Kill));
        if socket::try_send_multipart(&self.socket, frames)? == SendOutcome::WouldBlock {
            tracing::warn!("Sink did not accept termination request");
        }
        Ok(true)
    }

    pub fn kill_sent(&self) -> bool {
        self.kill_sent
    }
}

/// A bound PULL socket and the PUSH socket that can terminate it.
pub struct SinkEndpoint {
    receiver: zmq::Socket,
    terminator: SinkTerminator,
    port: u16,
}

impl SinkEndpoint {
    /// Bind the sink to an ephemeral loopback port.
    pub fn bind(context: &zmq::Context) -> Result<Self> {
        let (receiver, port) = socket::bind_socket(context, zmq::PULL)?;
        let terminator = SinkTerminator {
            socket: socket::connect_socket(context, zmq::PUSH, port)?,
            kill_sent: false,
        };
        Ok(Self {
            receiver,
            terminator,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start the sink loop on a thread named `<name>-sink`.
    pub fn spawn<D: SinkDecoder>(
        self,
        name: &str,
        registry: SharedRegistry,
        terminating: Terminating,
        decoder: D,
        events: Sender<SinkEvent<D::Output>>,
    ) -> Result<SinkHandle> {
        let sink = Sink {
            name: name.to_string(),
            receiver: self.receiver,
            registry,
            terminating,
            decoder,
            events,
        };
        let thread = std::thread::Builder::new()
            .name(format!("{}-sink", name))
            .spawn(move || sink.run())?;
        Ok(SinkHandle {
            terminator: self.terminator,
            thread: Some(thread),
            port: self.port,
        })
    }
}

/// Owner-side handle of a running sink thread.
pub struct SinkHandle {
    terminator: SinkTerminator,
    thread: Option<JoinHandle<Result<()>>>,
    port: u16,
}

impl SinkHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send the bypass KILL. Repeated calls do nothing.
    pub fn terminate(&mut self) -> Result<bool> {
        self.terminator.terminate()
    }

    pub fn kill_sent(&self) -> bool {
        self.terminator.kill_sent()
    }

    /// Whether the sink thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Wait for the sink thread and return how its loop ended.
    pub fn join(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| Err(PipeError::Protocol("sink thread panicked".into()))),
            None => Ok(()),
        }
    }
}

/// The sink loop state. Lives on the sink thread.
struct Sink<D: SinkDecoder> {
    name: String,
    receiver: zmq::Socket,
    registry: SharedRegistry,
    terminating: Terminating,
    decoder: D,
    events: Sender<SinkEvent<D::Output>>,
}

impl<D: SinkDecoder> Sink<D> {
    fn run(mut self) -> Result<()> {
        tracing::debug!(sink = %self.name, "Sink started");
        let result = self.receive_loop();
        match &result {
            Ok(()) => tracing::debug!(sink = %self.name, "Sink stopped"),
            Err(e) => tracing::error!(sink = %self.name, error = %e, "Sink loop failed"),
        }
        result
    }

    fn receive_loop(&mut self) -> Result<()> {
        loop {
            if self.receiver.poll(zmq::POLLIN, IDLE_CHECK_MS)? == 0 {
                if self.remove_exited_workers() {
                    return Ok(());
                }
                continue;
            }
            let frames = socket::recv_multipart(&self.receiver)?;
            let envelope = protocol::parse_addressed(frames)?;
            let worker_id = envelope.worker_id;
            match envelope.content {
                Content::Data(data) => match self.decoder.process_sink_data(worker_id, &data) {
                    Ok(data) => self.emit(SinkEvent::Data { worker_id, data }),
                    Err(e) => tracing::warn!(
                        sink = %self.name,
                        worker_id = %worker_id,
                        error = %e,
                        "Dropping undecodable result"
                    ),
                },
                Content::Command(Command::Finished) => {
                    // A worker leaves the registry before its FINISHED is emitted.
                    let done = self.remove_worker(worker_id);
                    self.emit(SinkEvent::WorkerFinished(worker_id));
                    if done {
                        return Ok(());
                    }
                }
                Content::Command(Command::Stopped) => {
                    tracing::debug!(sink = %self.name, worker_id = %worker_id, "Worker stopped");
                    if self.remove_worker(worker_id) {
                        return Ok(());
                    }
                }
                Content::Command(Command::Kill) => {
                    tracing::debug!(sink = %self.name, "Sink received KILL");
                    return Ok(());
                }
                Content::Command(other) => {
                    return Err(PipeError::Protocol(format!(
                        "unexpected {} from worker {} at sink",
                        other, worker_id
                    )));
                }
            }
        }
    }

    /// Remove a worker. Returns true once the manager is terminating and no
    /// workers remain.
    fn remove_worker(&mut self, worker_id: WorkerId) -> bool {
        let (record, done) = {
            let mut registry = self.registry.lock();
            let record = registry.remove(worker_id);
            (record, registry.is_empty() && self.terminating.get())
        };
        if record.is_none() {
            tracing::debug!(sink = %self.name, worker_id = %worker_id, "Unknown worker signed off");
        }
        // The record reaps the exiting process when dropped, outside the lock.
        drop(record);
        done
    }

    /// Forget workers whose process died without FINISHED or STOPPED.
    /// Returns true if that leaves a terminating manager with no workers.
    fn remove_exited_workers(&mut self) -> bool {
        let (exited, done) = {
            let mut registry = self.registry.lock();
            let exited = registry.remove_exited();
            let done = !exited.is_empty() && registry.is_empty() && self.terminating.get();
            (exited, done)
        };
        for record in &exited {
            tracing::warn!(
                sink = %self.name,
                worker_id = %record.worker_id(),
                reason = ?record.exit_reason(),
                "Worker exited without signing off"
            );
        }
        done
    }

    fn emit(&self, event: SinkEvent<D::Output>) {
        if self.events.send(event).is_err() {
            tracing::debug!(sink = %self.name, "Event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::encode_payload;
    use crate::process::ProcessRecord;
    use crossbeam_channel::unbounded;
    use std::process::Command as OsCommand;

    fn start_sink(
        context: &zmq::Context,
        registry: SharedRegistry,
        terminating: Terminating,
    ) -> (
        SinkHandle,
        zmq::Socket,
        crossbeam_channel::Receiver<SinkEvent<String>>,
    ) {
        let endpoint = SinkEndpoint::bind(context).unwrap();
        let push = socket::connect_socket(context, zmq::PUSH, endpoint.port()).unwrap();
        let (tx, rx) = unbounded();
        let handle = endpoint
            .spawn("test", registry, terminating, JsonDecoder::<String>::new(), tx)
            .unwrap();
        (handle, push, rx)
    }

    fn register(registry: &SharedRegistry, id: u32) {
        let child = OsCommand::new("sleep").arg("30").spawn().unwrap();
        registry
            .lock()
            .insert(ProcessRecord::from_child(WorkerId::new(id), child));
    }

    #[test]
    fn test_data_then_finished() {
        let context = zmq::Context::new();
        let registry = SharedRegistry::new();
        register(&registry, 1);
        let terminating = Terminating::default();
        let (mut handle, push, rx) = start_sink(&context, registry.clone(), terminating.clone());

        let payload = encode_payload("hello").unwrap();
        push.send_multipart(
            protocol::addressed(WorkerId::new(1), Content::Data(payload)),
            0,
        )
        .unwrap();
        terminating.set();
        push.send_multipart(
            protocol::addressed(WorkerId::new(1), Content::Command(Command::Finished)),
            0,
        )
        .unwrap();

        // The last worker signing off while terminating ends the loop.
        handle.join().unwrap();
        let events: Vec<_> = rx.iter().collect();
        assert_eq!(
            events,
            vec![
                SinkEvent::Data {
                    worker_id: WorkerId::new(1),
                    data: "hello".to_string()
                },
                SinkEvent::WorkerFinished(WorkerId::new(1)),
            ]
        );
        assert!(registry.lock().is_empty());
    }

    #[test]
    fn test_stopped_removes_worker_without_exiting() {
        let context = zmq::Context::new();
        let registry = SharedRegistry::new();
        register(&registry, 1);
        register(&registry, 2);
        let (mut handle, push, _rx) =
            start_sink(&context, registry.clone(), Terminating::default());

        push.send_multipart(
            protocol::addressed(WorkerId::new(2), Content::Command(Command::Stopped)),
            0,
        )
        .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while registry.lock().contains(WorkerId::new(2)) && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(registry.lock().workers(), &[WorkerId::new(1)]);
        assert!(!handle.is_finished());

        assert!(handle.terminate().unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let context = zmq::Context::new();
        let (mut handle, _push, rx) =
            start_sink(&context, SharedRegistry::new(), Terminating::default());

        assert!(handle.terminate().unwrap());
        assert!(!handle.terminate().unwrap());
        assert!(handle.kill_sent());
        handle.join().unwrap();
        assert!(rx.try_recv().is_err());
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !condition() {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        true
    }

    #[test]
    fn test_undecodable_data_is_dropped() {
        let context = zmq::Context::new();
        let registry = SharedRegistry::new();
        register(&registry, 1);
        let (mut handle, push, rx) = start_sink(&context, registry, Terminating::default());

        push.send_multipart(
            protocol::addressed(WorkerId::new(1), Content::Data(b"not json".to_vec())),
            0,
        )
        .unwrap();
        push.send_multipart(
            protocol::addressed(
                WorkerId::new(1),
                Content::Data(encode_payload("after").unwrap()),
            ),
            0,
        )
        .unwrap();

        let event = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        assert_eq!(
            event,
            SinkEvent::Data {
                worker_id: WorkerId::new(1),
                data: "after".to_string()
            }
        );
        assert!(!handle.is_finished());
        handle.terminate().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_exited_worker_is_forgotten() {
        let context = zmq::Context::new();
        let registry = SharedRegistry::new();
        register(&registry, 1);
        let child = OsCommand::new("sh").args(["-c", "exit 0"]).spawn().unwrap();
        registry
            .lock()
            .insert(ProcessRecord::from_child(WorkerId::new(2), child));
        let (mut handle, _push, _rx) =
            start_sink(&context, registry.clone(), Terminating::default());

        assert!(wait_until(|| !registry.lock().contains(WorkerId::new(2))));
        assert_eq!(registry.lock().workers(), &[WorkerId::new(1)]);
        // Not terminating, so the sink keeps running.
        assert!(!handle.is_finished());
        handle.terminate().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_last_worker_exiting_while_terminating_ends_loop() {
        let context = zmq::Context::new();
        let registry = SharedRegistry::new();
        let child = OsCommand::new("sleep").arg("0.3").spawn().unwrap();
        registry
            .lock()
            .insert(ProcessRecord::from_child(WorkerId::new(1), child));
        let terminating = Terminating::default();
        terminating.set();
        let (mut handle, _push, _rx) = start_sink(&context, registry.clone(), terminating);

        // No KILL is sent: the crashed worker alone releases the sink.
        handle.join().unwrap();
        assert!(registry.lock().is_empty());
        assert!(!handle.kill_sent());
    }

    #[test]
    fn test_unexpected_token_ends_loop() {
        let context = zmq::Context::new();
        let (mut handle, push, _rx) =
            start_sink(&context, SharedRegistry::new(), Terminating::default());

        push.send_multipart(
            protocol::addressed(WorkerId::new(3), Content::Command(Command::Pause)),
            0,
        )
        .unwrap();
        match handle.join() {
            Err(PipeError::Protocol(msg)) => assert!(msg.contains("PAUSE")),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }
}
