//! Startup rendezvous of a pipeline worker.
//!
//! The manager beacons `[id, cmd, START]` until the worker answers on the
//! synchronization socket; the work follows once the reply arrives.

use crate::error::{PipeError, Result};
use crate::ipc::protocol::{self, Command, Content, WorkerId};
use crate::ipc::socket;

/// How the handshake ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendezvous {
    /// The serialized work arguments.
    Work(Vec<u8>),
    /// The manager stopped the worker before sending work.
    Stop,
}

/// Wait for START, synchronize, then wait for the work itself.
pub fn rendezvous(
    worker_id: WorkerId,
    receiver: &zmq::Socket,
    sync: &zmq::Socket,
) -> Result<Rendezvous> {
    loop {
        match next_own_message(worker_id, receiver)? {
            Content::Command(Command::Start) => break,
            Content::Command(Command::Stop) => return Ok(Rendezvous::Stop),
            other => tracing::debug!(worker_id = %worker_id, message = ?other, "Ignoring message before START"),
        }
    }

    sync.send(worker_id.to_filter(), 0)?;
    socket::recv_bytes(sync)?;
    tracing::debug!(worker_id = %worker_id, "Synchronized with manager");

    loop {
        match next_own_message(worker_id, receiver)? {
            // Beacons sent before the manager saw our request.
            Content::Command(Command::Start) => continue,
            Content::Command(Command::Stop) => return Ok(Rendezvous::Stop),
            Content::Data(payload) => return Ok(Rendezvous::Work(payload)),
            Content::Command(other) => {
                return Err(PipeError::Protocol(format!(
                    "unexpected {} on work channel of worker {}",
                    other, worker_id
                )));
            }
        }
    }
}

/// Receive the next message addressed exactly to `worker_id`.
///
/// Subscriptions match by prefix, so worker `1` also receives the messages
/// of worker `10`. Those are dropped here.
pub fn next_own_message(worker_id: WorkerId, receiver: &zmq::Socket) -> Result<Content> {
    let own_topic = worker_id.to_filter();
    loop {
        let frames = socket::recv_multipart(receiver)?;
        if frames.first() != Some(&own_topic) {
            continue;
        }
        return Ok(protocol::parse_addressed(frames)?.content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rendezvous_ignores_prefix_matches() {
        let context = zmq::Context::new();
        let (publisher, work_port) = socket::bind_socket(&context, zmq::PUB).unwrap();
        let (sync_server, sync_port) = socket::bind_socket(&context, zmq::REP).unwrap();

        let worker_context = context.clone();
        let worker = std::thread::spawn(move || {
            let id = WorkerId::new(1);
            let receiver = socket::connect_socket(&worker_context, zmq::SUB, work_port).unwrap();
            receiver.set_subscribe(&id.to_filter()).unwrap();
            let sync = socket::connect_socket(&worker_context, zmq::REQ, sync_port).unwrap();
            rendezvous(id, &receiver, &sync).unwrap()
        });

        // Beacon worker 1 while also publishing to worker 10.
        loop {
            publisher
                .send_multipart(
                    protocol::addressed(WorkerId::new(10), Content::Data(b"\"wrong\"".to_vec())),
                    0,
                )
                .unwrap();
            publisher
                .send_multipart(
                    protocol::addressed(WorkerId::new(1), Content::Command(Command::Start)),
                    0,
                )
                .unwrap();
            if sync_server.poll(zmq::POLLIN, 10).unwrap() > 0 {
                break;
            }
        }
        assert_eq!(socket::recv_bytes(&sync_server).unwrap(), b"1".to_vec());
        sync_server.send(&b""[..], 0).unwrap();

        publisher
            .send_multipart(
                protocol::addressed(WorkerId::new(10), Content::Data(b"\"wrong\"".to_vec())),
                0,
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        publisher
            .send_multipart(
                protocol::addressed(WorkerId::new(1), Content::Data(b"\"right\"".to_vec())),
                0,
            )
            .unwrap();

        assert_eq!(
            worker.join().unwrap(),
            Rendezvous::Work(b"\"right\"".to_vec())
        );
    }

    #[test]
    fn test_stop_during_handshake() {
        let context = zmq::Context::new();
        let (publisher, work_port) = socket::bind_socket(&context, zmq::PUB).unwrap();
        let (_sync_server, sync_port) = socket::bind_socket(&context, zmq::REP).unwrap();

        let worker_context = context.clone();
        let worker = std::thread::spawn(move || {
            let id = WorkerId::new(4);
            let receiver = socket::connect_socket(&worker_context, zmq::SUB, work_port).unwrap();
            receiver.set_subscribe(&id.to_filter()).unwrap();
            let sync = socket::connect_socket(&worker_context, zmq::REQ, sync_port).unwrap();
            rendezvous(id, &receiver, &sync).unwrap()
        });

        // Keep publishing until the late subscriber has seen a STOP.
        while !worker.is_finished() {
            publisher
                .send_multipart(
                    protocol::addressed(WorkerId::new(4), Content::Command(Command::Stop)),
                    0,
                )
                .unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(worker.join().unwrap(), Rendezvous::Stop);
    }
}
