//! ZeroMQ socket helpers.
//!
//! All endpoints are TCP on the loopback interface. Managers bind to
//! ephemeral ports and hand the port numbers to their workers on the
//! command line.

use crate::error::{PipeError, Result};

/// Interface every endpoint binds to or connects on.
pub const LOOPBACK: &str = "127.0.0.1";

/// How long a closing socket may hold on to unsent messages (ms).
///
/// The ZeroMQ default is to wait forever, which would make dropping a
/// context hang on a message addressed to a dead worker.
const DEFAULT_LINGER_MS: i32 = 250;

/// Outcome of a non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message was queued for delivery.
    Sent,
    /// No peer could accept the message right now.
    WouldBlock,
}

/// Endpoint string for a loopback port.
pub fn endpoint(port: u16) -> String {
    format!("tcp://{}:{}", LOOPBACK, port)
}

/// Create a socket with a bounded linger period.
pub fn new_socket(context: &zmq::Context, kind: zmq::SocketType) -> Result<zmq::Socket> {
    let socket = context.socket(kind)?;
    socket.set_linger(DEFAULT_LINGER_MS)?;
    Ok(socket)
}

/// Create a socket and connect it to a loopback port.
pub fn connect_socket(
    context: &zmq::Context,
    kind: zmq::SocketType,
    port: u16,
) -> Result<zmq::Socket> {
    let socket = new_socket(context, kind)?;
    socket.connect(&endpoint(port))?;
    Ok(socket)
}

/// Create a socket bound to an ephemeral loopback port.
pub fn bind_socket(context: &zmq::Context, kind: zmq::SocketType) -> Result<(zmq::Socket, u16)> {
    let socket = new_socket(context, kind)?;
    let port = bind_to_random_port(&socket)?;
    Ok((socket, port))
}

/// Bind to an ephemeral loopback port and return the port chosen.
pub fn bind_to_random_port(socket: &zmq::Socket) -> Result<u16> {
    socket.bind(&format!("tcp://{}:*", LOOPBACK))?;
    let endpoint = socket
        .get_last_endpoint()?
        .map_err(|raw| PipeError::Protocol(format!("non UTF-8 endpoint {:?}", raw)))?;
    parse_port(&endpoint)
}

fn parse_port(endpoint: &str) -> Result<u16> {
    endpoint
        .rsplit(':')
        .next()
        .and_then(|port| port.parse().ok())
        .ok_or_else(|| PipeError::Protocol(format!("cannot read port from {}", endpoint)))
}

/// Send without blocking, reporting a full or peerless socket as `WouldBlock`.
pub fn try_send_multipart(socket: &zmq::Socket, frames: Vec<Vec<u8>>) -> Result<SendOutcome> {
    match socket.send_multipart(frames, zmq::DONTWAIT) {
        Ok(()) => Ok(SendOutcome::Sent),
        Err(zmq::Error::EAGAIN) => Ok(SendOutcome::WouldBlock),
        Err(e) => Err(e.into()),
    }
}

/// Blocking multipart receive, retried on EINTR.
pub fn recv_multipart(socket: &zmq::Socket) -> Result<Vec<Vec<u8>>> {
    loop {
        match socket.recv_multipart(0) {
            Ok(frames) => return Ok(frames),
            Err(zmq::Error::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Non-blocking multipart receive. `None` when nothing is queued.
pub fn try_recv_multipart(socket: &zmq::Socket) -> Result<Option<Vec<Vec<u8>>>> {
    match socket.recv_multipart(zmq::DONTWAIT) {
        Ok(frames) => Ok(Some(frames)),
        Err(zmq::Error::EAGAIN) | Err(zmq::Error::EINTR) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Non-blocking single-frame receive. `None` when nothing is queued.
pub fn try_recv_bytes(socket: &zmq::Socket) -> Result<Option<Vec<u8>>> {
    match socket.recv_bytes(zmq::DONTWAIT) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(zmq::Error::EAGAIN) | Err(zmq::Error::EINTR) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Blocking single-frame receive, retried on EINTR.
pub fn recv_bytes(socket: &zmq::Socket) -> Result<Vec<u8>> {
    loop {
        match socket.recv_bytes(0) {
            Ok(bytes) => return Ok(bytes),
            Err(zmq::Error::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("tcp://127.0.0.1:45123").unwrap(), 45123);
        assert!(parse_port("tcp://127.0.0.1:").is_err());
        assert!(parse_port("inproc://sink").is_err());
    }

    #[test]
    fn test_bind_and_connect_roundtrip() {
        let context = zmq::Context::new();
        let (pull, port) = bind_socket(&context, zmq::PULL).unwrap();
        assert!(port > 0);

        let push = connect_socket(&context, zmq::PUSH, port).unwrap();
        push.send_multipart(vec![b"a".to_vec(), b"b".to_vec()], 0)
            .unwrap();

        let frames = recv_multipart(&pull).unwrap();
        assert_eq!(frames, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_try_send_without_peer_would_block() {
        let context = zmq::Context::new();
        let (push, _port) = bind_socket(&context, zmq::PUSH).unwrap();
        let outcome = try_send_multipart(&push, vec![b"cmd".to_vec(), b"STOP".to_vec()]).unwrap();
        assert_eq!(outcome, SendOutcome::WouldBlock);
    }

    #[test]
    fn test_try_recv_empty() {
        let context = zmq::Context::new();
        let (pull, _port) = bind_socket(&context, zmq::PULL).unwrap();
        assert!(try_recv_multipart(&pull).unwrap().is_none());
        assert!(try_recv_bytes(&pull).unwrap().is_none());
    }
}
