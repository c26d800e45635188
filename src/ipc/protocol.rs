//! Wire protocol shared by managers and workers.
//!
//! Every message is a ZeroMQ multipart message. Three layouts are used:
//!
//! ```text
//! addressed    [worker_id, kind, content]   sink-bound and published work
//! unaddressed  [kind, content]              daemon push, load balancer requests
//! control      [worker_id, TOKEN]           published pause/resume/stop
//! ```
//!
//! `kind` is either `cmd` (content is one of the control tokens) or `data`
//! (content is a JSON-serialized application payload).

use crate::error::{PipeError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of one worker within a manager's scope.
///
/// On the wire it is the decimal string of the id. That string doubles as
/// the subscription filter for published messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u32);

/// Identity used by the single daemon worker of a push/pull manager.
pub const DAEMON_WORKER_ID: WorkerId = WorkerId(0);

impl WorkerId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Frame used for routing and subscription filtering.
    pub fn to_filter(self) -> Vec<u8> {
        self.0.to_string().into_bytes()
    }

    /// Parse an identity frame.
    pub fn from_filter(frame: &[u8]) -> Result<Self> {
        std::str::from_utf8(frame)
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .map(Self)
            .ok_or_else(|| {
                PipeError::Protocol(format!(
                    "invalid worker identity frame {:?}",
                    String::from_utf8_lossy(frame)
                ))
            })
    }
}

impl From<u32> for WorkerId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl FromStr for WorkerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Control tokens. The byte spelling is the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Start,
    Stop,
    Stopped,
    Finished,
    Kill,
    Pause,
    Resume,
    Ready,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::Start,
        Command::Stop,
        Command::Stopped,
        Command::Finished,
        Command::Kill,
        Command::Pause,
        Command::Resume,
        Command::Ready,
    ];

    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Start => b"START",
            Self::Stop => b"STOP",
            Self::Stopped => b"STOPPED",
            Self::Finished => b"FINISHED",
            Self::Kill => b"KILL",
            Self::Pause => b"PAUSE",
            Self::Resume => b"RESUME",
            Self::Ready => b"READY",
        }
    }

    pub fn parse(token: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_bytes() == token)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

const KIND_CMD: &[u8] = b"cmd";
const KIND_DATA: &[u8] = b"data";

/// Body of a message: either a control token or serialized data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Command(Command),
    Data(Vec<u8>),
}

impl Content {
    fn into_frames(self) -> [Vec<u8>; 2] {
        match self {
            Self::Command(cmd) => [KIND_CMD.to_vec(), cmd.as_bytes().to_vec()],
            Self::Data(payload) => [KIND_DATA.to_vec(), payload],
        }
    }

    fn from_frames(kind: &[u8], content: Vec<u8>) -> Result<Self> {
        match kind {
            KIND_CMD => Command::parse(&content).map(Self::Command).ok_or_else(|| {
                PipeError::Protocol(format!(
                    "unknown control token {:?}",
                    String::from_utf8_lossy(&content)
                ))
            }),
            KIND_DATA => Ok(Self::Data(content)),
            other => Err(PipeError::Protocol(format!(
                "unknown message kind {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// A message carrying the identity of the worker it is from or for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub worker_id: WorkerId,
    pub content: Content,
}

/// Build `[worker_id, kind, content]`.
pub fn addressed(worker_id: WorkerId, content: Content) -> Vec<Vec<u8>> {
    let [kind, body] = content.into_frames();
    vec![worker_id.to_filter(), kind, body]
}

/// Build `[kind, content]`.
pub fn unaddressed(content: Content) -> Vec<Vec<u8>> {
    content.into_frames().to_vec()
}

/// Build `[worker_id, TOKEN]` for the control channel.
pub fn control(worker_id: WorkerId, command: Command) -> Vec<Vec<u8>> {
    vec![worker_id.to_filter(), command.as_bytes().to_vec()]
}

/// Split the topic frame off an addressed message without interpreting it.
///
/// Subscribers use this to drop messages that only share a prefix with
/// their own filter.
pub fn split_topic(mut frames: Vec<Vec<u8>>) -> Result<(Vec<u8>, Vec<Vec<u8>>)> {
    if frames.is_empty() {
        return Err(PipeError::Protocol("empty message".into()));
    }
    let topic = frames.remove(0);
    Ok((topic, frames))
}

pub fn parse_addressed(frames: Vec<Vec<u8>>) -> Result<Envelope> {
    let [id, kind, content]: [Vec<u8>; 3] = frames.try_into().map_err(|f: Vec<Vec<u8>>| {
        PipeError::Protocol(format!("expected 3 frames, got {}", f.len()))
    })?;
    Ok(Envelope {
        worker_id: WorkerId::from_filter(&id)?,
        content: Content::from_frames(&kind, content)?,
    })
}

pub fn parse_unaddressed(frames: Vec<Vec<u8>>) -> Result<Content> {
    let [kind, content]: [Vec<u8>; 2] = frames.try_into().map_err(|f: Vec<Vec<u8>>| {
        PipeError::Protocol(format!("expected 2 frames, got {}", f.len()))
    })?;
    Content::from_frames(&kind, content)
}

/// Parse `[worker_id, TOKEN]`, returning the raw topic and the token.
pub fn parse_control(frames: Vec<Vec<u8>>) -> Result<(Vec<u8>, Command)> {
    let [topic, token]: [Vec<u8>; 2] = frames.try_into().map_err(|f: Vec<Vec<u8>>| {
        PipeError::Protocol(format!("expected 2 control frames, got {}", f.len()))
    })?;
    let command = Command::parse(&token).ok_or_else(|| {
        PipeError::Protocol(format!(
            "unknown control token {:?}",
            String::from_utf8_lossy(&token)
        ))
    })?;
    Ok((topic, command))
}

/// Serialize an application payload.
pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Deserialize an application payload.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Transport identity of a load balanced worker, e.g. `Thumbnail-Extractor-2`.
pub fn create_identity(worker_type: &str, worker_id: WorkerId) -> Vec<u8> {
    let worker_type = worker_type.split_whitespace().collect::<Vec<_>>().join("-");
    format!("{}-{}", worker_type, worker_id).into_bytes()
}

/// Recover the worker id from a transport identity.
pub fn worker_id_from_identity(identity: &[u8]) -> Result<WorkerId> {
    let text = std::str::from_utf8(identity)
        .map_err(|_| PipeError::Protocol("identity is not valid UTF-8".into()))?;
    let tail = text.rsplit('-').next().unwrap_or(text);
    WorkerId::from_filter(tail.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_filter() {
        assert_eq!(WorkerId::new(54).to_filter(), b"54".to_vec());
        assert_eq!(WorkerId::from_filter(b"54").unwrap(), WorkerId::new(54));
        assert!(WorkerId::from_filter(b"fifty").is_err());
        assert!(WorkerId::from_filter(b"").is_err());
    }

    #[test]
    fn test_command_tokens_are_verbatim() {
        let expected = [
            "START", "STOP", "STOPPED", "FINISHED", "KILL", "PAUSE", "RESUME", "READY",
        ];
        for (command, token) in Command::ALL.iter().zip(expected) {
            assert_eq!(command.as_bytes(), token.as_bytes());
            assert_eq!(command.to_string(), token);
        }
        for command in Command::ALL {
            assert_eq!(Command::parse(command.as_bytes()), Some(command));
        }
        assert_eq!(Command::parse(b"stop"), None);
    }

    #[test]
    fn test_addressed_layout() {
        let frames = addressed(WorkerId::new(3), Content::Command(Command::Finished));
        assert_eq!(
            frames,
            vec![b"3".to_vec(), b"cmd".to_vec(), b"FINISHED".to_vec()]
        );

        let envelope = parse_addressed(frames).unwrap();
        assert_eq!(envelope.worker_id, WorkerId::new(3));
        assert_eq!(envelope.content, Content::Command(Command::Finished));
    }

    #[test]
    fn test_unknown_token_is_protocol_violation() {
        let frames = vec![b"1".to_vec(), b"cmd".to_vec(), b"EXPLODE".to_vec()];
        match parse_addressed(frames) {
            Err(PipeError::Protocol(msg)) => assert!(msg.contains("EXPLODE")),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_frame_count() {
        assert!(parse_addressed(vec![b"1".to_vec(), b"cmd".to_vec()]).is_err());
        assert!(parse_unaddressed(vec![b"cmd".to_vec()]).is_err());
        assert!(parse_control(vec![b"1".to_vec()]).is_err());
    }

    #[test]
    fn test_unaddressed_data() {
        let frames = unaddressed(Content::Data(b"{}".to_vec()));
        assert_eq!(frames[0], b"data".to_vec());
        assert_eq!(
            parse_unaddressed(frames).unwrap(),
            Content::Data(b"{}".to_vec())
        );
    }

    #[test]
    fn test_control_layout() {
        let frames = control(WorkerId::new(10), Command::Pause);
        assert_eq!(frames, vec![b"10".to_vec(), b"PAUSE".to_vec()]);
        let (topic, command) = parse_control(frames).unwrap();
        assert_eq!(topic, b"10".to_vec());
        assert_eq!(command, Command::Pause);
    }

    #[test]
    fn test_payload_round_trip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct ScanArguments {
            scan_id: u32,
            device: String,
            ignore_other_types: bool,
            paths: Vec<String>,
        }

        let args = ScanArguments {
            scan_id: 9,
            device: "EOS 80D".into(),
            ignore_other_types: true,
            paths: vec!["/media/card/DCIM".into()],
        };
        let bytes = encode_payload(&args).unwrap();
        let back: ScanArguments = decode_payload(&bytes).unwrap();
        assert_eq!(back, args);
    }

    #[test]
    fn test_create_identity() {
        assert_eq!(create_identity("Worker", WorkerId::new(1)), b"Worker-1");
        assert_eq!(
            create_identity("Thumbnail Extractor", WorkerId::new(2)),
            b"Thumbnail-Extractor-2"
        );
        assert_eq!(
            create_identity("Thumbnail  Extractor Plus", WorkerId::new(22)),
            b"Thumbnail-Extractor-Plus-22"
        );
    }

    #[test]
    fn test_worker_id_from_identity() {
        assert_eq!(
            worker_id_from_identity(b"Worker-1").unwrap(),
            WorkerId::new(1)
        );
        assert_eq!(
            worker_id_from_identity(b"Thumbnail-Extractor-Plus-22").unwrap(),
            WorkerId::new(22)
        );
        assert!(worker_id_from_identity(b"Worker-x").is_err());
    }
}
