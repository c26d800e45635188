//! File signature probe run as a load balanced worker.

use crate::error::Result;
use crate::worker::{BalancedJob, ResultSender};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;

/// Number of leading bytes reported.
const MAGIC_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub path: PathBuf,
    /// Leading bytes of the file, hex encoded.
    pub magic: Option<String>,
    pub kind: String,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn for_path(path: PathBuf) -> Self {
        match read_magic(&path) {
            Ok(magic) => Self {
                kind: classify(&magic).to_string(),
                magic: Some(magic.iter().map(|b| format!("{:02x}", b)).collect()),
                error: None,
                path,
            },
            Err(e) => Self {
                kind: "unknown".to_string(),
                magic: None,
                error: Some(e.to_string()),
                path,
            },
        }
    }
}

fn read_magic(path: &std::path::Path) -> std::io::Result<Vec<u8>> {
    let mut magic = Vec::with_capacity(MAGIC_LEN);
    std::fs::File::open(path)?
        .take(MAGIC_LEN as u64)
        .read_to_end(&mut magic)?;
    Ok(magic)
}

/// Best-effort file kind from its leading bytes.
pub fn classify(magic: &[u8]) -> &'static str {
    match magic {
        [0xff, 0xd8, 0xff, ..] => "jpeg",
        [0x89, b'P', b'N', b'G', ..] => "png",
        [b'I', b'I', 0x2a, 0x00, ..] | [b'M', b'M', 0x00, 0x2a, ..] => "tiff",
        [b'%', b'P', b'D', b'F', ..] => "pdf",
        [0x7f, b'E', b'L', b'F', ..] => "elf",
        [b'#', b'!', ..] => "script",
        [] => "empty",
        _ => "data",
    }
}

#[derive(Debug, Default)]
pub struct ProbeJob;

impl BalancedJob for ProbeJob {
    const WORKER_TYPE: &'static str = "Probe";
    type Request = ProbeRequest;

    fn handle(&mut self, results: &ResultSender, request: ProbeRequest) -> Result<()> {
        results.send_data(&ProbeResult::for_path(request.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify(&[0xff, 0xd8, 0xff, 0xe0]), "jpeg");
        assert_eq!(classify(b"\x89PNG\r\n\x1a\n"), "png");
        assert_eq!(classify(b"II*\0"), "tiff");
        assert_eq!(classify(b"#!/bin/sh"), "script");
        assert_eq!(classify(b""), "empty");
        assert_eq!(classify(b"hello"), "data");
    }

    #[test]
    fn test_probe_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("script.sh");
        std::fs::write(&file, b"#!/bin/sh\necho hi\n").unwrap();

        let result = ProbeResult::for_path(file);
        assert_eq!(result.kind, "script");
        assert_eq!(result.magic.as_deref(), Some("23212f62696e2f73"));

        let result = ProbeResult::for_path(dir.path().join("missing"));
        assert_eq!(result.kind, "unknown");
        assert!(result.error.is_some());
    }
}
