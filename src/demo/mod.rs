//! Small jobs that exercise each topology end to end.
//!
//! - `scan`: directory walk on a publish/pull pipeline
//! - `stat`: file metadata from a push/pull daemon
//! - `probe`: file signatures from a load balanced pool

pub mod probe;
pub mod scan;
pub mod stat;
