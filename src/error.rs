//! Error types for the SCP protocol engine

use std::io;
use thiserror::Error;

/// Failures raised by the codec, the two protocol roles and the session.
///
/// Local filesystem and filter failures are not represented here; the
/// directory walkers and the client wrap those with `anyhow` context instead.
#[derive(Debug, Error)]
pub enum ScpError {
    /// I/O on the remote streams failed (includes a forced session close)
    #[error("transport I/O failed: {0}")]
    Io(#[from] io::Error),

    /// Writing a received body to its local destination failed
    #[error("writing to destination failed: {0}")]
    Destination(#[source] io::Error),

    #[error("expected {expected} message, got {actual}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: String,
    },

    #[error("malformed {kind} header: {line:?}")]
    MalformedHeader { kind: &'static str, line: String },

    #[error("unexpected message type byte 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("unexpected end of stream while {0}")]
    UnexpectedEof(&'static str),

    #[error("header line exceeds {0} bytes")]
    LineTooLong(usize),

    /// The remote scp sent a fatal (0x02) reply
    #[error("remote reported fatal error: {0}")]
    RemoteFatal(String),

    #[error("file body shorter than announced: expected {expected} bytes, got {actual}")]
    ShortBody { expected: u64, actual: u64 },

    #[error("file body longer than announced {expected} bytes")]
    LongBody { expected: u64 },

    #[error("end-directory without matching start-directory")]
    UnbalancedEnd,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("session not started")]
    NotStarted,

    #[error("session already closed")]
    Closed,
}

pub type ScpResult<T> = Result<T, ScpError>;
