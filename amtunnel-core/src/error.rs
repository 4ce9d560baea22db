//! Domain-specific error types for the application-mode tunnel.
//!
//! All fallible operations return `Result<T, TunnelError>`.
//! Nothing arriving from the peer can panic the session: every malformed
//! input maps onto a typed variant and the caller decides what to do with
//! the unconsumed bytes.

use thiserror::Error;

/// The canonical error type for the tunnel protocol.
#[derive(Debug, Error)]
pub enum TunnelError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// The declared-length metadata block is not a JSON object.
    #[error("invalid metadata: {0}")]
    MetadataParse(String),

    /// A frame does not match the fixed-offset line shape.
    #[error("malformed frame: {0}")]
    Framing(&'static str),

    /// A frame carries a character outside the protocol alphabet.
    #[error("illegal character {ch:?} at offset {offset}")]
    IllegalCharacter { ch: char, offset: usize },

    /// The recomputed chain digest disagrees with the embedded one.
    #[error("hash chain mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// The sequence ended before the end frame arrived.
    #[error("transfer ended before the end frame")]
    Incomplete,

    /// The session start signal did not carry a decimal length.
    #[error("invalid start parameters: {0}")]
    InvalidStartParams(String),

    /// Input arrived for a session that already completed or failed.
    #[error("session already finished")]
    SessionFinished,

    /// The transfer ended with `ABORT`, from either side.
    #[error("transfer aborted: {0}")]
    Aborted(String),

    // ── Source Errors ────────────────────────────────────────────
    /// Reading the upload source failed mid-stream.
    #[error("source stream error: {0}")]
    SourceStream(String),

    /// The upload source URI uses a scheme we cannot read.
    #[error("unsupported source: {0}")]
    UnsupportedSource(String),

    // ── I/O Errors ───────────────────────────────────────────────
    /// The storage or stdio layer reported an error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The pty write channel was closed by its reader.
    #[error("channel closed")]
    ChannelClosed,

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl TunnelError {
    /// Returns `true` for the errors that end a session with `ABORT`.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            TunnelError::MetadataParse(_)
                | TunnelError::Framing(_)
                | TunnelError::IllegalCharacter { .. }
                | TunnelError::Integrity { .. }
                | TunnelError::Incomplete
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for TunnelError {
    fn from(s: String) -> Self {
        TunnelError::Other(s)
    }
}

impl From<&str> for TunnelError {
    fn from(s: &str) -> Self {
        TunnelError::Other(s.to_string())
    }
}

impl From<base64::DecodeError> for TunnelError {
    fn from(e: base64::DecodeError) -> Self {
        TunnelError::Encoding(e.to_string())
    }
}

impl From<reqwest::Error> for TunnelError {
    fn from(e: reqwest::Error) -> Self {
        TunnelError::SourceStream(e.to_string())
    }
}
