//! # amtunnel-core
//!
//! File transfer over a terminal's application-mode escape channel.
//!
//! This crate contains:
//! - **Codec**: the `#<cmd>:<base64>:<hex>` line format, plus `LineCodec` for `tokio_util`
//! - **Hash chain**: the SHA-256 chain linking every line to the one before it
//! - **Metadata**: `BulkFileMetadata`, the JSON description of a file
//! - **Storage**: `BulkFileStorage` / `BulkFileSink` with an in-memory implementation
//! - **Adapter**: the `AppModeHandler` seam and its `CONTINUE` / `PAUSE` / `ABORT` verdicts
//! - **Download**: `DownloadSession` state machine and `BulkDownloadHandler`
//! - **Upload**: `UploadEncoder`, source resolution and the flow-controlled `BulkFileUploader`
//! - **Error**: `TunnelError`, a `thiserror`-based error type

pub mod adapter;
pub mod codec;
pub mod download;
pub mod error;
pub mod hash_chain;
pub mod metadata;
pub mod storage;
pub mod upload;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use adapter::{Action, AppModeHandler, HandlerResult};
pub use codec::{Command, Direction, Frame, LineCodec};
pub use download::{BulkDownloadHandler, DownloadOptions, DownloadSession, DownloadState};
pub use error::TunnelError;
pub use hash_chain::HashChain;
pub use metadata::BulkFileMetadata;
pub use storage::{BulkFile, BulkFileSink, BulkFileStorage, FileStatus, MemoryStorage};
pub use upload::{
    BulkFileUploader, PtyReader, PtyWriter, UploadEncoder, UploadEvent, UploadHandle,
    UploadOptions, pty_channel,
};
