//! Outbound transfers: local source → remote process.
//!
//! ```text
//! uri ──resolve──► ResolvedSource ──► BulkFileUploader ──► UploadEncoder
//!                                            │
//!                                       line queue
//!                                            ▼
//!                               PtyWriter ══budget══► PtyReader ──► pty
//! ```

pub mod channel;
pub mod encoder;
pub mod source;
pub mod uploader;

pub use channel::{DEFAULT_PTY_BUFFER_SIZE, PtyReader, PtyWriter, pty_channel};
pub use encoder::UploadEncoder;
pub use source::{ByteStream, DEFAULT_SOURCE_CHUNK_SIZE, ResolvedSource, resolve};
pub use uploader::{BulkFileUploader, UploadEvent, UploadHandle, UploadOptions};
