//! Inbound transfers: remote process → local storage.
//!
//! ```text
//! escape parser ──start(len)──► BulkDownloadHandler ──► DownloadSession
//!               ──data(text)──►        │                     │
//!               ◄──CONTINUE / PAUSE / ABORT──────────────────┘
//!                                                            ▼
//!                                              BulkFileSink (storage)
//! ```

pub mod handler;
pub mod session;

pub use handler::BulkDownloadHandler;
pub use session::{DEFAULT_CREATED_THRESHOLD, DownloadOptions, DownloadSession, DownloadState};
