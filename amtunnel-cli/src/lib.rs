//! # amtunnel-cli: bulk file transfer over a pty byte stream
//!
//! Front end for `amtunnel-core`. Protocol lines travel on stdin/stdout,
//! so the binary can sit on either end of a terminal session.
//!
//! ## Commands
//!
//! - **send**: Upload a file, URL or data URI as framed lines on stdout.
//! - **receive**: Read an application-mode download from stdin into a directory.
//! - **unpack**: Rebuild a file from an upload stream on stdin.

pub mod config;
pub mod storage;
pub mod transfer;
