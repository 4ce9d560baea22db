//! Upload encoder: raw bytes in, protocol lines out.
//!
//! ```text
//! #M:<base64 metadata json>:<digest>
//! #D:<base64 ≤ 720 bytes>:<digest>     (repeated)
//! #E::<digest>   or   #A::<digest>     (exactly one)
//! ```
//!
//! Every line, the metadata line included, is one link of the hash chain.
//! Digests are cut to the upload length of 20 hex characters; the chain
//! itself always continues from the full 32-byte link.

use bytes::{Buf, BytesMut};

use crate::codec::{self, Command, Direction};
use crate::error::TunnelError;
use crate::hash_chain::HashChain;
use crate::metadata::BulkFileMetadata;

const LINE_BUDGET: usize = Direction::Upload.max_payload();

#[derive(Debug, Default)]
pub struct UploadEncoder {
    /// Source bytes not yet emitted.
    buffer: BytesMut,
    chain: HashChain,
    started: bool,
    terminated: bool,
}

impl UploadEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an `E` or `A` line was emitted.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Emit the metadata line. Must come first, and only once.
    pub fn begin(&mut self, metadata: &BulkFileMetadata) -> Result<String, TunnelError> {
        if self.started {
            return Err(TunnelError::Other("upload already started".into()));
        }
        self.started = true;
        let json = metadata.to_json()?;
        Ok(self.line(Command::Metadata, json.as_bytes()))
    }

    /// Append source bytes; returns every line that is now complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        if self.terminated {
            return Vec::new();
        }
        self.buffer.extend_from_slice(data);
        let mut lines = Vec::with_capacity(self.buffer.len() / LINE_BUDGET);
        while self.buffer.len() >= LINE_BUDGET {
            let chunk = self.buffer.split_to(LINE_BUDGET);
            lines.push(self.line(Command::Data, &chunk));
        }
        lines
    }

    /// Source ended: flush the remainder and close with `E`.
    pub fn finish(&mut self) -> Vec<String> {
        if self.terminated {
            return Vec::new();
        }
        let mut lines = Vec::with_capacity(2);
        if self.buffer.has_remaining() {
            let rest = self.buffer.split();
            lines.push(self.line(Command::Data, &rest));
        }
        lines.push(self.line(Command::End, b""));
        self.terminated = true;
        lines
    }

    /// Close with `A`. Buffered bytes are discarded.
    pub fn abort(&mut self) -> Option<String> {
        if self.terminated {
            return None;
        }
        self.buffer.clear();
        self.terminated = true;
        Some(self.line(Command::Abort, b""))
    }

    fn line(&mut self, command: Command, raw: &[u8]) -> String {
        let hash = self.chain.next_hex(raw, Direction::Upload.hash_len());
        codec::encode_frame(command, raw, &hash)
    }
}
