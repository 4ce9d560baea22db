//! Download session state machine.
//!
//! ```text
//!  Idle ──start──► Metadata ──(len ≥ declared)──► Body ──("E")──► Complete
//!                     │                             │
//!                     └──────────► Error ◄──────────┘
//!            (bad JSON, bad frame, illegal char, hash mismatch, early stop)
//! ```
//!
//! Decoded data frames go into a pending queue that is flushed into the
//! sink as far as the sink's desired size allows. When the sink fills up
//! the session answers `Pause`; the caller resumes delivery after
//! [`DownloadSession::handle_drain`] answers `Continue`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::adapter::HandlerResult;
use crate::codec::{self, Command, Direction};
use crate::error::TunnelError;
use crate::hash_chain::HashChain;
use crate::metadata::BulkFileMetadata;
use crate::storage::{BulkFile, BulkFileSink, BulkFileStorage};

/// Written bytes after which a partial file is announced.
pub const DEFAULT_CREATED_THRESHOLD: usize = 1024;

// ── DownloadState ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadState {
    /// No transfer started.
    #[default]
    Idle,
    /// Accumulating the declared-length JSON block.
    Metadata,
    /// Receiving framed data lines.
    Body,
    /// End frame verified.
    Complete,
    /// Terminal failure; the file was marked failed.
    Error,
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Metadata => write!(f, "METADATA"),
            Self::Body => write!(f, "BODY"),
            Self::Complete => write!(f, "COMPLETE"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

// ── DownloadOptions ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Written bytes that trigger the early "created" notification.
    pub created_threshold: usize,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            created_threshold: DEFAULT_CREATED_THRESHOLD,
        }
    }
}

// ── DownloadSession ──────────────────────────────────────────────

/// One inbound transfer.
pub struct DownloadSession {
    state: DownloadState,
    options: DownloadOptions,

    /// Declared byte length of the metadata block.
    metadata_len: usize,

    /// Text received but not yet consumed.
    buffer: String,

    chain: HashChain,

    /// Decoded bytes waiting for sink capacity, oldest first.
    pending: VecDeque<Bytes>,

    sink: Option<Box<dyn BulkFileSink>>,

    /// Our reference on the file; dropped when the transfer ends.
    file: Option<Arc<BulkFile>>,

    /// Bytes the sink accepted.
    written: usize,

    created_notified: bool,

    /// Notification raised but not yet collected by the owner.
    created: Option<Arc<BulkFile>>,

    failure: Option<TunnelError>,
}

impl DownloadSession {
    pub fn new(options: DownloadOptions) -> Self {
        Self {
            state: DownloadState::Idle,
            options,
            metadata_len: 0,
            buffer: String::new(),
            chain: HashChain::new(),
            pending: VecDeque::new(),
            sink: None,
            file: None,
            written: 0,
            created_notified: false,
            created: None,
            failure: None,
        }
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    /// The error that moved the session to `Error`, if any.
    pub fn failure(&self) -> Option<&TunnelError> {
        self.failure.as_ref()
    }

    /// The file being written, while the session still holds it.
    pub fn file(&self) -> Option<&Arc<BulkFile>> {
        self.file.as_ref()
    }

    /// Decoded bytes queued behind a full sink.
    pub fn pending_bytes(&self) -> usize {
        self.pending.iter().map(Bytes::len).sum()
    }

    /// Collect the "created" notification, at most once per session.
    pub fn take_created(&mut self) -> Option<Arc<BulkFile>> {
        self.created.take()
    }

    /// `true` once the sink is closed and the file released.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, DownloadState::Complete | DownloadState::Error)
            && self.sink.is_none()
    }

    // ── Triggers ─────────────────────────────────────────────────

    /// Begin a transfer. `params[0]` is the decimal byte length of the
    /// JSON metadata block that follows.
    pub fn start(&mut self, params: &[&str]) -> HandlerResult {
        *self = Self::new(self.options.clone());
        self.state = DownloadState::Metadata;

        let declared = params.first().map(|p| p.trim()).unwrap_or_default();
        match declared.parse::<usize>() {
            Ok(len) => {
                self.metadata_len = len;
                debug!(metadata_len = len, "download session started");
                HandlerResult::proceed()
            }
            Err(_) => {
                self.fail(TunnelError::InvalidStartParams(declared.to_string()));
                HandlerResult::abort("")
            }
        }
    }

    /// Consume body text from the peer.
    pub fn handle_data(
        &mut self,
        storage: &mut dyn BulkFileStorage,
        data: &str,
    ) -> HandlerResult {
        match self.state {
            DownloadState::Metadata => {
                self.buffer.push_str(data);
                self.process_metadata(storage)
            }
            DownloadState::Body => {
                self.buffer.push_str(data);
                self.process_body()
            }
            DownloadState::Complete if is_terminators(data) => HandlerResult::proceed(),
            DownloadState::Idle | DownloadState::Complete | DownloadState::Error => {
                HandlerResult::abort(data)
            }
        }
    }

    /// The sink signalled it accepts more data.
    pub fn handle_drain(&mut self) -> HandlerResult {
        if self.sink.is_none() {
            return HandlerResult::proceed();
        }
        self.flush_and_report()
    }

    /// The application-mode sequence ended.
    pub fn handle_stop(&mut self) -> HandlerResult {
        if self.sink.is_some() {
            if let Err(e) = self.flush() {
                self.fail(e);
                return HandlerResult::abort(std::mem::take(&mut self.buffer));
            }
        }
        self.notify_created(true);

        match self.state {
            DownloadState::Complete => HandlerResult::proceed(),
            DownloadState::Error => HandlerResult::abort(std::mem::take(&mut self.buffer)),
            _ => {
                self.fail(TunnelError::Incomplete);
                HandlerResult::abort(std::mem::take(&mut self.buffer))
            }
        }
    }

    // ── Metadata ─────────────────────────────────────────────────

    fn process_metadata(&mut self, storage: &mut dyn BulkFileStorage) -> HandlerResult {
        if self.buffer.len() < self.metadata_len {
            return HandlerResult::proceed();
        }

        let metadata = match self.parse_metadata() {
            Ok(metadata) => metadata,
            Err(e) => return self.abort_with_buffer(e),
        };

        let sink = match storage.open_writable(metadata) {
            Ok(sink) => sink,
            Err(e) => return self.abort_with_buffer(e),
        };
        let file = sink.file().clone();
        info!(
            file_id = file.id(),
            filename = file.metadata().filename().unwrap_or("<unnamed>"),
            "receiving bulk file"
        );
        self.file = Some(file);
        self.sink = Some(sink);

        self.buffer.drain(..self.metadata_len);
        self.state = DownloadState::Body;
        self.process_body()
    }

    fn parse_metadata(&self) -> Result<BulkFileMetadata, TunnelError> {
        let block = self.buffer.get(..self.metadata_len).ok_or_else(|| {
            TunnelError::MetadataParse("declared length splits a character".into())
        })?;
        let mut metadata = BulkFileMetadata::parse(block)?;
        metadata.backfill_inferred();
        Ok(metadata)
    }

    // ── Body ─────────────────────────────────────────────────────

    fn process_body(&mut self) -> HandlerResult {
        let max_line_len = Direction::Download.max_line_len();
        // consumed prefix of `buffer`; compacted once after the loop
        let mut cursor = 0;

        while self.state == DownloadState::Body {
            let Some((len, consumed)) =
                codec::next_frame_boundary(&self.buffer.as_bytes()[cursor..], max_line_len)
            else {
                break;
            };
            if len > 0 {
                if let Err(e) = self.process_frame(cursor, len) {
                    self.buffer.drain(..cursor);
                    return self.abort_with_buffer(e);
                }
            }
            cursor += consumed;
        }

        if self.state == DownloadState::Complete {
            let trailing = self.buffer[cursor..].trim_start_matches(['\n', '\r']);
            if !trailing.is_empty() {
                debug!(bytes = trailing.len(), "ignoring data after end frame");
            }
            self.buffer.clear();
        } else {
            self.buffer.drain(..cursor);
        }

        self.flush_and_report()
    }

    /// Validate and apply the frame occupying `buffer[start..start + len]`.
    /// Everything before `start` is ASCII frames already consumed.
    fn process_frame(&mut self, start: usize, len: usize) -> Result<(), TunnelError> {
        let raw = &self.buffer.as_bytes()[start..start + len];
        if let Some(offset) = codec::find_illegal_byte(raw) {
            // every byte before `offset` is ASCII, so it is a char boundary
            let ch = self.buffer[start + offset..]
                .chars()
                .next()
                .unwrap_or('\u{fffd}');
            return Err(TunnelError::IllegalCharacter { ch, offset });
        }

        let frame = codec::decode_frame(&self.buffer[start..start + len], Direction::Download)?;
        self.chain.verify(&frame.payload, &frame.hash)?;
        debug!(command = %frame.command, bytes = frame.payload.len(), "frame verified");

        match frame.command {
            Command::Data if !frame.payload.is_empty() => self.pending.push_back(frame.payload),
            Command::Data => {}
            Command::End => self.state = DownloadState::Complete,
            Command::Metadata | Command::Abort => {
                return Err(TunnelError::Framing("command not valid in this direction"));
            }
        }
        Ok(())
    }

    // ── Flushing ─────────────────────────────────────────────────

    fn flush_and_report(&mut self) -> HandlerResult {
        match self.flush() {
            Ok(true) => HandlerResult::proceed(),
            Ok(false) => HandlerResult::pause(),
            Err(e) => self.abort_with_buffer(e),
        }
    }

    /// Write pending buffers until the sink is full or the queue is
    /// empty. Returns whether the sink can take more right now.
    fn flush(&mut self) -> Result<bool, TunnelError> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(true);
        };

        let mut ready = true;
        let mut written = 0;
        while let Some(mut chunk) = self.pending.pop_front() {
            let desired = sink.desired_size();
            if desired == 0 {
                self.pending.push_front(chunk);
                ready = false;
                break;
            }
            if chunk.len() > desired {
                let head = chunk.split_to(desired);
                sink.write(&head)?;
                written += head.len();
                self.pending.push_front(chunk);
                ready = false;
                break;
            }
            ready = sink.write(&chunk)?;
            written += chunk.len();
            if !ready {
                break;
            }
        }

        self.written += written;
        self.notify_created(false);

        if self.pending.is_empty() && self.state == DownloadState::Complete {
            self.finish_success();
        }
        Ok(ready)
    }

    // ── Endings ──────────────────────────────────────────────────

    fn notify_created(&mut self, force: bool) {
        if self.created_notified {
            return;
        }
        let Some(file) = &self.file else {
            return;
        };
        if force || self.written >= self.options.created_threshold {
            self.created = Some(file.clone());
            self.created_notified = true;
        }
    }

    fn finish_success(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.close(true);
        }
        self.notify_created(true);
        if let Some(file) = self.file.take() {
            info!(file_id = file.id(), bytes = self.written, "bulk file complete");
        }
    }

    fn fail(&mut self, error: TunnelError) {
        warn!(state = %self.state, "download aborted: {error}");
        self.state = DownloadState::Error;
        self.pending.clear();
        if let Some(mut sink) = self.sink.take() {
            sink.close(false);
        }
        self.notify_created(true);
        self.file = None;
        self.failure = Some(error);
    }

    fn abort_with_buffer(&mut self, error: TunnelError) -> HandlerResult {
        self.fail(error);
        HandlerResult::abort(std::mem::take(&mut self.buffer))
    }
}

fn is_terminators(data: &str) -> bool {
    data.bytes().all(|b| b == b'\n' || b == b'\r')
}

// ── Tests ────────────────────────────────────────────────────────
