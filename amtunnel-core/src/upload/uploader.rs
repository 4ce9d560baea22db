//! Bulk file uploader. Drives an [`UploadEncoder`] from a source stream
//! into the bounded pty channel.
//!
//! ```text
//! source ──► byte counter ──► UploadEncoder ──► line queue ──► PtyWriter
//!   ▲                                              │
//!   └──────── paused while the queue is non-empty ─┘
//! ```
//!
//! Lines are written whole, in order, and only as far as the channel
//! budget allows. Every capacity-changed signal writes as many queued
//! lines as now fit.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::TunnelError;
use crate::metadata::BulkFileMetadata;
use crate::upload::channel::PtyWriter;
use crate::upload::encoder::UploadEncoder;
use crate::upload::source::{self, DEFAULT_SOURCE_CHUNK_SIZE, ResolvedSource};

/// Progress and completion notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// Total source bytes read so far.
    Uploaded(u64),
    /// The upload ended (completed, aborted or failed). Sent once.
    Finished,
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Read size for file and inline sources.
    pub source_chunk_size: usize,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            source_chunk_size: DEFAULT_SOURCE_CHUNK_SIZE,
        }
    }
}

/// Remote control for a running upload.
#[derive(Debug, Clone, Default)]
pub struct UploadHandle {
    abort: CancellationToken,
    dispose: CancellationToken,
}

impl UploadHandle {
    /// Send `A`, stop reading the source, finish without waiting for
    /// the queue to drain.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Tear down without emitting anything further.
    pub fn dispose(&self) {
        self.dispose.cancel();
    }
}

pub struct BulkFileUploader {
    uri: String,
    overrides: BulkFileMetadata,
    options: UploadOptions,
    encoder: UploadEncoder,
    queue: VecDeque<String>,
    pty: PtyWriter,
    events: mpsc::UnboundedSender<UploadEvent>,
    handle: UploadHandle,
    uploaded: Arc<AtomicU64>,
    finished: bool,
}

impl BulkFileUploader {
    /// Create an uploader for the source at `uri`, writing into `pty`.
    pub fn new(
        uri: impl Into<String>,
        pty: PtyWriter,
        options: UploadOptions,
    ) -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let uploader = Self {
            uri: uri.into(),
            overrides: BulkFileMetadata::new(),
            options,
            encoder: UploadEncoder::new(),
            queue: VecDeque::new(),
            pty,
            events,
            handle: UploadHandle::default(),
            uploaded: Arc::new(AtomicU64::new(0)),
            finished: false,
        };
        (uploader, events_rx)
    }

    /// Metadata entries that take precedence over what the source reports.
    pub fn with_metadata(mut self, overrides: BulkFileMetadata) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn handle(&self) -> UploadHandle {
        self.handle.clone()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn dispose(&self) {
        self.handle.dispose();
    }

    /// Source bytes read so far.
    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// Lines waiting for pty budget.
    pub fn queued_lines(&self) -> usize {
        self.queue.len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Resolve the source and run the upload to its end.
    ///
    /// Resolution failures are returned before anything is written. A
    /// source that fails mid-stream is logged and the upload ends with `A`.
    pub async fn upload(&mut self) -> Result<(), TunnelError> {
        let source = source::resolve(&self.uri, self.options.source_chunk_size).await?;
        self.upload_from(source).await
    }

    /// Run the upload over an already opened source.
    pub async fn upload_from(&mut self, source: ResolvedSource) -> Result<(), TunnelError> {
        let mut metadata = source.metadata;
        for (key, value) in self.overrides.as_map() {
            metadata.insert(key.clone(), value.clone());
        }
        info!(
            filename = metadata.filename().unwrap_or("<unnamed>"),
            size = metadata.size(),
            "uploading bulk file"
        );
        let first = self.encoder.begin(&metadata)?;
        self.enqueue([first])?;

        let counter = self.uploaded.clone();
        let events = self.events.clone();
        let mut stream = source.stream.inspect(move |chunk| {
            if let Ok(bytes) = chunk {
                let total = counter.fetch_add(bytes.len() as u64, Ordering::Relaxed)
                    + bytes.len() as u64;
                let _ = events.send(UploadEvent::Uploaded(total));
            }
        });

        let abort = self.handle.abort.clone();
        let dispose = self.handle.dispose.clone();
        let pty = self.pty.clone();
        let mut source_ended = false;

        loop {
            let paused = !self.queue.is_empty();
            tokio::select! {
                biased;
                _ = dispose.cancelled() => {
                    debug!("upload disposed");
                    self.queue.clear();
                    self.finished = true;
                    return Ok(());
                }
                _ = abort.cancelled() => {
                    return self.abort_now();
                }
                _ = pty.capacity_changed(), if paused => {
                    self.flush_queue()?;
                }
                next = stream.next(), if !paused && !source_ended => match next {
                    Some(Ok(bytes)) => {
                        let lines = self.encoder.push(&bytes);
                        self.enqueue(lines)?;
                    }
                    Some(Err(e)) => {
                        error!("upload source failed: {e}");
                        return self.abort_now();
                    }
                    None => {
                        source_ended = true;
                        let lines = self.encoder.finish();
                        self.enqueue(lines)?;
                    }
                },
            }

            if source_ended && self.queue.is_empty() {
                info!(bytes = self.uploaded(), "upload complete");
                self.finish();
                return Ok(());
            }
        }
    }

    fn enqueue(&mut self, lines: impl IntoIterator<Item = String>) -> Result<(), TunnelError> {
        self.queue.extend(lines);
        self.flush_queue()
    }

    /// Write queued lines, whole, while they fit.
    fn flush_queue(&mut self) -> Result<(), TunnelError> {
        while let Some(line) = self.queue.front() {
            if !self.pty.try_write(line)? {
                break;
            }
            self.queue.pop_front();
        }
        Ok(())
    }

    fn abort_now(&mut self) -> Result<(), TunnelError> {
        if let Some(line) = self.encoder.abort() {
            warn!(bytes = self.uploaded(), "upload aborted");
            self.enqueue([line])?;
        }
        if !self.queue.is_empty() {
            // keep order intact for the peer's hash chain; drain in the background
            spawn_drain(self.pty.clone(), std::mem::take(&mut self.queue));
        }
        self.finish();
        Ok(())
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            let _ = self.events.send(UploadEvent::Finished);
        }
    }
}

fn spawn_drain(pty: PtyWriter, mut queue: VecDeque<String>) {
    tokio::spawn(async move {
        while let Some(line) = queue.pop_front() {
            loop {
                match pty.try_write(&line) {
                    Ok(true) => break,
                    Ok(false) => pty.capacity_changed().await,
                    Err(_) => return,
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::stream;

    use super::*;
    use crate::upload::channel::pty_channel;

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn empty_source_emits_metadata_and_end() {
        let (writer, mut reader) = pty_channel(4096);
        let (mut uploader, mut events) =
            BulkFileUploader::new("data:,", writer, UploadOptions::default());
        uploader.upload().await.unwrap();

        let first = reader.try_recv().unwrap();
        assert!(first.starts_with("#M:"));
        let last = reader.try_recv().unwrap();
        assert!(last.starts_with("#E::"));
        assert!(reader.try_recv().is_none());
        assert_eq!(drain_events(&mut events), vec![UploadEvent::Finished]);
    }

    #[tokio::test]
    async fn queue_holds_lines_that_do_not_fit() {
        let (writer, mut reader) = pty_channel(1000);
        let (mut uploader, _events) =
            BulkFileUploader::new("data:,", writer, UploadOptions::default());
        uploader.enqueue(["x".repeat(600), "y".repeat(600)]).unwrap();
        assert_eq!(uploader.queued_lines(), 1);

        reader.try_recv();
        uploader.flush_queue().unwrap();
        assert_eq!(uploader.queued_lines(), 0);
    }

    #[tokio::test]
    async fn failing_source_ends_with_abort() {
        let (writer, mut reader) = pty_channel(4096);
        let (mut uploader, mut events) =
            BulkFileUploader::new("unused", writer, UploadOptions::default());
        let source = ResolvedSource {
            stream: Box::pin(stream::iter(vec![
                Ok(Bytes::from_static(b"0123456789")),
                Err(TunnelError::SourceStream("connection reset".into())),
            ])),
            metadata: BulkFileMetadata::new(),
        };
        uploader.upload_from(source).await.unwrap();

        assert!(reader.try_recv().unwrap().starts_with("#M:"));
        assert!(reader.try_recv().unwrap().starts_with("#A::"));
        assert!(reader.try_recv().is_none());
        assert_eq!(
            drain_events(&mut events),
            vec![UploadEvent::Uploaded(10), UploadEvent::Finished]
        );
    }

    #[tokio::test]
    async fn abort_before_start_sends_abort_marker() {
        let (writer, mut reader) = pty_channel(4096);
        let (mut uploader, mut events) =
            BulkFileUploader::new("data:,abc", writer, UploadOptions::default());
        uploader.abort();
        uploader.upload().await.unwrap();

        assert!(reader.try_recv().unwrap().starts_with("#M:"));
        assert!(reader.try_recv().unwrap().starts_with("#A::"));
        assert!(reader.try_recv().is_none());
        assert!(uploader.is_finished());
        assert_eq!(drain_events(&mut events), vec![UploadEvent::Finished]);
    }

    #[tokio::test]
    async fn source_stalls_behind_queue_and_abort_trails_it() {
        // each 2880-byte chunk encodes to four ~1 KiB data lines
        let (writer, mut reader) = pty_channel(1024);
        let (mut uploader, mut events) =
            BulkFileUploader::new("unused", writer, UploadOptions::default());
        let handle = uploader.handle();

        let polled = Arc::new(AtomicU64::new(0));
        let counter = polled.clone();
        let source = ResolvedSource {
            stream: Box::pin(stream::iter(0..50).map(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TunnelError>(Bytes::from(vec![0x5a; 2880]))
            })),
            metadata: BulkFileMetadata::new(),
        };
        let task = tokio::spawn(async move {
            uploader.upload_from(source).await.unwrap();
            uploader
        });

        // nobody reads the pty: one chunk is pulled, then the queue holds
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(polled.load(Ordering::SeqCst), 1);
        assert_eq!(drain_events(&mut events), vec![UploadEvent::Uploaded(2880)]);

        assert!(reader.recv().await.unwrap().starts_with("#M:"));
        assert!(reader.recv().await.unwrap().starts_with("#D:"));
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(polled.load(Ordering::SeqCst), 1);

        handle.abort();
        let uploader = task.await.unwrap();
        assert!(uploader.is_finished());
        assert_eq!(uploader.queued_lines(), 0);
        // finished while lines are still waiting for pty budget
        assert_eq!(drain_events(&mut events), vec![UploadEvent::Finished]);
        drop(uploader);

        let mut rest = Vec::new();
        while let Some(line) = reader.recv().await {
            rest.push(line);
        }
        assert_eq!(rest.len(), 4);
        assert!(rest[..3].iter().all(|l| l.starts_with("#D:")));
        assert_eq!(rest.iter().filter(|l| l.starts_with("#A:")).count(), 1);
        assert!(rest[3].starts_with("#A::"));
        assert_eq!(polled.load(Ordering::SeqCst), 1);
        assert!(drain_events(&mut events).is_empty());
    }

    #[tokio::test]
    async fn dispose_emits_nothing_more() {
        let (writer, mut reader) = pty_channel(4096);
        let (mut uploader, mut events) =
            BulkFileUploader::new("data:,abc", writer, UploadOptions::default());
        uploader.dispose();
        uploader.upload().await.unwrap();

        assert!(reader.try_recv().unwrap().starts_with("#M:"));
        assert!(reader.try_recv().is_none());
        assert!(drain_events(&mut events).is_empty());
    }

    #[tokio::test]
    async fn overrides_win_over_source_metadata() {
        let (writer, mut reader) = pty_channel(4096);
        let (uploader, _events) =
            BulkFileUploader::new("data:,abc", writer, UploadOptions::default());
        let mut uploader =
            uploader.with_metadata(BulkFileMetadata::new().with("filename", "renamed.txt"));
        uploader.upload().await.unwrap();

        let line = reader.try_recv().unwrap();
        let frame = crate::codec::decode_frame(
            line.trim_end(),
            crate::codec::Direction::Upload,
        )
        .unwrap();
        let meta = BulkFileMetadata::parse(std::str::from_utf8(&frame.payload).unwrap()).unwrap();
        assert_eq!(meta.filename(), Some("renamed.txt"));
        assert_eq!(meta.size(), Some(3));
    }
}
