//! Storage collaborator surface for downloaded files.
//!
//! The download session never touches disk itself. It asks a
//! [`BulkFileStorage`] for a writable [`BulkFileSink`] once the metadata
//! is known, writes decoded bytes into it, and closes it exactly once.
//!
//! A [`BulkFile`] is shared through `Arc`: the session holds one
//! reference for its lifetime and drops it when the transfer ends, so
//! the strong count is the reference count.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::TunnelError;
use crate::metadata::BulkFileMetadata;

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

// ── BulkFile ─────────────────────────────────────────────────────

/// Completion state of a bulk file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileStatus {
    /// Still receiving bytes.
    #[default]
    Pending,
    /// Every byte arrived and the chain verified.
    Complete,
    /// The transfer failed; contents are partial.
    Failed,
}

/// A file's identity, metadata and progress.
#[derive(Debug)]
pub struct BulkFile {
    id: u64,
    metadata: BulkFileMetadata,
    written: AtomicU64,
    status: Mutex<FileStatus>,
}

impl BulkFile {
    pub fn new(metadata: BulkFileMetadata) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
            metadata,
            written: AtomicU64::new(0),
            status: Mutex::new(FileStatus::Pending),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn metadata(&self) -> &BulkFileMetadata {
        &self.metadata
    }

    /// Bytes accepted by the sink so far.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn record_written(&self, n: usize) {
        self.written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn status(&self) -> FileStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_status(&self, status: FileStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

// ── Collaborator traits ──────────────────────────────────────────

/// A writable destination for one downloaded file.
pub trait BulkFileSink {
    /// The file being written.
    fn file(&self) -> &Arc<BulkFile>;

    /// How many bytes the sink wants right now. Zero means full.
    fn desired_size(&self) -> usize;

    /// Write a chunk. Returns `false` when the sink cannot take more
    /// synchronously; the caller must wait for its drain signal.
    fn write(&mut self, chunk: &[u8]) -> Result<bool, TunnelError>;

    /// Finish the file. Called exactly once.
    fn close(&mut self, success: bool);
}

/// Opens sinks for incoming files.
pub trait BulkFileStorage {
    fn open_writable(
        &mut self,
        metadata: BulkFileMetadata,
    ) -> Result<Box<dyn BulkFileSink>, TunnelError>;
}

// ── MemoryStorage ────────────────────────────────────────────────

/// In-memory storage with an optional per-file buffer limit.
///
/// Written bytes count against the limit until [`MemoryStorage::drain`]
/// releases them, which models a consumer reading the file at its own
/// pace.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    capacity: Option<usize>,
    entries: Vec<MemoryEntry>,
}

#[derive(Debug)]
struct MemoryEntry {
    file: Arc<BulkFile>,
    data: Vec<u8>,
    buffered: usize,
    closed: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit each file to `capacity` buffered bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        let storage = Self::default();
        storage.lock().capacity = Some(capacity);
        storage
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every file opened so far, oldest first.
    pub fn files(&self) -> Vec<Arc<BulkFile>> {
        self.lock().entries.iter().map(|e| e.file.clone()).collect()
    }

    /// Bytes written to the `index`-th file.
    pub fn contents(&self, index: usize) -> Option<Vec<u8>> {
        self.lock().entries.get(index).map(|e| e.data.clone())
    }

    /// Whether the `index`-th file's sink was closed.
    pub fn is_closed(&self, index: usize) -> bool {
        self.lock().entries.get(index).is_some_and(|e| e.closed)
    }

    /// Release up to `n` buffered bytes of the `index`-th file.
    pub fn drain(&self, index: usize, n: usize) {
        if let Some(entry) = self.lock().entries.get_mut(index) {
            entry.buffered = entry.buffered.saturating_sub(n);
        }
    }
}

impl BulkFileStorage for MemoryStorage {
    fn open_writable(
        &mut self,
        metadata: BulkFileMetadata,
    ) -> Result<Box<dyn BulkFileSink>, TunnelError> {
        let file = BulkFile::new(metadata);
        let index = {
            let mut inner = self.lock();
            inner.entries.push(MemoryEntry {
                file: file.clone(),
                data: Vec::new(),
                buffered: 0,
                closed: false,
            });
            inner.entries.len() - 1
        };
        Ok(Box::new(MemorySink {
            storage: self.clone(),
            index,
            file,
        }))
    }
}

struct MemorySink {
    storage: MemoryStorage,
    index: usize,
    file: Arc<BulkFile>,
}

impl BulkFileSink for MemorySink {
    fn file(&self) -> &Arc<BulkFile> {
        &self.file
    }

    fn desired_size(&self) -> usize {
        let inner = self.storage.lock();
        match (inner.capacity, inner.entries.get(self.index)) {
            (Some(cap), Some(entry)) => cap.saturating_sub(entry.buffered),
            _ => usize::MAX,
        }
    }

    fn write(&mut self, chunk: &[u8]) -> Result<bool, TunnelError> {
        {
            let mut inner = self.storage.lock();
            let entry = inner
                .entries
                .get_mut(self.index)
                .ok_or(TunnelError::Other("memory entry vanished".into()))?;
            if entry.closed {
                return Err(TunnelError::SessionFinished);
            }
            entry.data.extend_from_slice(chunk);
            entry.buffered += chunk.len();
        }
        self.file.record_written(chunk.len());
        Ok(self.desired_size() > 0)
    }

    fn close(&mut self, success: bool) {
        if let Some(entry) = self.storage.lock().entries.get_mut(self.index) {
            entry.closed = true;
        }
        self.file.set_status(if success {
            FileStatus::Complete
        } else {
            FileStatus::Failed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_sink_always_accepts() {
        let mut storage = MemoryStorage::new();
        let mut sink = storage.open_writable(BulkFileMetadata::new()).unwrap();
        assert!(sink.write(&[0u8; 10_000]).unwrap());
        assert_eq!(sink.file().written(), 10_000);
        assert_eq!(storage.contents(0).unwrap().len(), 10_000);
    }

    #[test]
    fn capacity_and_drain() {
        let mut storage = MemoryStorage::with_capacity(8);
        let mut sink = storage.open_writable(BulkFileMetadata::new()).unwrap();
        assert_eq!(sink.desired_size(), 8);
        assert!(sink.write(b"abcd").unwrap());
        assert!(!sink.write(b"efgh").unwrap());
        assert_eq!(sink.desired_size(), 0);

        storage.drain(0, 5);
        assert_eq!(sink.desired_size(), 5);
    }

    #[test]
    fn close_sets_status() {
        let mut storage = MemoryStorage::new();
        let mut sink = storage.open_writable(BulkFileMetadata::new()).unwrap();
        assert_eq!(sink.file().status(), FileStatus::Pending);
        sink.close(false);
        assert_eq!(sink.file().status(), FileStatus::Failed);
        assert!(storage.is_closed(0));
        assert!(sink.write(b"late").is_err());
    }

    #[test]
    fn file_ids_are_unique() {
        let a = BulkFile::new(BulkFileMetadata::new());
        let b = BulkFile::new(BulkFileMetadata::new());
        assert_ne!(a.id(), b.id());
    }
}
