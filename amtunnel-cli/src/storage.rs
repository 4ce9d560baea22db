//! Filesystem storage for received files.
//!
//! Each file is written to `<name>.part` inside the output directory and
//! renamed to `<name>` once it completes. A failed transfer leaves the
//! `.part` file behind.
//!
//! Decoded bytes are buffered in memory up to the high-water mark; the
//! sink reports itself full at that point and [`FsStorage::flush`]
//! writes the buffers out, which is the drain signal for the session.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use amtunnel_core::{
    BulkFile, BulkFileMetadata, BulkFileSink, BulkFileStorage, FileStatus, TunnelError,
};
use tracing::{debug, info, warn};

/// Writes received files into a directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    inner: Arc<Mutex<FsInner>>,
}

#[derive(Debug)]
struct FsInner {
    dir: PathBuf,
    high_water_mark: usize,
    entries: Vec<FsEntry>,
    saved: Vec<PathBuf>,
}

#[derive(Debug)]
struct FsEntry {
    handle: Option<File>,
    part_path: PathBuf,
    final_path: PathBuf,
    buffered: Vec<u8>,
}

impl FsEntry {
    fn write_out(&mut self) -> std::io::Result<()> {
        if let Some(handle) = self.handle.as_mut() {
            if !self.buffered.is_empty() {
                handle.write_all(&self.buffered)?;
                self.buffered.clear();
            }
        }
        Ok(())
    }
}

impl FsStorage {
    pub fn new(dir: impl Into<PathBuf>, high_water_mark: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FsInner {
                dir: dir.into(),
                high_water_mark: high_water_mark.max(1),
                entries: Vec::new(),
                saved: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write every buffered byte to disk.
    pub fn flush(&self) -> Result<(), TunnelError> {
        for entry in self.lock().entries.iter_mut() {
            entry.write_out()?;
        }
        Ok(())
    }

    /// Paths of files that completed, oldest first.
    pub fn saved(&self) -> Vec<PathBuf> {
        self.lock().saved.clone()
    }
}

impl BulkFileStorage for FsStorage {
    fn open_writable(
        &mut self,
        metadata: BulkFileMetadata,
    ) -> Result<Box<dyn BulkFileSink>, TunnelError> {
        let file = BulkFile::new(metadata);
        let name = file
            .metadata()
            .filename()
            .and_then(sanitize_file_name)
            .unwrap_or_else(|| format!("download-{}", file.id()));

        let mut inner = self.lock();
        std::fs::create_dir_all(&inner.dir)?;
        let final_path = unique_path(&inner.dir, &name);
        let part_path = part_path(&final_path);
        let handle = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)?;
        debug!(path = %part_path.display(), "opened download target");

        inner.entries.push(FsEntry {
            handle: Some(handle),
            part_path,
            final_path,
            buffered: Vec::new(),
        });
        let index = inner.entries.len() - 1;
        drop(inner);

        Ok(Box::new(FsSink {
            storage: self.clone(),
            index,
            file,
        }))
    }
}

struct FsSink {
    storage: FsStorage,
    index: usize,
    file: Arc<BulkFile>,
}

impl FsSink {
    fn finish(&self, success: bool) -> std::io::Result<Option<PathBuf>> {
        let mut inner = self.storage.lock();
        let Some(entry) = inner.entries.get_mut(self.index) else {
            return Ok(None);
        };
        entry.write_out()?;
        let Some(handle) = entry.handle.take() else {
            return Ok(None);
        };
        handle.sync_all()?;
        drop(handle);
        if !success {
            return Ok(None);
        }
        std::fs::rename(&entry.part_path, &entry.final_path)?;
        let path = entry.final_path.clone();
        inner.saved.push(path.clone());
        Ok(Some(path))
    }
}

impl BulkFileSink for FsSink {
    fn file(&self) -> &Arc<BulkFile> {
        &self.file
    }

    fn desired_size(&self) -> usize {
        let inner = self.storage.lock();
        match inner.entries.get(self.index) {
            Some(entry) if entry.handle.is_some() => {
                inner.high_water_mark.saturating_sub(entry.buffered.len())
            }
            _ => 0,
        }
    }

    fn write(&mut self, chunk: &[u8]) -> Result<bool, TunnelError> {
        {
            let mut inner = self.storage.lock();
            let entry = inner
                .entries
                .get_mut(self.index)
                .filter(|e| e.handle.is_some())
                .ok_or(TunnelError::SessionFinished)?;
            entry.buffered.extend_from_slice(chunk);
        }
        self.file.record_written(chunk.len());
        Ok(self.desired_size() > 0)
    }

    fn close(&mut self, success: bool) {
        match self.finish(success) {
            Ok(Some(path)) => {
                self.file.set_status(FileStatus::Complete);
                info!(path = %path.display(), bytes = self.file.written(), "saved bulk file");
            }
            Ok(None) => {
                self.file.set_status(FileStatus::Failed);
                warn!(file_id = self.file.id(), "download failed; partial file kept");
            }
            Err(e) => {
                self.file.set_status(FileStatus::Failed);
                warn!(file_id = self.file.id(), "could not finish download: {e}");
            }
        }
    }
}

// ── Naming ───────────────────────────────────────────────────────

/// Reduce a peer-supplied name to a plain file name in the output dir.
///
/// Directory components are dropped and anything outside a conservative
/// character set becomes `_`. Returns `None` when nothing usable is left.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.');
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

fn is_taken(path: &Path) -> bool {
    path.exists() || part_path(path).exists()
}

/// `dir/name`, or `dir/stem-N.ext` for the first free `N`.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !is_taken(&candidate) {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    let mut n = 1u32;
    loop {
        let alt = match ext {
            Some(ext) => dir.join(format!("{stem}-{n}.{ext}")),
            None => dir.join(format!("{stem}-{n}")),
        };
        if !is_taken(&alt) {
            return alt;
        }
        n += 1;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> BulkFileMetadata {
        BulkFileMetadata::new().with("filename", name)
    }

    #[test]
    fn sanitizes_peer_names() {
        assert_eq!(sanitize_file_name("report.pdf").as_deref(), Some("report.pdf"));
        assert_eq!(sanitize_file_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_file_name("C:\\tmp\\a b.txt").as_deref(), Some("a b.txt"));
        assert_eq!(sanitize_file_name("x;rm -rf").as_deref(), Some("x_rm -rf"));
        assert_eq!(sanitize_file_name(".bashrc").as_deref(), Some("bashrc"));
        assert_eq!(sanitize_file_name("dir/"), None);
        assert_eq!(sanitize_file_name(".."), None);
    }

    #[test]
    fn completed_file_is_renamed() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FsStorage::new(dir.path(), 1024);
        let mut sink = storage.open_writable(named("hello.txt")).unwrap();
        assert!(dir.path().join("hello.txt.part").exists());

        assert!(sink.write(b"hello ").unwrap());
        assert!(sink.write(b"world").unwrap());
        sink.close(true);

        let path = dir.path().join("hello.txt");
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        assert!(!dir.path().join("hello.txt.part").exists());
        assert_eq!(storage.saved(), vec![path]);
        assert_eq!(sink.file().status(), FileStatus::Complete);
    }

    #[test]
    fn failed_file_keeps_part() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FsStorage::new(dir.path(), 1024);
        let mut sink = storage.open_writable(named("broken.bin")).unwrap();
        sink.write(b"partial").unwrap();
        sink.close(false);

        assert_eq!(
            std::fs::read(dir.path().join("broken.bin.part")).unwrap(),
            b"partial"
        );
        assert!(storage.saved().is_empty());
        assert_eq!(sink.file().status(), FileStatus::Failed);
    }

    #[test]
    fn high_water_mark_and_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FsStorage::new(dir.path(), 8);
        let mut sink = storage.open_writable(named("hwm")).unwrap();
        assert_eq!(sink.desired_size(), 8);
        assert!(sink.write(b"abcd").unwrap());
        assert!(!sink.write(b"efgh").unwrap());
        assert_eq!(sink.desired_size(), 0);

        storage.flush().unwrap();
        assert_eq!(sink.desired_size(), 8);
        assert_eq!(std::fs::read(dir.path().join("hwm.part")).unwrap(), b"abcdefgh");
    }

    #[test]
    fn name_collisions_get_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.csv"), b"old").unwrap();
        let mut storage = FsStorage::new(dir.path(), 1024);

        let mut first = storage.open_writable(named("data.csv")).unwrap();
        let mut second = storage.open_writable(named("data.csv")).unwrap();
        first.close(true);
        second.close(true);

        assert_eq!(
            storage.saved(),
            vec![dir.path().join("data-1.csv"), dir.path().join("data-2.csv")]
        );
        assert_eq!(std::fs::read(dir.path().join("data.csv")).unwrap(), b"old");
    }

    #[test]
    fn unnamed_file_gets_generated_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FsStorage::new(dir.path(), 1024);
        let mut sink = storage.open_writable(BulkFileMetadata::new()).unwrap();
        let id = sink.file().id();
        sink.close(true);
        assert_eq!(storage.saved(), vec![dir.path().join(format!("download-{id}"))]);
    }
}
