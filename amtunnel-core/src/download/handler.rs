//! Application-mode handler that owns the active download session.

use std::sync::Arc;

use tracing::debug;

use crate::adapter::{AppModeHandler, HandlerResult};
use crate::download::session::{DownloadOptions, DownloadSession, DownloadState};
use crate::storage::{BulkFile, BulkFileStorage};

type CreatedCallback = Box<dyn Fn(&Arc<BulkFile>) + Send + Sync + 'static>;

/// Routes application-mode events into a [`DownloadSession`].
///
/// Exactly one session is active at a time. A new start signal replaces
/// the current session as is: the old one is neither drained nor aborted.
pub struct BulkDownloadHandler<S: BulkFileStorage> {
    storage: S,
    options: DownloadOptions,
    session: Option<DownloadSession>,
    created_callbacks: Vec<CreatedCallback>,
}

impl<S: BulkFileStorage> BulkDownloadHandler<S> {
    pub fn new(storage: S) -> Self {
        Self::with_options(storage, DownloadOptions::default())
    }

    pub fn with_options(storage: S, options: DownloadOptions) -> Self {
        Self {
            storage,
            options,
            session: None,
            created_callbacks: Vec::new(),
        }
    }

    /// Register an observer for the per-session "created" notification.
    pub fn on_created_bulk_file<F>(&mut self, f: F)
    where
        F: Fn(&Arc<BulkFile>) + Send + Sync + 'static,
    {
        self.created_callbacks.push(Box::new(f));
    }

    pub fn state(&self) -> DownloadState {
        self.session
            .as_ref()
            .map(DownloadSession::state)
            .unwrap_or_default()
    }

    pub fn session(&self) -> Option<&DownloadSession> {
        self.session.as_ref()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Forward the sink's "accepting more data" signal.
    ///
    /// `Continue` means the pending queue drained and the caller may
    /// resume delivering bytes.
    pub fn handle_drain(&mut self) -> HandlerResult {
        let result = match self.session.as_mut() {
            Some(session) => session.handle_drain(),
            None => HandlerResult::proceed(),
        };
        self.dispatch_created();
        result
    }

    fn dispatch_created(&mut self) {
        let Some(file) = self.session.as_mut().and_then(DownloadSession::take_created) else {
            return;
        };
        debug!(file_id = file.id(), "bulk file created");
        for callback in &self.created_callbacks {
            callback(&file);
        }
    }
}

impl<S: BulkFileStorage> AppModeHandler for BulkDownloadHandler<S> {
    fn handle_start(&mut self, params: &[&str]) -> HandlerResult {
        if let Some(old) = &self.session {
            if !old.is_finished() {
                debug!(state = %old.state(), "replacing active download session");
            }
        }
        let mut session = DownloadSession::new(self.options.clone());
        let result = session.start(params);
        self.session = Some(session);
        result
    }

    fn handle_data(&mut self, data: &str) -> HandlerResult {
        let result = match self.session.as_mut() {
            Some(session) => session.handle_data(&mut self.storage, data),
            None => HandlerResult::abort(data),
        };
        self.dispatch_created();
        result
    }

    fn handle_stop(&mut self) -> HandlerResult {
        let result = match self.session.as_mut() {
            Some(session) => session.handle_stop(),
            None => HandlerResult::proceed(),
        };
        self.dispatch_created();
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::adapter::Action;
    use crate::codec::{self, Command};
    use crate::hash_chain::HashChain;
    use crate::storage::MemoryStorage;

    #[test]
    fn data_without_session_is_handed_back() {
        let mut handler = BulkDownloadHandler::new(MemoryStorage::new());
        let result = handler.handle_data("ls output");
        assert!(result.is_abort());
        assert_eq!(result.remaining_data.as_deref(), Some("ls output"));
        assert_eq!(handler.state(), DownloadState::Idle);
    }

    #[test]
    fn created_observers_fire_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut handler = BulkDownloadHandler::new(MemoryStorage::new());
        let seen = count.clone();
        handler.on_created_bulk_file(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let meta = "{}";
        handler.handle_start(&["2"]);
        handler.handle_data(meta);
        let mut chain = HashChain::new();
        let end = codec::encode_frame(Command::End, b"", &chain.next_hex(b"", 64));
        assert_eq!(handler.handle_data(&end).action, Action::Continue);
        assert_eq!(handler.handle_stop().action, Action::Continue);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(handler.state(), DownloadState::Complete);
    }

    #[test]
    fn restart_replaces_session_silently() {
        let mut handler = BulkDownloadHandler::new(MemoryStorage::new());
        handler.handle_start(&["2"]);
        handler.handle_data("{}");
        assert_eq!(handler.state(), DownloadState::Body);

        handler.handle_start(&["2"]);
        assert_eq!(handler.state(), DownloadState::Metadata);
        // the replaced file is left as it was
        let files = handler.storage().files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].status(), crate::storage::FileStatus::Pending);
    }
}
