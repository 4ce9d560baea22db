//! Bounded, byte-budgeted write channel toward the pty.
//!
//! The writer may only enqueue a chunk when the whole chunk fits in the
//! remaining budget. The reader (the task that actually writes into the
//! pty) returns budget as it consumes chunks and raises a
//! capacity-changed signal each time.
//!
//! A chunk larger than the whole budget is charged as the whole budget,
//! so it still goes through once the channel is empty.

use std::sync::Arc;

use tokio::sync::{Notify, Semaphore, TryAcquireError, mpsc};

use crate::error::TunnelError;

/// Default pty write budget in bytes.
pub const DEFAULT_PTY_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug)]
struct Shared {
    budget: Semaphore,
    capacity_changed: Notify,
    capacity: usize,
}

impl Shared {
    fn cost(&self, chunk: &str) -> usize {
        chunk.len().min(self.capacity)
    }
}

/// Create a channel holding at most `capacity` bytes in flight.
pub fn pty_channel(capacity: usize) -> (PtyWriter, PtyReader) {
    let capacity = capacity.clamp(1, u32::MAX as usize);
    let shared = Arc::new(Shared {
        budget: Semaphore::new(capacity),
        capacity_changed: Notify::new(),
        capacity,
    });
    let (tx, rx) = mpsc::unbounded_channel();
    (
        PtyWriter {
            tx,
            shared: shared.clone(),
        },
        PtyReader { rx, shared },
    )
}

/// Producer half, held by the uploader.
#[derive(Debug, Clone)]
pub struct PtyWriter {
    tx: mpsc::UnboundedSender<String>,
    shared: Arc<Shared>,
}

impl PtyWriter {
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Budget currently free, in bytes.
    pub fn available(&self) -> usize {
        self.shared.budget.available_permits()
    }

    /// Enqueue `chunk` if all of it fits; `Ok(false)` leaves it unsent.
    pub fn try_write(&self, chunk: &str) -> Result<bool, TunnelError> {
        let cost = self.shared.cost(chunk) as u32;
        match self.shared.budget.try_acquire_many(cost) {
            Ok(permit) => {
                permit.forget();
                self.tx
                    .send(chunk.to_owned())
                    .map_err(|_| TunnelError::ChannelClosed)?;
                Ok(true)
            }
            Err(TryAcquireError::NoPermits) => Ok(false),
            Err(TryAcquireError::Closed) => Err(TunnelError::ChannelClosed),
        }
    }

    /// Resolves after the reader freed budget (or went away).
    pub async fn capacity_changed(&self) {
        self.shared.capacity_changed.notified().await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, drained into the pty.
#[derive(Debug)]
pub struct PtyReader {
    rx: mpsc::UnboundedReceiver<String>,
    shared: Arc<Shared>,
}

impl PtyReader {
    /// Next chunk; `None` once every writer is gone and the queue is empty.
    pub async fn recv(&mut self) -> Option<String> {
        let chunk = self.rx.recv().await?;
        self.release(&chunk);
        Some(chunk)
    }

    pub fn try_recv(&mut self) -> Option<String> {
        let chunk = self.rx.try_recv().ok()?;
        self.release(&chunk);
        Some(chunk)
    }

    fn release(&self, chunk: &str) {
        self.shared.budget.add_permits(self.shared.cost(chunk));
        self.shared.capacity_changed.notify_one();
    }
}

impl Drop for PtyReader {
    fn drop(&mut self) {
        self.shared.budget.close();
        self.shared.capacity_changed.notify_one();
    }
}
