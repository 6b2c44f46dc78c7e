use std::sync::{
    Arc,
    PoisonError,
    RwLock,
    RwLockReadGuard,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::index_handle::IndexHandle;

/// What happens to an index once a newer one replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetirePolicy {
    /// Close it and delete its directory.
    #[default]
    Destroy,
    /// Close it and leave the directory on disk.
    Retain,
}

impl RetirePolicy {
    pub fn retire(self, handle: IndexHandle) {
        match self {
            RetirePolicy::Retain => handle.close(),
            RetirePolicy::Destroy => {
                let path = handle.path().map(|p| p.display().to_string());
                if let Err(e) = handle.destroy() {
                    tracing::warn!(
                        path = path.as_deref().unwrap_or("<memory>"),
                        error = %e,
                        "failed to remove retired index"
                    );
                }
            }
        }
    }
}

/// The index currently answering queries.
///
/// Readers hold the read lock for the length of one query; a swap waits for
/// them to finish and hands the old index back to the caller.
#[derive(Debug)]
pub struct ActiveIndexHolder {
    handle: RwLock<IndexHandle>,
    swaps: AtomicU64,
}

impl ActiveIndexHolder {
    pub fn new(initial: IndexHandle) -> Self {
        Self {
            handle: RwLock::new(initial),
            swaps: AtomicU64::new(0),
        }
    }

    pub fn current(&self) -> RwLockReadGuard<'_, IndexHandle> {
        self.handle.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `new` and return the index it replaced.
    pub fn swap(&self, new: IndexHandle) -> IndexHandle {
        let old = {
            let mut guard =
                self.handle.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, new)
        };
        self.swaps.fetch_add(1, Ordering::Relaxed);
        old
    }

    /// Number of swaps since start.
    pub fn swap_count(&self) -> u64 {
        self.swaps.load(Ordering::Relaxed)
    }
}

/// Install every handle received on `rx`, retiring the one it replaces.
///
/// Runs until the channel closes or `cancel` fires.
pub async fn serve_updates(
    holder: Arc<ActiveIndexHolder>,
    mut rx: mpsc::Receiver<IndexHandle>,
    policy: RetirePolicy,
    cancel: CancellationToken,
) {
    loop {
        let handle = tokio::select! {
            _ = cancel.cancelled() => return,
            next = rx.recv() => match next {
                Some(handle) => handle,
                None => return,
            },
        };

        let holder = Arc::clone(&holder);
        let swapped = tokio::task::spawn_blocking(move || {
            let old = holder.swap(handle);
            tracing::info!(
                path = ?holder.current().path(),
                "switched to new index"
            );
            policy.retire(old);
        })
        .await;

        if let Err(e) = swapped {
            tracing::error!(error = %e, "index swap task failed");
        }
    }
}
