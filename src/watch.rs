//! Keeps the served index in step with the data repository.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    index_dir::IndexDir,
    index_handle::IndexHandle,
    pipeline::{BuildOptions, build_index},
    source::SourceRepository,
    state::{IndexState, read_state, write_state},
};

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub index_dir: IndexDir,
    pub data_path: PathBuf,
    /// Pause between polls. Zero runs a single poll.
    pub interval: Duration,
    pub build: BuildOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    Idle,
    Refreshing,
    Comparing,
    Rebuilding,
    Sleeping,
}

/// Poll the source repository and publish a freshly built index whenever
/// its revision differs from the one recorded in `.state`.
///
/// Only one build runs at a time. Failed builds caused by bad data are
/// logged and retried on the next poll; source and disk failures end the
/// loop with an error. Returns `Ok(())` once `cancel` fires.
///
/// The published handle belongs to the receiver. Old builds are never
/// removed here, since the receiver may still be serving them.
pub async fn watch_for_updates(
    config: WatchConfig,
    source: Arc<dyn SourceRepository>,
    publisher: mpsc::Sender<IndexHandle>,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!(
        data = %config.data_path.display(),
        interval = %humantime::format_duration(config.interval),
        "watching for updates"
    );

    loop {
        tracing::debug!(phase = ?WatchPhase::Idle, "watch");
        if cancel.is_cancelled() {
            return Ok(());
        }

        match poll_once(&config, &source, &cancel).await {
            Ok(Some(handle)) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    sent = publisher.send(handle) => {
                        if sent.is_err() {
                            tracing::warn!("index receiver closed, stopping");
                            return Ok(());
                        }
                        tracing::info!("published new index");
                    }
                }
            }
            Ok(None) => {}
            Err(Error::Canceled) => return Ok(()),
            Err(e) if e.is_retryable() => {
                tracing::error!(
                    error = %e,
                    "rebuild failed, keeping the current index"
                );
            }
            Err(e) => return Err(e),
        }

        if config.interval.is_zero() {
            tracing::info!("check interval is 0, stopping after one pass");
            return Ok(());
        }

        tracing::debug!(phase = ?WatchPhase::Sleeping, "watch");
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
}

/// One refresh-compare-rebuild cycle. `Ok(None)` means the index is
/// already current.
async fn poll_once(
    config: &WatchConfig,
    source: &Arc<dyn SourceRepository>,
    cancel: &CancellationToken,
) -> Result<Option<IndexHandle>> {
    tracing::debug!(phase = ?WatchPhase::Refreshing, "watch");
    let repo = Arc::clone(source);
    run_blocking(move || repo.refresh()).await?;

    tracing::debug!(phase = ?WatchPhase::Comparing, "watch");
    let repo = Arc::clone(source);
    let revision = run_blocking(move || repo.revision()).await?;
    let state = read_state(&config.index_dir)?;

    tracing::info!(
        index = state.as_ref().map(|s| s.revision.as_str()).unwrap_or("none"),
        repo = %revision,
        "comparing states"
    );
    if state.is_some_and(|s| s.is_current(&revision)) {
        return Ok(None);
    }

    tracing::debug!(phase = ?WatchPhase::Rebuilding, "watch");
    tracing::info!(revision = %revision, "new commits found, rebuilding");
    let dir = config.index_dir.clone();
    let data = config.data_path.clone();
    let options = config.build.clone();
    let cancel = cancel.clone();
    let handle = run_blocking(move || {
        rebuild(&dir, &data, &options, revision, &cancel)
    })
    .await?;

    Ok(Some(handle))
}

/// Build a new index under a fresh name and record it in `.state`.
fn rebuild(
    dir: &IndexDir,
    data: &Path,
    options: &BuildOptions,
    revision: String,
    cancel: &CancellationToken,
) -> Result<IndexHandle> {
    let name = Uuid::new_v4().to_string();
    let handle = build_index(&dir.build_dir(&name), data, options, cancel)?;

    let state = IndexState {
        index: name,
        revision,
    };
    if let Err(e) = write_state(dir, &state) {
        if let Err(cleanup) = handle.destroy() {
            tracing::warn!(
                error = %cleanup,
                "failed to remove unrecorded build"
            );
        }
        return Err(e);
    }
    Ok(handle)
}

/// Open the build recorded in `.state`, or build one if there is none.
///
/// With `force_rebuild` a new build is made even when a recorded one
/// exists. The recorded build is left on disk either way.
pub fn load_index(
    dir: &IndexDir,
    data: &Path,
    source: &dyn SourceRepository,
    force_rebuild: bool,
    options: &BuildOptions,
    cancel: &CancellationToken,
) -> Result<IndexHandle> {
    tracing::info!(root = %dir.root().display(), "loading index");

    if !force_rebuild && let Some(state) = read_state(dir)? {
        let path = dir.build_dir(&state.index);
        if path.is_dir() {
            tracing::info!(
                path = %path.display(),
                revision = %state.revision,
                "opening existing index"
            );
            return IndexHandle::open(&path);
        }
        tracing::warn!(
            path = %path.display(),
            "recorded index is missing, rebuilding"
        );
    }

    let revision = source.revision()?;
    rebuild(dir, data, options, revision, cancel)
}

/// Run [`load_index`] off the async runtime and hand the result to
/// `publisher`, so whatever serves the receiver stays up while the first
/// build runs.
///
/// Returns `Ok(false)` when `cancel` fires first or the receiver is gone.
pub async fn publish_initial(
    config: &WatchConfig,
    source: Arc<dyn SourceRepository>,
    force_rebuild: bool,
    publisher: &mpsc::Sender<IndexHandle>,
    cancel: &CancellationToken,
) -> Result<bool> {
    let dir = config.index_dir.clone();
    let data = config.data_path.clone();
    let options = config.build.clone();
    let token = cancel.clone();
    let loaded = run_blocking(move || {
        load_index(
            &dir,
            &data,
            source.as_ref(),
            force_rebuild,
            &options,
            &token,
        )
    })
    .await;

    let handle = match loaded {
        Ok(handle) => handle,
        Err(Error::Canceled) => return Ok(false),
        Err(e) => return Err(e),
    };
    tracing::info!("load complete");

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(false),
        sent = publisher.send(handle) => Ok(sent.is_ok()),
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(Error::Canceled),
    }
}
