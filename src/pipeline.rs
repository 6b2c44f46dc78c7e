//! Turns a data root into a populated index.
//!
//! One generator thread lists conference directories into a bounded queue,
//! a pool of parser threads turns them into [`Collection`]s, and a single
//! indexer thread submits one batch per collection. Indexing overlaps with
//! parsing, and the first failure anywhere cancels the whole build.

use std::{
    fs::ReadDir,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::Instant,
};

use crossbeam_channel::{Receiver, Sender, bounded};
use rayon::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::{
    collection::{CATEGORY_FILE, Collection, parse_collection},
    document::{IndexedSession, document_key},
    error::{Error, Result},
    index_handle::IndexHandle,
    tantivy_index::{Batch, SessionWriter, WRITER_MEMORY_BUDGET},
};

pub const DEFAULT_PARSER_WORKERS: usize = 8;
const DEFAULT_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Number of parser threads. Values below 1 are treated as 1.
    pub parser_workers: usize,
    /// Capacity of both the directory queue and the parsed-collection queue.
    pub queue_capacity: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            parser_workers: DEFAULT_PARSER_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuildStats {
    pub collections: usize,
    pub documents: usize,
}

/// Destination of the indexer's batches.
pub trait BatchSink {
    /// Write the whole batch or fail. A failure aborts the build.
    fn submit(&mut self, batch: Batch) -> Result<()>;
}

impl BatchSink for SessionWriter {
    fn submit(&mut self, batch: Batch) -> Result<()> {
        SessionWriter::submit(self, batch)
    }
}

/// Keeps the first error of a build and cancels the build's scope when it
/// arrives. Later errors are dropped.
struct FirstError {
    slot: Mutex<Option<Error>>,
    scope: CancellationToken,
}

impl FirstError {
    fn new(scope: CancellationToken) -> Self {
        Self {
            slot: Mutex::new(None),
            scope,
        }
    }

    fn record(&self, err: Error) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
            self.scope.cancel();
        } else {
            tracing::debug!(
                error = %err,
                "discarding error after first failure"
            );
        }
    }

    fn into_inner(self) -> Option<Error> {
        self.slot
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parse every collection under `data_root` and submit it to `sink`.
///
/// Returns only after the indexer has finished. On failure the first error
/// is returned; if `cancel` fired and nothing failed, [`Error::Canceled`].
/// Each collection is submitted as a single batch, so a collection is either
/// fully written or not at all.
pub fn fill_index<S>(
    data_root: &Path,
    sink: S,
    options: &BuildOptions,
    cancel: &CancellationToken,
) -> Result<BuildStats>
where
    S: BatchSink + Send,
{
    let entries =
        std::fs::read_dir(data_root).map_err(|e| Error::parse(data_root, e))?;

    let scope = cancel.child_token();
    let errors = FirstError::new(scope.clone());
    let capacity = options.queue_capacity.max(1);
    let (dir_tx, dir_rx) = bounded::<PathBuf>(capacity);
    let (parsed_tx, parsed_rx) = bounded::<Collection>(capacity);

    let stats = {
        let scope = &scope;
        let errors = &errors;

        std::thread::scope(|s| {
            s.spawn(move || {
                generate(data_root, entries, dir_tx, scope, errors)
            });

            let parsers: Vec<_> = (0..options.parser_workers.max(1))
                .map(|_| {
                    let rx = dir_rx.clone();
                    let tx = parsed_tx.clone();
                    s.spawn(move || parse_worker(rx, tx, scope, errors))
                })
                .collect();
            // Workers hold the only remaining ends, so the indexer sees the
            // parsed queue close exactly when the last parser exits.
            drop(dir_rx);
            drop(parsed_tx);

            let indexer =
                s.spawn(move || index_worker(parsed_rx, sink, scope, errors));

            for parser in parsers {
                if let Err(panic) = parser.join() {
                    std::panic::resume_unwind(panic);
                }
            }
            indexer
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
        })
    };

    if let Some(err) = errors.into_inner() {
        return Err(err);
    }
    if scope.is_cancelled() {
        return Err(Error::Canceled);
    }
    Ok(stats)
}

fn generate(
    data_root: &Path,
    entries: ReadDir,
    tx: Sender<PathBuf>,
    scope: &CancellationToken,
    errors: &FirstError,
) {
    for entry in entries {
        if scope.is_cancelled() {
            return;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                errors.record(Error::parse(data_root, e));
                return;
            }
        };

        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if !path.is_dir() || !path.join(CATEGORY_FILE).is_file() {
            continue;
        }

        // Fails only once every parser has exited.
        if tx.send(path).is_err() {
            return;
        }
    }
}

fn parse_worker(
    rx: Receiver<PathBuf>,
    tx: Sender<Collection>,
    scope: &CancellationToken,
    errors: &FirstError,
) {
    for dir in rx {
        if scope.is_cancelled() {
            return;
        }
        match parse_collection(&dir, scope) {
            Ok(collection) => {
                tracing::debug!(
                    collection = %collection.slug,
                    sessions = collection.sessions.len(),
                    "parsed collection"
                );
                if tx.send(collection).is_err() {
                    return;
                }
            }
            Err(Error::Canceled) => return,
            Err(e) => {
                tracing::warn!(
                    path = %dir.display(),
                    error = %e,
                    "failed to load collection"
                );
                errors.record(e);
                return;
            }
        }
    }
}

fn index_worker<S: BatchSink>(
    rx: Receiver<Collection>,
    mut sink: S,
    scope: &CancellationToken,
    errors: &FirstError,
) -> BuildStats {
    let mut stats = BuildStats::default();

    for collection in rx {
        // Whatever is still buffered is dropped along with `rx`.
        if scope.is_cancelled() {
            break;
        }

        let batch = collection_batch(&collection);
        let documents = batch.len();
        tracing::info!(collection = %collection.title, documents, "indexing");

        if !batch.is_empty()
            && let Err(e) = sink.submit(batch)
        {
            errors.record(e);
            break;
        }
        stats.collections += 1;
        stats.documents += documents;
    }

    stats
}

/// One batch holding every session of `collection`, keyed by document key.
pub fn collection_batch(collection: &Collection) -> Batch {
    let docs: Vec<(String, IndexedSession)> = collection
        .sessions
        .par_iter()
        .map(|session| {
            (
                document_key(&collection.slug, &session.slug),
                IndexedSession::new(session, collection),
            )
        })
        .collect();

    let mut batch = Batch::new();
    for (id, doc) in docs {
        batch.put(id, doc);
    }
    batch
}

/// Build a fresh on-disk index at `path` from `data_root`.
///
/// A failed build removes its directory; the caller's previous index is
/// never touched.
pub fn build_index(
    path: &Path,
    data_root: &Path,
    options: &BuildOptions,
    cancel: &CancellationToken,
) -> Result<IndexHandle> {
    tracing::info!(
        path = %path.display(),
        data = %data_root.display(),
        "building index"
    );
    let started = Instant::now();

    let handle = IndexHandle::open_or_create(path)?;
    let result = handle
        .index()
        .writer(WRITER_MEMORY_BUDGET)
        .and_then(|writer| fill_index(data_root, writer, options, cancel));

    match result {
        Ok(stats) => {
            tracing::info!(
                collections = stats.collections,
                documents = stats.documents,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "index built"
            );
            Ok(handle)
        }
        Err(e) => {
            if let Err(cleanup) = handle.destroy() {
                tracing::warn!(
                    path = %path.display(),
                    error = %cleanup,
                    "failed to remove incomplete index"
                );
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::collection::{VIDEOS_DIR, fixtures::write_conference};

    /// Records the ids of every submitted batch.
    #[derive(Clone, Default)]
    struct RecordingSink {
        batches: Arc<Mutex<Vec<Vec<String>>>>,
        cancel_after_first: Option<CancellationToken>,
    }

    impl BatchSink for RecordingSink {
        fn submit(&mut self, batch: Batch) -> Result<()> {
            self.batches
                .lock()
                .unwrap()
                .push(batch.ids().map(str::to_string).collect());
            if let Some(cancel) = &self.cancel_after_first {
                cancel.cancel();
            }
            Ok(())
        }
    }

    struct FailingSink;

    impl BatchSink for FailingSink {
        fn submit(&mut self, _batch: Batch) -> Result<()> {
            Err(Error::Engine("disk full".to_string()))
        }
    }

    fn sorted_ids(sink: &RecordingSink) -> Vec<String> {
        let mut ids: Vec<String> =
            sink.batches.lock().unwrap().iter().flatten().cloned().collect();
        ids.sort();
        ids
    }

    #[test]
    fn indexes_every_session_once() {
        let tmp = tempfile::tempdir().unwrap();
        write_conference(
            tmp.path(),
            "pycon",
            "PyCon",
            &[("a", "Async IO"), ("b", "Type Hints")],
        );
        write_conference(tmp.path(), "euro", "Euro", &[("c", "Packaging")]);

        let sink = RecordingSink::default();
        let stats = fill_index(
            tmp.path(),
            sink.clone(),
            &BuildOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(
            stats,
            BuildStats {
                collections: 2,
                documents: 3,
            }
        );
        assert_eq!(
            sorted_ids(&sink),
            vec![
                "session:euro:packaging",
                "session:pycon:async-io",
                "session:pycon:type-hints",
            ]
        );
    }

    #[test]
    fn one_batch_per_collection() {
        let tmp = tempfile::tempdir().unwrap();
        write_conference(tmp.path(), "a", "A", &[("1", "One"), ("2", "Two")]);
        write_conference(tmp.path(), "b", "B", &[("3", "Three")]);

        let sink = RecordingSink::default();
        fill_index(
            tmp.path(),
            sink.clone(),
            &BuildOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        let mut sizes: Vec<usize> =
            sink.batches.lock().unwrap().iter().map(Vec::len).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 2]);
    }

    #[test]
    fn empty_collections_submit_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        write_conference(tmp.path(), "empty", "Empty", &[]);
        write_conference(tmp.path(), "full", "Full", &[("a", "A")]);

        let sink = RecordingSink::default();
        let stats = fill_index(
            tmp.path(),
            sink.clone(),
            &BuildOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(
            stats,
            BuildStats {
                collections: 2,
                documents: 1,
            }
        );
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
    }

    #[test]
    fn skips_hidden_and_unmarked_directories() {
        let tmp = tempfile::tempdir().unwrap();
        write_conference(tmp.path(), ".git", "Git", &[("x", "Hidden")]);
        write_conference(tmp.path(), "real", "Real", &[("y", "Shown")]);
        std::fs::create_dir_all(tmp.path().join("no-meta").join(VIDEOS_DIR))
            .unwrap();
        std::fs::write(tmp.path().join("README.md"), "# data").unwrap();

        let sink = RecordingSink::default();
        let stats = fill_index(
            tmp.path(),
            sink.clone(),
            &BuildOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(stats.collections, 1);
        assert_eq!(sorted_ids(&sink), vec!["session:real:shown"]);
    }

    #[test]
    fn many_collections_with_a_small_pool() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..40 {
            let slug = format!("conf-{i}");
            write_conference(
                tmp.path(),
                &slug,
                &slug,
                &[("a", "First"), ("b", "Second")],
            );
        }

        let sink = RecordingSink::default();
        let options = BuildOptions {
            parser_workers: 3,
            queue_capacity: 2,
        };
        let stats = fill_index(
            tmp.path(),
            sink.clone(),
            &options,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(stats.documents, 80);
        let ids = sorted_ids(&sink);
        let mut unique = ids.clone();
        unique.dedup();
        assert_eq!(ids.len(), unique.len());
    }

    #[test]
    fn broken_metadata_fails_the_build() {
        let tmp = tempfile::tempdir().unwrap();
        let conf = write_conference(tmp.path(), "conf", "Conf", &[]);
        std::fs::write(conf.join(CATEGORY_FILE), "not valid json").unwrap();
        write_conference(tmp.path(), "fine", "Fine", &[("a", "A")]);

        let err = fill_index(
            tmp.path(),
            RecordingSink::default(),
            &BuildOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Parse { .. }), "got {err:?}");
    }

    #[test]
    fn many_failures_surface_one_error() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..10 {
            let conf = write_conference(tmp.path(), &format!("c{i}"), "C", &[]);
            std::fs::write(conf.join(CATEGORY_FILE), "{").unwrap();
        }

        let err = fill_index(
            tmp.path(),
            RecordingSink::default(),
            &BuildOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Parse { .. }), "got {err:?}");
    }

    #[test]
    fn engine_failure_fails_the_build() {
        let tmp = tempfile::tempdir().unwrap();
        write_conference(tmp.path(), "conf", "Conf", &[("a", "A")]);

        let err = fill_index(
            tmp.path(),
            FailingSink,
            &BuildOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Engine(_)), "got {err:?}");
    }

    #[test]
    fn missing_data_root_is_a_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = fill_index(
            &tmp.path().join("missing"),
            RecordingSink::default(),
            &BuildOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Parse { .. }), "got {err:?}");
    }

    #[test]
    fn canceled_before_start() {
        let tmp = tempfile::tempdir().unwrap();
        write_conference(tmp.path(), "conf", "Conf", &[("a", "A")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let sink = RecordingSink::default();
        let err = fill_index(
            tmp.path(),
            sink.clone(),
            &BuildOptions::default(),
            &cancel,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Canceled));
        assert!(sink.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn canceled_mid_build_leaves_only_whole_batches() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..20 {
            write_conference(
                tmp.path(),
                &format!("conf-{i}"),
                "Conf",
                &[("a", "A"), ("b", "B"), ("c", "C")],
            );
        }

        let cancel = CancellationToken::new();
        let sink = RecordingSink {
            batches: Arc::default(),
            cancel_after_first: Some(cancel.clone()),
        };
        let options = BuildOptions {
            parser_workers: 2,
            queue_capacity: 1,
        };

        let err = fill_index(tmp.path(), sink.clone(), &options, &cancel)
            .unwrap_err();

        assert!(matches!(err, Error::Canceled));
        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert!(batches.iter().all(|b| b.len() == 3));
    }

    #[test]
    fn build_index_writes_to_disk() {
        let data = tempfile::tempdir().unwrap();
        let index_root = tempfile::tempdir().unwrap();
        write_conference(data.path(), "conf", "Conf", &[("a", "Hello")]);
        let path = index_root.path().join("build");

        let handle = build_index(
            &path,
            data.path(),
            &BuildOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(handle.path(), Some(path.as_path()));
        assert_eq!(
            handle.index().document_ids().unwrap(),
            vec!["session:conf:hello"]
        );
    }

    #[test]
    fn failed_build_removes_its_directory() {
        let data = tempfile::tempdir().unwrap();
        let index_root = tempfile::tempdir().unwrap();
        let conf = write_conference(data.path(), "conf", "Conf", &[]);
        std::fs::write(conf.join(CATEGORY_FILE), "nope").unwrap();
        let path = index_root.path().join("build");

        let err = build_index(
            &path,
            data.path(),
            &BuildOptions::default(),
            &CancellationToken::new(),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Parse { .. }));
        assert!(!path.exists());
    }
}
