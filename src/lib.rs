//! talksearch - a search index and query API for conference talk recordings.
//!
//! The data tree holds one directory per conference, each with a
//! `category.json` and a `videos/` folder of per-talk JSON files. talksearch
//! builds a [Tantivy](https://github.com/quickwit-oss/tantivy) index from
//! it, serves queries over HTTP, and rebuilds in the background whenever the
//! data repository moves to a new revision. A new build is swapped in only
//! after it has been fully written, so queries never see a partial index.
//!
//! # Quick start
//!
//! ```no_run
//! use talksearch::pipeline::{BuildOptions, build_index};
//! use talksearch::tantivy_index::SearchRequest;
//! use tokio_util::sync::CancellationToken;
//!
//! let handle = build_index(
//!     "/tmp/talks-index".as_ref(),
//!     "/srv/pyvideo-data".as_ref(),
//!     &BuildOptions::default(),
//!     &CancellationToken::new(),
//! )
//! .unwrap();
//!
//! let results = handle
//!     .index()
//!     .search("async python", &SearchRequest::default())
//!     .unwrap();
//! for hit in &results.hits {
//!     println!("{} (score: {:.3})", hit.id, hit.score);
//! }
//! ```

pub mod active;
pub mod collection;
pub mod document;
pub mod error;
pub mod index_dir;
pub mod index_handle;
pub mod pipeline;
pub mod server;
pub mod slugify;
pub mod source;
pub mod state;
pub mod tantivy_index;
pub mod watch;

pub use active::ActiveIndexHolder;
pub use error::{Error, Result};
pub use index_dir::IndexDir;
pub use index_handle::IndexHandle;
pub use tantivy_index::SearchIndex;
