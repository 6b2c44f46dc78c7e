use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    slugify::slugify,
};

/// Metadata file every conference directory must contain.
pub const CATEGORY_FILE: &str = "category.json";

/// Subdirectory holding one JSON file per session.
pub const VIDEOS_DIR: &str = "videos";

const SESSION_EXTENSION: &str = ".json";

/// One conference or event together with its sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    pub title: String,
    pub slug: String,
    pub sessions: Vec<Session>,
}

/// A single talk as described by its session file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Session {
    #[serde(deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(deserialize_with = "null_as_default")]
    pub speakers: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub recorded: String,
    #[serde(deserialize_with = "null_as_default")]
    pub videos: Vec<Video>,
    #[serde(deserialize_with = "null_as_default")]
    pub slug: String,
    #[serde(deserialize_with = "null_as_default")]
    pub thumbnail_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Video {
    #[serde(rename = "type", deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(deserialize_with = "null_as_default")]
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CategoryMetadata {
    #[serde(deserialize_with = "null_as_default")]
    title: String,
    slug: Option<String>,
}

/// A `null` value reads as the field's default, same as a missing key.
fn null_as_default<'de, D, T>(
    deserializer: D,
) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Read a conference directory into a [`Collection`].
///
/// The directory must contain `category.json` and a `videos/` folder. Every
/// `*.json` file inside `videos/` becomes one session; other entries are
/// ignored. A single broken session file fails the whole collection, so a
/// collection is either complete or absent.
///
/// Cancellation is checked before each session file.
pub fn parse_collection(
    dir: &Path,
    cancel: &CancellationToken,
) -> Result<Collection> {
    let category_path = dir.join(CATEGORY_FILE);
    let raw = std::fs::read(&category_path)
        .map_err(|e| Error::parse(&category_path, e))?;
    let metadata: CategoryMetadata = serde_json::from_slice(&raw)
        .map_err(|e| Error::parse(&category_path, e))?;

    let slug = match metadata.slug {
        Some(slug) if !slug.is_empty() => slug,
        _ => slugify(&metadata.title),
    };

    let session_files = list_session_files(&dir.join(VIDEOS_DIR))?;

    let mut sessions = Vec::with_capacity(session_files.len());
    for path in &session_files {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        sessions.push(parse_session(path)?);
    }

    Ok(Collection {
        title: metadata.title,
        slug,
        sessions,
    })
}

/// Parse one session file, deriving the slug from the title when the file
/// does not carry one.
pub fn parse_session(path: &Path) -> Result<Session> {
    let raw = std::fs::read(path).map_err(|e| Error::parse(path, e))?;
    let mut session: Session =
        serde_json::from_slice(&raw).map_err(|e| Error::parse(path, e))?;

    if session.slug.is_empty() {
        session.slug = slugify(&session.title);
    }

    Ok(session)
}

fn list_session_files(videos_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(videos_dir)
        .map_err(|e| Error::parse(videos_dir, e))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::parse(videos_dir, e))?;
        let name = entry.file_name();
        if name.to_string_lossy().ends_with(SESSION_EXTENSION) {
            files.push(entry.path());
        }
    }

    // Directory order is filesystem-dependent; sort for stable output.
    files.sort();
    Ok(files)
}
