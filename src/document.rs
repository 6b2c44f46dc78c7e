use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;

use crate::{
    collection::{Collection, Session},
    slugify::slugify,
};

/// Display format for `recorded_formatted`, e.g. `Fri Feb 5 2016`.
const RECORDED_DISPLAY_FORMAT: &str = "%a %b %-d %Y";

const NAIVE_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Speaker {
    pub name: String,
    pub slug: String,
}

/// The flattened form of a session that gets submitted to the index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexedSession {
    pub title: String,
    pub description: String,
    pub url: String,
    pub collection_title: String,
    pub collection_url: String,
    pub speakers: Vec<Speaker>,
    pub thumbnail_url: String,
    pub recorded: Option<DateTime<Utc>>,
    pub recorded_formatted: String,
}

impl IndexedSession {
    /// Denormalize a session and its parent collection into one document.
    pub fn new(session: &Session, collection: &Collection) -> Self {
        let speakers = session
            .speakers
            .iter()
            .map(|name| Speaker {
                name: name.clone(),
                slug: slugify(name),
            })
            .collect();

        let recorded = if session.recorded.is_empty() {
            None
        } else {
            let parsed = parse_recorded(&session.recorded);
            if parsed.is_none() {
                tracing::info!(
                    recorded = %session.recorded,
                    session = %session.slug,
                    "failed to parse recording timestamp"
                );
            }
            parsed
        };

        let recorded_formatted = recorded
            .map(|ts| ts.format(RECORDED_DISPLAY_FORMAT).to_string())
            .unwrap_or_default();

        Self {
            title: session.title.clone(),
            description: session.description.clone(),
            url: format!("/{}/{}.html", collection.slug, session.slug),
            collection_title: collection.title.clone(),
            collection_url: format!("/events/{}.html", collection.slug),
            speakers,
            thumbnail_url: session.thumbnail_url.clone(),
            recorded,
            recorded_formatted,
        }
    }
}

/// The index key of a session. Two sessions sharing a key overwrite each
/// other.
pub fn document_key(collection_slug: &str, session_slug: &str) -> String {
    format!("session:{collection_slug}:{session_slug}")
}

/// Parse a free-form recording timestamp.
///
/// Accepted, in order: RFC 3339 with offset, a full timestamp without
/// offset (taken as UTC), and a bare date (midnight UTC).
pub fn parse_recorded(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, NAIVE_DATETIME_FORMAT)
    {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
