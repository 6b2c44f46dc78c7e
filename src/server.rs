//! The query API.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use axum::{
    Json,
    Router,
    extract::{Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::{
    active::ActiveIndexHolder,
    error::{Error, Result},
    tantivy_index::{FacetRequest, SearchRequest, fields},
};

const RESULT_SIZE: usize = 100;
const FACET_SIZE: usize = 10;

const RETURNED_FIELDS: &[&str] = &[
    fields::TITLE,
    fields::URL,
    fields::SPEAKERS,
    fields::THUMBNAIL_URL,
    fields::COLLECTION_TITLE,
    fields::COLLECTION_URL,
    fields::RECORDED,
    fields::RECORDED_FORMATTED,
];

pub struct AppState {
    holder: Arc<ActiveIndexHolder>,
    search_count: AtomicU64,
}

impl AppState {
    pub fn new(holder: Arc<ActiveIndexHolder>) -> Self {
        Self {
            holder,
            search_count: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
}

#[derive(Debug, Serialize)]
struct Metrics {
    search_count: u64,
    index_swaps: u64,
}

pub fn router(
    state: Arc<AppState>,
    allowed_origins: &[String],
) -> Result<Router> {
    let origins = allowed_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|_| {
                Error::Config(format!("invalid allowed origin: {origin}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET])
        .allow_credentials(true);

    Ok(Router::new()
        .route("/api/v1/search", get(search))
        .route("/api/v1/metrics", get(metrics))
        .with_state(state)
        .layer(cors))
}

/// Serve the API on `addr` until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    holder: Arc<ActiveIndexHolder>,
    allowed_origins: &[String],
    cancel: CancellationToken,
) -> Result<()> {
    let app = router(Arc::new(AppState::new(holder)), allowed_origins)?;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(
        addr = %listener.local_addr()?,
        origins = ?allowed_origins,
        "starting HTTP server"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

fn search_request() -> SearchRequest {
    let facets = BTreeMap::from([
        (
            "collection".to_string(),
            FacetRequest {
                field: fields::COLLECTION_TITLE.to_string(),
                size: FACET_SIZE,
            },
        ),
        (
            "speaker".to_string(),
            FacetRequest {
                field: fields::SPEAKERS.to_string(),
                size: FACET_SIZE,
            },
        ),
    ]);

    SearchRequest {
        fields: RETURNED_FIELDS.iter().map(|f| f.to_string()).collect(),
        size: RESULT_SIZE,
        highlight: true,
        facets,
    }
}

async fn search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Response {
    state.search_count.fetch_add(1, Ordering::Relaxed);

    let holder = Arc::clone(&state.holder);
    let outcome = tokio::task::spawn_blocking(move || {
        let current = holder.current();
        current.index().search(&params.q, &search_request())
    })
    .await;

    match outcome {
        Ok(Ok(results)) => Json(results).into_response(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Query failed").into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "query task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Query failed").into_response()
        }
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<Metrics> {
    Json(Metrics {
        search_count: state.search_count.load(Ordering::Relaxed),
        index_swaps: state.holder.swap_count(),
    })
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        collection::{Collection, Session},
        document::{IndexedSession, document_key},
        index_handle::IndexHandle,
        tantivy_index::{Batch, WRITER_MEMORY_BUDGET},
    };

    const ORIGIN: &str = "http://localhost:8000";

    fn populated_handle() -> IndexHandle {
        let handle = IndexHandle::in_memory().unwrap();
        let collection = Collection {
            title: "PyCon US 2016".to_string(),
            slug: "pycon-us-2016".to_string(),
            sessions: Vec::new(),
        };

        let mut batch = Batch::new();
        for (title, speaker) in [
            ("Async Python in practice", "Ada Lovelace"),
            ("Python packaging", "Grace Hopper"),
            ("Rust for Pythonistas", "Ada Lovelace"),
        ] {
            let session = Session {
                title: title.to_string(),
                slug: crate::slugify::slugify(title),
                speakers: vec![speaker.to_string()],
                recorded: "2016-05-30".to_string(),
                ..Session::default()
            };
            batch.put(
                document_key(&collection.slug, &session.slug),
                IndexedSession::new(&session, &collection),
            );
        }
        handle
            .index()
            .writer(WRITER_MEMORY_BUDGET)
            .unwrap()
            .submit(batch)
            .unwrap();
        handle
    }

    fn app(handle: IndexHandle) -> (Arc<ActiveIndexHolder>, Router) {
        let holder = Arc::new(ActiveIndexHolder::new(handle));
        let router = router(
            Arc::new(AppState::new(Arc::clone(&holder))),
            &[ORIGIN.to_string()],
        )
        .unwrap();
        (holder, router)
    }

    async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn search_returns_hits_and_facets() {
        let (_holder, router) = app(populated_handle());

        let (status, body) = get_json(&router, "/api/v1/search?q=python").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_hits"], 2);
        let hit = &body["hits"][0];
        assert!(hit["fields"]["url"].as_str().unwrap().starts_with("/pycon"));
        assert_eq!(hit["fields"]["collection_title"], "PyCon US 2016");
        assert!(hit["fields"]["description"].is_null());

        assert_eq!(body["facets"]["collection"]["field"], "collection_title");
        assert_eq!(
            body["facets"]["collection"]["terms"][0]["term"],
            "PyCon US 2016"
        );
        assert_eq!(body["facets"]["collection"]["terms"][0]["count"], 2);
        assert_eq!(body["facets"]["speaker"]["field"], "speakers");
    }

    #[tokio::test]
    async fn empty_index_has_no_hits() {
        let (_holder, router) = app(IndexHandle::in_memory().unwrap());

        let (status, body) = get_json(&router, "/api/v1/search?q=python").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_hits"], 0);
        assert_eq!(body["hits"], Value::Array(Vec::new()));
    }

    #[tokio::test]
    async fn metrics_count_searches_and_swaps() {
        let (holder, router) = app(populated_handle());

        get_json(&router, "/api/v1/search?q=rust").await;
        get_json(&router, "/api/v1/search?q=async").await;
        holder.swap(IndexHandle::in_memory().unwrap());

        let (status, body) = get_json(&router, "/api/v1/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["search_count"], 2);
        assert_eq!(body["index_swaps"], 1);
    }

    #[tokio::test]
    async fn swapped_index_is_served() {
        let (holder, router) = app(IndexHandle::in_memory().unwrap());
        holder.swap(populated_handle());

        let (_, body) = get_json(&router, "/api/v1/search?q=rust").await;
        assert_eq!(body["total_hits"], 1);
    }

    #[tokio::test]
    async fn cors_allows_configured_origin() {
        let (_holder, router) = app(IndexHandle::in_memory().unwrap());

        let request = |origin: &str| {
            Request::get("/api/v1/search?q=x")
                .header("origin", origin)
                .body(Body::empty())
                .unwrap()
        };

        let allowed = router.clone().oneshot(request(ORIGIN)).await.unwrap();
        assert_eq!(
            allowed.headers()["access-control-allow-origin"],
            ORIGIN
        );
        assert_eq!(
            allowed.headers()["access-control-allow-credentials"],
            "true"
        );

        let denied = router
            .oneshot(request("http://evil.example"))
            .await
            .unwrap();
        assert!(
            !denied
                .headers()
                .contains_key("access-control-allow-origin")
        );
    }

    #[test]
    fn invalid_origin_is_rejected() {
        let holder =
            Arc::new(ActiveIndexHolder::new(IndexHandle::in_memory().unwrap()));
        let err = router(
            Arc::new(AppState::new(holder)),
            &["bad\norigin".to_string()],
        )
        .unwrap_err();

        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }
}
