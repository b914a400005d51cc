//! Request handlers

use super::WebState;
use crate::context::SearchContext;
use crate::error::SearchError;
use crate::metrics::MetricsSnapshot;
use crate::protocol::{DoneEvent, FileMatch, Request};
use crate::service::SearchEvent;
use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use tracing::{info, warn};

/// Matches drained from the service per `matches` event.
const BATCH_SIZE: usize = 256;

/// Error body returned before streaming starts
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Stats response: counters plus the current state of the fetch limiter
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    pub fetch_limit: usize,
    pub fetch_permits_available: usize,
    pub cache_dir: String,
}

pub struct ApiError(SearchError);

impl From<SearchError> for ApiError {
    fn from(e: SearchError) -> Self {
        Self(e)
    }
}

fn status_for(e: &SearchError) -> StatusCode {
    match e {
        SearchError::BadRequest(_) => StatusCode::BAD_REQUEST,
        e if e.is_temporary() => StatusCode::SERVICE_UNAVAILABLE,
        SearchError::DeadlineExceeded | SearchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = ErrorResponse {
            error: self.0.to_string(),
            code: self.0.code(),
        };
        (status, Json(body)).into_response()
    }
}

/// Cancels the search when the response stream is dropped, i.e. when the
/// client disconnects.
struct CancelOnDrop(SearchContext);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn to_sse(events: Vec<SearchEvent>) -> (Vec<Result<Event, Infallible>>, bool) {
    let mut matches: Vec<FileMatch> = Vec::new();
    let mut done: Option<DoneEvent> = None;
    for event in events {
        match event {
            SearchEvent::Match(m) => matches.push(m),
            SearchEvent::Done(d) => done = Some(d),
        }
    }

    let mut out = Vec::with_capacity(2);
    if !matches.is_empty() {
        out.push(Ok(encode("matches", &matches)));
    }
    let finished = done.is_some();
    if let Some(done) = done {
        out.push(Ok(encode("done", &done)));
    }
    (out, finished)
}

fn encode<T: Serialize>(name: &str, data: &T) -> Event {
    Event::default()
        .event(name)
        .json_data(data)
        .unwrap_or_else(|e| {
            warn!(event = name, error = %e, "failed to encode event");
            Event::default().comment("encode error")
        })
}

/// Handle search requests: validation errors are returned as JSON, anything
/// later is reported in the terminal `done` event.
pub async fn search_handler(
    State(state): State<WebState>,
    Json(req): Json<Request>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    info!(
        repo = %req.repo,
        commit = %req.commit,
        structural = req.pattern_info.is_structural,
        indexed = req.indexed,
        "search request"
    );
    let ctx = SearchContext::background();
    let rx = state.service.start(&ctx, req).map_err(|e| {
        warn!(error = %e, "rejected search request");
        e
    })?;

    let events = stream::unfold(Some((rx, CancelOnDrop(ctx))), |state| async move {
        let (mut rx, guard) = state?;
        let mut buf = Vec::with_capacity(BATCH_SIZE);
        if rx.recv_many(&mut buf, BATCH_SIZE).await == 0 {
            return None;
        }
        let (events, finished) = to_sse(buf);
        let next = if finished { None } else { Some((rx, guard)) };
        Some((stream::iter(events), next))
    })
    .flatten();

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Handle stats requests
pub async fn stats_handler(State(state): State<WebState>) -> Json<StatsResponse> {
    let store = state.service.store();
    Json(StatsResponse {
        metrics: state.service.metrics().snapshot(),
        fetch_limit: store.limiter().size(),
        fetch_permits_available: store.limiter().available(),
        cache_dir: store.config().cache_dir.display().to_string(),
    })
}

/// Handle health check requests
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
