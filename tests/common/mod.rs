//! Mock HTTP origin for integration tests: serves byte ranges with
//! configurable validators, delays, and failure injection, and records
//! every ranged GET it sees.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeLog {
    pub path: String,
    pub start: u64,
    pub end: u64,
}

#[derive(Default)]
struct OriginState {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    etag: Mutex<Option<String>>,
    last_modified: Mutex<Option<String>>,
    requests: Mutex<Vec<RangeLog>>,
    delay: Mutex<Option<Duration>>,
    /// Number of upcoming requests to answer with 500.
    fail_next: AtomicUsize,
    /// Serve at most this many body bytes regardless of the range.
    short_body: Mutex<Option<usize>>,
}

pub struct MockOrigin {
    addr: std::net::SocketAddr,
    state: Arc<OriginState>,
}

impl MockOrigin {
    /// Start a server with `data` available at `/image`.
    pub async fn serve(data: Vec<u8>) -> Self {
        let state = Arc::new(OriginState::default());
        state
            .objects
            .lock()
            .unwrap()
            .insert("/image".to_string(), data);

        let app = Router::new()
            .fallback(handle)
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}/image", self.addr)
    }

    pub fn set_object(&self, path: &str, data: Vec<u8>) {
        self.state
            .objects
            .lock()
            .unwrap()
            .insert(path.to_string(), data);
    }

    pub fn set_etag(&self, etag: Option<&str>) {
        *self.state.etag.lock().unwrap() = etag.map(String::from);
    }

    pub fn set_last_modified_epoch(&self, epoch: i64) {
        let formatted = chrono::DateTime::from_timestamp(epoch, 0)
            .unwrap()
            .to_rfc2822();
        *self.state.last_modified.lock().unwrap() = Some(formatted);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_requests(&self, count: usize) {
        self.state.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn serve_short_bodies(&self, limit: usize) {
        *self.state.short_body.lock().unwrap() = Some(limit);
    }

    pub fn requests(&self) -> Vec<RangeLog> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Ranged GETs whose range covers byte `offset` of `path`.
    pub fn requests_covering(&self, path: &str, offset: u64) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.path == path && r.start <= offset && offset <= r.end)
            .count()
    }
}

fn parse_range(headers: &HeaderMap) -> Option<(u64, u64)> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

async fn handle(State(state): State<Arc<OriginState>>, uri: Uri, headers: HeaderMap) -> Response {
    let delay = *state.delay.lock().unwrap();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let path = uri.path().to_string();
    let Some((start, end)) = parse_range(&headers) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    state.requests.lock().unwrap().push(RangeLog {
        path: path.clone(),
        start,
        end,
    });

    if state
        .fail_next
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let objects = state.objects.lock().unwrap();
    let Some(data) = objects.get(&path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if start as usize >= data.len() {
        return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
    }
    let stop = (end as usize + 1).min(data.len());
    let mut body = data[start as usize..stop].to_vec();
    drop(objects);

    if let Some(limit) = *state.short_body.lock().unwrap() {
        body.truncate(limit);
    }

    let mut response = Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, stop - 1, body.len()),
        );
    if let Some(etag) = state.etag.lock().unwrap().clone() {
        response = response.header(header::ETAG, etag);
    }
    if let Some(last_modified) = state.last_modified.lock().unwrap().clone() {
        response = response.header(header::LAST_MODIFIED, last_modified);
    }
    response.body(Body::from(body)).unwrap()
}

/// Deterministic but non-trivial test payload.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
