//! Local HTTP fixture serving a manifest and a payload.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use sha2::{Digest, Sha512};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PAYLOAD_LEN: usize = 256 * 1024;

pub fn payload_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn sha512_hex(data: &[u8]) -> String {
    hex::encode(Sha512::digest(data))
}

pub struct Fixture {
    pub payload: Vec<u8>,
    pub manifest: Mutex<serde_json::Value>,
    /// Answer range requests with 206. Otherwise the full body is sent.
    pub honour_range: AtomicBool,
    /// Chunk size and per-chunk delay of the payload body.
    pub throttle: Mutex<Option<(usize, Duration)>>,
    /// Answer this many payload requests with 503 first.
    pub fail_next: AtomicUsize,
    /// Start offset of every payload request, `None` without a Range header.
    pub ranges: Mutex<Vec<Option<u64>>>,
}

impl Fixture {
    pub fn new(payload: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            payload,
            manifest: Mutex::new(serde_json::Value::Null),
            honour_range: AtomicBool::new(true),
            throttle: Mutex::new(None),
            fail_next: AtomicUsize::new(0),
            ranges: Mutex::new(Vec::new()),
        })
    }

    pub fn set_manifest(&self, value: serde_json::Value) {
        *self.manifest.lock().unwrap() = value;
    }

    pub fn throttle(&self, chunk: usize, delay: Duration) {
        *self.throttle.lock().unwrap() = Some((chunk, delay));
    }

    pub fn unthrottle(&self) {
        *self.throttle.lock().unwrap() = None;
    }

    pub fn ranges(&self) -> Vec<Option<u64>> {
        self.ranges.lock().unwrap().clone()
    }

    pub fn digest(&self) -> String {
        sha512_hex(&self.payload)
    }
}

/// Manifest body describing `fixture`'s payload at `base`.
pub fn manifest_for(base: &str, fixture: &Fixture, date: i64) -> serde_json::Value {
    serde_json::json!({
        "version": "14.1",
        "date": date,
        "incremental": "eng.1400",
        "url": format!("{}/payload.zip", base),
        "file_name": "ota.zip",
        "file_size": fixture.payload.len(),
        "sha_512": fixture.digest(),
        "changelog": "Fixes and improvements",
    })
}

async fn serve_manifest(State(fixture): State<Arc<Fixture>>) -> Json<serde_json::Value> {
    Json(fixture.manifest.lock().unwrap().clone())
}

fn range_start(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::RANGE)?
        .to_str()
        .ok()?
        .strip_prefix("bytes=")?
        .trim_end_matches('-')
        .parse()
        .ok()
}

async fn serve_payload(State(fixture): State<Arc<Fixture>>, headers: HeaderMap) -> Response {
    let start = range_start(&headers);
    fixture.ranges.lock().unwrap().push(start);

    if fixture
        .fail_next
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let total = fixture.payload.len();
    let (status, offset) = match start {
        Some(s) if fixture.honour_range.load(Ordering::SeqCst) && (s as usize) < total => {
            (StatusCode::PARTIAL_CONTENT, s as usize)
        }
        _ => (StatusCode::OK, 0),
    };
    let body = fixture.payload[offset..].to_vec();

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, body.len());
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", offset, total - 1, total),
        );
    }

    let throttle = *fixture.throttle.lock().unwrap();
    let body = match throttle {
        None => Body::from(body),
        Some((chunk, delay)) => {
            let chunks: Vec<Bytes> = body.chunks(chunk).map(Bytes::copy_from_slice).collect();
            let stream = futures::stream::iter(chunks).then(move |c| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, std::io::Error>(c)
            });
            Body::from_stream(stream)
        }
    };
    builder.body(body).unwrap()
}

/// Serve `fixture` on an ephemeral port. Returns the base URL.
pub async fn serve(fixture: Arc<Fixture>) -> String {
    let app = Router::new()
        .route("/latest.json", get(serve_manifest))
        .route("/payload.zip", get(serve_payload))
        .with_state(fixture);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}
