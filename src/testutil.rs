//! In-process HTTP server used by the engine tests.
//!
//! Serves a fixed payload with byte-range support, and can be told to
//! ignore ranges, trickle specific connections, delay chunks or answer with
//! a burst of 429s — enough to script every end-to-end scenario the engine
//! has to survive.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use axum::routing::get;
use futures::stream;

/// Deterministic payload of `n` bytes: `byte[i] = i mod 256`.
#[must_use]
pub fn payload(n: usize) -> Vec<u8> {
    (0..n).map(|i| u8::try_from(i % 256).unwrap()).collect()
}

struct ServerState {
    payload: Vec<u8>,
    ignore_ranges: AtomicBool,
    chunk_delay_ms: AtomicU64,
    /// 429 responses still to serve before succeeding.
    rate_limits_remaining: AtomicU32,
    retry_after_secs: AtomicU32,
    rate_limited_served: AtomicU32,
    /// When set, the first non-probe ranged request is trickled.
    throttle_one: AtomicBool,
    throttle_armed: AtomicBool,
    request_count: AtomicU32,
}

/// A scriptable range-capable HTTP server bound to a random local port.
pub struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl TestServer {
    /// Starts the server with the given payload.
    pub async fn spawn(payload: Vec<u8>) -> Self {
        let state = Arc::new(ServerState {
            payload,
            ignore_ranges: AtomicBool::new(false),
            chunk_delay_ms: AtomicU64::new(0),
            rate_limits_remaining: AtomicU32::new(0),
            retry_after_secs: AtomicU32::new(0),
            rate_limited_served: AtomicU32::new(0),
            throttle_one: AtomicBool::new(false),
            throttle_armed: AtomicBool::new(false),
            request_count: AtomicU32::new(0),
        });

        let app = Router::new()
            .fallback(get(serve))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    /// Responds `200` with the full body regardless of `Range` headers.
    #[must_use]
    pub fn ignore_ranges(self) -> Self {
        self.state.ignore_ranges.store(true, Ordering::Release);
        self
    }

    /// Sleeps this long before each served chunk.
    #[must_use]
    pub fn with_chunk_delay(self, delay: Duration) -> Self {
        self.state
            .chunk_delay_ms
            .store(delay.as_millis().try_into().unwrap(), Ordering::Release);
        self
    }

    /// The next `n` requests answer `429` with the given `Retry-After`.
    #[must_use]
    pub fn with_rate_limits(self, n: u32, retry_after_secs: u32) -> Self {
        self.state.rate_limits_remaining.store(n, Ordering::Release);
        self.state
            .retry_after_secs
            .store(retry_after_secs, Ordering::Release);
        self
    }

    /// Trickles the first non-probe ranged request at a few KiB/s while
    /// every other connection runs at full speed.
    #[must_use]
    pub fn throttle_one_connection(self) -> Self {
        self.state.throttle_one.store(true, Ordering::Release);
        self.state.throttle_armed.store(true, Ordering::Release);
        self
    }

    /// URL for an arbitrary basename under this server.
    #[must_use]
    pub fn url(&self, name: &str) -> String {
        format!("http://{}/{name}", self.addr)
    }

    /// Total requests served, probes included.
    #[must_use]
    pub fn request_count(&self) -> u32 {
        self.state.request_count.load(Ordering::Acquire)
    }

    /// How many 429 responses were actually served.
    #[must_use]
    pub fn rate_limited_served(&self) -> u32 {
        self.state.rate_limited_served.load(Ordering::Acquire)
    }
}

fn parse_range(headers: &HeaderMap, len: u64) -> Option<(u64, u64)> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = match end {
        "" => len.saturating_sub(1),
        e => e.parse().ok()?,
    };
    (start <= end && start < len).then_some((start, end.min(len.saturating_sub(1))))
}

fn body_stream(data: Vec<u8>, chunk: usize, delay: Duration) -> Body {
    let s = stream::unfold((data, 0usize), move |(data, pos)| async move {
        if pos >= data.len() {
            return None;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let end = (pos + chunk).min(data.len());
        let bytes = Bytes::copy_from_slice(&data[pos..end]);
        Some((Ok::<_, Infallible>(bytes), (data, end)))
    });
    Body::from_stream(s)
}

async fn serve(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    state.request_count.fetch_add(1, Ordering::AcqRel);

    let total = state.payload.len() as u64;
    let delay = Duration::from_millis(state.chunk_delay_ms.load(Ordering::Acquire));
    let range = if state.ignore_ranges.load(Ordering::Acquire) {
        None
    } else {
        parse_range(&headers, total)
    };
    let is_probe = range == Some((0, 0));

    // Scripted 429 burst; probes are exempt so the download gets started.
    if !is_probe
        && state
            .rate_limits_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    {
        state.rate_limited_served.fetch_add(1, Ordering::AcqRel);
        let retry_after = state.retry_after_secs.load(Ordering::Acquire);
        return Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header(header::RETRY_AFTER, retry_after.to_string())
            .body(Body::empty())
            .unwrap();
    }

    match range {
        Some((start, end)) => {
            let slice = state.payload[usize::try_from(start).unwrap()..=usize::try_from(end).unwrap()]
                .to_vec();

            // One unlucky connection gets trickled, if scripted.
            let throttled = !is_probe
                && state.throttle_one.load(Ordering::Acquire)
                && state
                    .throttle_armed
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();

            let body = if throttled {
                body_stream(slice, 512, Duration::from_millis(100))
            } else {
                body_stream(slice, 64 * 1024, delay)
            };

            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{total}"),
                )
                .header(header::CONTENT_LENGTH, (end - start + 1).to_string())
                .body(body)
                .unwrap()
        }
        None => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, total.to_string())
            .body(body_stream(state.payload.clone(), 64 * 1024, delay))
            .unwrap(),
    }
}
