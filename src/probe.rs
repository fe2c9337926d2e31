//! Server capability probe: one ranged GET decides the download path.

use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE, USER_AGENT};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::RuntimeConfig;
use crate::constants::{PROBE_ATTEMPTS, PROBE_RETRY_DELAY, PROBE_TIMEOUT};
use crate::error::{Error, Result};
use crate::filename::determine_filename;

/// How many body bytes the probe sniffs for filename heuristics.
const SNIFF_LEN: usize = 512;

/// Metadata gathered by probing the server.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// Total size in bytes; 0 when the server does not report one.
    pub file_size: u64,
    /// Whether `Range` requests are honored.
    pub supports_range: bool,
    /// Resolved filename (hint, headers, URL or sniffed bytes).
    pub filename: String,
    /// Content-Type as reported, if any.
    pub content_type: Option<String>,
}

/// Sends `GET` with `Range: bytes=0-0` and interprets the response.
///
/// Transport errors are retried up to three times with a short pause; the
/// first response that arrives settles the result. `206` means ranges work
/// and `Content-Range` carries the size; `200` means the server ignored the
/// range header; anything else fails the probe.
///
/// # Errors
///
/// Returns [`Error::Probe`] when no usable response arrives,
/// [`Error::Cancelled`] when `cancel` fires first.
pub async fn probe_server(
    cancel: &CancellationToken,
    raw_url: &str,
    filename_hint: Option<&str>,
    runtime: &RuntimeConfig,
) -> Result<ProbeResult> {
    let url = Url::parse(raw_url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::InvalidUrl(format!(
            "unsupported scheme: {}",
            url.scheme()
        )));
    }

    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()?;

    let mut last_err: Option<reqwest::Error> = None;
    let mut response = None;

    for attempt in 0..PROBE_ATTEMPTS {
        if attempt > 0 {
            log::debug!("retrying probe, attempt {}", attempt + 1);
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(PROBE_RETRY_DELAY) => {}
            }
        }

        let request = client
            .get(url.clone())
            .header(RANGE, "bytes=0-0")
            .header(USER_AGENT, &runtime.user_agent)
            .send();

        let result = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            r = request => r,
        };

        match result {
            Ok(resp) => {
                response = Some(resp);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }

    let Some(resp) = response else {
        let detail = last_err.map_or_else(|| "no response".to_string(), |e| e.to_string());
        return Err(Error::Probe(detail));
    };

    log::debug!("probe response status: {}", resp.status());

    let (file_size, supports_range) = match resp.status() {
        StatusCode::PARTIAL_CONTENT => (parse_content_range_total(resp.headers()), true),
        StatusCode::OK => {
            let size = resp
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            (size, false)
        }
        status => {
            return Err(Error::Probe(format!(
                "unexpected status code: {}",
                status.as_u16()
            )));
        }
    };

    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let headers = resp.headers().clone();
    let sniffed = sniff_body(resp).await;

    let filename = match filename_hint {
        Some(hint) if !hint.is_empty() => hint.to_string(),
        _ => determine_filename(&url, &headers, &sniffed),
    };

    log::debug!(
        "probe complete: filename={filename}, size={file_size}, range={supports_range}"
    );

    Ok(ProbeResult {
        file_size,
        supports_range,
        filename,
        content_type,
    })
}

/// Parses the total out of `Content-Range: bytes 0-0/SIZE`. A `*` total
/// (unknown) maps to 0.
fn parse_content_range_total(headers: &reqwest::header::HeaderMap) -> u64 {
    headers
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .filter(|total| *total != "*")
        .and_then(|total| total.parse().ok())
        .unwrap_or(0)
}

/// Reads up to [`SNIFF_LEN`] body bytes, then drops the rest of the stream.
async fn sniff_body(resp: reqwest::Response) -> Vec<u8> {
    let mut sniffed = Vec::with_capacity(SNIFF_LEN);
    let mut stream = resp.bytes_stream();
    while sniffed.len() < SNIFF_LEN {
        match stream.next().await {
            Some(Ok(chunk)) => {
                let take = chunk.len().min(SNIFF_LEN - sniffed.len());
                sniffed.extend_from_slice(&chunk[..take]);
            }
            _ => break,
        }
    }
    sniffed
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn content_range_total_parses_size() {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 0-0/16777216"));
        assert_eq!(parse_content_range_total(&h), 16_777_216);
    }

    #[test]
    fn content_range_star_means_unknown() {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 0-0/*"));
        assert_eq!(parse_content_range_total(&h), 0);
    }

    #[test]
    fn content_range_missing_means_zero() {
        assert_eq!(parse_content_range_total(&HeaderMap::new()), 0);
    }

    #[tokio::test]
    async fn probe_rejects_non_http_schemes() {
        let cancel = CancellationToken::new();
        let err = probe_server(&cancel, "ftp://example.com/f", None, &RuntimeConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn probe_ranged_server() {
        let server = crate::testutil::TestServer::spawn(crate::testutil::payload(64 * 1024)).await;
        let cancel = CancellationToken::new();

        let probe = probe_server(&cancel, &server.url("data.bin"), None, &RuntimeConfig::default())
            .await
            .unwrap();
        assert!(probe.supports_range);
        assert_eq!(probe.file_size, 64 * 1024);
        assert_eq!(probe.filename, "data.bin");
    }

    #[tokio::test]
    async fn probe_downgrades_on_200() {
        let server = crate::testutil::TestServer::spawn(crate::testutil::payload(1024))
            .await
            .ignore_ranges();
        let cancel = CancellationToken::new();

        let probe = probe_server(&cancel, &server.url("plain.bin"), None, &RuntimeConfig::default())
            .await
            .unwrap();
        assert!(!probe.supports_range);
        assert_eq!(probe.file_size, 1024);
    }

    #[tokio::test]
    async fn filename_hint_overrides_probe() {
        let server = crate::testutil::TestServer::spawn(crate::testutil::payload(512)).await;
        let cancel = CancellationToken::new();

        let probe = probe_server(
            &cancel,
            &server.url("server-name.bin"),
            Some("my-name.bin"),
            &RuntimeConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(probe.filename, "my-name.bin");
    }
}
