//! Upstream Probe (C5)
//!
//! Classifies a Stream's upstream URL before a session is opened: what kind
//! of payload it serves, how long the origin took to answer, and whether the
//! Deferred-Start Shim needs to stand in while the real transcoder spins up.

use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RANGE, USER_AGENT};

use crate::net::validate_url_for_ssrf;

const PROBE_USER_AGENT: &str = "IPTV-Bridge/1.0 (compatible; upstream-probe)";
const MAX_REDIRECTS: usize = 5;
const RANGED_GET_BYTES: u64 = 16 * 1024;
const SLOW_LATENCY_THRESHOLD: Duration = Duration::from_secs(3);
const MPEGTS_SYNC_BYTE: u8 = 0x47;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
    #[error("upstream requires authorization")]
    Unauthorized,
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("URL not allowed: {0}")]
    UrlNotAllowed(String),
}

impl From<crate::net::SsrfError> for ProbeError {
    fn from(e: crate::net::SsrfError) -> Self {
        ProbeError::UrlNotAllowed(e.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    MpegTs,
    Hls,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub resolved_url: String,
    pub kind: UpstreamKind,
    pub first_byte_ms_estimate: u64,
    pub requires_deferred_start: bool,
}

/// Probe a Stream's upstream URL. `connection_limits_one` is true when the
/// owning Stream tolerates only a single live upstream connection, which is
/// the condition under which a slow or refused HEAD forces deferred-start.
pub async fn probe(url: &str, connection_limits_one: bool) -> Result<ProbeResult, ProbeError> {
    validate_url_for_ssrf(url)?;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| ProbeError::Unreachable(e.to_string()))?;

    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(PROBE_USER_AGENT));

    let started = Instant::now();
    let head_response = client
        .head(url)
        .headers(headers.clone())
        .send()
        .await;

    let (resolved_url, content_type, content_length, head_refused) = match head_response {
        Ok(resp) if resp.status().is_success() => {
            let resolved_url = resp.url().to_string();
            let content_type = resp
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let content_length = resp.content_length();
            (resolved_url, content_type, content_length, false)
        }
        Ok(resp) if resp.status().as_u16() == 401 || resp.status().as_u16() == 403 => {
            return Err(ProbeError::Unauthorized);
        }
        _ => (url.to_string(), None, None, true),
    };

    let first_byte_latency = started.elapsed();

    let (kind, first_byte_latency, head_refused) = if head_refused || content_length.unwrap_or(0) == 0 {
        let ranged_started = Instant::now();
        let sample = ranged_get_sample(&client, &resolved_url, headers).await?;
        let kind = classify(content_type.as_deref(), &resolved_url, &sample);
        (kind, ranged_started.elapsed(), false)
    } else {
        let kind = classify(content_type.as_deref(), &resolved_url, &[]);
        (kind, first_byte_latency, head_refused)
    };

    let requires_deferred_start = connection_limits_one
        && (head_refused || first_byte_latency > SLOW_LATENCY_THRESHOLD);

    Ok(ProbeResult {
        resolved_url,
        kind,
        first_byte_ms_estimate: first_byte_latency.as_millis() as u64,
        requires_deferred_start,
    })
}

async fn ranged_get_sample(
    client: &reqwest::Client,
    url: &str,
    mut headers: HeaderMap,
) -> Result<Vec<u8>, ProbeError> {
    headers.insert(
        RANGE,
        HeaderValue::from_str(&format!("bytes=0-{}", RANGED_GET_BYTES - 1))
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?,
    );

    let response = client
        .get(url)
        .headers(headers)
        .send()
        .await
        .map_err(|e| ProbeError::Unreachable(e.to_string()))?;

    if response.status().as_u16() == 401 || response.status().as_u16() == 403 {
        return Err(ProbeError::Unauthorized);
    }
    if !response.status().is_success() && response.status().as_u16() != 206 {
        return Err(ProbeError::Unreachable(format!(
            "HTTP error: {}",
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ProbeError::Unreachable(e.to_string()))?;
    Ok(bytes.to_vec())
}

/// Classify by Content-Type, then by URL suffix, then by magic bytes.
fn classify(content_type: Option<&str>, url: &str, sample: &[u8]) -> UpstreamKind {
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        if ct.contains("mp2t") || ct.contains("mpeg") {
            return UpstreamKind::MpegTs;
        }
        if ct.contains("mpegurl") || ct.contains("m3u8") {
            return UpstreamKind::Hls;
        }
    }

    let lower_url = url.to_ascii_lowercase();
    if lower_url.ends_with(".ts") {
        return UpstreamKind::MpegTs;
    }
    if lower_url.ends_with(".m3u8") {
        return UpstreamKind::Hls;
    }

    if !sample.is_empty() && sample[0] == MPEGTS_SYNC_BYTE {
        return UpstreamKind::MpegTs;
    }
    if sample.starts_with(b"#EXTM3U") {
        return UpstreamKind::Hls;
    }

    UpstreamKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_content_type() {
        assert_eq!(classify(Some("video/mp2t"), "http://x/y", &[]), UpstreamKind::MpegTs);
        assert_eq!(
            classify(Some("application/vnd.apple.mpegurl"), "http://x/y", &[]),
            UpstreamKind::Hls
        );
    }

    #[test]
    fn classifies_by_url_suffix_when_no_content_type() {
        assert_eq!(classify(None, "http://x/stream.ts", &[]), UpstreamKind::MpegTs);
        assert_eq!(classify(None, "http://x/playlist.m3u8", &[]), UpstreamKind::Hls);
    }

    #[test]
    fn classifies_by_magic_bytes_as_last_resort() {
        let ts_sample = [0x47, 0x00, 0x00, 0x00];
        assert_eq!(classify(None, "http://x/stream", &ts_sample), UpstreamKind::MpegTs);

        let hls_sample = b"#EXTM3U\n#EXT-X-VERSION:3\n".to_vec();
        assert_eq!(classify(None, "http://x/stream", &hls_sample), UpstreamKind::Hls);
    }

    #[test]
    fn unclassifiable_sample_is_unknown() {
        assert_eq!(classify(None, "http://x/stream", &[0, 1, 2]), UpstreamKind::Unknown);
    }
}
