//! Plex Protocol Surface support (content negotiation, query tolerance,
//! the Live-TV metadata contract, and the Plex-facing error envelope).
//!
//! Built on the XMLTV/EPG `quick_xml::Writer` usage in `server/epg.rs` for
//! escaping, and on the ETag/cache-control pattern already applied to the
//! `epg.xml` response in `server/handlers.rs`.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// Response representation Plex clients can request: most Plex apps speak
/// XML by default, but some (including the official web client) send
/// `Accept: application/json` and expect a JSON MediaContainer instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Xml,
    Json,
}

impl Format {
    pub fn content_type(self) -> &'static str {
        match self {
            Format::Xml => "text/xml;charset=utf-8",
            Format::Json => "application/json;charset=utf-8",
        }
    }
}

/// Decide XML vs JSON the way Plex itself negotiates: an explicit
/// `Accept: application/json` wins, otherwise XML is the default every Plex
/// client tolerates.
pub fn negotiate(headers: &HeaderMap) -> Format {
    if let Some(accept) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) {
        if accept.contains("application/json") {
            return Format::Json;
        }
    }
    Format::Xml
}

/// Escape text for inclusion in an XML element body or attribute value.
pub fn xml_escape(s: &str) -> String {
    quick_xml::escape::escape(s).into_owned()
}

/// Query parameters Plex Media Server and Plex clients are known to attach
/// to library/timeline/transcode requests. Anything outside this set is
/// dropped rather than rejected, since Plex evolves its client query
/// parameters across versions and a strict allowlist must not break older
/// or newer clients sending a harmless extra parameter.
pub fn known_query_keys() -> &'static [&'static str] {
    &[
        "X-Plex-Token",
        "X-Plex-Client-Identifier",
        "X-Plex-Platform",
        "X-Plex-Platform-Version",
        "X-Plex-Product",
        "X-Plex-Version",
        "X-Plex-Device",
        "X-Plex-Device-Name",
        "X-Plex-Provides",
        "X-Plex-Session-Identifier",
        "includeChildren",
        "includeExternalMedia",
        "includeRelated",
        "checkFiles",
        "session",
        "ratingKey",
        "key",
        "type",
    ]
}

/// Drop any query parameter not in `known_query_keys`, preserving order of
/// the ones kept.
pub fn sanitize_query(query: &str) -> String {
    let allowed = known_query_keys();
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or("");
            allowed.iter().any(|k| k.eq_ignore_ascii_case(key))
        })
        .collect();
    kept.join("&")
}

/// Field values the Live-TV metadata contract requires on every channel or
/// timeline payload. Plex treats `type=5`/`"trailer"` as a movie extra, not
/// live television, and will refuse to play it as a channel: every handler
/// that emits channel metadata must use these constants instead of the
/// on-demand-video defaults.
pub struct LiveTvMetadataFields;

impl LiveTvMetadataFields {
    pub const XML_TYPE: &'static str = "clip";
    pub const CONTENT_TYPE: u8 = 4;
    pub const METADATA_TYPE: &'static str = "clip";
    pub const MEDIA_TYPE: &'static str = "clip";
}

/// Headers every Plex metadata response must carry: metadata describing a
/// live channel must never be cached by an intermediary, since the
/// now/next window backing it changes underneath the same ratingKey.
pub fn metadata_headers(etag: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CACHE_CONTROL,
        "no-cache, no-store, must-revalidate".parse().expect("valid header value"),
    );
    headers.insert(header::ETAG, etag.parse().expect("valid etag header value"));
    headers
}

/// Middleware applied to the Plex library/timeline/transcode sub-router:
/// stamps every response that doesn't already carry one with the no-cache
/// headers the Live-TV metadata contract requires. Handlers remain
/// responsible for the body's field values; this only guarantees the
/// headers are never forgotten on a new endpoint.
pub async fn coerce_live_tv_metadata(request: Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    if !headers.contains_key(header::CACHE_CONTROL) {
        headers.insert(
            header::CACHE_CONTROL,
            "no-cache, no-store, must-revalidate".parse().expect("valid header value"),
        );
    }
    response
}

/// Minimal MediaContainer/JSON error envelope for Plex-targeted endpoints.
/// Plex clients choke on an HTML error page, so every error this surface
/// returns is a tiny well-formed document in the negotiated format, with
/// status clamped at 500 even for internal failures.
pub fn plex_error_response(format: Format, status: StatusCode, message: &str) -> Response {
    let status = if status.as_u16() > 500 { StatusCode::INTERNAL_SERVER_ERROR } else { status };
    let body = match format {
        Format::Json => {
            format!(
                r#"{{"MediaContainer":{{"size":0,"error":"{}"}}}}"#,
                xml_escape(message)
            )
        }
        Format::Xml => {
            format!(
                r#"<?xml version="1.0" encoding="UTF-8"?><MediaContainer size="0" error="{}"/>"#,
                xml_escape(message)
            )
        }
    };
    let mut response = (status, body).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, format.content_type().parse().expect("valid content type"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_defaults_to_xml() {
        let headers = HeaderMap::new();
        assert_eq!(negotiate(&headers), Format::Xml);
    }

    #[test]
    fn negotiate_honors_json_accept_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, "application/json".parse().unwrap());
        assert_eq!(negotiate(&headers), Format::Json);
    }

    #[test]
    fn sanitize_query_drops_unknown_keys() {
        let result = sanitize_query("X-Plex-Token=abc&evil=1&checkFiles=1");
        assert!(result.contains("X-Plex-Token=abc"));
        assert!(result.contains("checkFiles=1"));
        assert!(!result.contains("evil"));
    }

    #[test]
    fn xml_escape_handles_ampersand_and_quotes() {
        assert_eq!(xml_escape("Tom & Jerry \"Show\""), "Tom &amp; Jerry &quot;Show&quot;");
    }

    #[test]
    fn error_response_status_clamped_at_500() {
        let response = plex_error_response(Format::Json, StatusCode::from_u16(599).unwrap(), "boom");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
