//! M3U Stream Parser (C6)
//!
//! Incremental parser for M3U/M3U8 playlist bodies. Unlike the XMLTV fetcher,
//! which can afford to buffer the whole document, playlists from IPTV
//! providers can run into the tens of megabytes, so this module streams line
//! by line and never materializes the full body in memory.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;

use crate::net::validate_url_for_ssrf;

const DOWNLOAD_TIMEOUT_SECS: u64 = 30;
const EMIT_CHUNK_SIZE: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum M3uError {
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed playlist: {0}")]
    MalformedPlaylist(String),
    #[error("playlist is empty")]
    Empty,
    #[error("URL not allowed: {0}")]
    UrlNotAllowed(String),
}

impl From<crate::net::SsrfError> for M3uError {
    fn from(e: crate::net::SsrfError) -> Self {
        M3uError::UrlNotAllowed(e.0)
    }
}

/// One `#EXTINF` entry plus its following URL line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct M3uEntry {
    pub tvg_id: Option<String>,
    pub tvg_name: Option<String>,
    pub tvg_logo: Option<String>,
    pub group_title: Option<String>,
    pub display_name: String,
    pub url: String,
}

/// Emitted every `EMIT_CHUNK_SIZE` records, and once more at end-of-stream
/// with whatever remains.
#[derive(Debug, Clone)]
pub struct ParseProgress {
    pub parsed: usize,
    pub estimated_total: Option<usize>,
    pub bytes_read: u64,
}

pub struct ParseOutcome {
    pub entries: Vec<M3uEntry>,
    pub progress_events: Vec<ParseProgress>,
}

/// Fetch a playlist body and parse it, reporting progress in `EMIT_CHUNK_SIZE`
/// batches. Entries are deduplicated by `(url, display_name)` within the
/// parse; memory use is bounded by the output vector, not the input size.
pub async fn parse_playlist_url(url: &str) -> Result<ParseOutcome, M3uError> {
    validate_url_for_ssrf(url)?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .build()
        .map_err(|e| M3uError::Network(e.to_string()))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| M3uError::Network(e.to_string()))?;

    if !response.status().is_success() {
        return Err(M3uError::Network(format!("HTTP error: {}", response.status())));
    }

    let stream = response
        .bytes_stream()
        .map(|r| r.map_err(std::io::Error::other));
    let reader = StreamReader::new(stream);
    parse_playlist_reader(BufReader::new(reader)).await
}

/// Parse an already-open async reader (used directly by tests and by
/// `parse_playlist_url`).
pub async fn parse_playlist_reader<R: AsyncBufRead + Unpin>(
    mut reader: R,
) -> Result<ParseOutcome, M3uError> {
    let mut line = String::new();
    let mut bytes_read: u64 = 0;
    let mut saw_header = false;
    let mut saw_any_line = false;

    let mut entries: Vec<M3uEntry> = Vec::new();
    let mut seen: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();
    let mut progress_events = Vec::new();
    let mut pending: Option<PendingExtinf> = None;

    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| M3uError::Network(e.to_string()))?;
        if n == 0 {
            break;
        }
        bytes_read += n as u64;
        saw_any_line = true;

        let trimmed = trim_line(&line);
        if trimmed.is_empty() {
            continue;
        }

        if !saw_header {
            saw_header = true;
            if !trimmed.starts_with("#EXTM3U") {
                return Err(M3uError::MalformedPlaylist(
                    "playlist does not start with #EXTM3U".into(),
                ));
            }
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("#EXTINF:") {
            pending = Some(parse_extinf(rest));
            continue;
        }

        if trimmed.starts_with('#') {
            // Unrecognized directive (#EXTGRP, #EXTVLCOPT, ...); skip.
            continue;
        }

        // A non-comment line following an #EXTINF is the stream URL.
        if let Some(meta) = pending.take() {
            let key = (trimmed.to_string(), meta.display_name.clone());
            if seen.insert(key) {
                entries.push(M3uEntry {
                    tvg_id: meta.tvg_id,
                    tvg_name: meta.tvg_name,
                    tvg_logo: meta.tvg_logo,
                    group_title: meta.group_title,
                    display_name: meta.display_name,
                    url: trimmed.to_string(),
                });

                if entries.len() % EMIT_CHUNK_SIZE == 0 {
                    progress_events.push(ParseProgress {
                        parsed: entries.len(),
                        estimated_total: None,
                        bytes_read,
                    });
                }
            }
        }
    }

    if !saw_any_line {
        return Err(M3uError::Empty);
    }
    if !saw_header {
        return Err(M3uError::MalformedPlaylist(
            "playlist does not start with #EXTM3U".into(),
        ));
    }

    progress_events.push(ParseProgress {
        parsed: entries.len(),
        estimated_total: Some(entries.len()),
        bytes_read,
    });

    Ok(ParseOutcome {
        entries,
        progress_events,
    })
}

/// Streaming count of `#EXTINF` lines without materializing any records;
/// used to show total-size feedback before a real parse begins.
pub async fn estimate(url: &str) -> Result<usize, M3uError> {
    validate_url_for_ssrf(url)?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .build()
        .map_err(|e| M3uError::Network(e.to_string()))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| M3uError::Network(e.to_string()))?;

    if !response.status().is_success() {
        return Err(M3uError::Network(format!("HTTP error: {}", response.status())));
    }

    let stream = response
        .bytes_stream()
        .map(|r| r.map_err(std::io::Error::other));
    let reader = StreamReader::new(stream);
    let mut buffered = BufReader::new(reader);

    let mut count = 0usize;
    let mut line = String::new();
    let mut saw_any = false;
    loop {
        line.clear();
        let n = buffered
            .read_line(&mut line)
            .await
            .map_err(|e| M3uError::Network(e.to_string()))?;
        if n == 0 {
            break;
        }
        saw_any = true;
        if trim_line(&line).starts_with("#EXTINF:") {
            count += 1;
        }
    }

    if !saw_any {
        return Err(M3uError::Empty);
    }
    Ok(count)
}

struct PendingExtinf {
    tvg_id: Option<String>,
    tvg_name: Option<String>,
    tvg_logo: Option<String>,
    group_title: Option<String>,
    display_name: String,
}

/// Parse the body of an `#EXTINF:` line: duration, comma-separated
/// `key="value"` attributes, then a trailing display title after the last
/// comma.
fn parse_extinf(rest: &str) -> PendingExtinf {
    let display_name = rest
        .rsplit_once(',')
        .map(|(_, title)| title.trim().to_string())
        .unwrap_or_default();

    let attrs = rest.rsplit_once(',').map(|(attrs, _)| attrs).unwrap_or(rest);

    PendingExtinf {
        tvg_id: extract_attr(attrs, "tvg-id"),
        tvg_name: extract_attr(attrs, "tvg-name"),
        tvg_logo: extract_attr(attrs, "tvg-logo"),
        group_title: extract_attr(attrs, "group-title"),
        display_name,
    }
}

fn extract_attr(attrs: &str, key: &str) -> Option<String> {
    let needle = format!("{}=\"", key);
    let start = attrs.find(&needle)? + needle.len();
    let end = attrs[start..].find('"')? + start;
    Some(attrs[start..end].to_string())
}

/// Strip a BOM (if present on the very first line), then CR/LF.
fn trim_line(line: &str) -> &str {
    line.strip_prefix('\u{feff}')
        .unwrap_or(line)
        .trim_end_matches(['\r', '\n'])
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader as TokioBufReader;

    fn reader_for(body: &str) -> TokioBufReader<Cursor<Vec<u8>>> {
        TokioBufReader::new(Cursor::new(body.as_bytes().to_vec()))
    }

    #[tokio::test]
    async fn parses_basic_playlist() {
        let body = "#EXTM3U\n#EXTINF:-1 tvg-id=\"bbc1\" tvg-logo=\"https://x/icon.png\" group-title=\"UK\",BBC One\nhttp://example.com/bbc1.ts\n";
        let outcome = parse_playlist_reader(reader_for(body)).await.unwrap();
        assert_eq!(outcome.entries.len(), 1);
        let entry = &outcome.entries[0];
        assert_eq!(entry.tvg_id.as_deref(), Some("bbc1"));
        assert_eq!(entry.tvg_logo.as_deref(), Some("https://x/icon.png"));
        assert_eq!(entry.group_title.as_deref(), Some("UK"));
        assert_eq!(entry.display_name, "BBC One");
        assert_eq!(entry.url, "http://example.com/bbc1.ts");
    }

    #[tokio::test]
    async fn tolerates_crlf_and_bom() {
        let body = "\u{feff}#EXTM3U\r\n#EXTINF:-1,Channel One\r\nhttp://example.com/one.ts\r\n";
        let outcome = parse_playlist_reader(reader_for(body)).await.unwrap();
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.entries[0].display_name, "Channel One");
    }

    #[tokio::test]
    async fn dedups_by_url_and_display_name() {
        let body = "#EXTM3U\n#EXTINF:-1,Dup\nhttp://example.com/a.ts\n#EXTINF:-1,Dup\nhttp://example.com/a.ts\n#EXTINF:-1,Dup\nhttp://example.com/b.ts\n";
        let outcome = parse_playlist_reader(reader_for(body)).await.unwrap();
        assert_eq!(outcome.entries.len(), 2);
    }

    #[tokio::test]
    async fn empty_body_is_rejected() {
        let err = parse_playlist_reader(reader_for("")).await.unwrap_err();
        assert!(matches!(err, M3uError::Empty));
    }

    #[tokio::test]
    async fn missing_header_is_malformed() {
        let body = "#EXTINF:-1,No header\nhttp://example.com/a.ts\n";
        let err = parse_playlist_reader(reader_for(body)).await.unwrap_err();
        assert!(matches!(err, M3uError::MalformedPlaylist(_)));
    }

    #[tokio::test]
    async fn unrecognized_directives_are_skipped() {
        let body = "#EXTM3U\n#EXTVLCOPT:network-caching=1000\n#EXTINF:-1,Channel\nhttp://example.com/c.ts\n";
        let outcome = parse_playlist_reader(reader_for(body)).await.unwrap();
        assert_eq!(outcome.entries.len(), 1);
    }

    #[tokio::test]
    async fn emits_progress_chunks() {
        let mut body = String::from("#EXTM3U\n");
        for i in 0..1200 {
            body.push_str(&format!("#EXTINF:-1,Ch{}\nhttp://example.com/{}.ts\n", i, i));
        }
        let outcome = parse_playlist_reader(reader_for(&body)).await.unwrap();
        assert_eq!(outcome.entries.len(), 1200);
        // Two chunk boundaries (500, 1000) plus the final completion event.
        assert_eq!(outcome.progress_events.len(), 3);
        assert_eq!(outcome.progress_events[0].parsed, 500);
        assert_eq!(outcome.progress_events[1].parsed, 1000);
        assert_eq!(outcome.progress_events[2].parsed, 1200);
        assert_eq!(outcome.progress_events[2].estimated_total, Some(1200));
    }
}
