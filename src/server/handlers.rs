//! Non-streaming HTTP handlers: health, discovery documents, the M3U
//! playlist, and the XMLTV guide. Streaming endpoints live in `server::stream`
//! and the Plex library surface lives in `server::plex`/`server::routes`.

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use super::hdhr;
use super::m3u;
use super::state::AppState;
use crate::cache::{etag_for, TTL_DISCOVERY, TTL_EPG_NOW_NEXT, TTL_LINEUP};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Returns 200 OK with a JSON body. Used by monitoring and by the Plex
/// discovery probe to confirm the process is reachable before it tries the
/// heavier discovery endpoints.
pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy".to_string() }))
}

pub async fn fallback_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn text_response(body: String, content_type: &'static str, etag: &str, cache_control: &'static str) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::ETAG, HeaderValue::from_str(&etag).unwrap_or(HeaderValue::from_static("\"0\"")));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));
    (headers, body)
}

fn json_response(body: String, etag: &str, cache_control: &'static str) -> impl IntoResponse {
    text_response(body, "application/json", etag, cache_control)
}

/// Serves the M3U playlist Plex imports as the channel list, cached behind
/// the shared `Cache` so repeated polls from Plex's tuner manager don't hit
/// the database every time.
pub async fn playlist_m3u(State(state): State<AppState>) -> Result<impl IntoResponse, (StatusCode, String)> {
    if let Some(cached) = state.cache.get("m3u:playlist").filter(|c| !c.stale) {
        state.observer.record_cache_access(true);
        return Ok(text_response(cached.value, "audio/x-mpegurl", &cached.etag, "public, max-age=30"));
    }
    state.observer.record_cache_access(false);

    let mut conn = state.get_connection().map_err(|e| {
        tracing::error!("m3u playlist: connection pool error: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Service temporarily unavailable".to_string())
    })?;
    let port = state.get_port();
    let content = m3u::generate_m3u_playlist(&mut conn, port).map_err(|e| {
        tracing::error!("m3u playlist: generation failed: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Unable to generate playlist".to_string())
    })?;

    let etag = etag_for(&content);
    state.cache.put("m3u:playlist", content.clone(), etag.clone(), TTL_LINEUP);
    Ok(text_response(content, "audio/x-mpegurl", &etag, "public, max-age=30"))
}

/// Serves the XMLTV guide document for the default guide window.
pub async fn epg_xml(State(state): State<AppState>) -> Result<impl IntoResponse, (StatusCode, String)> {
    if let Some(cached) = state.cache.get("epg:xml").filter(|c| !c.stale) {
        state.observer.record_cache_access(true);
        return Ok(text_response(cached.value, "application/xml", &cached.etag, "public, max-age=60"));
    }
    state.observer.record_cache_access(false);

    let mut conn = state.get_connection().map_err(|e| {
        tracing::error!("epg.xml: connection pool error: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Service temporarily unavailable".to_string())
    })?;
    let content = super::epg::generate_xmltv_epg(&mut conn).map_err(|e| {
        tracing::error!("epg.xml: generation failed: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Unable to generate guide".to_string())
    })?;

    let etag = etag_for(&content);
    state.cache.put("epg:xml", content.clone(), etag.clone(), TTL_EPG_NOW_NEXT);
    Ok(text_response(content, "application/xml", &etag, "public, max-age=60"))
}

pub async fn discover_json(State(state): State<AppState>) -> Result<impl IntoResponse, (StatusCode, String)> {
    if let Some(cached) = state.cache.get("hdhr:discover").filter(|c| !c.stale) {
        state.observer.record_cache_access(true);
        return Ok(json_response(cached.value, &cached.etag, "no-cache"));
    }
    state.observer.record_cache_access(false);

    let mut conn = state.get_connection().map_err(|e| {
        tracing::error!("discover.json: connection pool error: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Service temporarily unavailable".to_string())
    })?;
    let config = state.config.snapshot();
    let port = state.get_port();
    let response = hdhr::generate_discover_response(&mut conn, &config, port).map_err(|e| {
        tracing::error!("discover.json: generation failed: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Unable to generate discovery document".to_string())
    })?;

    let body = serde_json::to_string(&response).expect("DiscoverResponse always serializes");
    let etag = etag_for(&body);
    state.cache.put("hdhr:discover", body.clone(), etag.clone(), TTL_DISCOVERY);
    Ok(json_response(body, &etag, "no-cache"))
}

pub async fn lineup_json(State(state): State<AppState>) -> Result<impl IntoResponse, (StatusCode, String)> {
    if let Some(cached) = state.cache.get("hdhr:lineup").filter(|c| !c.stale) {
        state.observer.record_cache_access(true);
        return Ok(json_response(cached.value, &cached.etag, "no-cache"));
    }
    state.observer.record_cache_access(false);

    let mut conn = state.get_connection().map_err(|e| {
        tracing::error!("lineup.json: connection pool error: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Service temporarily unavailable".to_string())
    })?;
    let port = state.get_port();
    let lineup = hdhr::generate_lineup(&mut conn, port).map_err(|e| {
        tracing::error!("lineup.json: generation failed: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Unable to generate lineup".to_string())
    })?;

    let body = serde_json::to_string(&lineup).expect("lineup always serializes");
    let etag = etag_for(&body);
    state.cache.put("hdhr:lineup", body.clone(), etag.clone(), TTL_LINEUP);
    Ok(json_response(body, &etag, "no-cache"))
}

pub async fn lineup_status_json() -> impl IntoResponse {
    let status = hdhr::generate_lineup_status();
    Json(status)
}

/// UPnP device description Plex's discovery probe also fetches alongside
/// `/discover.json`.
pub async fn device_xml(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.snapshot();
    let port = state.get_port();
    let local_ip = hdhr::get_local_ip();
    let base_url = format!("http://{}:{}", local_ip, port);
    let device_id = hdhr::generate_device_id();
    let xml = hdhr::generate_device_xml(&device_id, &config, &base_url);
    let etag = etag_for(&xml);
    text_response(xml, "text/xml", &etag, "no-cache")
}
