use axum::{middleware, routing::get, Router};

use super::handlers::{device_xml, discover_json, epg_xml, fallback_handler, health_check, lineup_json, lineup_status_json, playlist_m3u};
use super::library::{library_metadata, library_sections, library_sections_all, timeline, transcode_decision};
use super::plex::coerce_live_tv_metadata;
use super::state::AppState;
use super::stream::{preview_channel, stream_channel};

/// Plex-facing library/timeline/transcode sub-router. Wrapped in
/// `coerce_live_tv_metadata` so every response, current and future, carries
/// the Live-TV no-cache headers the metadata contract requires even if a
/// handler forgets to set them itself.
fn plex_library_router() -> Router<AppState> {
    Router::new()
        .route("/library/sections", get(library_sections))
        .route("/library/sections/1/all", get(library_sections_all))
        .route("/library/metadata/{id}", get(library_metadata))
        .route("/timeline/{id}", get(timeline).post(timeline))
        .route("/video/:/transcode/universal/decision", get(transcode_decision))
        .layer(middleware::from_fn(coerce_live_tv_metadata))
}

/// Build the full HTTP surface: HDHomeRun emulation, the M3U/XMLTV documents
/// Plex imports, the streaming pipeline, and the Plex library/timeline
/// surface browsed after discovery.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/playlist.m3u", get(playlist_m3u))
        .route("/epg.xml", get(epg_xml))
        .route("/discover.json", get(discover_json))
        .route("/lineup.json", get(lineup_json))
        .route("/lineup_status.json", get(lineup_status_json))
        .route("/device.xml", get(device_xml))
        .route("/stream/{channel_id}", get(stream_channel))
        .route("/preview/{channel_id}", get(preview_channel))
        .merge(plex_library_router())
        .fallback(fallback_handler)
        .with_state(state)
}
