//! Plex library/timeline/transcode-decision surface: the endpoints a Plex
//! client walks after HDHomeRun discovery hands it a tuner, to browse the
//! Live TV "section" and report/negotiate playback.
//!
//! New construction: nothing elsewhere in this server ever modeled a Plex
//! client talking anything but the HDHomeRun wire format. Built on
//! `server::plex` for content negotiation, escaping, and the Live-TV
//! metadata contract, and on `server::epg`/`epg::storage` for the now/next
//! data backing each channel's metadata.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use diesel::prelude::*;
use std::collections::HashMap;

use crate::cache::etag_for;
use crate::db::models::Channel;
use crate::db::schema::channels;
use crate::epg::storage::now_next;

use super::plex::{negotiate, plex_error_response, xml_escape, Format, LiveTvMetadataFields};
use super::state::AppState;

const SECTION_KEY: &str = "1";
const SECTION_TITLE: &str = "Live TV";

fn enabled_channels(conn: &mut crate::db::DbPooledConnection) -> Result<Vec<Channel>, diesel::result::Error> {
    channels::table.filter(channels::enabled.eq(1)).order(channels::channel_number.asc()).load(conn)
}

fn channel_video_fragment(channel: &Channel, title: &str, summary: Option<&str>) -> String {
    let thumb = channel
        .logo_url
        .as_deref()
        .map(|url| format!(" thumb=\"{}\"", xml_escape(url)))
        .unwrap_or_default();
    let summary_attr = summary.map(|s| format!(" summary=\"{}\"", xml_escape(s))).unwrap_or_default();
    format!(
        r#"<Video ratingKey="{rating_key}" key="/library/metadata/{rating_key}" type="{media_type}" title="{title}"{summary}{thumb} index="{index}" duration="86400000"/>"#,
        rating_key = channel.id.unwrap_or_default(),
        media_type = LiveTvMetadataFields::MEDIA_TYPE,
        title = xml_escape(title),
        summary = summary_attr,
        thumb = thumb,
        index = channel.channel_number,
    )
}

fn channel_video_json(channel: &Channel, title: &str, summary: Option<&str>) -> serde_json::Value {
    let mut obj = serde_json::json!({
        "ratingKey": channel.id.unwrap_or_default().to_string(),
        "key": format!("/library/metadata/{}", channel.id.unwrap_or_default()),
        "type": LiveTvMetadataFields::METADATA_TYPE,
        "title": title,
        "index": channel.channel_number,
        "duration": 86_400_000,
    });
    if let Some(summary) = summary {
        obj["summary"] = serde_json::Value::String(summary.to_string());
    }
    if let Some(logo) = &channel.logo_url {
        obj["thumb"] = serde_json::Value::String(logo.clone());
    }
    obj
}

/// `/library/sections`: advertises the single Live TV section Plex's library
/// browser lists channels under.
pub async fn library_sections(headers: HeaderMap) -> Response {
    let format = negotiate(&headers);
    let body = match format {
        Format::Xml => format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><MediaContainer size="1"><Directory key="{key}" title="{title}" type="{media_type}"/></MediaContainer>"#,
            key = SECTION_KEY,
            title = xml_escape(SECTION_TITLE),
            media_type = LiveTvMetadataFields::MEDIA_TYPE,
        ),
        Format::Json => serde_json::json!({
            "MediaContainer": {
                "size": 1,
                "Directory": [{"key": SECTION_KEY, "title": SECTION_TITLE, "type": LiveTvMetadataFields::METADATA_TYPE}],
            }
        })
        .to_string(),
    };
    respond(format, body)
}

/// `/library/sections/1/all`: every enabled channel, rendered as a Live-TV
/// "clip" item per the metadata contract so Plex never treats a channel as
/// an on-demand video.
pub async fn library_sections_all(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let format = negotiate(&headers);
    let mut conn = match state.get_connection() {
        Ok(conn) => conn,
        Err(e) => return plex_error_response(format, axum::http::StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };
    let channels = match enabled_channels(&mut conn) {
        Ok(channels) => channels,
        Err(e) => return plex_error_response(format, axum::http::StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    let body = match format {
        Format::Xml => {
            let items: String = channels
                .iter()
                .map(|c| channel_video_fragment(c, &c.display_name, None))
                .collect();
            format!(
                r#"<?xml version="1.0" encoding="UTF-8"?><MediaContainer size="{size}" title1="{title}">{items}</MediaContainer>"#,
                size = channels.len(),
                title = xml_escape(SECTION_TITLE),
                items = items,
            )
        }
        Format::Json => {
            let items: Vec<serde_json::Value> = channels.iter().map(|c| channel_video_json(c, &c.display_name, None)).collect();
            serde_json::json!({"MediaContainer": {"size": channels.len(), "title1": SECTION_TITLE, "Metadata": items}}).to_string()
        }
    };
    respond(format, body)
}

/// `/library/metadata/{id}`: one channel's current now/next-enriched
/// metadata, keyed by its `channels.id` as the Plex ratingKey.
pub async fn library_metadata(Path(rating_key): Path<i32>, State(state): State<AppState>, headers: HeaderMap) -> Response {
    let format = negotiate(&headers);
    let mut conn = match state.get_connection() {
        Ok(conn) => conn,
        Err(e) => return plex_error_response(format, axum::http::StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    let channel: Channel = match channels::table.filter(channels::id.eq(rating_key)).first(&mut conn) {
        Ok(channel) => channel,
        Err(_) => return plex_error_response(format, axum::http::StatusCode::NOT_FOUND, "channel not found"),
    };

    let (title, summary) = match &channel.epg_id {
        Some(epg_id) => match now_next(&mut conn, epg_id) {
            Ok(result) => match result.now {
                Some(program) => (program.title.clone(), program.description.clone()),
                None => (channel.display_name.clone(), None),
            },
            Err(_) => (channel.display_name.clone(), None),
        },
        None => (channel.display_name.clone(), None),
    };

    let body = match format {
        Format::Xml => format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><MediaContainer size="1">{}</MediaContainer>"#,
            channel_video_fragment(&channel, &title, summary.as_deref())
        ),
        Format::Json => {
            serde_json::json!({"MediaContainer": {"size": 1, "Metadata": [channel_video_json(&channel, &title, summary.as_deref())]}}).to_string()
        }
    };
    let etag = etag_for(&body);
    let mut response = respond(format, body);
    response.headers_mut().extend(super::plex::metadata_headers(&etag));
    response
}

/// `/timeline/{id}`: Plex clients POST playback progress here periodically.
/// There is no session state worth tracking server-side for a live channel,
/// so this just acknowledges with an empty MediaContainer.
pub async fn timeline(Path(_rating_key): Path<i32>, Query(_params): Query<HashMap<String, String>>, headers: HeaderMap) -> Response {
    let format = negotiate(&headers);
    let body = match format {
        Format::Xml => r#"<?xml version="1.0" encoding="UTF-8"?><MediaContainer size="0"/>"#.to_string(),
        Format::Json => r#"{"MediaContainer":{"size":0}}"#.to_string(),
    };
    respond(format, body)
}

/// `/video/:/transcode/universal/decision`: Plex asks this before playing a
/// stream to decide direct-play vs. transcode. Every channel here is already
/// served as an MPEG-TS stream-copy by the Transcoder Supervisor, so the
/// answer is always "direct play".
pub async fn transcode_decision(Query(_params): Query<HashMap<String, String>>, headers: HeaderMap) -> Response {
    let format = negotiate(&headers);
    let body = match format {
        Format::Xml => {
            r#"<?xml version="1.0" encoding="UTF-8"?><MediaContainer size="1" generalDecisionCode="1000" generalDecisionText="Direct play is possible."><Decision generalDecisionCode="1000" generalDecisionText="Direct play is possible." directPlayDecisionCode="1000"/></MediaContainer>"#.to_string()
        }
        Format::Json => serde_json::json!({
            "MediaContainer": {
                "size": 1,
                "generalDecisionCode": 1000,
                "generalDecisionText": "Direct play is possible.",
            }
        })
        .to_string(),
    };
    respond(format, body)
}

fn respond(format: Format, body: String) -> Response {
    let mut response = body.into_response();
    response
        .headers_mut()
        .insert(axum::http::header::CONTENT_TYPE, format.content_type().parse().expect("valid content type"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel(id: i32, name: &str, number: i32) -> Channel {
        Channel {
            id: Some(id),
            channel_number: number,
            display_name: name.to_string(),
            logo_url: None,
            enabled: 1,
            epg_id: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn channel_video_fragment_uses_clip_type_and_rating_key() {
        let channel = test_channel(7, "ESPN HD", 206);
        let fragment = channel_video_fragment(&channel, "SportsCenter", Some("Highlights"));
        assert!(fragment.contains(r#"ratingKey="7""#));
        assert!(fragment.contains(r#"type="clip""#));
        assert!(fragment.contains(r#"title="SportsCenter""#));
        assert!(fragment.contains(r#"summary="Highlights""#));
        assert!(fragment.contains(r#"index="206""#));
    }

    #[test]
    fn channel_video_fragment_escapes_title() {
        let channel = test_channel(1, "Tom & Jerry", 1);
        let fragment = channel_video_fragment(&channel, "Tom & Jerry", None);
        assert!(fragment.contains("Tom &amp; Jerry"));
    }

    #[test]
    fn channel_video_json_includes_clip_metadata_type() {
        let channel = test_channel(3, "CNN", 10);
        let json = channel_video_json(&channel, "CNN", None);
        assert_eq!(json["type"], LiveTvMetadataFields::METADATA_TYPE);
        assert_eq!(json["ratingKey"], "3");
    }
}
