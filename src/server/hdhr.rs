//! HDHomeRun Emulation Module
//!
//! Implements HDHomeRun device emulation so Plex's tuner auto-discovery
//! finds this process and builds its Live TV lineup from the `channels`
//! table. Generalizes HDHomeRun responses previously keyed off XMLTV/Xtream
//! mapping tables onto the plain `channels`/`streams` schema, and adds the
//! `/device.xml` UPnP description Plex's discovery probe also fetches.

use diesel::prelude::*;
use diesel::sql_types::{Integer, Text};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::config::Config;
use crate::db::DbPooledConnection;

/// HDHomeRun discovery response, returned by GET /discover.json.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoverResponse {
    pub friendly_name: String,
    pub model_number: String,
    pub firmware_name: String,
    pub firmware_version: String,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    pub device_auth: String,
    #[serde(rename = "BaseURL")]
    pub base_url: String,
    #[serde(rename = "LineupURL")]
    pub lineup_url: String,
    pub tuner_count: u32,
}

/// HDHomeRun channel lineup entry, returned by GET /lineup.json as an array.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct LineupEntry {
    pub guide_number: String,
    pub guide_name: String,
    #[serde(rename = "URL")]
    pub url: String,
}

/// HDHomeRun lineup status response, returned by GET /lineup_status.json.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
pub struct LineupStatusResponse {
    pub scan_in_progress: u8,
    pub scan_possible: u8,
    pub source: String,
    pub source_list: Vec<String>,
}

#[derive(QueryableByName, Debug)]
struct TunerCountRow {
    #[diesel(sql_type = Integer)]
    tuner_count: i32,
}

#[derive(QueryableByName, Debug)]
struct EnabledChannelRow {
    #[diesel(sql_type = Integer)]
    id: i32,
    #[diesel(sql_type = Integer)]
    channel_number: i32,
    #[diesel(sql_type = Text)]
    display_name: String,
}

/// Stable device ID derived from the machine hostname, so it survives
/// restarts without being persisted.
pub fn generate_device_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "iptv-bridge".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("IPTVBRIDGE{:08X}", hasher.finish() as u32)
}

/// Local network IP address to advertise in BaseURL/device URLs, falling
/// back to loopback if detection fails.
pub fn get_local_ip() -> String {
    local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// Maximum `max_connections` across active accounts, used as the advertised
/// tuner count. MAX rather than SUM: every stream proxies through this
/// process regardless of which account it came from, and the busiest single
/// account is the real ceiling on simultaneous upstream connections.
pub fn get_tuner_count(conn: &mut DbPooledConnection) -> Result<u32, diesel::result::Error> {
    let result = diesel::sql_query(
        r#"
        SELECT COALESCE(MAX(COALESCE(max_connections_actual, max_connections)), 2) as tuner_count
        FROM accounts
        WHERE is_active = 1
        "#,
    )
    .load::<TunerCountRow>(conn)?;

    Ok(result.first().map(|r| r.tuner_count as u32).unwrap_or(2))
}

pub fn generate_discover_response(
    conn: &mut DbPooledConnection,
    config: &Config,
    port: u16,
) -> Result<DiscoverResponse, diesel::result::Error> {
    let tuner_count = get_tuner_count(conn)?;
    let local_ip = get_local_ip();
    let base_url = format!("http://{}:{}", local_ip, port);
    let lineup_url = format!("{}/lineup.json", base_url);
    let device_id = generate_device_id();

    Ok(DiscoverResponse {
        friendly_name: config.friendly_name.clone(),
        model_number: config.model_number.clone(),
        firmware_name: "hdhomerun_atsc".to_string(),
        firmware_version: "20200101".to_string(),
        device_id,
        device_auth: "iptv-bridge".to_string(),
        base_url,
        lineup_url,
        tuner_count,
    })
}

fn get_enabled_channels_for_lineup(
    conn: &mut DbPooledConnection,
) -> Result<Vec<EnabledChannelRow>, diesel::result::Error> {
    diesel::sql_query(
        r#"
        SELECT c.id, c.channel_number, c.display_name
        FROM channels c
        WHERE c.enabled = 1
        AND EXISTS (SELECT 1 FROM streams s WHERE s.channel_id = c.id AND s.enabled = 1)
        ORDER BY c.channel_number ASC, c.display_name ASC
        "#,
    )
    .load::<EnabledChannelRow>(conn)
}

/// Lineup entries point at `/stream/{channel_id}`, the pipeline endpoint
/// that runs admission, probing, and the transcoder supervisor.
pub fn generate_lineup(
    conn: &mut DbPooledConnection,
    port: u16,
) -> Result<Vec<LineupEntry>, diesel::result::Error> {
    let channels = get_enabled_channels_for_lineup(conn)?;
    let local_ip = get_local_ip();

    Ok(channels
        .into_iter()
        .map(|channel| LineupEntry {
            guide_number: channel.channel_number.to_string(),
            guide_name: channel.display_name,
            url: format!("http://{}:{}/stream/{}", local_ip, port, channel.id),
        })
        .collect())
}

/// IPTV sources can't be tuner-scanned; the lineup is whatever `channels`
/// holds, so this is always a static "nothing in progress" reply.
pub fn generate_lineup_status() -> LineupStatusResponse {
    LineupStatusResponse {
        scan_in_progress: 0,
        scan_possible: 0,
        source: "Cable".to_string(),
        source_list: vec!["Cable".to_string()],
    }
}

/// UPnP device description served at /device.xml, the other half of Plex's
/// HDHomeRun discovery probe alongside /discover.json.
pub fn generate_device_xml(device_id: &str, config: &Config, base_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <URLBase>{base_url}/</URLBase>
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaServer:1</deviceType>
    <friendlyName>{friendly_name}</friendlyName>
    <manufacturer>{manufacturer}</manufacturer>
    <modelName>{model_number}</modelName>
    <modelNumber>{model_number}</modelNumber>
    <serialNumber>{device_id}</serialNumber>
    <UDN>uuid:{device_id}</UDN>
  </device>
</root>"#,
        base_url = base_url,
        friendly_name = crate::server::plex::xml_escape(&config.friendly_name),
        manufacturer = crate::server::plex::xml_escape(&config.manufacturer),
        model_number = crate::server::plex::xml_escape(&config.model_number),
        device_id = device_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_response_serializes_with_pascal_case() {
        let response = DiscoverResponse {
            friendly_name: "IPTV Bridge".to_string(),
            model_number: "HDHR5-4K".to_string(),
            firmware_name: "hdhomerun_atsc".to_string(),
            firmware_version: "20200101".to_string(),
            device_id: "IPTVBRIDGE12345678".to_string(),
            device_auth: "iptv-bridge".to_string(),
            base_url: "http://192.168.1.100:5004".to_string(),
            lineup_url: "http://192.168.1.100:5004/lineup.json".to_string(),
            tuner_count: 2,
        };

        let json = serde_json::to_string(&response).unwrap();

        assert!(json.contains("\"FriendlyName\":\"IPTV Bridge\""));
        assert!(json.contains("\"ModelNumber\":\"HDHR5-4K\""));
        assert!(json.contains("\"DeviceID\":\"IPTVBRIDGE12345678\""));
        assert!(json.contains("\"DeviceAuth\":\"iptv-bridge\""));
        assert!(json.contains("\"BaseURL\":\"http://192.168.1.100:5004\""));
        assert!(json.contains("\"LineupURL\":\"http://192.168.1.100:5004/lineup.json\""));
        assert!(json.contains("\"TunerCount\":2"));
    }

    #[test]
    fn test_discover_response_base_url_format() {
        let response = DiscoverResponse {
            friendly_name: "IPTV Bridge".to_string(),
            model_number: "HDHR5-4K".to_string(),
            firmware_name: "hdhomerun_atsc".to_string(),
            firmware_version: "20200101".to_string(),
            device_id: "IPTVBRIDGE12345678".to_string(),
            device_auth: "iptv-bridge".to_string(),
            base_url: "http://192.168.1.100:5004".to_string(),
            lineup_url: "http://192.168.1.100:5004/lineup.json".to_string(),
            tuner_count: 2,
        };

        let json = serde_json::to_string(&response).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        let base_url = parsed["BaseURL"].as_str().unwrap();
        let lineup_url = parsed["LineupURL"].as_str().unwrap();

        assert!(lineup_url.starts_with(base_url));
        assert!(lineup_url.ends_with("/lineup.json"));
    }

    #[test]
    fn test_lineup_entry_serializes_correctly() {
        let entry = LineupEntry {
            guide_number: "206".to_string(),
            guide_name: "ESPN HD".to_string(),
            url: "http://192.168.1.100:5004/stream/123".to_string(),
        };

        let json = serde_json::to_string(&entry).unwrap();

        assert!(json.contains("\"GuideNumber\":\"206\""));
        assert!(json.contains("\"GuideName\":\"ESPN HD\""));
        assert!(json.contains("\"URL\":\"http://192.168.1.100:5004/stream/123\""));
    }

    #[test]
    fn test_empty_lineup_returns_valid_empty_array() {
        let lineup: Vec<LineupEntry> = vec![];
        let json = serde_json::to_string(&lineup).unwrap();
        assert_eq!(json, "[]");
    }

    #[test]
    fn test_lineup_status_response_serializes_correctly() {
        let status = generate_lineup_status();
        let json = serde_json::to_string(&status).unwrap();

        assert!(json.contains("\"ScanInProgress\":0"));
        assert!(json.contains("\"ScanPossible\":0"));
        assert!(json.contains("\"Source\":\"Cable\""));
        assert!(json.contains("\"SourceList\":[\"Cable\"]"));
    }

    #[test]
    fn test_device_id_has_correct_prefix_and_is_stable() {
        let id1 = generate_device_id();
        let id2 = generate_device_id();
        assert!(id1.starts_with("IPTVBRIDGE"));
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), "IPTVBRIDGE".len() + 8);
    }

    #[test]
    fn test_local_ip_returns_valid_format() {
        let ip = get_local_ip();
        assert!(ip == "127.0.0.1" || ip.split('.').count() == 4);
    }

    #[test]
    fn test_device_xml_embeds_friendly_name_and_device_id() {
        let config = Config::default();
        let xml = generate_device_xml("IPTVBRIDGEABCDEF01", &config, "http://192.168.1.100:5004");
        assert!(xml.contains("<friendlyName>IPTV Bridge</friendlyName>"));
        assert!(xml.contains("IPTVBRIDGEABCDEF01"));
        assert!(xml.starts_with("<?xml"));
    }
}
