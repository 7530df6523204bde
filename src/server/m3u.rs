//! M3U Playlist Generation Module
//!
//! Generates the M3U playlist Plex imports as its channel source. Generalizes
//! an XMLTV/Xtream-join query into a direct read of `channels` joined against
//! `streams`, since this schema has no separate XMLTV-vs-provider split: a
//! channel simply has zero or more streams.

use diesel::prelude::*;
use diesel::sql_types::{Integer, Nullable, Text};

use crate::db::DbPooledConnection;

/// Internal representation of a channel for M3U generation.
#[derive(Debug, Clone)]
pub struct M3uChannel {
    pub channel_id: i32,
    pub display_name: String,
    pub channel_number: i32,
    pub logo_url: Option<String>,
    pub tvg_id: String,
}

#[derive(QueryableByName, Debug)]
struct EnabledChannelRow {
    #[diesel(sql_type = Integer)]
    id: i32,
    #[diesel(sql_type = Integer)]
    channel_number: i32,
    #[diesel(sql_type = Text)]
    display_name: String,
    #[diesel(sql_type = Nullable<Text>)]
    logo_url: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    epg_id: Option<String>,
}

/// Enabled channels that have at least one enabled stream, ordered for
/// display the way Plex's channel manager shows them.
pub fn get_enabled_channels_for_m3u(conn: &mut DbPooledConnection) -> Result<Vec<M3uChannel>, diesel::result::Error> {
    let rows = diesel::sql_query(
        r#"
        SELECT c.id, c.channel_number, c.display_name, c.logo_url, c.epg_id
        FROM channels c
        WHERE c.enabled = 1
        AND EXISTS (SELECT 1 FROM streams s WHERE s.channel_id = c.id AND s.enabled = 1)
        ORDER BY c.channel_number ASC, c.display_name ASC
        "#,
    )
    .load::<EnabledChannelRow>(conn)?;

    Ok(rows
        .into_iter()
        .map(|row| M3uChannel {
            channel_id: row.id,
            display_name: row.display_name.clone(),
            channel_number: row.channel_number,
            logo_url: row.logo_url,
            tvg_id: row.epg_id.unwrap_or(row.display_name),
        })
        .collect())
}

/// Generate the full playlist text: a header line, then one EXTINF/URL pair
/// per enabled channel, pointing at the `/stream/{channel_id}` pipeline.
pub fn generate_m3u_playlist(conn: &mut DbPooledConnection, port: u16) -> Result<String, diesel::result::Error> {
    let channels = get_enabled_channels_for_m3u(conn)?;
    Ok(generate_m3u_from_channels(&channels, port))
}

pub fn generate_m3u_from_channels(channels: &[M3uChannel], port: u16) -> String {
    let estimated_size = 50 + (channels.len() * 200);
    let mut output = String::with_capacity(estimated_size);

    output.push_str("#EXTM3U\n");
    for channel in channels {
        generate_channel_entry(&mut output, channel, port);
    }
    output
}

fn generate_channel_entry(output: &mut String, channel: &M3uChannel, port: u16) {
    output.push_str(&format!(
        "#EXTINF:-1 tvg-id=\"{}\" tvg-name=\"{}\"",
        escape_m3u_attribute(&channel.tvg_id),
        escape_m3u_attribute(&channel.display_name)
    ));

    if let Some(ref logo) = channel.logo_url {
        output.push_str(&format!(" tvg-logo=\"{}\"", escape_m3u_attribute(logo)));
    }

    output.push_str(&format!(" tvg-chno=\"{}\"", channel.channel_number));
    output.push_str(&format!(",{}\n", channel.display_name));
    output.push_str(&format!("http://127.0.0.1:{}/stream/{}\n", port, channel.channel_id));
}

/// Escape double quotes and newlines in an M3U attribute value.
fn escape_m3u_attribute(value: &str) -> String {
    value.replace('\"', "&quot;").replace('\n', " ").replace('\r', "")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_channel(
        id: i32,
        name: &str,
        channel_number: i32,
        logo: Option<&str>,
        tvg_id: &str,
    ) -> M3uChannel {
        M3uChannel {
            channel_id: id,
            display_name: name.to_string(),
            channel_number,
            logo_url: logo.map(str::to_string),
            tvg_id: tvg_id.to_string(),
        }
    }

    #[test]
    fn test_generate_single_channel_with_logo() {
        let channels = vec![create_test_channel(
            123,
            "ESPN HD",
            206,
            Some("http://example.com/espn.png"),
            "ESPN.US",
        )];

        let result = generate_m3u_from_channels(&channels, 5004);

        assert!(result.contains("#EXTINF:-1 tvg-id=\"ESPN.US\" tvg-name=\"ESPN HD\""));
        assert!(result.contains("tvg-logo=\"http://example.com/espn.png\""));
        assert!(result.contains("tvg-chno=\"206\""));
        assert!(result.contains(",ESPN HD\n"));
        assert!(result.contains("http://127.0.0.1:5004/stream/123\n"));
    }

    #[test]
    fn test_generate_single_channel_without_logo() {
        let channels = vec![create_test_channel(456, "CNN", 207, None, "CNN.US")];

        let result = generate_m3u_from_channels(&channels, 5004);

        assert!(result.contains("#EXTINF:-1 tvg-id=\"CNN.US\" tvg-name=\"CNN\""));
        assert!(!result.contains("tvg-logo="));
        assert!(result.contains("tvg-chno=\"207\""));
        assert!(result.contains(",CNN\n"));
        assert!(result.contains("http://127.0.0.1:5004/stream/456\n"));
    }

    #[test]
    fn test_generate_multiple_channels_preserves_order() {
        let channels = vec![
            create_test_channel(1, "A", 1, None, "A"),
            create_test_channel(2, "B", 2, None, "B"),
        ];
        let result = generate_m3u_from_channels(&channels, 5004);
        let a_pos = result.find("stream/1\n").unwrap();
        let b_pos = result.find("stream/2\n").unwrap();
        assert!(a_pos < b_pos);
    }

    #[test]
    fn test_empty_playlist_still_has_header() {
        let result = generate_m3u_from_channels(&[], 5004);
        assert_eq!(result, "#EXTM3U\n");
    }

    #[test]
    fn test_escape_m3u_attribute_escapes_quotes_and_newlines() {
        assert_eq!(escape_m3u_attribute("Tom \"T\" Jones"), "Tom &quot;T&quot; Jones");
        assert_eq!(escape_m3u_attribute("line1\nline2"), "line1 line2");
        assert_eq!(escape_m3u_attribute("a\r\nb"), "a b");
    }

    #[test]
    fn test_m3u_starts_with_extm3u_header() {
        let channels = vec![create_test_channel(1, "Test", 100, None, "TEST.ID")];
        let result = generate_m3u_from_channels(&channels, 5004);
        let lines: Vec<&str> = result.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert!(lines[1].starts_with("#EXTINF:-1"));
        assert!(lines[2].starts_with("http://"));
    }

    #[test]
    fn test_m3u_extinf_attribute_order() {
        let channels = vec![create_test_channel(1, "Test", 100, Some("http://logo.png"), "TEST.ID")];
        let result = generate_m3u_from_channels(&channels, 5004);
        let extinf_line = result.lines().nth(1).unwrap();

        let id_pos = extinf_line.find("tvg-id=").unwrap();
        let name_pos = extinf_line.find("tvg-name=").unwrap();
        let logo_pos = extinf_line.find("tvg-logo=").unwrap();
        let chno_pos = extinf_line.find("tvg-chno=").unwrap();

        assert!(id_pos < name_pos);
        assert!(name_pos < logo_pos);
        assert!(logo_pos < chno_pos);
    }

    #[test]
    fn test_tvg_id_falls_back_to_display_name_when_epg_id_absent() {
        let channel = create_test_channel(1, "No EPG Channel", 50, None, "No EPG Channel");
        let result = generate_m3u_from_channels(&[channel], 5004);
        assert!(result.contains("tvg-id=\"No EPG Channel\""));
    }
}
