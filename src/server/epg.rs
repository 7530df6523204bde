//! EPG (Electronic Program Guide) Generation Module
//!
//! Renders the XMLTV document Plex imports for its guide data. Generalizes a
//! direct XMLTV-table query into a read through `epg::storage::guide_window`,
//! the shared guide-window query the timeline and now/next lookups also use,
//! so this endpoint and the Plex metadata surface never disagree about
//! what's airing.

use std::io::Cursor;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::db::DbPooledConnection;
use crate::epg::storage::{guide_window, EpgError, GuideEntry};

/// Output structure for an XMLTV `<channel>` element, deduplicated from the
/// guide window rows that share a `channel_id_xmltv`.
#[derive(Debug, Clone)]
pub struct XmltvChannelOutput {
    pub id: String,
    pub display_name: String,
}

/// Output structure for an XMLTV `<programme>` element.
#[derive(Debug, Clone)]
pub struct XmltvProgramme {
    pub channel_id: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub start: String,
    pub stop: String,
    pub episode_num: Option<String>,
}

/// Default width of the guide window served at `/epg.xml`: Plex typically
/// only requests a few days ahead, and a wider window just inflates the
/// response for data nothing will render soon.
const GUIDE_WINDOW: chrono::Duration = chrono::Duration::days(7);

pub fn format_xmltv_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%d%H%M%S +0000").to_string()
}

fn parse_db_datetime(dt_str: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(dt_str, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    let normalized = dt_str.replace(' ', "T");
    let with_z = if normalized.ends_with('Z') {
        normalized
    } else {
        format!("{}Z", normalized.trim_end_matches('Z'))
    };
    DateTime::parse_from_rfc3339(&with_z).ok().map(|dt| dt.with_timezone(&Utc))
}

/// Format a DB timestamp string straight to XMLTV form, falling back to the
/// raw string (still a valid-enough fallback for clients) if it can't be
/// parsed — a malformed single row shouldn't break the whole document.
fn xmltv_timestamp(raw: &str) -> String {
    parse_db_datetime(raw).map(format_xmltv_datetime).unwrap_or_else(|| raw.to_string())
}

fn entries_to_channels_and_programmes(entries: &[GuideEntry]) -> (Vec<XmltvChannelOutput>, Vec<XmltvProgramme>) {
    let mut channels: Vec<XmltvChannelOutput> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut programmes = Vec::with_capacity(entries.len());

    for entry in entries {
        if seen.insert(entry.channel_id_xmltv.clone()) {
            channels.push(XmltvChannelOutput {
                id: entry.channel_id_xmltv.clone(),
                display_name: entry.channel_display_name.clone(),
            });
        }

        let episode_num = match (entry.season, entry.episode) {
            (Some(season), Some(episode)) => Some(format!("S{:02}E{:02}", season, episode)),
            _ => None,
        };

        programmes.push(XmltvProgramme {
            channel_id: entry.channel_id_xmltv.clone(),
            title: entry.title.clone(),
            description: entry.description.clone(),
            category: entry.category.clone(),
            start: xmltv_timestamp(&entry.start_time),
            stop: xmltv_timestamp(&entry.end_time),
            episode_num,
        });
    }

    (channels, programmes)
}

/// Fetch the default guide window (now through `GUIDE_WINDOW`) and render it
/// as XMLTV.
pub fn generate_xmltv_epg(conn: &mut DbPooledConnection) -> Result<String, EpgError> {
    let now = Utc::now();
    let start = now.format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let end = (now + GUIDE_WINDOW).format("%Y-%m-%dT%H:%M:%SZ").to_string();

    let entries = guide_window(conn, &start, &end)?;
    let (channels, programmes) = entries_to_channels_and_programmes(&entries);

    format_xmltv_output(&channels, &programmes)
        .map_err(|e| EpgError::ParseError(format!("failed to render XMLTV output: {e}")))
}

pub fn format_xmltv_output(
    channels: &[XmltvChannelOutput],
    programmes: &[XmltvProgramme],
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let estimated_size = 500 + (channels.len() * 300) + (programmes.len() * 300);
    let buffer = Vec::with_capacity(estimated_size);
    let mut writer = Writer::new(Cursor::new(buffer));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::Text(BytesText::new("\n")))?;
    writer.write_event(Event::DocType(BytesText::from_escaped("tv SYSTEM \"xmltv.dtd\"")))?;
    writer.write_event(Event::Text(BytesText::new("\n")))?;

    let mut tv = BytesStart::new("tv");
    tv.push_attribute(("generator-info-name", "iptv-bridge"));
    tv.push_attribute(("generator-info-url", ""));
    writer.write_event(Event::Start(tv))?;
    writer.write_event(Event::Text(BytesText::new("\n")))?;

    for channel in channels {
        write_channel(&mut writer, channel)?;
    }
    for programme in programmes {
        write_programme(&mut writer, programme)?;
    }

    writer.write_event(Event::End(BytesEnd::new("tv")))?;

    let bytes = writer.into_inner().into_inner();
    Ok(String::from_utf8(bytes)?)
}

fn write_channel<W: std::io::Write>(writer: &mut Writer<W>, channel: &XmltvChannelOutput) -> Result<(), quick_xml::Error> {
    let mut ch = BytesStart::new("channel");
    ch.push_attribute(("id", channel.id.as_str()));
    writer.write_event(Event::Start(ch))?;

    writer.write_event(Event::Start(BytesStart::new("display-name")))?;
    writer.write_event(Event::Text(BytesText::new(&channel.display_name)))?;
    writer.write_event(Event::End(BytesEnd::new("display-name")))?;

    writer.write_event(Event::End(BytesEnd::new("channel")))?;
    writer.write_event(Event::Text(BytesText::new("\n")))?;

    Ok(())
}

fn write_programme<W: std::io::Write>(writer: &mut Writer<W>, programme: &XmltvProgramme) -> Result<(), quick_xml::Error> {
    let mut prog = BytesStart::new("programme");
    prog.push_attribute(("start", programme.start.as_str()));
    prog.push_attribute(("stop", programme.stop.as_str()));
    prog.push_attribute(("channel", programme.channel_id.as_str()));
    writer.write_event(Event::Start(prog))?;

    let mut title = BytesStart::new("title");
    title.push_attribute(("lang", "en"));
    writer.write_event(Event::Start(title))?;
    writer.write_event(Event::Text(BytesText::new(&programme.title)))?;
    writer.write_event(Event::End(BytesEnd::new("title")))?;

    if let Some(ref desc) = programme.description {
        let mut desc_elem = BytesStart::new("desc");
        desc_elem.push_attribute(("lang", "en"));
        writer.write_event(Event::Start(desc_elem))?;
        writer.write_event(Event::Text(BytesText::new(desc)))?;
        writer.write_event(Event::End(BytesEnd::new("desc")))?;
    }

    if let Some(ref cat) = programme.category {
        let mut cat_elem = BytesStart::new("category");
        cat_elem.push_attribute(("lang", "en"));
        writer.write_event(Event::Start(cat_elem))?;
        writer.write_event(Event::Text(BytesText::new(cat)))?;
        writer.write_event(Event::End(BytesEnd::new("category")))?;
    }

    if let Some(ref ep_num) = programme.episode_num {
        let mut ep_elem = BytesStart::new("episode-num");
        ep_elem.push_attribute(("system", "onscreen"));
        writer.write_event(Event::Start(ep_elem))?;
        writer.write_event(Event::Text(BytesText::new(ep_num)))?;
        writer.write_event(Event::End(BytesEnd::new("episode-num")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("programme")))?;
    writer.write_event(Event::Text(BytesText::new("\n")))?;

    Ok(())
}

/// Generate XMLTV content from pre-fetched data, for testing without a DB.
pub fn generate_xmltv_from_data(
    channels: &[XmltvChannelOutput],
    programmes: &[XmltvProgramme],
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    format_xmltv_output(channels, programmes)
}
