use diesel::prelude::*;

use crate::db::schema::{accounts, channels, epg_channels, epg_programs, epg_sources, event_log, settings, streams};

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = settings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Setting {
    pub key: String,
    pub value: String,
}

impl Setting {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Credential bundle an Xtream-style Stream is minted from.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = accounts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Account {
    pub id: Option<i32>,
    pub name: String,
    pub server_url: String,
    pub username: String,
    pub password_encrypted: Vec<u8>,
    pub max_connections: i32,
    pub is_active: i32,
    pub created_at: String,
    pub updated_at: String,
    pub expiry_date: Option<String>,
    pub max_connections_actual: Option<i32>,
    pub active_connections: Option<i32>,
    pub last_check: Option<String>,
    pub connection_status: Option<String>,
}

#[derive(AsChangeset, Debug)]
#[diesel(table_name = accounts)]
pub struct AccountStatusUpdate {
    pub expiry_date: Option<String>,
    pub max_connections_actual: Option<i32>,
    pub active_connections: Option<i32>,
    pub last_check: Option<String>,
    pub connection_status: Option<String>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = accounts)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewAccount {
    pub name: String,
    pub server_url: String,
    pub username: String,
    pub password_encrypted: Vec<u8>,
    pub max_connections: i32,
    pub is_active: i32,
}

impl NewAccount {
    pub fn new(
        name: impl Into<String>,
        server_url: impl Into<String>,
        username: impl Into<String>,
        password_encrypted: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            server_url: server_url.into(),
            username: username.into(),
            password_encrypted,
            max_connections: 1,
            is_active: 1,
        }
    }
}

/// A virtual tuner channel presented to Plex.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = channels)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Channel {
    pub id: Option<i32>,
    pub channel_number: i32,
    pub display_name: String,
    pub logo_url: Option<String>,
    pub enabled: i32,
    pub epg_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = channels)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewChannel {
    pub channel_number: i32,
    pub display_name: String,
    pub logo_url: Option<String>,
    pub enabled: i32,
    pub epg_id: Option<String>,
}

impl NewChannel {
    pub fn new(channel_number: i32, display_name: impl Into<String>) -> Self {
        Self {
            channel_number,
            display_name: display_name.into(),
            logo_url: None,
            enabled: 1,
            epg_id: None,
        }
    }

    pub fn with_logo(mut self, logo_url: impl Into<String>) -> Self {
        self.logo_url = Some(logo_url.into());
        self
    }

    pub fn with_epg_id(mut self, epg_id: impl Into<String>) -> Self {
        self.epg_id = Some(epg_id.into());
        self
    }
}

/// One playable source belonging to a Channel.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = streams)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Stream {
    pub id: Option<i32>,
    pub channel_id: i32,
    pub url: String,
    pub protocol_kind: String,
    pub connection_limits: i32,
    pub priority: i32,
    pub enabled: i32,
    pub account_id: Option<i32>,
    pub username: Option<String>,
    pub password_encrypted: Option<Vec<u8>>,
    pub headers_json: Option<String>,
    pub display_name: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Stream {
    /// A Stream's upstream cannot be multiplexed at the origin and therefore
    /// requires the deferred-start path and a dedicated session per client.
    pub fn is_shareable(&self) -> bool {
        self.connection_limits == 0
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = streams)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewStream {
    pub channel_id: i32,
    pub url: String,
    pub protocol_kind: String,
    pub connection_limits: i32,
    pub priority: i32,
    pub enabled: i32,
    pub account_id: Option<i32>,
    pub username: Option<String>,
    pub password_encrypted: Option<Vec<u8>>,
    pub headers_json: Option<String>,
    pub display_name: Option<String>,
}

impl NewStream {
    pub fn new(channel_id: i32, url: impl Into<String>) -> Self {
        Self {
            channel_id,
            url: url.into(),
            protocol_kind: "unknown".to_string(),
            connection_limits: 0,
            priority: 0,
            enabled: 1,
            account_id: None,
            username: None,
            password_encrypted: None,
            headers_json: None,
            display_name: None,
        }
    }
}

/// An XMLTV feed subscription.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = epg_sources)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EpgSource {
    pub id: Option<i32>,
    pub name: String,
    pub url: String,
    pub format: String,
    pub refresh_interval_seconds: i32,
    pub category: Option<String>,
    pub enabled: i32,
    pub last_refresh: Option<String>,
    pub last_success: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = epg_sources)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewEpgSource {
    pub name: String,
    pub url: String,
    pub format: String,
    pub refresh_interval_seconds: i32,
    pub category: Option<String>,
    pub enabled: i32,
}

/// An `<channel>` record sourced from XMLTV.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = epg_channels)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EpgChannel {
    pub id: Option<i32>,
    pub source_id: i32,
    pub xmltv_channel_id: String,
    pub display_name: String,
    pub icon: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = epg_channels)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewEpgChannel {
    pub source_id: i32,
    pub xmltv_channel_id: String,
    pub display_name: String,
    pub icon: Option<String>,
}

impl NewEpgChannel {
    pub fn new(
        source_id: i32,
        xmltv_channel_id: impl Into<String>,
        display_name: impl Into<String>,
        icon: Option<String>,
    ) -> Self {
        Self {
            source_id,
            xmltv_channel_id: xmltv_channel_id.into(),
            display_name: display_name.into(),
            icon,
        }
    }
}

/// One guide entry.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = epg_programs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EpgProgram {
    pub id: Option<i32>,
    pub channel_id_xmltv: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub start_time: String,
    pub end_time: String,
    pub live: i32,
    pub premiere: i32,
    pub finale: i32,
    pub new: i32,
    pub hd: i32,
    pub episode: Option<i32>,
    pub season: Option<i32>,
    pub year: Option<i32>,
    pub rating: Option<String>,
    pub created_at: String,
}

#[derive(Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = epg_programs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewEpgProgram {
    pub channel_id_xmltv: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub start_time: String,
    pub end_time: String,
    pub live: i32,
    pub premiere: i32,
    pub finale: i32,
    pub new: i32,
    pub hd: i32,
    pub episode: Option<i32>,
    pub season: Option<i32>,
    pub year: Option<i32>,
    pub rating: Option<String>,
}

impl NewEpgProgram {
    pub fn new(
        channel_id_xmltv: impl Into<String>,
        title: impl Into<String>,
        start_time: impl Into<String>,
        end_time: impl Into<String>,
    ) -> Self {
        Self {
            channel_id_xmltv: channel_id_xmltv.into(),
            title: title.into(),
            subtitle: None,
            description: None,
            category: None,
            start_time: start_time.into(),
            end_time: end_time.into(),
            live: 0,
            premiere: 0,
            finale: 0,
            new: 0,
            hd: 0,
            episode: None,
            season: None,
            year: None,
            rating: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Build directly from a parsed XMLTV programme, carrying over every flag.
    pub fn from_parsed(channel_id_xmltv: impl Into<String>, p: &crate::xmltv::ParsedProgram) -> Self {
        Self {
            channel_id_xmltv: channel_id_xmltv.into(),
            title: p.title.clone(),
            subtitle: p.subtitle.clone(),
            description: p.description.clone(),
            category: p.category.clone(),
            start_time: p.start_time.clone(),
            end_time: p.end_time.clone(),
            live: p.live as i32,
            premiere: p.premiere as i32,
            finale: p.finale as i32,
            new: p.new as i32,
            hd: p.hd as i32,
            episode: p.episode,
            season: p.season,
            year: p.year,
            rating: p.rating.clone(),
        }
    }
}

/// An append-only structured event backing the Observer's diagnostics surface.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = event_log)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EventLog {
    pub id: Option<i32>,
    pub timestamp: String,
    pub level: String,
    pub category: String,
    pub message: String,
    pub details: Option<String>,
    pub is_read: i32,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = event_log)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewEventLog {
    pub level: String,
    pub category: String,
    pub message: String,
    pub details: Option<String>,
}

impl NewEventLog {
    pub fn info(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: "info".to_string(),
            category: category.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn warn(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: "warn".to_string(),
            category: category.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn error(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: "error".to_string(),
            category: category.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}
