//! EPG Engine storage (C7): refresh transaction, now/next lookup, guide window.
//!
//! Generalizes a prior delete-then-insert refresh transaction to the
//! flattened `epg_channels`/`epg_programs` schema, replacing the full-source
//! wipe with a window-bounded delete so a refresh only touches the time
//! range the new document actually covers.

use chrono::Utc;
use diesel::prelude::*;
use diesel::sql_types::{Integer, Nullable, Text};
use thiserror::Error;

use crate::db::schema::{epg_channels, epg_programs, epg_sources};
use crate::db::{DbPooledConnection, EpgProgram, EpgSource, NewEpgChannel, NewEpgProgram};
use crate::xmltv::{fetch_xmltv, parse_xmltv_data, XmltvError};

const BATCH_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum EpgError {
    #[error("EPG source unreachable: {0}")]
    SourceUnreachable(String),
    #[error("EPG parse failed: {0}")]
    ParseError(String),
    #[error("EPG storage failed: {0}")]
    StorageFailed(String),
}

impl From<XmltvError> for EpgError {
    fn from(err: XmltvError) -> Self {
        match err {
            XmltvError::DownloadError(e) | XmltvError::UrlNotAllowed(e) => {
                EpgError::SourceUnreachable(e)
            }
            XmltvError::DatabaseError(e) => EpgError::StorageFailed(e.to_string()),
            other => EpgError::ParseError(other.to_string()),
        }
    }
}

impl From<diesel::result::Error> for EpgError {
    fn from(err: diesel::result::Error) -> Self {
        EpgError::StorageFailed(err.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RefreshOutcome {
    pub channels_upserted: usize,
    pub programs_upserted: usize,
    pub programs_deleted: usize,
}

/// Sentinel channel_number orphaned EPG programs (no channel maps to them)
/// surface under in the guide window read.
pub const ORPHAN_CHANNEL_NUMBER: i32 = 9999;

/// Fetch, parse, and commit one EPG source's XMLTV document.
///
/// On success but zero committed rows, the transaction is rolled back and
/// `StorageFailed("stored-zero")` is returned so prior data is retained —
/// a malformed-but-well-formed-XML feed must not silently wipe the guide.
pub async fn refresh_source(
    conn: &mut DbPooledConnection,
    source: &EpgSource,
) -> Result<RefreshOutcome, EpgError> {
    let source_id = source.id.ok_or_else(|| EpgError::StorageFailed("source has no id".into()))?;

    let data = fetch_xmltv(&source.url, &source.format).await?;
    let (parsed_channels, parsed_programs) = parse_xmltv_data(&data)?;

    commit_parsed(conn, source_id, &parsed_channels, &parsed_programs)
}

/// The synchronous half of a refresh: commits already-parsed channels and
/// programs in one transaction. Split out from `refresh_source` so the
/// upsert/window-delete logic is testable without a network fetch.
fn commit_parsed(
    conn: &mut DbPooledConnection,
    source_id: i32,
    parsed_channels: &[crate::xmltv::ParsedChannel],
    parsed_programs: &[crate::xmltv::ParsedProgram],
) -> Result<RefreshOutcome, EpgError> {
    let outcome = conn.transaction::<RefreshOutcome, diesel::result::Error, _>(|tx_conn| {
        let mut outcome = RefreshOutcome::default();

        for channel in parsed_channels {
            let record = NewEpgChannel::new(
                source_id,
                channel.channel_id.clone(),
                channel.display_name.clone(),
                channel.icon.clone(),
            );
            diesel::insert_into(epg_channels::table)
                .values(&record)
                .on_conflict((epg_channels::source_id, epg_channels::xmltv_channel_id))
                .do_update()
                .set(&record)
                .execute(tx_conn)?;
            outcome.channels_upserted += 1;
        }

        if let (Some(min_start), Some(max_start)) = (
            parsed_programs.iter().map(|p| p.start_time.as_str()).min(),
            parsed_programs.iter().map(|p| p.start_time.as_str()).max(),
        ) {
            let channel_ids: Vec<String> =
                parsed_programs.iter().map(|p| p.channel_id.clone()).collect::<std::collections::BTreeSet<_>>().into_iter().collect();

            let deleted = diesel::delete(
                epg_programs::table
                    .filter(epg_programs::channel_id_xmltv.eq_any(&channel_ids))
                    .filter(epg_programs::start_time.ge(min_start))
                    .filter(epg_programs::start_time.le(max_start)),
            )
            .execute(tx_conn)?;
            outcome.programs_deleted = deleted;

            // The window was fully cleared above, so a plain insert covers
            // the upsert case; `do_nothing` only guards against a source
            // emitting two <programme> entries for the same channel/start.
            let mut batch: Vec<NewEpgProgram> = Vec::with_capacity(BATCH_SIZE);
            for program in parsed_programs {
                batch.push(NewEpgProgram::from_parsed(program.channel_id.clone(), program));
                if batch.len() >= BATCH_SIZE {
                    for record in &batch {
                        outcome.programs_upserted += diesel::insert_into(epg_programs::table)
                            .values(record)
                            .on_conflict((epg_programs::channel_id_xmltv, epg_programs::start_time))
                            .do_nothing()
                            .execute(tx_conn)?;
                    }
                    batch.clear();
                }
            }
            if !batch.is_empty() {
                for record in &batch {
                    outcome.programs_upserted += diesel::insert_into(epg_programs::table)
                        .values(record)
                        .on_conflict((epg_programs::channel_id_xmltv, epg_programs::start_time))
                        .do_nothing()
                        .execute(tx_conn)?;
                }
            }
        }

        if outcome.channels_upserted == 0 && outcome.programs_upserted == 0 {
            return Err(diesel::result::Error::RollbackTransaction);
        }

        let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        diesel::update(epg_sources::table.filter(epg_sources::id.eq(source_id)))
            .set((
                epg_sources::last_refresh.eq(&now),
                epg_sources::last_success.eq(&now),
                epg_sources::last_error.eq(None::<String>),
            ))
            .execute(tx_conn)?;

        Ok(outcome)
    });

    outcome.map_err(|e| match e {
        diesel::result::Error::RollbackTransaction => {
            EpgError::StorageFailed("stored-zero".to_string())
        }
        other => EpgError::from(other),
    })
}

/// Record a failed refresh attempt against the source row, preserving
/// whatever guide data is already stored.
pub fn record_refresh_failure(
    conn: &mut DbPooledConnection,
    source_id: i32,
    error: &EpgError,
) -> Result<(), EpgError> {
    let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    diesel::update(epg_sources::table.filter(epg_sources::id.eq(source_id)))
        .set((
            epg_sources::last_refresh.eq(&now),
            epg_sources::last_error.eq(error.to_string()),
        ))
        .execute(conn)?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct NowNext {
    pub now: Option<EpgProgram>,
    pub next: Vec<EpgProgram>,
}

/// Resolve the currently-airing and up-to-two upcoming programs for a
/// channel's XMLTV id.
pub fn now_next(conn: &mut DbPooledConnection, epg_id: &str) -> Result<NowNext, EpgError> {
    let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

    let current = epg_programs::table
        .filter(epg_programs::channel_id_xmltv.eq(epg_id))
        .filter(epg_programs::start_time.le(&now))
        .filter(epg_programs::end_time.gt(&now))
        .order(epg_programs::start_time.asc())
        .first::<EpgProgram>(conn)
        .optional()?;

    let next = epg_programs::table
        .filter(epg_programs::channel_id_xmltv.eq(epg_id))
        .filter(epg_programs::start_time.gt(&now))
        .order(epg_programs::start_time.asc())
        .limit(2)
        .load::<EpgProgram>(conn)?;

    Ok(NowNext { now: current, next })
}

/// One row of a guide window read: a program plus the (possibly synthetic)
/// channel it renders under.
#[derive(Debug, Clone, QueryableByName)]
pub struct GuideEntry {
    #[diesel(sql_type = Integer)]
    pub channel_number: i32,
    #[diesel(sql_type = Text)]
    pub channel_display_name: String,
    #[diesel(sql_type = Text)]
    pub channel_id_xmltv: String,
    #[diesel(sql_type = Text)]
    pub title: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub subtitle: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub description: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub category: Option<String>,
    #[diesel(sql_type = Text)]
    pub start_time: String,
    #[diesel(sql_type = Text)]
    pub end_time: String,
    #[diesel(sql_type = Integer)]
    pub live: i32,
    #[diesel(sql_type = Integer)]
    pub premiere: i32,
    #[diesel(sql_type = Integer)]
    pub finale: i32,
    #[diesel(sql_type = Integer)]
    pub new: i32,
    #[diesel(sql_type = Integer)]
    pub hd: i32,
    #[diesel(sql_type = Nullable<Integer>)]
    pub episode: Option<i32>,
    #[diesel(sql_type = Nullable<Integer>)]
    pub season: Option<i32>,
    #[diesel(sql_type = Nullable<Integer>)]
    pub year: Option<i32>,
    #[diesel(sql_type = Nullable<Text>)]
    pub rating: Option<String>,
}

/// Read all program rows whose window overlaps `[start, end)`, LEFT JOINed
/// against `channels` so a program with no channel mapping still surfaces
/// under a synthetic "EPG Channel {id}" row at the orphan sentinel number.
pub fn guide_window(
    conn: &mut DbPooledConnection,
    start: &str,
    end: &str,
) -> Result<Vec<GuideEntry>, EpgError> {
    let rows = diesel::sql_query(format!(
        r#"
        SELECT
            COALESCE(c.channel_number, {orphan}) AS channel_number,
            COALESCE(c.display_name, 'EPG Channel ' || p.channel_id_xmltv) AS channel_display_name,
            p.channel_id_xmltv,
            p.title,
            p.subtitle,
            p.description,
            p.category,
            p.start_time,
            p.end_time,
            p.live,
            p.premiere,
            p.finale,
            p.new,
            p.hd,
            p.episode,
            p.season,
            p.year,
            p.rating
        FROM epg_programs p
        LEFT JOIN channels c ON c.epg_id = p.channel_id_xmltv
        WHERE p.start_time < ? AND p.end_time > ?
        ORDER BY channel_number ASC, p.start_time ASC
        "#,
        orphan = ORPHAN_CHANNEL_NUMBER
    ))
    .bind::<Text, _>(end)
    .bind::<Text, _>(start)
    .load::<GuideEntry>(conn)?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::channels;
    use crate::xmltv::ParsedChannel;
    use diesel::r2d2::{ConnectionManager, Pool};
    use diesel::sqlite::SqliteConnection;

    fn test_conn() -> DbPooledConnection {
        let manager = ConnectionManager::<SqliteConnection>::new(":memory:");
        let pool = Pool::builder().max_size(1).build(manager).expect("pool");
        let mut conn = pool.get().expect("conn");
        crate::db::run_migrations(&mut conn).expect("migrations");
        conn
    }

    fn parsed_channel(id: &str, name: &str) -> ParsedChannel {
        ParsedChannel {
            channel_id: id.to_string(),
            display_name: name.to_string(),
            icon: None,
        }
    }

    fn parsed_program(channel_id: &str, title: &str, start: &str, end: &str) -> crate::xmltv::ParsedProgram {
        crate::xmltv::ParsedProgram {
            channel_id: channel_id.to_string(),
            title: title.to_string(),
            subtitle: None,
            description: None,
            start_time: start.to_string(),
            end_time: end.to_string(),
            category: None,
            live: false,
            premiere: false,
            finale: false,
            new: false,
            hd: false,
            season: None,
            episode: None,
            year: None,
            rating: None,
        }
    }

    #[test]
    fn commit_parsed_inserts_channels_and_programs() {
        let mut conn = test_conn();
        diesel::insert_into(epg_sources::table)
            .values((
                epg_sources::name.eq("Test"),
                epg_sources::url.eq("https://example.com/epg.xml"),
            ))
            .execute(&mut conn)
            .unwrap();

        let channels_in = vec![parsed_channel("ESPN.US", "ESPN")];
        let programs_in = vec![parsed_program(
            "ESPN.US",
            "SportsCenter",
            "2026-08-01T20:00:00Z",
            "2026-08-01T21:00:00Z",
        )];

        let outcome = commit_parsed(&mut conn, 1, &channels_in, &programs_in).unwrap();
        assert_eq!(outcome.channels_upserted, 1);
        assert_eq!(outcome.programs_upserted, 1);
        assert_eq!(outcome.programs_deleted, 0);
    }

    #[test]
    fn commit_parsed_replaces_programs_in_window() {
        let mut conn = test_conn();
        diesel::insert_into(epg_sources::table)
            .values((epg_sources::name.eq("Test"), epg_sources::url.eq("https://example.com/epg.xml")))
            .execute(&mut conn)
            .unwrap();

        let channels_in = vec![parsed_channel("ESPN.US", "ESPN")];
        let first_pass = vec![parsed_program(
            "ESPN.US",
            "Old Show",
            "2026-08-01T20:00:00Z",
            "2026-08-01T21:00:00Z",
        )];
        commit_parsed(&mut conn, 1, &channels_in, &first_pass).unwrap();

        let second_pass = vec![parsed_program(
            "ESPN.US",
            "New Show",
            "2026-08-01T20:00:00Z",
            "2026-08-01T21:00:00Z",
        )];
        let outcome = commit_parsed(&mut conn, 1, &channels_in, &second_pass).unwrap();
        assert_eq!(outcome.programs_deleted, 1);
        assert_eq!(outcome.programs_upserted, 1);

        let stored: Vec<EpgProgram> = epg_programs::table.load(&mut conn).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].title, "New Show");
    }

    #[test]
    fn commit_parsed_rolls_back_on_stored_zero() {
        let mut conn = test_conn();
        diesel::insert_into(epg_sources::table)
            .values((epg_sources::name.eq("Test"), epg_sources::url.eq("https://example.com/epg.xml")))
            .execute(&mut conn)
            .unwrap();

        let err = commit_parsed(&mut conn, 1, &[], &[]).unwrap_err();
        assert!(matches!(err, EpgError::StorageFailed(msg) if msg == "stored-zero"));
    }

    #[test]
    fn now_next_resolves_current_and_upcoming() {
        let mut conn = test_conn();
        diesel::insert_into(epg_sources::table)
            .values((epg_sources::name.eq("Test"), epg_sources::url.eq("https://example.com/epg.xml")))
            .execute(&mut conn)
            .unwrap();

        let channels_in = vec![parsed_channel("ESPN.US", "ESPN")];
        let now = Utc::now();
        let current_start = (now - chrono::Duration::minutes(10)).format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let current_end = (now + chrono::Duration::minutes(10)).format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let next_start = (now + chrono::Duration::minutes(10)).format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let next_end = (now + chrono::Duration::minutes(40)).format("%Y-%m-%dT%H:%M:%SZ").to_string();

        let programs_in = vec![
            parsed_program("ESPN.US", "Now Airing", &current_start, &current_end),
            parsed_program("ESPN.US", "Up Next", &next_start, &next_end),
        ];
        commit_parsed(&mut conn, 1, &channels_in, &programs_in).unwrap();

        let result = now_next(&mut conn, "ESPN.US").unwrap();
        assert_eq!(result.now.unwrap().title, "Now Airing");
        assert_eq!(result.next.len(), 1);
        assert_eq!(result.next[0].title, "Up Next");
    }

    #[test]
    fn guide_window_surfaces_orphan_channels_at_sentinel_number() {
        let mut conn = test_conn();
        diesel::insert_into(epg_sources::table)
            .values((epg_sources::name.eq("Test"), epg_sources::url.eq("https://example.com/epg.xml")))
            .execute(&mut conn)
            .unwrap();

        // No row in `channels` maps to "UNMAPPED.US" — it's an orphan.
        let channels_in = vec![parsed_channel("UNMAPPED.US", "Unmapped")];
        let programs_in = vec![parsed_program(
            "UNMAPPED.US",
            "Orphan Show",
            "2026-08-01T20:00:00Z",
            "2026-08-01T21:00:00Z",
        )];
        commit_parsed(&mut conn, 1, &channels_in, &programs_in).unwrap();

        let rows = guide_window(&mut conn, "2026-08-01T00:00:00Z", "2026-08-02T00:00:00Z").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].channel_number, ORPHAN_CHANNEL_NUMBER);
        assert!(rows[0].channel_display_name.contains("UNMAPPED.US"));
    }

    #[test]
    fn guide_window_uses_mapped_channel_number() {
        let mut conn = test_conn();
        diesel::insert_into(epg_sources::table)
            .values((epg_sources::name.eq("Test"), epg_sources::url.eq("https://example.com/epg.xml")))
            .execute(&mut conn)
            .unwrap();
        diesel::insert_into(channels::table)
            .values((
                channels::channel_number.eq(7),
                channels::display_name.eq("ESPN HD"),
                channels::epg_id.eq(Some("ESPN.US")),
            ))
            .execute(&mut conn)
            .unwrap();

        let channels_in = vec![parsed_channel("ESPN.US", "ESPN")];
        let programs_in = vec![parsed_program(
            "ESPN.US",
            "Mapped Show",
            "2026-08-01T20:00:00Z",
            "2026-08-01T21:00:00Z",
        )];
        commit_parsed(&mut conn, 1, &channels_in, &programs_in).unwrap();

        let rows = guide_window(&mut conn, "2026-08-01T00:00:00Z", "2026-08-02T00:00:00Z").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].channel_number, 7);
        assert_eq!(rows[0].channel_display_name, "ESPN HD");
    }
}

