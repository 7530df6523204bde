//! Observer (C13)
//!
//! Structured logging, in-process metrics, and a live-sessions diagnostic
//! read. Generalizes scattered `log_event_internal`/`log_provider_event`
//! call sites into a single counters-plus-persistence component that every
//! other component reports to. The Observer never gates admission or
//! streaming decisions — it only observes and records what already happened
//! elsewhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use diesel::prelude::*;

use crate::db::models::NewEventLog;
use crate::db::schema::event_log;
use crate::db::DbPool;
use crate::session::{Session, SessionRegistry};

/// How often accumulated counters are flushed to the EventLog table.
pub const METRICS_FLUSH_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub active_sessions: usize,
    pub sessions_by_channel: HashMap<i32, usize>,
    pub bytes_per_session: HashMap<String, u64>,
    pub deferred_start_invocations: u64,
    pub supervisor_restarts: u64,
    pub epg_refresh_success: u64,
    pub epg_refresh_failure: u64,
    pub cache_hit_ratio: f64,
}

/// Counters accumulated across the process's lifetime. Cheap to update from
/// any call site: every field is a relaxed `AtomicU64`, read only when a
/// snapshot or periodic flush is taken.
#[derive(Default)]
struct Counters {
    deferred_start_invocations: AtomicU64,
    supervisor_restarts: AtomicU64,
    epg_refresh_success: AtomicU64,
    epg_refresh_failure: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

/// Central metrics and event sink. Held as a single `Arc<Observer>` shared
/// across the Session Registry, Transcoder Supervisor, Deferred-Start Shim,
/// Cache, and EPG Engine call sites that report into it.
pub struct Observer {
    counters: Counters,
    pool: DbPool,
}

impl Observer {
    pub fn new(pool: DbPool) -> Self {
        Self {
            counters: Counters::default(),
            pool,
        }
    }

    pub fn record_deferred_start(&self) {
        self.counters.deferred_start_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_supervisor_restart(&self) {
        self.counters.supervisor_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_epg_refresh(&self, success: bool) {
        if success {
            self.counters.epg_refresh_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.epg_refresh_failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cache_access(&self, hit: bool) {
        if hit {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn cache_hit_ratio(&self) -> f64 {
        let hits = self.counters.cache_hits.load(Ordering::Relaxed);
        let misses = self.counters.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Active sessions, grouped and byte-totaled, read live from the Session
    /// Registry; accumulated counters read from the atomics above. This is
    /// the payload for a diagnostics endpoint, not a cached value.
    pub fn snapshot(&self, sessions: &SessionRegistry) -> MetricsSnapshot {
        let live = sessions.live_sessions();

        let mut sessions_by_channel: HashMap<i32, usize> = HashMap::new();
        let mut bytes_per_session: HashMap<String, u64> = HashMap::new();
        for session in &live {
            *sessions_by_channel.entry(session.channel_id).or_insert(0) += 1;
            let bytes: u64 = session.clients.iter().map(|c| c.bytes_sent).sum();
            bytes_per_session.insert(session.session_id.clone(), bytes);
        }

        MetricsSnapshot {
            active_sessions: live.len(),
            sessions_by_channel,
            bytes_per_session,
            deferred_start_invocations: self.counters.deferred_start_invocations.load(Ordering::Relaxed),
            supervisor_restarts: self.counters.supervisor_restarts.load(Ordering::Relaxed),
            epg_refresh_success: self.counters.epg_refresh_success.load(Ordering::Relaxed),
            epg_refresh_failure: self.counters.epg_refresh_failure.load(Ordering::Relaxed),
            cache_hit_ratio: self.cache_hit_ratio(),
        }
    }

    /// Raw session table for the live-sessions diagnostic endpoint.
    pub fn live_sessions(&self, sessions: &SessionRegistry) -> Vec<Session> {
        sessions.live_sessions()
    }

    /// Persist a free-form structured event. Failures to write are logged
    /// but not propagated: observability must never be able to fail a
    /// request.
    pub fn record_event(&self, level: &str, category: &str, message: &str, details: Option<serde_json::Value>) {
        let mut conn = match self.pool.get() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("observer: could not acquire connection to record event: {}", e);
                return;
            }
        };

        let mut event = match level {
            "warn" => NewEventLog::warn(category, message),
            "error" => NewEventLog::error(category, message),
            _ => NewEventLog::info(category, message),
        };
        if let Some(details) = details {
            event = event.with_details(details.to_string());
        }

        if let Err(e) = diesel::insert_into(event_log::table).values(&event).execute(&mut conn) {
            tracing::warn!("observer: failed to persist event: {}", e);
        }
    }

    /// Flush the current counter snapshot to the EventLog as a single
    /// `metrics` category event, so a dashboard reading the log table sees
    /// periodic samples across restarts rather than only point-in-time
    /// diagnostics reads.
    pub fn flush_snapshot(&self, sessions: &SessionRegistry) {
        let snapshot = self.snapshot(sessions);
        let details = serde_json::json!({
            "active_sessions": snapshot.active_sessions,
            "sessions_by_channel": snapshot.sessions_by_channel,
            "deferred_start_invocations": snapshot.deferred_start_invocations,
            "supervisor_restarts": snapshot.supervisor_restarts,
            "epg_refresh_success": snapshot.epg_refresh_success,
            "epg_refresh_failure": snapshot.epg_refresh_failure,
            "cache_hit_ratio": snapshot.cache_hit_ratio,
        });
        self.record_event("info", "metrics", "periodic metrics snapshot", Some(details));
    }
}

/// Spawn the periodic flush loop. Mirrors the idle-sweep/scheduler pattern
/// used elsewhere in the server: a `tokio::time::interval` loop owned by a
/// detached task, torn down automatically when the `Observer`/`SessionRegistry`
/// Arcs it holds are dropped.
pub fn spawn_periodic_flush(observer: std::sync::Arc<Observer>, sessions: std::sync::Arc<SessionRegistry>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(METRICS_FLUSH_INTERVAL);
        loop {
            ticker.tick().await;
            observer.flush_snapshot(&sessions);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use diesel::r2d2::{ConnectionManager, Pool};
    use diesel::sqlite::SqliteConnection;

    fn test_pool() -> DbPool {
        let manager = ConnectionManager::<SqliteConnection>::new(":memory:");
        let pool = Pool::builder().max_size(1).build(manager).unwrap();
        let mut conn = pool.get().unwrap();
        crate::db::run_migrations(&mut conn).unwrap();
        pool
    }

    #[test]
    fn counters_start_at_zero_and_increment() {
        let observer = Observer::new(test_pool());
        let sessions = SessionRegistry::new(4);
        let snapshot = observer.snapshot(&sessions);
        assert_eq!(snapshot.deferred_start_invocations, 0);
        assert_eq!(snapshot.supervisor_restarts, 0);

        observer.record_deferred_start();
        observer.record_deferred_start();
        observer.record_supervisor_restart();

        let snapshot = observer.snapshot(&sessions);
        assert_eq!(snapshot.deferred_start_invocations, 2);
        assert_eq!(snapshot.supervisor_restarts, 1);
    }

    #[test]
    fn cache_hit_ratio_reflects_recorded_accesses() {
        let observer = Observer::new(test_pool());
        let sessions = SessionRegistry::new(4);
        observer.record_cache_access(true);
        observer.record_cache_access(true);
        observer.record_cache_access(false);
        let snapshot = observer.snapshot(&sessions);
        assert!((snapshot.cache_hit_ratio - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn epg_refresh_counters_split_by_outcome() {
        let observer = Observer::new(test_pool());
        let sessions = SessionRegistry::new(4);
        observer.record_epg_refresh(true);
        observer.record_epg_refresh(true);
        observer.record_epg_refresh(false);
        let snapshot = observer.snapshot(&sessions);
        assert_eq!(snapshot.epg_refresh_success, 2);
        assert_eq!(snapshot.epg_refresh_failure, 1);
    }

    #[test]
    fn record_event_persists_to_event_log_table() {
        use crate::db::schema::event_log;

        let observer = Observer::new(test_pool());
        observer.record_event("warn", "supervisor", "transcoder restarted", None);

        let mut conn = observer.pool.get().unwrap();
        let count: i64 = event_log::table.count().get_result(&mut conn).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn flush_snapshot_writes_a_metrics_event() {
        use crate::db::schema::event_log;

        let observer = Observer::new(test_pool());
        let sessions = SessionRegistry::new(4);
        observer.flush_snapshot(&sessions);

        let mut conn = observer.pool.get().unwrap();
        let count: i64 = event_log::table
            .filter(event_log::category.eq("metrics"))
            .count()
            .get_result(&mut conn)
            .unwrap();
        assert_eq!(count, 1);
    }
}
