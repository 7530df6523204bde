//! EPG Engine scheduling (C7)
//!
//! Generalizes a one-daily-cron-job-for-every-source scheduler into one
//! repeated-interval job per enabled EPG Source, firing at that source's own
//! `refresh_interval_seconds`. Keeps the `tokio-cron-scheduler` dependency
//! and a missed-refresh startup check, generalized from a single global
//! schedule to per-source overdue detection.

use std::sync::Arc;
use std::time::Duration;

use diesel::prelude::*;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

use crate::db::schema::epg_sources;
use crate::db::{DbPool, EpgSource};
use crate::epg::storage;
use crate::observer::Observer;

const MIN_REFRESH_INTERVAL_SECS: i32 = 60;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("EPG scheduler error: {0}")]
    Scheduler(String),
    #[error("EPG engine database error: {0}")]
    Database(#[from] diesel::result::Error),
}

impl From<JobSchedulerError> for EngineError {
    fn from(err: JobSchedulerError) -> Self {
        EngineError::Scheduler(err.to_string())
    }
}

/// Owns the per-source refresh timers. One instance per running server.
pub struct EpgEngine {
    scheduler: JobScheduler,
    pool: DbPool,
    observer: Option<Arc<Observer>>,
}

impl EpgEngine {
    pub async fn new(pool: DbPool) -> Result<Self, EngineError> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self { scheduler, pool, observer: None })
    }

    pub fn with_observer(mut self, observer: Arc<Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Arm one repeated job per enabled source, then start the underlying
    /// scheduler. Call `run_missed_refreshes` afterward to recover any
    /// source whose refresh was due while the process was down.
    pub async fn start(&self) -> Result<(), EngineError> {
        let sources = self.load_enabled_sources()?;
        for source in &sources {
            self.arm_source(source).await?;
        }
        self.scheduler.start().await?;
        tracing::info!("EPG engine started with {} per-source refresh timers", sources.len());
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        self.scheduler.shutdown().await?;
        Ok(())
    }

    fn load_enabled_sources(&self) -> Result<Vec<EpgSource>, EngineError> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| EngineError::Scheduler(format!("connection pool: {e}")))?;
        Ok(epg_sources::table.filter(epg_sources::enabled.eq(1)).load(&mut conn)?)
    }

    async fn arm_source(&self, source: &EpgSource) -> Result<(), EngineError> {
        let interval_secs = source.refresh_interval_seconds.max(MIN_REFRESH_INTERVAL_SECS) as u64;
        let pool = self.pool.clone();
        let source_id = source.id;
        let source_name = source.name.clone();
        let observer = self.observer.clone();

        let job = Job::new_repeated_async(Duration::from_secs(interval_secs), move |_uuid, _lock| {
            let pool = pool.clone();
            let source_name = source_name.clone();
            let observer = observer.clone();
            Box::pin(async move {
                run_refresh_by_id(&pool, source_id, &source_name, observer.as_ref()).await;
            })
        })
        .map_err(|e| EngineError::Scheduler(e.to_string()))?;

        self.scheduler.add(job).await?;
        tracing::info!("Armed EPG refresh timer for '{}' every {}s", source.name, interval_secs);
        Ok(())
    }

    /// Startup recovery: refresh any enabled source whose last recorded
    /// refresh predates its own interval, so a restart during the
    /// scheduled window doesn't silently skip a cycle.
    pub async fn run_missed_refreshes(&self) {
        let sources = match self.load_enabled_sources() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("EPG missed-refresh check failed: {}", e);
                return;
            }
        };

        for source in sources {
            if is_refresh_overdue(&source) {
                tracing::info!("Triggering missed EPG refresh for source '{}'", source.name);
                let pool = self.pool.clone();
                let source_id = source.id;
                let name = source.name.clone();
                let observer = self.observer.clone();
                tokio::spawn(async move {
                    run_refresh_by_id(&pool, source_id, &name, observer.as_ref()).await;
                });
            }
        }
    }
}

fn is_refresh_overdue(source: &EpgSource) -> bool {
    let Some(last) = source.last_refresh.as_deref() else {
        return true;
    };
    let Some(last_dt) = parse_db_timestamp(last) else {
        return true;
    };
    let elapsed = chrono::Utc::now().signed_duration_since(last_dt);
    elapsed.num_seconds() >= source.refresh_interval_seconds.max(MIN_REFRESH_INTERVAL_SECS) as i64
}

fn parse_db_timestamp(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    let normalized = s.replace(' ', "T");
    let with_z = if normalized.ends_with('Z') {
        normalized
    } else {
        format!("{normalized}Z")
    };
    chrono::DateTime::parse_from_rfc3339(&with_z)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

async fn run_refresh_by_id(
    pool: &DbPool,
    source_id: Option<i32>,
    source_name: &str,
    observer: Option<&Arc<Observer>>,
) {
    let Some(source_id) = source_id else {
        return;
    };

    let mut conn = match pool.get() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("EPG refresh for '{}': connection pool: {}", source_name, e);
            return;
        }
    };

    let source: EpgSource = match epg_sources::table.filter(epg_sources::id.eq(source_id)).first(&mut conn) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("EPG refresh for '{}': source no longer exists: {}", source_name, e);
            return;
        }
    };

    match storage::refresh_source(&mut conn, &source).await {
        Ok(outcome) => {
            tracing::info!(
                "EPG refresh for '{}' committed {} channels, {} programs ({} stale rows replaced)",
                source_name,
                outcome.channels_upserted,
                outcome.programs_upserted,
                outcome.programs_deleted,
            );
            if let Some(observer) = observer {
                observer.record_epg_refresh(true);
            }
        }
        Err(err) => {
            tracing::error!("EPG refresh for '{}' failed: {}", source_name, err);
            let _ = storage::record_refresh_failure(&mut conn, source_id, &err);
            if let Some(observer) = observer {
                observer.record_epg_refresh(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(interval: i32, last_refresh: Option<&str>) -> EpgSource {
        EpgSource {
            id: Some(1),
            name: "Test Source".to_string(),
            url: "https://example.com/epg.xml".to_string(),
            format: "xml".to_string(),
            refresh_interval_seconds: interval,
            category: None,
            enabled: 1,
            last_refresh: last_refresh.map(str::to_string),
            last_success: None,
            last_error: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn never_refreshed_source_is_overdue() {
        assert!(is_refresh_overdue(&source(3600, None)));
    }

    #[test]
    fn recently_refreshed_source_is_not_overdue() {
        let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        assert!(!is_refresh_overdue(&source(3600, Some(&now))));
    }

    #[test]
    fn stale_refresh_past_interval_is_overdue() {
        let old = (chrono::Utc::now() - chrono::Duration::hours(5))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();
        assert!(is_refresh_overdue(&source(3600, Some(&old))));
    }
}
