//! Process entrypoint: parse CLI flags, initialize structured logging, open
//! the database, assemble every long-lived component, and start the HTTP
//! server. This is a headless server process, not a desktop application.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sqlite::SqliteConnection;

use iptv_bridge::admission::AdmissionController;
use iptv_bridge::cache::Cache;
use iptv_bridge::config::{Config, ConfigResolver};
use iptv_bridge::credentials::CredentialManager;
use iptv_bridge::db::{establish_connection, run_migrations, DbPool};
use iptv_bridge::epg::EpgEngine;
use iptv_bridge::observer::{spawn_periodic_flush, Observer};
use iptv_bridge::profiles::default_profile;
use iptv_bridge::server::{self, AppState};
use iptv_bridge::session::SessionRegistry;

/// Maximum bytes the in-process document cache (lineup, EPG XML, discovery)
/// is allowed to hold before it starts evicting the oldest entries.
const CACHE_BYTE_BUDGET: usize = 8 * 1024 * 1024;

/// How often the idle-sweep background task checks for sessions past their
/// idle grace window or absolute ceiling.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "iptv-bridge", about = "IPTV-to-Plex bridge presenting a virtual HDHomeRun tuner")]
struct Cli {
    /// Path to a TOML config file overlaying the compiled-in defaults.
    #[arg(long, env = "IPTV_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Override the configured bind address (e.g. 0.0.0.0:5004).
    #[arg(long, env = "IPTV_BIND_ADDRESS")]
    bind_address: Option<std::net::SocketAddr>,
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    fmt().with_env_filter(filter).init();
}

fn build_pool(database_path: &std::path::Path) -> Result<DbPool, Box<dyn std::error::Error + Send + Sync>> {
    if let Some(parent) = database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let database_url = database_path.to_string_lossy().to_string();

    let mut conn = establish_connection(&database_url)?;
    run_migrations(&mut conn)?;
    drop(conn);

    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    let pool = Pool::builder().max_size(16).build(manager)?;
    Ok(pool)
}

/// Periodically reap sessions idle past their grace window or absolute
/// ceiling, mirroring the cleanup `DisconnectGuard` performs when a client
/// disconnects mid-stream: cancel the session's Transcoder Supervisor and
/// release its concurrency-tracker slot, since no HTTP response body drop
/// will ever do it for a session nobody is attached to anymore.
fn spawn_idle_sweep(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(IDLE_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let reaped = state.sessions.sweep_idle();
            if reaped.is_empty() {
                continue;
            }
            tracing::info!("idle sweep reaped {} session(s)", reaped.len());
            let mut tracker = state.concurrency.lock().await;
            for session_id in &reaped {
                if let Some((_, session)) = state.supervisors.remove(session_id) {
                    session.handle.cancel();
                }
                tracker.release_untracked(session_id);
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_ref())?;
    if let Some(bind_address) = cli.bind_address {
        config.bind_address = bind_address;
    }

    init_tracing(&config.log_level);
    tracing::info!("starting iptv-bridge");

    let pool = build_pool(&config.database_path)?;

    {
        let mut conn = pool.get()?;
        config.apply_persisted_settings(&mut conn);
    }

    let data_dir = config
        .database_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let credentials = Arc::new(CredentialManager::new(data_dir));
    let cache = Arc::new(Cache::new(CACHE_BYTE_BUDGET));
    let sessions = Arc::new(SessionRegistry::new(config.max_concurrent_streams));
    let admission = Arc::new(AdmissionController::new(config.max_concurrent_streams));
    let observer = Arc::new(Observer::new(pool.clone()));
    let profile = Arc::new(default_profile());

    let mut epg_engine = EpgEngine::new(pool.clone()).await?;
    epg_engine = epg_engine.with_observer(observer.clone());
    epg_engine.start().await?;
    epg_engine.run_missed_refreshes().await;
    let epg_engine = Arc::new(epg_engine);

    let config_resolver = ConfigResolver::new(config);

    let state = AppState::new(
        config_resolver,
        pool,
        cache,
        credentials,
        sessions.clone(),
        admission,
        profile,
        observer.clone(),
        epg_engine,
    );

    spawn_periodic_flush(observer, sessions);
    spawn_idle_sweep(state.clone());

    server::start_server(state).await?;

    Ok(())
}
