//! Shared application state (C1 composition root)
//!
//! Generalizes a bare `AppState{pool}` into the full set of long-lived
//! components every handler needs a handle to. Built once in `main` and
//! cloned (an `Arc` clone per field) into every request.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::admission::{AdmissionController, StreamConcurrencyTracker};
use crate::cache::Cache;
use crate::config::ConfigResolver;
use crate::credentials::CredentialManager;
use crate::db::{DbPool, DbPooledConnection};
use crate::epg::engine::EpgEngine;
use crate::observer::Observer;
use crate::profiles::Profile;
use crate::server::stream::SupervisorSession;
use crate::session::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: ConfigResolver,
    pool: DbPool,
    pub cache: Arc<Cache>,
    pub credentials: Arc<CredentialManager>,
    pub sessions: Arc<SessionRegistry>,
    pub admission: Arc<AdmissionController>,
    pub concurrency: Arc<Mutex<StreamConcurrencyTracker>>,
    pub profile: Arc<Profile>,
    pub observer: Arc<Observer>,
    pub supervisors: Arc<DashMap<String, SupervisorSession>>,
    pub epg_engine: Arc<EpgEngine>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConfigResolver,
        pool: DbPool,
        cache: Arc<Cache>,
        credentials: Arc<CredentialManager>,
        sessions: Arc<SessionRegistry>,
        admission: Arc<AdmissionController>,
        profile: Arc<Profile>,
        observer: Arc<Observer>,
        epg_engine: Arc<EpgEngine>,
    ) -> Self {
        Self {
            config,
            pool,
            cache,
            credentials,
            sessions,
            admission,
            concurrency: Arc::new(Mutex::new(StreamConcurrencyTracker::default())),
            profile,
            observer,
            supervisors: Arc::new(DashMap::new()),
            epg_engine,
        }
    }

    /// Get the bind port from the live config snapshot.
    pub fn get_port(&self) -> u16 {
        self.config.snapshot().bind_address.port()
    }

    /// Get a database connection from the pool
    pub fn get_connection(&self) -> Result<DbPooledConnection, r2d2::Error> {
        self.pool.get()
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}
