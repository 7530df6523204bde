//! Session Registry (C8)
//!
//! Authoritative map of active streaming sessions. Generalizes a prior
//! `StreamManager`/`StreamSession` pair (which tracked a single Xtream
//! quality-tier session keyed by connection count) into the full lifecycle
//! state machine a Session entity requires: shareable vs. non-shareable
//! sessions, a per-session client set, and idle sweeping.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

use crate::profiles::ClientClass;

pub const IDLE_EMPTY_GRACE: Duration = Duration::from_secs(20);
pub const IDLE_ABSOLUTE_CEILING: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Deferring,
    Streaming,
    Draining,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct ClientBinding {
    pub client_id: String,
    pub remote_addr: String,
    pub user_agent: String,
    pub bytes_sent: u64,
    pub attached_at: Instant,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub channel_id: i32,
    pub stream_id: i32,
    pub client_class: ClientClass,
    pub shareable: bool,
    pub state: SessionState,
    pub created_at: Instant,
    pub last_activity_at: Instant,
    pub deferred_until: Option<Instant>,
    pub clients: Vec<ClientBinding>,
}

impl Session {
    fn new(channel_id: i32, stream_id: i32, client_class: ClientClass, shareable: bool) -> Self {
        let now = Instant::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            channel_id,
            stream_id,
            client_class,
            shareable,
            state: SessionState::Initializing,
            created_at: now,
            last_activity_at: now,
            deferred_until: None,
            clients: Vec::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }

    fn is_idle_empty_past_grace(&self) -> bool {
        self.clients.is_empty() && self.last_activity_at.elapsed() >= IDLE_EMPTY_GRACE
    }

    fn is_past_absolute_ceiling(&self) -> bool {
        self.last_activity_at.elapsed() >= IDLE_ABSOLUTE_CEILING
    }
}

/// Central table keyed by `session_id`, backed by `DashMap` for lock-free
/// concurrent reads.
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    tuner_slots_in_use: AtomicU32,
    max_concurrent_streams: AtomicU32,
}

impl SessionRegistry {
    pub fn new(max_concurrent_streams: u32) -> Self {
        Self {
            sessions: DashMap::new(),
            tuner_slots_in_use: AtomicU32::new(0),
            max_concurrent_streams: AtomicU32::new(max_concurrent_streams),
        }
    }

    pub fn set_max_concurrent_streams(&self, max: u32) {
        self.max_concurrent_streams.store(max, Ordering::Relaxed);
    }

    pub fn tuner_slots_in_use(&self) -> u32 {
        self.tuner_slots_in_use.load(Ordering::Relaxed)
    }

    pub fn has_free_tuner_slot(&self) -> bool {
        self.tuner_slots_in_use.load(Ordering::Relaxed) < self.max_concurrent_streams.load(Ordering::Relaxed)
    }

    /// Attach to an existing shareable session for `channel_id`, or create a
    /// new one. Returns `(session_id, joined_existing)`. Non-shareable
    /// streams (`connection_limits = 1`) always create a new session, since
    /// the upstream can't be multiplexed at the origin.
    pub fn get_or_create(
        &self,
        channel_id: i32,
        stream_id: i32,
        shareable: bool,
        client: ClientBinding,
    ) -> Option<(String, bool)> {
        if shareable {
            if let Some(mut existing) = self
                .sessions
                .iter_mut()
                .find(|e| e.channel_id == channel_id && e.shareable && e.state != SessionState::Terminated)
            {
                existing.clients.push(client);
                existing.touch();
                return Some((existing.session_id.clone(), true));
            }
        }

        if !self.has_free_tuner_slot() {
            return None;
        }

        let client_class = client.user_agent.as_str().into();
        let mut session = Session::new(channel_id, stream_id, client_class, shareable);
        session.clients.push(client);
        let session_id = session.session_id.clone();
        self.sessions.insert(session_id.clone(), session);
        self.tuner_slots_in_use.fetch_add(1, Ordering::Relaxed);
        Some((session_id, false))
    }

    pub fn attach(&self, session_id: &str, client: ClientBinding) -> bool {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.clients.push(client);
            session.touch();
            true
        } else {
            false
        }
    }

    pub fn detach(&self, session_id: &str, client_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.clients.retain(|c| c.client_id != client_id);
            session.touch();
        }
    }

    pub fn touch(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.touch();
        }
    }

    pub fn set_state(&self, session_id: &str, state: SessionState) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.state = state;
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn terminate(&self, session_id: &str) {
        if let Some((_, mut session)) = self.sessions.remove(session_id) {
            session.state = SessionState::Terminated;
            self.tuner_slots_in_use.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of every tracked session, for the Observer's diagnostics
    /// read. Clones rather than holding a lock across the caller's use.
    pub fn live_sessions(&self) -> Vec<Session> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Whether a shareable, non-terminated session already exists for
    /// `channel_id`. Read-only check used by the Admission Controller to
    /// report a join-vs-create decision before calling `get_or_create`.
    pub fn has_shareable_session(&self, channel_id: i32) -> bool {
        self.sessions
            .iter()
            .any(|e| e.channel_id == channel_id && e.shareable && e.state != SessionState::Terminated)
    }

    /// Terminate sessions whose client set has been empty past the grace
    /// window, or whose last activity (regardless of client presence)
    /// exceeds the absolute ceiling. Returns the terminated session IDs so
    /// callers can reap the associated Transcoder Supervisor.
    pub fn sweep_idle(&self) -> Vec<String> {
        let to_terminate: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.is_idle_empty_past_grace() || e.is_past_absolute_ceiling())
            .map(|e| e.session_id.clone())
            .collect();

        for session_id in &to_terminate {
            self.terminate(session_id);
        }
        to_terminate
    }
}

impl From<&str> for ClientClass {
    fn from(ua: &str) -> Self {
        ClientClass::from_user_agent(ua)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(id: &str) -> ClientBinding {
        ClientBinding {
            client_id: id.to_string(),
            remote_addr: "127.0.0.1:1234".to_string(),
            user_agent: "PlexMediaServer/1.0".to_string(),
            bytes_sent: 0,
            attached_at: Instant::now(),
        }
    }

    #[test]
    fn shareable_sessions_are_joined_not_duplicated() {
        let registry = SessionRegistry::new(4);
        let (id1, joined1) = registry.get_or_create(1, 10, true, binding("a")).unwrap();
        let (id2, joined2) = registry.get_or_create(1, 10, true, binding("b")).unwrap();
        assert_eq!(id1, id2);
        assert!(!joined1);
        assert!(joined2);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn non_shareable_sessions_always_create_new() {
        let registry = SessionRegistry::new(4);
        let (id1, _) = registry.get_or_create(1, 10, false, binding("a")).unwrap();
        let (id2, _) = registry.get_or_create(1, 10, false, binding("b")).unwrap();
        assert_ne!(id1, id2);
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn admission_refused_when_tuner_slots_exhausted() {
        let registry = SessionRegistry::new(1);
        registry.get_or_create(1, 10, false, binding("a")).unwrap();
        assert!(registry.get_or_create(2, 11, false, binding("b")).is_none());
    }

    #[test]
    fn terminate_frees_tuner_slot() {
        let registry = SessionRegistry::new(1);
        let (id, _) = registry.get_or_create(1, 10, false, binding("a")).unwrap();
        registry.terminate(&id);
        assert!(registry.get_or_create(2, 11, false, binding("b")).is_some());
    }

    #[test]
    fn detach_removes_client_but_keeps_session() {
        let registry = SessionRegistry::new(4);
        let (id, _) = registry.get_or_create(1, 10, true, binding("a")).unwrap();
        registry.detach(&id, "a");
        let session = registry.get(&id).unwrap();
        assert!(session.clients.is_empty());
        assert_eq!(registry.active_count(), 1);
    }
}
