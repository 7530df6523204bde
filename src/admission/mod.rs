//! Admission Controller (C12)
//!
//! Applies the global tuner cap and per-stream concurrency limits, and
//! decides whether a new consumer joins an existing shareable session or
//! opens a new one. Generalizes a `StreamManager::can_start_stream`
//! connection-limit check with a stream-specific cap and a Plex-preference
//! pre-emption rule.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::profiles::ClientClass;
use crate::session::SessionRegistry;

pub const IDLE_PREEMPTION_THRESHOLD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    JoinExisting,
    Admit,
    Deny,
    /// A non-Plex session was pre-empted (terminated) to admit this request.
    AdmitWithPreemption { preempted_session_id_index: usize },
}

pub struct AdmissionRequest<'a> {
    pub channel_id: i32,
    pub stream_id: i32,
    pub client_class: ClientClass,
    pub shareable: bool,
    pub stream_specific_cap: Option<u32>,
    pub active_sessions_for_stream: &'a [StreamSessionSummary],
}

#[derive(Debug, Clone)]
pub struct StreamSessionSummary {
    pub session_id: String,
    pub client_class: ClientClass,
    pub last_byte_write_at: Instant,
}

pub struct AdmissionController {
    max_concurrent_streams: u32,
}

impl AdmissionController {
    pub fn new(max_concurrent_streams: u32) -> Self {
        Self { max_concurrent_streams }
    }

    /// Decide admission given the current registry state and a request.
    /// Does not mutate the registry; callers act on the returned decision.
    pub fn decide(&self, registry: &SessionRegistry, req: &AdmissionRequest) -> AdmissionDecision {
        if req.shareable && registry.has_shareable_session(req.channel_id) {
            return AdmissionDecision::JoinExisting;
        }

        if let Some(cap) = req.stream_specific_cap {
            if req.active_sessions_for_stream.len() as u32 >= cap {
                return AdmissionDecision::Deny;
            }
        }

        if registry.active_count() as u32 >= self.max_concurrent_streams {
            if req.client_class == ClientClass::PlexServer {
                if let Some(index) = find_preemptable(req.active_sessions_for_stream) {
                    return AdmissionDecision::AdmitWithPreemption {
                        preempted_session_id_index: index,
                    };
                }
            }
            return AdmissionDecision::Deny;
        }

        AdmissionDecision::Admit
    }
}

fn find_preemptable(candidates: &[StreamSessionSummary]) -> Option<usize> {
    candidates.iter().position(|s| {
        s.client_class != ClientClass::PlexServer
            && s.last_byte_write_at.elapsed() >= IDLE_PREEMPTION_THRESHOLD
    })
}

/// Tracks per-stream_id concurrency independent of the global tuner pool,
/// used by callers to build `AdmissionRequest::active_sessions_for_stream`.
#[derive(Default)]
pub struct StreamConcurrencyTracker {
    by_stream: HashMap<i32, Vec<StreamSessionSummary>>,
}

impl StreamConcurrencyTracker {
    pub fn record(&mut self, stream_id: i32, summary: StreamSessionSummary) {
        self.by_stream.entry(stream_id).or_default().push(summary);
    }

    pub fn release(&mut self, stream_id: i32, session_id: &str) {
        if let Some(list) = self.by_stream.get_mut(&stream_id) {
            list.retain(|s| s.session_id != session_id);
        }
    }

    pub fn for_stream(&self, stream_id: i32) -> &[StreamSessionSummary] {
        self.by_stream.get(&stream_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Remove a session from whichever stream's bucket holds it, for callers
    /// (the idle sweep) that know a session was terminated but not which
    /// stream it belonged to.
    pub fn release_untracked(&mut self, session_id: &str) {
        for list in self.by_stream.values_mut() {
            list.retain(|s| s.session_id != session_id);
        }
    }
}
