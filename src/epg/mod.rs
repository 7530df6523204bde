//! EPG Engine (C7)
//!
//! Ingests XMLTV sources on a per-source timer, stores channels/programs in
//! the flattened `epg_channels`/`epg_programs` schema, and answers now/next
//! and guide-window reads for the Plex Protocol Surface.

pub mod engine;
pub mod storage;

pub use engine::{EngineError, EpgEngine};
pub use storage::{
    guide_window, now_next, record_refresh_failure, refresh_source, EpgError, GuideEntry,
    NowNext, RefreshOutcome, ORPHAN_CHANNEL_NUMBER,
};
