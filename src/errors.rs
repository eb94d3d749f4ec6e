// src/errors.rs
//
// Engine error taxonomy. Nothing in here is allowed to crash the process:
// malformed geometry/config/detections are rejected at the boundary and
// surfaced to the collaborator that supplied them.

use crate::types::{TrackId, ZoneId};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Rejected at registry write time; the zone config is left unchanged.
    #[error("invalid zone geometry for '{zone_id}': {reason}")]
    InvalidZoneGeometry { zone_id: ZoneId, reason: String },

    /// Dropped and logged; the track continues from its last good point.
    #[error("out-of-order point for track {track_id}: ts {ts_ms} <= last {last_ts_ms}")]
    OutOfOrderPoint {
        track_id: TrackId,
        ts_ms: f64,
        last_ts_ms: f64,
    },

    #[error("unknown zone type '{0}'")]
    UnknownZoneType(String),

    /// Persistence backend failure; writes are buffered with bounded retry.
    #[error("event store unavailable: {0}")]
    StoreUnavailable(String),
}
