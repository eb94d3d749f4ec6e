// src/types.rs

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

pub type CameraId = String;
pub type ZoneId = String;
pub type TrackId = u64;

/// Image-space coordinate (pixels).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClass {
    Person,
    Vessel,
    Helicopter,
    /// Classes the rule table does not know about. Candidate generation is
    /// skipped for these, never fatal.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    Danger,
    Smoking,
    Helipad,
    Berth,
    Safe,
    #[serde(other)]
    Unknown,
}

impl ZoneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneKind::Danger => "danger",
            ZoneKind::Smoking => "smoking",
            ZoneKind::Helipad => "helipad",
            ZoneKind::Berth => "berth",
            ZoneKind::Safe => "safe",
            ZoneKind::Unknown => "unknown",
        }
    }
}

/// Variant order matters: derived `Ord` gives Low < Medium < High < Critical,
/// which the dispatcher relies on for shedding decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ZoneViolation,
    PersonNoHelmet,
    SmokingZoneViolation,
    VesselUnauthorized,
    HelicopterLanding,
    LoiteringDetected,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ZoneViolation => "zone_violation",
            EventType::PersonNoHelmet => "person_no_helmet",
            EventType::SmokingZoneViolation => "smoking_zone_violation",
            EventType::VesselUnauthorized => "vessel_unauthorized",
            EventType::HelicopterLanding => "helicopter_landing",
            EventType::LoiteringDetected => "loitering_detected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Open,
    Closed,
    Acknowledged,
}

/// One sample from the external tracker. Timestamps are stream time in
/// milliseconds; the engine never consults the wall clock for these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackPoint {
    pub ts_ms: f64,
    pub centroid: Point,
    /// Boolean attributes attached by the detector, e.g. {"helmet": false}.
    #[serde(default)]
    pub attributes: HashMap<String, bool>,
}

impl TrackPoint {
    /// Attribute lookup; None when the detector did not report it.
    pub fn flag(&self, name: &str) -> Option<bool> {
        self.attributes.get(name).copied()
    }
}

/// One update on a camera's tracked-object stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackUpdate {
    pub camera_id: CameraId,
    pub track_id: TrackId,
    pub class: ObjectClass,
    #[serde(flatten)]
    pub point: TrackPoint,
}

/// Ephemeral per-tick signal that a rule condition currently holds.
/// Never persisted; consumed by the aggregator in the same lane iteration.
#[derive(Debug, Clone)]
pub struct ViolationCandidate {
    pub event_type: EventType,
    pub camera_id: CameraId,
    pub zone_id: Option<ZoneId>,
    pub track_id: TrackId,
    pub class: ObjectClass,
    /// Timestamp of the sample that produced this candidate.
    pub ts_ms: f64,
    /// When the underlying condition began (membership entered timestamp,
    /// loitering window start). Used as the event's start_ts.
    pub onset_ms: f64,
    pub severity: Severity,
}

/// A deduplicated, timestamped safety event with an open/close lifecycle.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: Uuid,
    pub event_type: EventType,
    pub severity: Severity,
    pub camera_id: CameraId,
    pub zone_id: Option<ZoneId>,
    pub start_ms: f64,
    pub end_ms: Option<f64>,
    pub status: EventStatus,
    pub related_tracks: BTreeSet<TrackId>,
    /// Reference into the external snapshot store, attached by collaborators.
    pub snapshot_ref: Option<String>,
}

/// The wire/storage contract other systems rely on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub severity: Severity,
    pub camera_id: CameraId,
    pub zone_id: Option<ZoneId>,
    pub start_ts: f64,
    pub end_ts: Option<f64>,
    pub status: EventStatus,
    pub related_tracks: Vec<TrackId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_ref: Option<String>,
}

impl From<&Event> for EventRecord {
    fn from(event: &Event) -> Self {
        Self {
            event_id: event.id,
            event_type: event.event_type,
            severity: event.severity,
            camera_id: event.camera_id.clone(),
            zone_id: event.zone_id.clone(),
            start_ts: event.start_ms,
            end_ts: event.end_ms,
            status: event.status,
            related_tracks: event.related_tracks.iter().copied().collect(),
            snapshot_ref: event.snapshot_ref.clone(),
        }
    }
}

/// Zone record wire shape: polygon as [[x,y],...] in image space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub zone_id: ZoneId,
    pub camera_id: CameraId,
    #[serde(rename = "type")]
    pub kind: ZoneKind,
    pub polygon: Vec<[f64; 2]>,
    #[serde(default)]
    pub version: u64,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}
