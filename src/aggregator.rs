// src/aggregator.rs
//
// EventAggregator: deduplicates violation candidates into Event entities
// with an open/extend/close lifecycle. One event is open per dedup key at
// any time; candidates arriving within the grace window extend it, a quiet
// key is closed by the periodic sweep, and a candidate after closure opens
// a brand new event rather than resurrecting the old one.

use crate::config::{AggregatorConfig, MergePolicy};
use crate::types::{
    CameraId, Event, EventStatus, EventType, ObjectClass, TrackId, ViolationCandidate, ZoneId,
};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Track dimension of the dedup key. Under the merge policies, candidates
/// from co-located tracks fold into one event instead of causing a storm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MergeScope {
    Track(TrackId),
    Class(ObjectClass),
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    event_type: EventType,
    camera_id: CameraId,
    zone_id: Option<ZoneId>,
    scope: MergeScope,
}

impl DedupKey {
    fn for_candidate(candidate: &ViolationCandidate, policy: MergePolicy) -> Self {
        let scope = match policy {
            MergePolicy::PerTrack => MergeScope::Track(candidate.track_id),
            MergePolicy::SameClass => MergeScope::Class(candidate.class),
            MergePolicy::AnyClass => MergeScope::Any,
        };
        Self {
            event_type: candidate.event_type,
            camera_id: candidate.camera_id.clone(),
            zone_id: candidate.zone_id.clone(),
            scope,
        }
    }
}

/// Lifecycle transition produced by the aggregator. The lane forwards every
/// one of these to the event store, and opened/upgraded ones to the
/// dispatcher when severity qualifies.
#[derive(Debug, Clone)]
pub enum EventAction {
    Opened(Event),
    Extended(Event),
    SeverityUpgraded(Event),
    Closed(Event),
}

impl EventAction {
    pub fn event(&self) -> &Event {
        match self {
            EventAction::Opened(e)
            | EventAction::Extended(e)
            | EventAction::SeverityUpgraded(e)
            | EventAction::Closed(e) => e,
        }
    }
}

struct OpenEntry {
    event: Event,
    last_candidate_ms: f64,
}

pub struct EventAggregator {
    config: AggregatorConfig,
    open: HashMap<DedupKey, OpenEntry>,
}

impl EventAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            open: HashMap::new(),
        }
    }

    /// Fold a candidate into the open event for its dedup key, creating one
    /// if none is open. Returns the event id and the resulting action.
    pub fn ingest(&mut self, candidate: ViolationCandidate) -> (Uuid, EventAction) {
        let key = DedupKey::for_candidate(&candidate, self.config.merge_policy);

        if let Some(entry) = self.open.get_mut(&key) {
            entry.last_candidate_ms = entry.last_candidate_ms.max(candidate.ts_ms);

            let end = entry.event.end_ms.unwrap_or(entry.event.start_ms);
            entry.event.end_ms = Some(end.max(candidate.ts_ms));

            let merged_new_track = entry.event.related_tracks.insert(candidate.track_id);
            if merged_new_track {
                debug!(
                    "Track {} merged into {} event {}",
                    candidate.track_id,
                    entry.event.event_type.as_str(),
                    entry.event.id
                );
            }

            if candidate.severity > entry.event.severity {
                let from = entry.event.severity;
                entry.event.severity = candidate.severity;
                info!(
                    "Event {} severity upgraded {} -> {}",
                    entry.event.id,
                    from.as_str(),
                    candidate.severity.as_str()
                );
                return (
                    entry.event.id,
                    EventAction::SeverityUpgraded(entry.event.clone()),
                );
            }

            return (entry.event.id, EventAction::Extended(entry.event.clone()));
        }

        let mut related_tracks = BTreeSet::new();
        related_tracks.insert(candidate.track_id);
        let event = Event {
            id: Uuid::new_v4(),
            event_type: candidate.event_type,
            severity: candidate.severity,
            camera_id: candidate.camera_id.clone(),
            zone_id: candidate.zone_id.clone(),
            start_ms: candidate.onset_ms,
            end_ms: None,
            status: EventStatus::Open,
            related_tracks,
            snapshot_ref: None,
        };
        info!(
            "Event {} opened: {} {} zone={} start={:.0}ms",
            event.id,
            event.severity.as_str(),
            event.event_type.as_str(),
            event.zone_id.as_deref().unwrap_or("-"),
            event.start_ms
        );

        let id = event.id;
        let action = EventAction::Opened(event.clone());
        self.open.insert(
            key,
            OpenEntry {
                event,
                last_candidate_ms: candidate.ts_ms,
            },
        );
        (id, action)
    }

    /// Grace-window sweep. Closes every open event whose key has been quiet
    /// for longer than the grace period relative to the stream watermark.
    /// The closed event's end_ts is the last supporting candidate time.
    pub fn tick(&mut self, watermark_ms: f64) -> Vec<EventAction> {
        let grace = self.config.grace_ms;
        let expired: Vec<DedupKey> = self
            .open
            .iter()
            .filter(|(_, entry)| watermark_ms - entry.last_candidate_ms > grace)
            .map(|(key, _)| key.clone())
            .collect();

        let mut actions = Vec::new();
        for key in expired {
            let entry = self.open.remove(&key).unwrap();
            actions.push(close_entry(entry, None));
        }
        actions
    }

    /// Lane shutdown: force-close every open event with end_ts at shutdown
    /// (stream) time rather than leaving them open indefinitely.
    pub fn force_close_all(&mut self, shutdown_ms: f64) -> Vec<EventAction> {
        if !self.open.is_empty() {
            warn!(
                "Force-closing {} open event(s) at shutdown ({:.0}ms)",
                self.open.len(),
                shutdown_ms
            );
        }
        let entries: Vec<OpenEntry> = self.open.drain().map(|(_, e)| e).collect();
        entries
            .into_iter()
            .map(|entry| close_entry(entry, Some(shutdown_ms)))
            .collect()
    }

    /// Operator acknowledgment. An external mutation, never performed by
    /// the engine itself; closed events are acknowledged through the store.
    pub fn acknowledge(&mut self, event_id: Uuid) -> Option<Event> {
        for entry in self.open.values_mut() {
            if entry.event.id == event_id {
                entry.event.status = EventStatus::Acknowledged;
                info!("Event {} acknowledged by operator", event_id);
                return Some(entry.event.clone());
            }
        }
        None
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

fn close_entry(mut entry: OpenEntry, override_end_ms: Option<f64>) -> EventAction {
    let end = override_end_ms.unwrap_or(entry.last_candidate_ms);
    entry.event.end_ms = Some(end);
    if entry.event.status != EventStatus::Acknowledged {
        entry.event.status = EventStatus::Closed;
    }
    info!(
        "Event {} closed: {} end={:.0}ms tracks={:?}",
        entry.event.id,
        entry.event.event_type.as_str(),
        end,
        entry.event.related_tracks
    );
    EventAction::Closed(entry.event)
}
