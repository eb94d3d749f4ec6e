// src/membership.rs
//
// ZoneStateTracker: per (track, zone) membership state machine with
// hysteresis. Raw centroid jitter near a polygon boundary would otherwise
// flap memberships every frame; entry and exit both require a configured
// run of consecutive samples (or a dwell time) before they are accepted,
// while a single contradicting sample inside the window is treated as noise.

use crate::config::HysteresisConfig;
use crate::errors::EngineError;
use crate::types::{ObjectClass, TrackId, TrackUpdate, ZoneId, ZoneKind};
use crate::zones::ZoneSnapshot;
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MembershipState {
    /// First containment hit seen; waiting for the hysteresis threshold.
    EnteringCandidate,
    Inside,
    /// Containment lost; waiting for the exit window before closing.
    ExitingCandidate,
}

/// Active membership of one track in one zone. At most one per (track, zone)
/// pair; `Outside` is represented by absence.
#[derive(Debug, Clone)]
pub struct Membership {
    pub zone_id: ZoneId,
    pub zone_kind: ZoneKind,
    pub state: MembershipState,
    /// First containment hit of the accepted run. Survives an exit
    /// candidate that reverts to Inside.
    pub entered_ms: f64,
    /// Timestamp of the most recent contained sample.
    pub last_inside_ms: f64,
    pub(crate) consecutive_hits: u32,
    pub(crate) consecutive_misses: u32,
}

/// A membership that reached `Inside` and has now been confirmed closed.
#[derive(Debug, Clone)]
pub struct ClosedMembership {
    pub track_id: TrackId,
    pub zone_id: ZoneId,
    pub entered_ms: f64,
    pub exited_ms: f64,
}

#[derive(Debug, Clone)]
struct TrackMeta {
    class: ObjectClass,
    last_ts_ms: f64,
}

pub struct ZoneStateTracker {
    hysteresis: HysteresisConfig,
    memberships: HashMap<(TrackId, ZoneId), Membership>,
    tracks: HashMap<TrackId, TrackMeta>,
}

impl ZoneStateTracker {
    pub fn new(hysteresis: HysteresisConfig) -> Self {
        Self {
            hysteresis,
            memberships: HashMap::new(),
            tracks: HashMap::new(),
        }
    }

    /// Feed one track point through the containment state machines for every
    /// active zone in the snapshot. Returns memberships that were confirmed
    /// closed by this sample.
    ///
    /// Timestamps must be strictly increasing per track; out-of-order points
    /// are rejected, not reordered.
    pub fn observe(
        &mut self,
        update: &TrackUpdate,
        snapshot: &ZoneSnapshot,
    ) -> Result<Vec<ClosedMembership>, EngineError> {
        let track_id = update.track_id;
        let ts_ms = update.point.ts_ms;

        if let Some(meta) = self.tracks.get(&track_id) {
            if ts_ms <= meta.last_ts_ms {
                return Err(EngineError::OutOfOrderPoint {
                    track_id,
                    ts_ms,
                    last_ts_ms: meta.last_ts_ms,
                });
            }
        }
        self.tracks.insert(
            track_id,
            TrackMeta {
                class: update.class,
                last_ts_ms: ts_ms,
            },
        );

        let mut closed = Vec::new();

        for zone in snapshot.active_zones() {
            let hit = zone.contains(update.point.centroid);
            let key = (track_id, zone.id.clone());
            let profile = self.hysteresis.profile_for(zone.kind);

            match self.memberships.get_mut(&key) {
                None => {
                    if hit {
                        let mut membership = Membership {
                            zone_id: zone.id.clone(),
                            zone_kind: zone.kind,
                            state: MembershipState::EnteringCandidate,
                            entered_ms: ts_ms,
                            last_inside_ms: ts_ms,
                            consecutive_hits: 1,
                            consecutive_misses: 0,
                        };
                        if profile.entry_samples <= 1 {
                            membership.state = MembershipState::Inside;
                            info!(
                                "Track {} entered zone '{}' at {:.0}ms",
                                track_id, zone.id, ts_ms
                            );
                        }
                        self.memberships.insert(key, membership);
                    }
                }
                Some(membership) => match membership.state {
                    MembershipState::EnteringCandidate => {
                        if hit {
                            membership.consecutive_hits += 1;
                            membership.last_inside_ms = ts_ms;
                            let dwell_ok = profile
                                .entry_dwell_ms
                                .map(|d| ts_ms - membership.entered_ms >= d)
                                .unwrap_or(false);
                            if membership.consecutive_hits >= profile.entry_samples || dwell_ok {
                                membership.state = MembershipState::Inside;
                                info!(
                                    "Track {} entered zone '{}' at {:.0}ms ({} samples)",
                                    track_id,
                                    zone.id,
                                    membership.entered_ms,
                                    membership.consecutive_hits
                                );
                            }
                        } else {
                            // One contradicting sample in the candidate
                            // window: noise, back to Outside.
                            debug!(
                                "Track {} entry candidate for '{}' rejected as noise",
                                track_id, zone.id
                            );
                            self.memberships.remove(&key);
                        }
                    }
                    MembershipState::Inside => {
                        if hit {
                            membership.last_inside_ms = ts_ms;
                        } else {
                            membership.state = MembershipState::ExitingCandidate;
                            membership.consecutive_misses = 1;
                            if profile.exit_samples <= 1 {
                                closed.push(ClosedMembership {
                                    track_id,
                                    zone_id: zone.id.clone(),
                                    entered_ms: membership.entered_ms,
                                    exited_ms: membership.last_inside_ms,
                                });
                                self.memberships.remove(&key);
                            }
                        }
                    }
                    MembershipState::ExitingCandidate => {
                        if hit {
                            // Reappearance within the window: still the same
                            // visit, original entered timestamp preserved.
                            membership.state = MembershipState::Inside;
                            membership.consecutive_misses = 0;
                            membership.last_inside_ms = ts_ms;
                        } else {
                            membership.consecutive_misses += 1;
                            if membership.consecutive_misses >= profile.exit_samples {
                                info!(
                                    "Track {} exited zone '{}' at {:.0}ms",
                                    track_id, zone.id, membership.last_inside_ms
                                );
                                closed.push(ClosedMembership {
                                    track_id,
                                    zone_id: zone.id.clone(),
                                    entered_ms: membership.entered_ms,
                                    exited_ms: membership.last_inside_ms,
                                });
                                self.memberships.remove(&key);
                            }
                        }
                    }
                },
            }
        }

        // Drop memberships for zones no longer present or deactivated in the
        // latest snapshot.
        self.memberships.retain(|(tid, zone_id), m| {
            if *tid != track_id {
                return true;
            }
            if snapshot.active_zones().any(|z| z.id == *zone_id) {
                return true;
            }
            debug!(
                "Membership of track {} in retired zone '{}' dropped (state {:?})",
                tid, zone_id, m.state
            );
            false
        });

        Ok(closed)
    }

    /// Memberships that currently count as Inside for rule evaluation.
    /// Exit candidates are excluded: the object is provisionally out.
    pub fn inside_memberships(&self, track_id: TrackId) -> Vec<&Membership> {
        self.memberships
            .iter()
            .filter(|((tid, _), m)| *tid == track_id && m.state == MembershipState::Inside)
            .map(|(_, m)| m)
            .collect()
    }

    pub fn class_of(&self, track_id: TrackId) -> Option<ObjectClass> {
        self.tracks.get(&track_id).map(|m| m.class)
    }

    /// Force-close memberships of tracks that have gone silent for longer
    /// than `timeout_ms` of stream time, and forget the tracks. Track ids
    /// are never reused by the external tracker, so the state is dead.
    /// Returns the expired track ids and the memberships closed by them.
    pub fn expire_tracks(
        &mut self,
        watermark_ms: f64,
        timeout_ms: f64,
    ) -> (Vec<TrackId>, Vec<ClosedMembership>) {
        let expired: Vec<TrackId> = self
            .tracks
            .iter()
            .filter(|(_, meta)| watermark_ms - meta.last_ts_ms > timeout_ms)
            .map(|(id, _)| *id)
            .collect();

        let mut closed = Vec::new();
        for track_id in &expired {
            debug!("Track {} timed out, force-closing memberships", track_id);
            closed.extend(self.close_track(*track_id));
            self.tracks.remove(track_id);
        }
        (expired, closed)
    }

    /// Force-close everything (lane shutdown).
    pub fn force_close_all(&mut self) -> Vec<ClosedMembership> {
        let track_ids: Vec<TrackId> = self.tracks.keys().copied().collect();
        let mut closed = Vec::new();
        for track_id in track_ids {
            closed.extend(self.close_track(track_id));
        }
        self.tracks.clear();
        closed
    }

    fn close_track(&mut self, track_id: TrackId) -> Vec<ClosedMembership> {
        let keys: Vec<(TrackId, ZoneId)> = self
            .memberships
            .keys()
            .filter(|(tid, _)| *tid == track_id)
            .cloned()
            .collect();

        let mut closed = Vec::new();
        for key in keys {
            let membership = self.memberships.remove(&key).unwrap();
            // Entry candidates never became real memberships.
            if membership.state != MembershipState::EnteringCandidate {
                closed.push(ClosedMembership {
                    track_id,
                    zone_id: membership.zone_id,
                    entered_ms: membership.entered_ms,
                    exited_ms: membership.last_inside_ms,
                });
            }
        }
        closed
    }

    #[cfg(test)]
    pub fn membership(&self, track_id: TrackId, zone_id: &str) -> Option<&Membership> {
        self.memberships.get(&(track_id, zone_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HysteresisProfile;
    use crate::types::{Point, TrackPoint, ZoneRecord};
    use crate::zones::ZoneRegistry;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc;

    fn snapshot_with_square() -> Arc<ZoneSnapshot> {
        let registry = ZoneRegistry::new();
        registry
            .update(ZoneRecord {
                zone_id: "danger_a".to_string(),
                camera_id: "cam1".to_string(),
                kind: ZoneKind::Danger,
                polygon: vec![[0.0, 0.0], [100.0, 0.0], [100.0, 100.0], [0.0, 100.0]],
                version: 0,
                active: true,
            })
            .unwrap();
        registry.get_snapshot("cam1").unwrap()
    }

    fn hysteresis(entry: u32, exit: u32) -> HysteresisConfig {
        HysteresisConfig {
            default: HysteresisProfile {
                entry_samples: entry,
                exit_samples: exit,
                entry_dwell_ms: None,
            },
            overrides: StdHashMap::new(),
        }
    }

    fn update_at(ts_ms: f64, x: f64, y: f64) -> TrackUpdate {
        TrackUpdate {
            camera_id: "cam1".to_string(),
            track_id: 1,
            class: ObjectClass::Person,
            point: TrackPoint {
                ts_ms,
                centroid: Point::new(x, y),
                attributes: StdHashMap::new(),
            },
        }
    }

    #[test]
    fn test_entry_requires_consecutive_hits() {
        let snapshot = snapshot_with_square();
        let mut tracker = ZoneStateTracker::new(hysteresis(2, 2));

        tracker.observe(&update_at(0.0, 50.0, 50.0), &snapshot).unwrap();
        assert_eq!(
            tracker.membership(1, "danger_a").unwrap().state,
            MembershipState::EnteringCandidate
        );
        assert!(tracker.inside_memberships(1).is_empty());

        tracker.observe(&update_at(1000.0, 50.0, 50.0), &snapshot).unwrap();
        let m = tracker.membership(1, "danger_a").unwrap();
        assert_eq!(m.state, MembershipState::Inside);
        assert_eq!(m.entered_ms, 0.0);
    }

    #[test]
    fn test_single_noisy_sample_rejects_entry_candidate() {
        let snapshot = snapshot_with_square();
        let mut tracker = ZoneStateTracker::new(hysteresis(3, 2));

        tracker.observe(&update_at(0.0, 50.0, 50.0), &snapshot).unwrap();
        tracker.observe(&update_at(1000.0, 50.0, 50.0), &snapshot).unwrap();
        // One contradicting sample before confirmation: back to Outside.
        tracker.observe(&update_at(2000.0, 150.0, 50.0), &snapshot).unwrap();
        assert!(tracker.membership(1, "danger_a").is_none());

        // The flicker never produced an Inside state.
        assert!(tracker.inside_memberships(1).is_empty());
    }

    #[test]
    fn test_exit_reappearance_keeps_entered_timestamp() {
        let snapshot = snapshot_with_square();
        let mut tracker = ZoneStateTracker::new(hysteresis(2, 2));

        tracker.observe(&update_at(0.0, 50.0, 50.0), &snapshot).unwrap();
        tracker.observe(&update_at(1000.0, 50.0, 50.0), &snapshot).unwrap();
        // Blip outside for a single sample.
        tracker.observe(&update_at(2000.0, 150.0, 50.0), &snapshot).unwrap();
        assert_eq!(
            tracker.membership(1, "danger_a").unwrap().state,
            MembershipState::ExitingCandidate
        );
        tracker.observe(&update_at(3000.0, 50.0, 50.0), &snapshot).unwrap();

        let m = tracker.membership(1, "danger_a").unwrap();
        assert_eq!(m.state, MembershipState::Inside);
        assert_eq!(m.entered_ms, 0.0, "original entered timestamp preserved");
    }

    #[test]
    fn test_confirmed_exit_closes_with_last_inside_timestamp() {
        let snapshot = snapshot_with_square();
        let mut tracker = ZoneStateTracker::new(hysteresis(2, 2));

        tracker.observe(&update_at(0.0, 50.0, 50.0), &snapshot).unwrap();
        tracker.observe(&update_at(1000.0, 50.0, 50.0), &snapshot).unwrap();
        tracker.observe(&update_at(2000.0, 150.0, 50.0), &snapshot).unwrap();
        let closed = tracker.observe(&update_at(3000.0, 150.0, 50.0), &snapshot).unwrap();

        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].entered_ms, 0.0);
        assert_eq!(closed[0].exited_ms, 1000.0);
        assert!(tracker.membership(1, "danger_a").is_none());
    }

    #[test]
    fn test_dwell_based_entry() {
        let snapshot = snapshot_with_square();
        let mut config = hysteresis(100, 2); // sample count effectively unreachable
        config.default.entry_dwell_ms = Some(1500.0);
        let mut tracker = ZoneStateTracker::new(config);

        tracker.observe(&update_at(0.0, 50.0, 50.0), &snapshot).unwrap();
        tracker.observe(&update_at(1000.0, 50.0, 50.0), &snapshot).unwrap();
        assert_eq!(
            tracker.membership(1, "danger_a").unwrap().state,
            MembershipState::EnteringCandidate
        );
        tracker.observe(&update_at(1600.0, 50.0, 50.0), &snapshot).unwrap();
        assert_eq!(
            tracker.membership(1, "danger_a").unwrap().state,
            MembershipState::Inside
        );
    }

    #[test]
    fn test_out_of_order_points_rejected() {
        let snapshot = snapshot_with_square();
        let mut tracker = ZoneStateTracker::new(hysteresis(2, 2));

        tracker.observe(&update_at(1000.0, 50.0, 50.0), &snapshot).unwrap();
        let err = tracker.observe(&update_at(1000.0, 50.0, 50.0), &snapshot);
        assert!(matches!(err, Err(EngineError::OutOfOrderPoint { .. })));
        let err = tracker.observe(&update_at(500.0, 50.0, 50.0), &snapshot);
        assert!(matches!(err, Err(EngineError::OutOfOrderPoint { .. })));
        // Track continues from its last good point.
        tracker.observe(&update_at(2000.0, 50.0, 50.0), &snapshot).unwrap();
        assert_eq!(
            tracker.membership(1, "danger_a").unwrap().state,
            MembershipState::Inside
        );
    }

    #[test]
    fn test_track_timeout_force_closes_membership() {
        let snapshot = snapshot_with_square();
        let mut tracker = ZoneStateTracker::new(hysteresis(2, 2));

        tracker.observe(&update_at(0.0, 50.0, 50.0), &snapshot).unwrap();
        tracker.observe(&update_at(1000.0, 50.0, 50.0), &snapshot).unwrap();

        let (expired, closed) = tracker.expire_tracks(5000.0, 10_000.0);
        assert!(expired.is_empty() && closed.is_empty());

        let (expired, closed) = tracker.expire_tracks(12_000.0, 10_000.0);
        assert_eq!(expired, vec![1]);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exited_ms, 1000.0);
        assert!(tracker.class_of(1).is_none());
    }
}
