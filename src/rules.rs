// src/rules.rs
//
// ComplianceRuleEvaluator: pure function of (object class, zone kind,
// membership state, attributes) -> violation candidates. Runs once per new
// track point and consults the *current* membership state rather than
// recomputing containment. Only loitering keeps state here: a sliding
// window of recent centroids per track.

use crate::config::RulesConfig;
use crate::membership::Membership;
use crate::types::{
    EventType, ObjectClass, Point, Severity, TrackId, TrackUpdate, ViolationCandidate, ZoneKind,
};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

pub fn default_severity(event_type: EventType) -> Severity {
    match event_type {
        EventType::ZoneViolation => Severity::Critical,
        EventType::PersonNoHelmet => Severity::High,
        EventType::SmokingZoneViolation => Severity::High,
        EventType::VesselUnauthorized => Severity::Medium,
        EventType::HelicopterLanding => Severity::Low,
        EventType::LoiteringDetected => Severity::Medium,
    }
}

pub struct RuleEvaluator {
    config: RulesConfig,
    loiter_windows: HashMap<TrackId, LoiterWindow>,
}

impl RuleEvaluator {
    pub fn new(config: RulesConfig) -> Self {
        Self {
            config,
            loiter_windows: HashMap::new(),
        }
    }

    /// Evaluate the rule table for one sample. An object satisfying several
    /// rules at once emits one candidate per rule; candidates for distinct
    /// event types are never merged downstream.
    pub fn evaluate(
        &mut self,
        update: &TrackUpdate,
        memberships: &[&Membership],
    ) -> Vec<ViolationCandidate> {
        let mut candidates = Vec::new();
        let ts_ms = update.point.ts_ms;

        if update.class == ObjectClass::Unknown {
            debug!(
                "Track {}: unknown object class, rule evaluation skipped",
                update.track_id
            );
            return candidates;
        }

        let candidate = |event_type: EventType, zone_id: Option<String>, onset_ms: f64| {
            ViolationCandidate {
                event_type,
                camera_id: update.camera_id.clone(),
                zone_id,
                track_id: update.track_id,
                class: update.class,
                ts_ms,
                onset_ms,
                severity: default_severity(event_type),
            }
        };

        for membership in memberships {
            match (update.class, membership.zone_kind) {
                (ObjectClass::Person, ZoneKind::Danger) => {
                    candidates.push(candidate(
                        EventType::ZoneViolation,
                        Some(membership.zone_id.clone()),
                        membership.entered_ms,
                    ));
                }
                (ObjectClass::Vessel, ZoneKind::Berth) => {
                    if update.point.flag("authorized") != Some(true) {
                        candidates.push(candidate(
                            EventType::VesselUnauthorized,
                            Some(membership.zone_id.clone()),
                            membership.entered_ms,
                        ));
                    }
                }
                (ObjectClass::Helicopter, ZoneKind::Helipad) => {
                    candidates.push(candidate(
                        EventType::HelicopterLanding,
                        Some(membership.zone_id.clone()),
                        membership.entered_ms,
                    ));
                }
                (_, ZoneKind::Unknown) => {
                    debug!(
                        "Track {}: membership in zone '{}' of unknown kind ignored",
                        update.track_id, membership.zone_id
                    );
                }
                _ => {}
            }

            // Helmet compliance: enforced for persons inside PPE zone kinds.
            // An unreported helmet attribute is not a violation.
            if update.class == ObjectClass::Person
                && self.config.ppe_zone_kinds.contains(&membership.zone_kind)
                && update.point.flag("helmet") == Some(false)
            {
                candidates.push(candidate(
                    EventType::PersonNoHelmet,
                    Some(membership.zone_id.clone()),
                    membership.entered_ms,
                ));
            }
        }

        // Smoking is only legal inside a designated smoking zone.
        if update.class == ObjectClass::Person && update.point.flag("smoking") == Some(true) {
            let in_smoking_zone = memberships
                .iter()
                .any(|m| m.zone_kind == ZoneKind::Smoking);
            if !in_smoking_zone {
                candidates.push(candidate(EventType::SmokingZoneViolation, None, ts_ms));
            }
        }

        // Loitering: any class, zone-independent.
        if let Some(onset_ms) = self.update_loiter_window(update) {
            candidates.push(candidate(EventType::LoiteringDetected, None, onset_ms));
        }

        candidates
    }

    /// Push the sample into the track's centroid window and report the
    /// window start timestamp if the loitering condition holds.
    fn update_loiter_window(&mut self, update: &TrackUpdate) -> Option<f64> {
        let window = self
            .loiter_windows
            .entry(update.track_id)
            .or_insert_with(LoiterWindow::new);
        window.push(update.point.ts_ms, update.point.centroid, &self.config.loitering)
    }

    /// Drop loitering state for a terminated track.
    pub fn forget_track(&mut self, track_id: TrackId) {
        self.loiter_windows.remove(&track_id);
    }
}

struct LoiterWindow {
    samples: VecDeque<(f64, Point)>,
}

impl LoiterWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    fn push(
        &mut self,
        ts_ms: f64,
        centroid: Point,
        config: &crate::config::LoiteringConfig,
    ) -> Option<f64> {
        self.samples.push_back((ts_ms, centroid));

        // Keep one sample at or before the window boundary so the retained
        // span can actually reach window_ms.
        let boundary = ts_ms - config.window_ms;
        while self.samples.len() >= 2 && self.samples[1].0 <= boundary {
            self.samples.pop_front();
        }

        let (front_ts, _) = *self.samples.front()?;
        if ts_ms - front_ts < config.window_ms {
            return None;
        }

        let (mut min_x, mut max_x) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut min_y, mut max_y) = (f64::INFINITY, f64::NEG_INFINITY);
        for (_, p) in &self.samples {
            min_x = min_x.min(p.x);
            max_x = max_x.max(p.x);
            min_y = min_y.min(p.y);
            max_y = max_y.max(p.y);
        }
        let diagonal = ((max_x - min_x).powi(2) + (max_y - min_y).powi(2)).sqrt();

        if diagonal < config.max_displacement_px {
            Some(front_ts)
        } else {
            None
        }
    }
}
