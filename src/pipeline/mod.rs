// src/pipeline/mod.rs
//
// Per-camera processing lanes and the engine that owns them. Each camera's
// stream is handled by one lane task, so all state for a camera is
// single-threaded and updates need no locking; cameras only share the zone
// registry snapshots and the outbound store/alert handles.

pub mod metrics;

use crate::aggregator::{EventAction, EventAggregator};
use crate::config::Config;
use crate::dispatcher::AlertDispatcher;
use crate::membership::ZoneStateTracker;
use crate::rules::RuleEvaluator;
use crate::store::StoreHandle;
use crate::types::{CameraId, Event, EventRecord, TrackUpdate};
use crate::zones::{ZoneRegistry, ZoneSnapshot};
use metrics::EngineMetrics;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Synchronous per-camera core: containment tracking, rule evaluation and
/// event aggregation for one camera's stream, in stream-time order.
pub struct CameraLane {
    camera_id: CameraId,
    registry: Arc<ZoneRegistry>,
    tracker: ZoneStateTracker,
    rules: RuleEvaluator,
    aggregator: EventAggregator,
    metrics: Arc<EngineMetrics>,
    /// Largest timestamp observed on this lane. Sweeps evaluate against
    /// this, never the wall clock, so replays behave like live streams.
    watermark_ms: f64,
    track_timeout_ms: f64,
}

impl CameraLane {
    pub fn new(
        camera_id: CameraId,
        config: &Config,
        registry: Arc<ZoneRegistry>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            camera_id,
            registry,
            tracker: ZoneStateTracker::new(config.hysteresis.clone()),
            rules: RuleEvaluator::new(config.rules.clone()),
            aggregator: EventAggregator::new(config.aggregator.clone()),
            metrics,
            watermark_ms: f64::NEG_INFINITY,
            track_timeout_ms: config.engine.track_timeout_ms,
        }
    }

    /// Run one track point through the full chain: containment hysteresis,
    /// rule table, event aggregation. Out-of-order points are dropped with
    /// a warning; they never corrupt lane state.
    pub fn process(&mut self, update: &TrackUpdate) -> Vec<EventAction> {
        self.metrics.inc(&self.metrics.track_points);
        self.watermark_ms = self.watermark_ms.max(update.point.ts_ms);

        let snapshot = self
            .registry
            .get_snapshot(&self.camera_id)
            .unwrap_or_else(|| ZoneSnapshot::empty(&self.camera_id));

        match self.tracker.observe(update, &snapshot) {
            Ok(closed) => {
                for membership in &closed {
                    debug!(
                        "Track {} visit to '{}' ended ({:.0}ms - {:.0}ms)",
                        membership.track_id,
                        membership.zone_id,
                        membership.entered_ms,
                        membership.exited_ms
                    );
                }
            }
            Err(e) => {
                self.metrics.inc(&self.metrics.out_of_order_dropped);
                warn!("Dropping track point on camera '{}': {}", self.camera_id, e);
                return Vec::new();
            }
        }

        let memberships = self.tracker.inside_memberships(update.track_id);
        let candidates = self.rules.evaluate(update, &memberships);

        let mut actions = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            self.metrics.inc(&self.metrics.candidates);
            let (_, action) = self.aggregator.ingest(candidate);
            self.note_action(&action);
            actions.push(action);
        }
        actions
    }

    /// Periodic sweep: expire silent tracks and close events whose grace
    /// window has elapsed relative to the lane watermark.
    pub fn sweep(&mut self) -> Vec<EventAction> {
        if self.watermark_ms.is_infinite() {
            return Vec::new();
        }

        let (expired, closed) = self
            .tracker
            .expire_tracks(self.watermark_ms, self.track_timeout_ms);
        for track_id in expired {
            self.rules.forget_track(track_id);
        }
        for membership in &closed {
            debug!(
                "Track {} visit to '{}' closed by timeout",
                membership.track_id, membership.zone_id
            );
        }

        let actions = self.aggregator.tick(self.watermark_ms);
        for action in &actions {
            self.note_action(action);
        }
        actions
    }

    /// Lane shutdown: every membership and open event is closed at the
    /// current watermark so nothing is left dangling.
    pub fn shutdown(&mut self) -> Vec<EventAction> {
        self.tracker.force_close_all();
        let shutdown_ms = if self.watermark_ms.is_finite() {
            self.watermark_ms
        } else {
            0.0
        };
        let actions = self.aggregator.force_close_all(shutdown_ms);
        for action in &actions {
            self.note_action(action);
        }
        actions
    }

    pub fn acknowledge(&mut self, event_id: Uuid) -> Option<Event> {
        self.aggregator.acknowledge(event_id)
    }

    pub fn open_events(&self) -> usize {
        self.aggregator.open_count()
    }

    fn note_action(&self, action: &EventAction) {
        match action {
            EventAction::Opened(_) => self.metrics.inc(&self.metrics.events_opened),
            EventAction::Extended(_) => self.metrics.inc(&self.metrics.events_extended),
            EventAction::SeverityUpgraded(_) => {
                self.metrics.inc(&self.metrics.severity_upgrades)
            }
            EventAction::Closed(_) => self.metrics.inc(&self.metrics.events_closed),
        }
    }
}

enum LaneMessage {
    Update(TrackUpdate),
    Acknowledge(Uuid),
}

struct LaneHandle {
    tx: mpsc::Sender<LaneMessage>,
    join: JoinHandle<()>,
}

/// Engine: routes track updates to per-camera lanes and owns their
/// lifecycles. Lanes are created lazily on the first update for a camera.
pub struct Engine {
    config: Config,
    registry: Arc<ZoneRegistry>,
    metrics: Arc<EngineMetrics>,
    store: StoreHandle,
    dispatcher: Arc<AlertDispatcher>,
    lanes: HashMap<CameraId, LaneHandle>,
}

impl Engine {
    pub fn new(
        config: Config,
        registry: Arc<ZoneRegistry>,
        store: StoreHandle,
        dispatcher: Arc<AlertDispatcher>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            config,
            registry,
            metrics,
            store,
            dispatcher,
            lanes: HashMap::new(),
        }
    }

    /// Feed one track update. Applies backpressure to the caller when the
    /// camera's lane queue is full rather than dropping the point.
    pub async fn submit(&mut self, update: TrackUpdate) {
        let camera_id = update.camera_id.clone();
        let lane = self.lane_for(&camera_id);
        if lane.tx.send(LaneMessage::Update(update)).await.is_err() {
            warn!("Lane for camera '{}' is gone, update dropped", camera_id);
        }
    }

    /// Operator acknowledgment of an open event. The owning lane is not
    /// known from the id alone, so every lane is asked; non-owners ignore it.
    pub async fn acknowledge(&mut self, event_id: Uuid) {
        for lane in self.lanes.values() {
            let _ = lane.tx.send(LaneMessage::Acknowledge(event_id)).await;
        }
    }

    /// Drain and stop every lane. Open events are force-closed at each
    /// lane's watermark and persisted on the way out.
    pub async fn shutdown(self) {
        info!("🛑 Engine shutting down, draining {} lane(s)", self.lanes.len());
        for (camera_id, lane) in self.lanes {
            drop(lane.tx);
            if let Err(e) = lane.join.await {
                warn!("Lane for camera '{}' ended abnormally: {}", camera_id, e);
            }
        }
    }

    fn lane_for(&mut self, camera_id: &str) -> &LaneHandle {
        if !self.lanes.contains_key(camera_id) {
            info!("📷 Starting lane for camera '{}'", camera_id);
            let lane = CameraLane::new(
                camera_id.to_string(),
                &self.config,
                self.registry.clone(),
                self.metrics.clone(),
            );
            let (tx, rx) = mpsc::channel(self.config.engine.lane_queue_capacity);
            let join = tokio::spawn(lane_task(
                lane,
                rx,
                self.store.clone(),
                self.dispatcher.clone(),
                Duration::from_millis(self.config.engine.sweep_interval_ms),
            ));
            self.lanes
                .insert(camera_id.to_string(), LaneHandle { tx, join });
        }
        &self.lanes[camera_id]
    }
}

async fn lane_task(
    mut lane: CameraLane,
    mut rx: mpsc::Receiver<LaneMessage>,
    store: StoreHandle,
    dispatcher: Arc<AlertDispatcher>,
    sweep_interval: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(LaneMessage::Update(update)) => {
                        forward(lane.process(&update), &store, &dispatcher);
                    }
                    Some(LaneMessage::Acknowledge(event_id)) => {
                        if let Some(event) = lane.acknowledge(event_id) {
                            store.persist(EventRecord::from(&event));
                        }
                    }
                    None => break,
                }
            }
            _ = sweep.tick() => {
                forward(lane.sweep(), &store, &dispatcher);
            }
        }
    }

    forward(lane.shutdown(), &store, &dispatcher);
    debug!("Lane for camera '{}' stopped", lane.camera_id);
}

/// Fan one batch of lifecycle transitions out to persistence and alerting.
/// Every transition is persisted; alerts fire on open and on severity
/// upgrade, with the gating left to the dispatcher.
fn forward(actions: Vec<EventAction>, store: &StoreHandle, dispatcher: &AlertDispatcher) {
    for action in actions {
        let record = EventRecord::from(action.event());
        match action {
            EventAction::Opened(_) | EventAction::SeverityUpgraded(_) => {
                dispatcher.dispatch(&record);
            }
            EventAction::Extended(_) | EventAction::Closed(_) => {}
        }
        store.persist(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HysteresisProfile;
    use crate::types::{
        EventStatus, EventType, ObjectClass, Point, Severity, TrackPoint, ZoneKind, ZoneRecord,
    };

    fn test_config() -> Config {
        let mut config = Config::default();
        config.hysteresis.default = HysteresisProfile {
            entry_samples: 2,
            exit_samples: 2,
            entry_dwell_ms: None,
        };
        config.aggregator.grace_ms = 5000.0;
        config
    }

    fn registry_with_danger_square() -> Arc<ZoneRegistry> {
        let registry = Arc::new(ZoneRegistry::new());
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
        registry
    }

    fn lane(config: &Config, registry: Arc<ZoneRegistry>) -> CameraLane {
        CameraLane::new(
            "cam1".to_string(),
            config,
            registry,
            Arc::new(EngineMetrics::new()),
        )
    }

    fn person_at(ts_ms: f64, x: f64, attributes: &[(&str, bool)]) -> TrackUpdate {
        TrackUpdate {
            camera_id: "cam1".to_string(),
            track_id: 42,
            class: ObjectClass::Person,
            point: TrackPoint {
                ts_ms,
                centroid: Point::new(x, 50.0),
                attributes: attributes
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect(),
            },
        }
    }

    /// Person in a danger zone at t=0..4s with a single-sample dropout at
    /// t=3s: exactly one event, start at the first containment hit, end at
    /// the last supporting sample.
    #[test]
    fn test_single_event_through_containment_dropout() {
        let config = test_config();
        let mut lane = lane(&config, registry_with_danger_square());

        // t=0: first hit, entry candidate only.
        assert!(lane.process(&person_at(0.0, 50.0, &[])).is_empty());

        // t=1s: entry confirmed, event opens with start at the onset.
        let actions = lane.process(&person_at(1000.0, 50.0, &[]));
        assert_eq!(actions.len(), 1);
        let opened = match &actions[0] {
            EventAction::Opened(e) => e.clone(),
            other => panic!("expected open, got {:?}", other),
        };
        assert_eq!(opened.event_type, EventType::ZoneViolation);
        assert_eq!(opened.start_ms, 0.0);
        assert_eq!(opened.severity, Severity::Critical);

        // t=2s: still inside, same event extends.
        let actions = lane.process(&person_at(2000.0, 50.0, &[]));
        assert!(matches!(&actions[0], EventAction::Extended(e) if e.id == opened.id));

        // t=3s: dropout sample outside; exit unconfirmed, no candidate.
        assert!(lane.process(&person_at(3000.0, 150.0, &[])).is_empty());

        // t=4s: back inside, the same event extends to 4s.
        let actions = lane.process(&person_at(4000.0, 50.0, &[]));
        match &actions[0] {
            EventAction::Extended(e) => {
                assert_eq!(e.id, opened.id);
                assert_eq!(e.end_ms, Some(4000.0));
            }
            other => panic!("expected extend, got {:?}", other),
        }

        // Stream moves on outside the zone; the sweep past the grace window
        // closes the one event with end at the last supporting sample.
        lane.process(&person_at(10_000.0, 150.0, &[]));
        let actions = lane.sweep();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            EventAction::Closed(e) => {
                assert_eq!(e.id, opened.id);
                assert_eq!(e.end_ms, Some(4000.0));
                assert_eq!(e.status, EventStatus::Closed);
            }
            other => panic!("expected close, got {:?}", other),
        }
        assert_eq!(lane.open_events(), 0);
    }

    /// Person without a helmet inside a danger zone: two events open
    /// simultaneously, same zone, distinct types, never merged.
    #[test]
    fn test_compound_violation_opens_two_events() {
        let config = test_config();
        let mut lane = lane(&config, registry_with_danger_square());

        lane.process(&person_at(0.0, 50.0, &[("helmet", false)]));
        let actions = lane.process(&person_at(1000.0, 50.0, &[("helmet", false)]));

        assert_eq!(actions.len(), 2);
        let mut types: Vec<EventType> = actions
            .iter()
            .map(|a| a.event().event_type)
            .collect();
        types.sort();
        assert_eq!(
            types,
            vec![EventType::ZoneViolation, EventType::PersonNoHelmet]
        );
        assert!(actions
            .iter()
            .all(|a| matches!(a, EventAction::Opened(_))));
        assert!(actions
            .iter()
            .all(|a| a.event().zone_id.as_deref() == Some("danger_a")));
        assert_eq!(lane.open_events(), 2);
    }

    /// Out-of-order points are dropped without disturbing the open event.
    #[test]
    fn test_out_of_order_point_dropped_not_fatal() {
        let config = test_config();
        let registry = registry_with_danger_square();
        let metrics = Arc::new(EngineMetrics::new());
        let mut lane =
            CameraLane::new("cam1".to_string(), &config, registry, metrics.clone());

        lane.process(&person_at(0.0, 50.0, &[]));
        lane.process(&person_at(1000.0, 50.0, &[]));
        assert_eq!(lane.open_events(), 1);

        let actions = lane.process(&person_at(500.0, 150.0, &[]));
        assert!(actions.is_empty());
        assert_eq!(
            metrics
                .out_of_order_dropped
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        assert_eq!(lane.open_events(), 1);
    }

    /// Shutdown closes open events at the lane watermark.
    #[test]
    fn test_shutdown_force_closes_at_watermark() {
        let config = test_config();
        let mut lane = lane(&config, registry_with_danger_square());

        lane.process(&person_at(0.0, 50.0, &[]));
        lane.process(&person_at(1000.0, 50.0, &[]));
        lane.process(&person_at(2500.0, 50.0, &[]));

        let actions = lane.shutdown();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            EventAction::Closed(e) => assert_eq!(e.end_ms, Some(2500.0)),
            other => panic!("expected close, got {:?}", other),
        }
    }

    /// Operator acknowledgment sticks: the event stays open, and the
    /// eventual close keeps the acknowledged status.
    #[test]
    fn test_acknowledged_event_survives_close() {
        let config = test_config();
        let mut lane = lane(&config, registry_with_danger_square());

        lane.process(&person_at(0.0, 50.0, &[]));
        let actions = lane.process(&person_at(1000.0, 50.0, &[]));
        let event_id = actions[0].event().id;

        let acked = lane.acknowledge(event_id);
        assert_eq!(acked.map(|e| e.status), Some(EventStatus::Acknowledged));
        assert!(lane.acknowledge(Uuid::new_v4()).is_none());

        let actions = lane.shutdown();
        assert_eq!(actions[0].event().status, EventStatus::Acknowledged);
    }

    /// A camera with no zone definitions still evaluates zone-independent
    /// rules like smoking.
    #[test]
    fn test_lane_without_zones_runs_zone_independent_rules() {
        let config = test_config();
        let mut lane = lane(&config, Arc::new(ZoneRegistry::new()));

        let actions = lane.process(&person_at(0.0, 50.0, &[("smoking", true)]));
        assert_eq!(actions.len(), 1);
        assert_eq!(
            actions[0].event().event_type,
            EventType::SmokingZoneViolation
        );
        assert_eq!(actions[0].event().zone_id, None);
    }

    /// Full async path: updates flow through the engine into the store and
    /// the log channel, and shutdown persists the close.
    #[tokio::test]
    async fn test_engine_end_to_end_persists_lifecycle() {
        use crate::config::{AlertingConfig, StoreConfig};
        use crate::store::{spawn_store_writer, JsonlEventStore};
        use uuid::Uuid;

        let dir = std::env::temp_dir().join(format!("rigwatch-engine-{}", Uuid::new_v4()));
        let mut config = test_config();
        config.store = StoreConfig {
            output_dir: dir.to_str().unwrap().to_string(),
            ..StoreConfig::default()
        };
        config.alerting = AlertingConfig {
            channels: vec![],
            ..AlertingConfig::default()
        };

        let registry = registry_with_danger_square();
        let metrics = Arc::new(EngineMetrics::new());
        let store = Box::new(JsonlEventStore::new(&config.store.output_dir).unwrap());
        let (store_handle, store_join) =
            spawn_store_writer(store, config.store.clone(), metrics.clone());
        let (dispatcher, _workers) =
            AlertDispatcher::with_channels(&config.alerting, vec![], metrics.clone());

        let mut engine = Engine::new(
            config,
            registry,
            store_handle,
            Arc::new(dispatcher),
            metrics.clone(),
        );

        for ts in [0.0, 1000.0, 2000.0] {
            engine.submit(person_at(ts, 50.0, &[])).await;
        }
        // Unknown id: broadcast to lanes, ignored by all of them.
        engine.acknowledge(Uuid::new_v4()).await;
        engine.shutdown().await;
        store_join.await.unwrap();

        let contents = std::fs::read_to_string(dir.join("events.jsonl")).unwrap();
        let records: Vec<EventRecord> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        // Open, extend, close: one line per transition, same event id.
        assert!(records.len() >= 3);
        assert!(records.iter().all(|r| r.event_id == records[0].event_id));
        let last = records.last().unwrap();
        assert_eq!(last.status, EventStatus::Closed);
        assert_eq!(last.start_ts, 0.0);
        assert_eq!(last.end_ts, Some(2000.0));

        std::fs::remove_dir_all(&dir).ok();
    }
}
