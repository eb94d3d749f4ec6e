// src/zones.rs
//
// PolygonRegistry: versioned zone definitions per camera with copy-on-write
// snapshot publication. Readers take an immutable Arc snapshot and never
// observe a partially updated polygon set; writes are serialized behind the
// registry lock and bump the zone's version.

use crate::errors::EngineError;
use crate::types::{CameraId, Point, ZoneId, ZoneKind, ZoneRecord};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Coincident-vertex rejection threshold (pixels).
const MIN_VERTEX_SEPARATION: f64 = 1e-6;

/// Tolerance for classifying a point as on a polygon edge.
const EDGE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct Zone {
    pub id: ZoneId,
    pub camera_id: CameraId,
    pub kind: ZoneKind,
    pub polygon: Vec<Point>,
    pub active: bool,
    pub version: u64,
}

impl Zone {
    /// Point-in-polygon containment. Boundary points are classified as
    /// inside (closed region), so an object standing exactly on the painted
    /// line is in the zone.
    pub fn contains(&self, point: Point) -> bool {
        let polygon = &self.polygon;
        let n = polygon.len();
        if n < 3 {
            return false;
        }

        // Boundary first: edge points would otherwise depend on ray direction.
        let mut j = n - 1;
        for i in 0..n {
            if point_on_segment(point, polygon[j], polygon[i]) {
                return true;
            }
            j = i;
        }

        // Standard even-odd ray cast, ray towards +x.
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (a, b) = (polygon[i], polygon[j]);
            if (a.y > point.y) != (b.y > point.y) {
                let x_cross = b.x + (point.y - b.y) * (a.x - b.x) / (a.y - b.y);
                if point.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

fn point_on_segment(p: Point, a: Point, b: Point) -> bool {
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    let scale = (b.x - a.x).abs().max((b.y - a.y).abs()).max(1.0);
    if cross.abs() > EDGE_EPSILON * scale {
        return false;
    }
    let within_x = p.x >= a.x.min(b.x) - EDGE_EPSILON && p.x <= a.x.max(b.x) + EDGE_EPSILON;
    let within_y = p.y >= a.y.min(b.y) - EDGE_EPSILON && p.y <= a.y.max(b.y) + EDGE_EPSILON;
    within_x && within_y
}

/// Immutable, consistent view of one camera's zones. Ordered by zone id.
#[derive(Debug)]
pub struct ZoneSnapshot {
    pub camera_id: CameraId,
    zones: Vec<Arc<Zone>>,
}

impl ZoneSnapshot {
    /// Snapshot for a camera with no zone definitions yet. Zone-independent
    /// rules still run against it.
    pub fn empty(camera_id: &str) -> Arc<Self> {
        Arc::new(Self {
            camera_id: camera_id.to_string(),
            zones: Vec::new(),
        })
    }

    /// Zones eligible for containment tests (active only).
    pub fn active_zones(&self) -> impl Iterator<Item = &Arc<Zone>> {
        self.zones.iter().filter(|z| z.active)
    }

    pub fn get(&self, zone_id: &str) -> Option<&Arc<Zone>> {
        self.zones.iter().find(|z| z.id == zone_id)
    }
}

pub struct ZoneRegistry {
    cameras: RwLock<HashMap<CameraId, Arc<ZoneSnapshot>>>,
}

impl ZoneRegistry {
    pub fn new() -> Self {
        Self {
            cameras: RwLock::new(HashMap::new()),
        }
    }

    /// Latest committed snapshot for a camera. Lock held only for the Arc
    /// clone; callers evaluate against the snapshot without further locking.
    pub fn get_snapshot(&self, camera_id: &str) -> Option<Arc<ZoneSnapshot>> {
        self.cameras
            .read()
            .expect("zone registry lock poisoned")
            .get(camera_id)
            .cloned()
    }

    /// Validate and publish a zone definition. Publishing replaces the whole
    /// camera snapshot atomically; in-flight readers keep the previous
    /// version. Returns the committed version number.
    pub fn update(&self, record: ZoneRecord) -> Result<u64, EngineError> {
        validate_polygon(&record)?;

        let polygon: Vec<Point> = record
            .polygon
            .iter()
            .map(|[x, y]| Point::new(*x, *y))
            .collect();

        let mut cameras = self.cameras.write().expect("zone registry lock poisoned");
        let previous = cameras.get(&record.camera_id);

        let prev_version = previous
            .and_then(|snap| snap.get(&record.zone_id))
            .map(|z| z.version)
            .unwrap_or(0);
        let version = prev_version + 1;

        let zone = Arc::new(Zone {
            id: record.zone_id.clone(),
            camera_id: record.camera_id.clone(),
            kind: record.kind,
            polygon,
            active: record.active,
            version,
        });

        let mut zones: Vec<Arc<Zone>> = previous
            .map(|snap| {
                snap.zones
                    .iter()
                    .filter(|z| z.id != record.zone_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        zones.push(zone);
        zones.sort_by(|a, b| a.id.cmp(&b.id));

        cameras.insert(
            record.camera_id.clone(),
            Arc::new(ZoneSnapshot {
                camera_id: record.camera_id.clone(),
                zones,
            }),
        );

        info!(
            "Zone '{}' on camera '{}' committed at version {} ({})",
            record.zone_id,
            record.camera_id,
            version,
            record.kind.as_str()
        );
        Ok(version)
    }

    /// Bulk-load zone definitions (startup path). Invalid zones are rejected
    /// individually; the rest still commit.
    pub fn load(&self, records: Vec<ZoneRecord>) -> usize {
        let mut committed = 0;
        for record in records {
            match self.update(record) {
                Ok(_) => committed += 1,
                Err(e) => warn!("Rejected zone definition: {}", e),
            }
        }
        committed
    }
}

fn validate_polygon(record: &ZoneRecord) -> Result<(), EngineError> {
    if record.kind == ZoneKind::Unknown {
        return Err(EngineError::UnknownZoneType(record.zone_id.clone()));
    }
    if record.polygon.len() < 3 {
        return Err(EngineError::InvalidZoneGeometry {
            zone_id: record.zone_id.clone(),
            reason: format!("{} vertices, need at least 3", record.polygon.len()),
        });
    }
    let n = record.polygon.len();
    for i in 0..n {
        let [ax, ay] = record.polygon[i];
        let [bx, by] = record.polygon[(i + 1) % n];
        if (ax - bx).abs() < MIN_VERTEX_SEPARATION && (ay - by).abs() < MIN_VERTEX_SEPARATION {
            return Err(EngineError::InvalidZoneGeometry {
                zone_id: record.zone_id.clone(),
                reason: format!("coincident consecutive vertices at index {}", i),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_record(zone_id: &str, camera_id: &str, kind: ZoneKind) -> ZoneRecord {
        ZoneRecord {
            zone_id: zone_id.to_string(),
            camera_id: camera_id.to_string(),
            kind,
            polygon: vec![[0.0, 0.0], [100.0, 0.0], [100.0, 100.0], [0.0, 100.0]],
            version: 0,
            active: true,
        }
    }

    /// Reference ray-cast without the boundary special case, used to
    /// cross-check strictly-interior and strictly-exterior points.
    fn reference_contains(polygon: &[Point], p: Point) -> bool {
        let n = polygon.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (a, b) = (polygon[i], polygon[j]);
            if (a.y > p.y) != (b.y > p.y)
                && p.x < b.x + (p.y - b.y) * (a.x - b.x) / (a.y - b.y)
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    #[test]
    fn test_contains_agrees_with_reference_off_boundary() {
        let registry = ZoneRegistry::new();
        // Concave "L" shape.
        let record = ZoneRecord {
            zone_id: "l_shape".to_string(),
            camera_id: "cam1".to_string(),
            kind: ZoneKind::Danger,
            polygon: vec![
                [0.0, 0.0],
                [100.0, 0.0],
                [100.0, 40.0],
                [40.0, 40.0],
                [40.0, 100.0],
                [0.0, 100.0],
            ],
            version: 0,
            active: true,
        };
        registry.update(record).unwrap();
        let snapshot = registry.get_snapshot("cam1").unwrap();
        let zone = snapshot.get("l_shape").unwrap();

        let probes = [
            Point::new(20.0, 20.0),
            Point::new(80.0, 20.0),
            Point::new(80.0, 80.0), // in the notch, outside
            Point::new(20.0, 80.0),
            Point::new(-5.0, 50.0),
            Point::new(41.0, 41.0),
            Point::new(39.0, 99.0),
        ];
        for p in probes {
            assert_eq!(
                zone.contains(p),
                reference_contains(&zone.polygon, p),
                "disagreement at ({}, {})",
                p.x,
                p.y
            );
        }
    }

    #[test]
    fn test_boundary_points_are_inside() {
        let registry = ZoneRegistry::new();
        registry
            .update(square_record("danger_a", "cam1", ZoneKind::Danger))
            .unwrap();
        let snapshot = registry.get_snapshot("cam1").unwrap();
        let zone = snapshot.get("danger_a").unwrap();

        assert!(zone.contains(Point::new(0.0, 0.0)), "vertex");
        assert!(zone.contains(Point::new(50.0, 0.0)), "edge midpoint");
        assert!(zone.contains(Point::new(100.0, 100.0)), "far vertex");
        assert!(zone.contains(Point::new(0.0, 37.5)), "left edge");
        assert!(!zone.contains(Point::new(100.0001, 50.0)));
    }

    #[test]
    fn test_rejects_degenerate_polygons() {
        let registry = ZoneRegistry::new();

        let mut too_few = square_record("bad", "cam1", ZoneKind::Danger);
        too_few.polygon.truncate(2);
        assert!(matches!(
            registry.update(too_few),
            Err(EngineError::InvalidZoneGeometry { .. })
        ));

        let mut coincident = square_record("bad2", "cam1", ZoneKind::Danger);
        coincident.polygon = vec![[0.0, 0.0], [0.0, 0.0], [100.0, 100.0], [0.0, 100.0]];
        assert!(matches!(
            registry.update(coincident),
            Err(EngineError::InvalidZoneGeometry { .. })
        ));

        // Nothing was committed for the camera.
        assert!(registry.get_snapshot("cam1").is_none());
    }

    #[test]
    fn test_versioning_and_snapshot_isolation() {
        let registry = ZoneRegistry::new();
        let v1 = registry
            .update(square_record("danger_a", "cam1", ZoneKind::Danger))
            .unwrap();
        assert_eq!(v1, 1);

        let before = registry.get_snapshot("cam1").unwrap();

        let mut updated = square_record("danger_a", "cam1", ZoneKind::Danger);
        updated.polygon = vec![[0.0, 0.0], [200.0, 0.0], [200.0, 200.0], [0.0, 200.0]];
        let v2 = registry.update(updated).unwrap();
        assert_eq!(v2, 2);

        // The snapshot taken before the update still sees version 1 geometry.
        assert_eq!(before.get("danger_a").unwrap().version, 1);
        assert!(!before
            .get("danger_a")
            .unwrap()
            .contains(Point::new(150.0, 150.0)));

        let after = registry.get_snapshot("cam1").unwrap();
        assert_eq!(after.get("danger_a").unwrap().version, 2);
        assert!(after
            .get("danger_a")
            .unwrap()
            .contains(Point::new(150.0, 150.0)));
    }

    #[test]
    fn test_inactive_zones_excluded_from_active_iteration() {
        let registry = ZoneRegistry::new();
        let mut record = square_record("danger_a", "cam1", ZoneKind::Danger);
        record.active = false;
        registry.update(record).unwrap();

        let snapshot = registry.get_snapshot("cam1").unwrap();
        assert_eq!(snapshot.active_zones().count(), 0);
        // Still present in the snapshot, just not eligible for containment.
        assert!(snapshot.get("danger_a").is_some());
    }
}
