// src/services/geo_index.rs
use chrono::{DateTime, Duration, Utc};
use h3o::{CellIndex, LatLng, Resolution};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing;

use crate::errors::{DispatchError, DispatchResult};
use crate::models::geo::GeoPoint;
use crate::models::vehicle::{AvailabilityStatus, VehicleType};

/// A rider returned by a nearby query, eligible on type and freshness.
/// Capacity and trip-state gating happen in the matcher.
#[derive(Debug, Clone)]
pub struct RiderCandidate {
    pub rider_id: String,
    pub vehicle_id: String,
    pub vehicle_type: VehicleType,
    pub capacity: u8,
    pub position: GeoPoint,
    pub distance_meters: f64,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    rider_id: String,
    vehicle_id: String,
    vehicle_type: VehicleType,
    capacity: u8,
    position: GeoPoint,
    status: AvailabilityStatus,
    last_heartbeat_at: DateTime<Utc>,
    cell: CellIndex,
}

#[derive(Default)]
struct Buckets {
    cells: HashMap<CellIndex, HashSet<String>>,
    entries: HashMap<String, IndexEntry>,
}

/// Spatial lookup of online riders near a point. Hexagonal bucketing at H3
/// resolution 8 (~460 m edge, ~800 m between neighbouring cell centres), so a
/// query touches the rings covering the search radius instead of the whole
/// fleet. Stale heartbeats are filtered at query time; a periodic sweep
/// reclaims the memory.
pub struct GeoIndex {
    resolution: Resolution,
    staleness: Duration,
    buckets: RwLock<Buckets>,
}

// Centre-to-centre spacing of adjacent hexes at resolution 8, metres.
const CELL_SPACING_M: f64 = 800.0;

impl GeoIndex {
    pub fn new(heartbeat_staleness_secs: i64) -> Self {
        Self {
            resolution: Resolution::Eight,
            staleness: Duration::seconds(heartbeat_staleness_secs),
            buckets: RwLock::new(Buckets::default()),
        }
    }

    fn to_cell(&self, point: &GeoPoint) -> DispatchResult<CellIndex> {
        let latlng = LatLng::new(point.latitude, point.longitude).map_err(|e| {
            DispatchError::InvalidFieldValue {
                field: "position".to_string(),
                value: format!("({}, {})", point.latitude, point.longitude),
                reason: e.to_string(),
            }
        })?;
        Ok(latlng.to_cell(self.resolution))
    }

    /// Insert or move a rider's entry. Idempotent: repeating the same update
    /// leaves the index unchanged. An Offline status removes the entry.
    pub fn upsert(
        &self,
        rider_id: &str,
        vehicle_id: &str,
        vehicle_type: VehicleType,
        capacity: u8,
        position: GeoPoint,
        status: AvailabilityStatus,
        heartbeat_at: DateTime<Utc>,
    ) -> DispatchResult<()> {
        if status == AvailabilityStatus::Offline {
            self.remove(rider_id);
            return Ok(());
        }

        let cell = self.to_cell(&position)?;
        let mut buckets = self.buckets.write().expect("geo index lock poisoned");

        if let Some(previous) = buckets.entries.get(rider_id) {
            let old_cell = previous.cell;
            if old_cell != cell {
                if let Some(ids) = buckets.cells.get_mut(&old_cell) {
                    ids.remove(rider_id);
                    if ids.is_empty() {
                        buckets.cells.remove(&old_cell);
                    }
                }
            }
        }

        buckets
            .cells
            .entry(cell)
            .or_default()
            .insert(rider_id.to_string());
        buckets.entries.insert(
            rider_id.to_string(),
            IndexEntry {
                rider_id: rider_id.to_string(),
                vehicle_id: vehicle_id.to_string(),
                vehicle_type,
                capacity,
                position,
                status,
                last_heartbeat_at: heartbeat_at,
                cell,
            },
        );
        Ok(())
    }

    /// Drop a rider's entry, on explicit offline transition or session end.
    pub fn remove(&self, rider_id: &str) {
        let mut buckets = self.buckets.write().expect("geo index lock poisoned");
        if let Some(entry) = buckets.entries.remove(rider_id) {
            if let Some(ids) = buckets.cells.get_mut(&entry.cell) {
                ids.remove(rider_id);
                if ids.is_empty() {
                    buckets.cells.remove(&entry.cell);
                }
            }
        }
    }

    /// Idle riders of the requested type within the radius, sorted by
    /// ascending distance with ties broken by rider id (stable total order).
    pub fn query_nearby(
        &self,
        point: &GeoPoint,
        radius_meters: f64,
        vehicle_type: VehicleType,
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<RiderCandidate>> {
        let origin = self.to_cell(point)?;
        let k = (radius_meters / CELL_SPACING_M).ceil() as u32 + 1;
        let disk: Vec<CellIndex> = origin.grid_disk(k);

        let buckets = self.buckets.read().expect("geo index lock poisoned");
        let mut candidates = Vec::new();

        for cell in disk {
            let Some(ids) = buckets.cells.get(&cell) else {
                continue;
            };
            for id in ids {
                let Some(entry) = buckets.entries.get(id) else {
                    continue;
                };
                if entry.status != AvailabilityStatus::OnlineIdle {
                    continue;
                }
                if entry.vehicle_type != vehicle_type {
                    continue;
                }
                // Heartbeat-expired entries count as offline even before the
                // rider says so.
                if now - entry.last_heartbeat_at > self.staleness {
                    continue;
                }
                let distance = point.distance_meters(&entry.position);
                if distance <= radius_meters {
                    candidates.push(RiderCandidate {
                        rider_id: entry.rider_id.clone(),
                        vehicle_id: entry.vehicle_id.clone(),
                        vehicle_type: entry.vehicle_type,
                        capacity: entry.capacity,
                        position: entry.position,
                        distance_meters: distance,
                    });
                }
            }
        }

        candidates.sort_by(|a, b| {
            a.distance_meters
                .partial_cmp(&b.distance_meters)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.rider_id.cmp(&b.rider_id))
        });

        Ok(candidates)
    }

    /// Reclaim entries whose heartbeat expired. Queries already ignore them;
    /// this just frees the memory. Returns the number removed.
    pub fn sweep_stale(&self, now: DateTime<Utc>) -> usize {
        let mut buckets = self.buckets.write().expect("geo index lock poisoned");
        let stale: Vec<String> = buckets
            .entries
            .values()
            .filter(|e| now - e.last_heartbeat_at > self.staleness)
            .map(|e| e.rider_id.clone())
            .collect();

        for rider_id in &stale {
            if let Some(entry) = buckets.entries.remove(rider_id) {
                if let Some(ids) = buckets.cells.get_mut(&entry.cell) {
                    ids.remove(rider_id);
                    if ids.is_empty() {
                        buckets.cells.remove(&entry.cell);
                    }
                }
            }
        }

        if !stale.is_empty() {
            tracing::debug!("Swept {} stale geo index entries", stale.len());
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.read().expect("geo index lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
