use crate::config::BandConfig;
use crate::market::{FrequencyRange, QosRequirements};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;

/// One committed spectrum assignment inside a band.
#[derive(Debug, Clone)]
struct Assignment {
    allocation_id: String,
    range: FrequencyRange,
    bandwidth_mbps: u64,
}

struct Band {
    config: BandConfig,
    assignments: Vec<Assignment>,
}

impl Band {
    fn allocated_mbps(&self) -> u64 {
        self.assignments.iter().map(|a| a.bandwidth_mbps).sum()
    }

    fn free_mbps(&self) -> u64 {
        self.config.capacity_mbps.saturating_sub(self.allocated_mbps())
    }

    fn satisfies_qos(&self, qos: &QosRequirements) -> bool {
        self.config.latency_class_ms <= qos.max_latency_ms
            && self.config.reliability >= qos.min_reliability
    }

    /// Find the lowest gap of `width_mhz` disjoint from every assignment.
    fn find_gap(&self, width_mhz: f64) -> Option<FrequencyRange> {
        let mut taken: Vec<&FrequencyRange> = self.assignments.iter().map(|a| &a.range).collect();
        taken.sort_by(|a, b| a.low_mhz.partial_cmp(&b.low_mhz).unwrap());

        let mut cursor = self.config.freq_low_mhz;
        for range in taken {
            if range.low_mhz - cursor >= width_mhz {
                break;
            }
            cursor = cursor.max(range.high_mhz);
        }
        if self.config.freq_high_mhz - cursor >= width_mhz {
            Some(FrequencyRange {
                low_mhz: cursor,
                high_mhz: cursor + width_mhz,
            })
        } else {
            None
        }
    }

    /// Sub-band width proportional to the requested share of capacity.
    fn width_for(&self, bandwidth_mbps: u64) -> f64 {
        let span = self.config.freq_high_mhz - self.config.freq_low_mhz;
        span * (bandwidth_mbps as f64 / self.config.capacity_mbps as f64)
    }
}

/// Read-only view of one band used during admission.
#[derive(Debug, Clone, Serialize)]
pub struct BandSnapshot {
    pub name: String,
    pub capacity_mbps: u64,
    pub allocated_mbps: u64,
    pub free_mbps: u64,
    pub latency_class_ms: u64,
    pub reliability: f64,
    pub active_assignments: usize,
}

/// The process-wide spectrum table.
///
/// All mutation happens under the single writer lock; admission math works
/// on snapshots taken under the read lock. The two-phase shape (candidates
/// under the read lock, `commit` re-validating under the write lock) lets
/// the marketplace consult the forecaster between the phases without
/// holding any lock across an await point.
pub struct SpectrumPool {
    bands: RwLock<Vec<Band>>,
}

impl SpectrumPool {
    pub fn new(configs: &[BandConfig]) -> Self {
        let bands = configs
            .iter()
            .map(|config| Band {
                config: config.clone(),
                assignments: Vec::new(),
            })
            .collect();
        Self {
            bands: RwLock::new(bands),
        }
    }

    /// Bands that could satisfy the request, best-fit ordered: the band with
    /// the least free capacity that still fits comes first, which keeps big
    /// bands unfragmented for big requests.
    pub fn candidates(&self, bandwidth_mbps: u64, qos: &QosRequirements) -> Vec<BandSnapshot> {
        let bands = self.bands.read().unwrap();
        let mut fits: Vec<BandSnapshot> = bands
            .iter()
            .filter(|b| b.satisfies_qos(qos))
            .filter(|b| b.free_mbps() >= bandwidth_mbps)
            .filter(|b| b.find_gap(b.width_for(bandwidth_mbps)).is_some())
            .map(|b| snapshot(b))
            .collect();
        fits.sort_by_key(|s| s.free_mbps);
        fits
    }

    /// Whether any band at all satisfies the QoS, regardless of capacity.
    /// Distinguishes `QoSInfeasible` from `CapacityExhausted`.
    pub fn qos_feasible(&self, qos: &QosRequirements) -> bool {
        self.bands
            .read()
            .unwrap()
            .iter()
            .any(|b| b.satisfies_qos(qos))
    }

    /// Commit an assignment in `band`, re-validating capacity and
    /// disjointness under the write lock. Returns the carved range and the
    /// band's power ceiling.
    pub fn commit(
        &self,
        band_name: &str,
        allocation_id: &str,
        bandwidth_mbps: u64,
    ) -> Option<(FrequencyRange, f64)> {
        let mut bands = self.bands.write().unwrap();
        let band = bands.iter_mut().find(|b| b.config.name == band_name)?;

        if band.free_mbps() < bandwidth_mbps {
            return None;
        }
        let range = band.find_gap(band.width_for(bandwidth_mbps))?;
        band.assignments.push(Assignment {
            allocation_id: allocation_id.to_string(),
            range: range.clone(),
            bandwidth_mbps,
        });

        let power = band.config.power_ceiling_dbm;
        publish_free_gauge(band);
        Some((range, power))
    }

    /// Return an allocation's spectrum. Idempotent.
    pub fn release(&self, allocation_id: &str) -> bool {
        let mut bands = self.bands.write().unwrap();
        for band in bands.iter_mut() {
            let before = band.assignments.len();
            band.assignments.retain(|a| a.allocation_id != allocation_id);
            if band.assignments.len() != before {
                publish_free_gauge(band);
                return true;
            }
        }
        false
    }

    /// Per-band capacity overview.
    pub fn capacity(&self) -> HashMap<String, (u64, u64)> {
        self.bands
            .read()
            .unwrap()
            .iter()
            .map(|b| (b.config.name.clone(), (b.config.capacity_mbps, b.free_mbps())))
            .collect()
    }

    pub fn snapshot_of(&self, band_name: &str) -> Option<BandSnapshot> {
        self.bands
            .read()
            .unwrap()
            .iter()
            .find(|b| b.config.name == band_name)
            .map(snapshot)
    }

    /// Drop every assignment. Used when a new leader rebuilds the table
    /// from replicated state.
    pub fn clear(&self) {
        let mut bands = self.bands.write().unwrap();
        for band in bands.iter_mut() {
            band.assignments.clear();
            publish_free_gauge(band);
        }
    }

    /// Re-install a known assignment (replication replay). The stored range
    /// is trusted; overlapping replays indicate corrupt replicated state
    /// and are refused.
    pub fn restore(
        &self,
        band_name: &str,
        allocation_id: &str,
        range: FrequencyRange,
        bandwidth_mbps: u64,
    ) -> bool {
        let mut bands = self.bands.write().unwrap();
        let Some(band) = bands.iter_mut().find(|b| b.config.name == band_name) else {
            return false;
        };
        if band
            .assignments
            .iter()
            .any(|a| a.range.overlaps(&range) || a.allocation_id == allocation_id)
        {
            return false;
        }
        band.assignments.push(Assignment {
            allocation_id: allocation_id.to_string(),
            range,
            bandwidth_mbps,
        });
        publish_free_gauge(band);
        true
    }
}

fn snapshot(band: &Band) -> BandSnapshot {
    BandSnapshot {
        name: band.config.name.clone(),
        capacity_mbps: band.config.capacity_mbps,
        allocated_mbps: band.allocated_mbps(),
        free_mbps: band.free_mbps(),
        latency_class_ms: band.config.latency_class_ms,
        reliability: band.config.reliability,
        active_assignments: band.assignments.len(),
    }
}

fn publish_free_gauge(band: &Band) {
    metrics::gauge!(
        "aether_market_free_mbps",
        "band" => band.config.name.clone(),
    )
    .set(band.free_mbps() as f64);
}
