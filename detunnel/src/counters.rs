//! Per-interface combined counters
//!
//! Every worker owns a `CounterLane`: a private copy of the whole
//! interface table. Workers only ever write their own lane, so the hot path
//! is a relaxed load and store with no read-modify-write and no lock.
//! Readers (stats/CLI collaborators) sum all lanes.
//!
//! The interface table grows in fixed chunks that never move once published,
//! which keeps growth safe while other workers are incrementing.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DetunnelError, DetunnelResult};

/// Interfaces per allocation chunk
pub const CHUNK_INTERFACES: usize = 64;

/// Default ceiling on interface indices
pub const DEFAULT_MAX_INTERFACES: u32 = 65536;

/// Largest accepted interface ceiling. Each lane keeps one chunk slot per
/// `CHUNK_INTERFACES` interfaces up front, so lanes × slots stays bounded.
pub const MAX_INTERFACES_LIMIT: u32 = 1 << 20;

/// Largest accepted number of worker lanes
pub const MAX_LANES: usize = 256;

/// What a counter measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Every packet reaching the stage (bytes = current length)
    Seen,
    /// Header stripped (bytes = header size)
    Processed,
    /// Payload handed on after the strip (bytes = remaining length)
    Unprocessed,
    /// Header truncated (bytes = remaining length)
    Failed,
    /// Header stripped but type not mapped (bytes = remaining length)
    Unrecognized,
}

impl MetricKind {
    pub const COUNT: usize = 5;

    pub const ALL: [MetricKind; MetricKind::COUNT] = [
        MetricKind::Seen,
        MetricKind::Processed,
        MetricKind::Unprocessed,
        MetricKind::Failed,
        MetricKind::Unrecognized,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MetricKind::Seen => "seen",
            MetricKind::Processed => "processed",
            MetricKind::Unprocessed => "unprocessed",
            MetricKind::Failed => "failed",
            MetricKind::Unrecognized => "unrecognized",
        }
    }

    #[inline(always)]
    fn slot(self) -> usize {
        self as usize
    }
}

/// Packet and byte totals
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub packets: u64,
    pub bytes: u64,
}

impl Counter {
    pub fn new(packets: u64, bytes: u64) -> Self {
        Self { packets, bytes }
    }

    fn saturating_add(self, other: Counter) -> Counter {
        Counter {
            packets: self.packets.saturating_add(other.packets),
            bytes: self.bytes.saturating_add(other.bytes),
        }
    }
}

#[derive(Default)]
struct Cell {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl Cell {
    /// Single-writer add. Only the owning lane calls this.
    #[inline(always)]
    fn add(&self, packets: u64, bytes: u64) {
        let p = self.packets.load(Ordering::Relaxed);
        self.packets
            .store(p.saturating_add(packets), Ordering::Relaxed);
        let b = self.bytes.load(Ordering::Relaxed);
        self.bytes.store(b.saturating_add(bytes), Ordering::Relaxed);
    }

    #[inline(always)]
    fn get(&self) -> Counter {
        Counter {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// All metrics of one interface in one lane, cache-line aligned
#[repr(C, align(64))]
#[derive(Default)]
struct Entry {
    cells: [Cell; MetricKind::COUNT],
}

struct Lane {
    chunks: Box<[OnceLock<Box<[Entry]>>]>,
    claimed: AtomicBool,
}

impl Lane {
    fn new(n_chunks: usize) -> Self {
        Self {
            chunks: (0..n_chunks).map(|_| OnceLock::new()).collect(),
            claimed: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    fn entry(&self, sw_if_index: u32) -> Option<&Entry> {
        let idx = sw_if_index as usize;
        self.chunks
            .get(idx / CHUNK_INTERFACES)?
            .get()
            .map(|chunk| &chunk[idx % CHUNK_INTERFACES])
    }
}

fn alloc_chunk() -> Option<Box<[Entry]>> {
    let mut entries: Vec<Entry> = Vec::new();
    entries.try_reserve_exact(CHUNK_INTERFACES).ok()?;
    entries.resize_with(CHUNK_INTERFACES, Entry::default);
    Some(entries.into_boxed_slice())
}

/// Interface-indexed counters shared by all workers of a stage
pub struct CounterStore {
    stage: String,
    lanes: Box<[Lane]>,
    max_interfaces: u32,
    /// Number of valid interface slots (high-water mark + 1)
    valid: AtomicU32,
}

impl CounterStore {
    /// Store with `lanes` worker lanes and the default interface ceiling
    pub fn new(stage: impl Into<String>, lanes: usize) -> Self {
        Self::with_max_interfaces(stage, lanes, DEFAULT_MAX_INTERFACES)
    }

    /// Store with an explicit interface ceiling. Both `lanes` and
    /// `max_interfaces` are clamped to `MAX_LANES` and `MAX_INTERFACES_LIMIT`.
    pub fn with_max_interfaces(stage: impl Into<String>, lanes: usize, max_interfaces: u32) -> Self {
        let stage = stage.into();
        if max_interfaces > MAX_INTERFACES_LIMIT || lanes > MAX_LANES {
            warn!(
                stage = %stage,
                max_interfaces,
                lanes,
                "counter store size clamped"
            );
        }
        let lanes = lanes.clamp(1, MAX_LANES);
        let max_interfaces = max_interfaces.min(MAX_INTERFACES_LIMIT);
        let n_chunks = (max_interfaces as usize).div_ceil(CHUNK_INTERFACES);
        Self {
            stage,
            lanes: (0..lanes).map(|_| Lane::new(n_chunks)).collect(),
            max_interfaces,
            valid: AtomicU32::new(0),
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn lanes(&self) -> usize {
        self.lanes.len()
    }

    pub fn max_interfaces(&self) -> u32 {
        self.max_interfaces
    }

    /// Highest interface index with allocated counters
    pub fn high_water_mark(&self) -> Option<u32> {
        self.valid.load(Ordering::Acquire).checked_sub(1)
    }

    /// Stats segment path for a metric, e.g. `/detunnel/ethernet/failed`
    pub fn stat_name(&self, kind: MetricKind) -> String {
        format!("/detunnel/{}/{}", self.stage, kind.name())
    }

    /// Make `sw_if_index` valid in every lane.
    ///
    /// A comparison against the high-water mark on the common path; growth
    /// zero-fills whole chunks and is safe to race with other workers.
    #[inline(always)]
    pub fn ensure_capacity(&self, sw_if_index: u32) -> DetunnelResult<()> {
        if sw_if_index < self.valid.load(Ordering::Acquire) {
            return Ok(());
        }
        self.grow(sw_if_index)
    }

    #[cold]
    fn grow(&self, sw_if_index: u32) -> DetunnelResult<()> {
        if sw_if_index >= self.max_interfaces {
            warn!(
                stage = %self.stage,
                sw_if_index,
                max = self.max_interfaces,
                "interface index beyond counter capacity"
            );
            return Err(DetunnelError::CounterCapacity {
                sw_if_index,
                max: self.max_interfaces,
            });
        }

        let last_chunk = sw_if_index as usize / CHUNK_INTERFACES;
        for lane in self.lanes.iter() {
            for slot in &lane.chunks[..=last_chunk] {
                if slot.get().is_some() {
                    continue;
                }
                let Some(chunk) = alloc_chunk() else {
                    warn!(stage = %self.stage, sw_if_index, "counter allocation failed");
                    return Err(DetunnelError::CounterAlloc { sw_if_index });
                };
                // Losing a race here just drops our zeroed chunk
                let _ = slot.set(chunk);
            }
        }

        let prev = self.valid.fetch_max(sw_if_index + 1, Ordering::AcqRel);
        if prev <= sw_if_index {
            debug!(
                stage = %self.stage,
                from = prev,
                to = sw_if_index + 1,
                "grew interface counters"
            );
        }
        Ok(())
    }

    /// Claim exclusive write access to one worker lane
    pub fn claim_lane(self: &Arc<Self>, lane: usize) -> DetunnelResult<CounterLane> {
        let unavailable = DetunnelError::LaneUnavailable {
            lane,
            lanes: self.lanes.len(),
        };
        let Some(l) = self.lanes.get(lane) else {
            return Err(unavailable);
        };
        if l.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(unavailable);
        }
        Ok(CounterLane {
            store: Arc::clone(self),
            lane,
        })
    }

    /// Sum of one metric across all lanes. Zero above the high-water mark.
    pub fn read(&self, sw_if_index: u32, kind: MetricKind) -> Counter {
        self.lanes
            .iter()
            .filter_map(|lane| lane.entry(sw_if_index))
            .map(|e| e.cells[kind.slot()].get())
            .fold(Counter::default(), Counter::saturating_add)
    }

    /// One lane's view of a metric
    pub fn read_lane(&self, lane: usize, sw_if_index: u32, kind: MetricKind) -> Counter {
        self.lanes
            .get(lane)
            .and_then(|l| l.entry(sw_if_index))
            .map(|e| e.cells[kind.slot()].get())
            .unwrap_or_default()
    }

    /// Summed counters for every interface up to the high-water mark
    pub fn snapshot(&self) -> Vec<InterfaceCounters> {
        let valid = self.valid.load(Ordering::Acquire);
        (0..valid)
            .map(|sw_if_index| InterfaceCounters {
                sw_if_index,
                seen: self.read(sw_if_index, MetricKind::Seen),
                processed: self.read(sw_if_index, MetricKind::Processed),
                unprocessed: self.read(sw_if_index, MetricKind::Unprocessed),
                failed: self.read(sw_if_index, MetricKind::Failed),
                unrecognized: self.read(sw_if_index, MetricKind::Unrecognized),
            })
            .collect()
    }
}

impl std::fmt::Debug for CounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterStore")
            .field("stage", &self.stage)
            .field("lanes", &self.lanes.len())
            .field("max_interfaces", &self.max_interfaces)
            .field("high_water_mark", &self.high_water_mark())
            .finish()
    }
}

/// Exclusive write handle on one lane of a `CounterStore`
pub struct CounterLane {
    store: Arc<CounterStore>,
    lane: usize,
}

impl CounterLane {
    pub fn index(&self) -> usize {
        self.lane
    }

    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }

    #[inline(always)]
    pub fn ensure_capacity(&self, sw_if_index: u32) -> DetunnelResult<()> {
        self.store.ensure_capacity(sw_if_index)
    }

    /// Add to one metric. No-op for an interface that was never validated.
    #[inline(always)]
    pub fn increment(&mut self, sw_if_index: u32, kind: MetricKind, packets: u64, bytes: u64) {
        let entry = self.store.lanes[self.lane].entry(sw_if_index);
        debug_assert!(entry.is_some(), "increment before ensure_capacity");
        if let Some(entry) = entry {
            entry.cells[kind.slot()].add(packets, bytes);
        }
    }
}

impl Drop for CounterLane {
    fn drop(&mut self) {
        self.store.lanes[self.lane]
            .claimed
            .store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for CounterLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterLane")
            .field("stage", &self.store.stage)
            .field("lane", &self.lane)
            .finish()
    }
}

/// Per-interface totals for reporting
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub sw_if_index: u32,
    pub seen: Counter,
    pub processed: Counter,
    pub unprocessed: Counter,
    pub failed: Counter,
    pub unrecognized: Counter,
}

impl InterfaceCounters {
    pub fn get(&self, kind: MetricKind) -> Counter {
        match kind {
            MetricKind::Seen => self.seen,
            MetricKind::Processed => self.processed,
            MetricKind::Unprocessed => self.unprocessed,
            MetricKind::Failed => self.failed,
            MetricKind::Unrecognized => self.unrecognized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_zero_fills_up_to_index() {
        let store = Arc::new(CounterStore::new("ethernet", 1));
        assert_eq!(store.high_water_mark(), None);

        store.ensure_capacity(5).unwrap();
        assert_eq!(store.high_water_mark(), Some(5));
        for i in 0..=5 {
            for kind in MetricKind::ALL {
                assert_eq!(store.read(i, kind), Counter::default());
            }
        }
    }

    #[test]
    fn test_growth_is_idempotent() {
        let store = Arc::new(CounterStore::new("ethernet", 1));
        let mut lane = store.claim_lane(0).unwrap();
        store.ensure_capacity(3).unwrap();
        lane.increment(3, MetricKind::Processed, 2, 28);

        store.ensure_capacity(3).unwrap();
        store.ensure_capacity(1).unwrap();
        assert_eq!(store.read(3, MetricKind::Processed), Counter::new(2, 28));
        assert_eq!(store.high_water_mark(), Some(3));

        // crossing a chunk boundary keeps earlier values
        store.ensure_capacity(CHUNK_INTERFACES as u32 * 3 + 1).unwrap();
        assert_eq!(store.read(3, MetricKind::Processed), Counter::new(2, 28));
    }

    #[test]
    fn test_capacity_ceiling() {
        let store = CounterStore::with_max_interfaces("vlan", 1, 128);
        assert!(store.ensure_capacity(127).is_ok());
        assert_eq!(
            store.ensure_capacity(128),
            Err(DetunnelError::CounterCapacity {
                sw_if_index: 128,
                max: 128
            })
        );
        assert_eq!(store.high_water_mark(), Some(127));
    }

    #[test]
    fn test_oversized_store_is_clamped() {
        let store = CounterStore::with_max_interfaces("ethernet", 1, u32::MAX);
        assert_eq!(store.max_interfaces(), MAX_INTERFACES_LIMIT);
        assert!(matches!(
            store.ensure_capacity(MAX_INTERFACES_LIMIT),
            Err(DetunnelError::CounterCapacity { .. })
        ));

        let store = CounterStore::with_max_interfaces("ethernet", MAX_LANES + 1, 64);
        assert_eq!(store.lanes(), MAX_LANES);
    }

    #[test]
    fn test_lanes_are_exclusive() {
        let store = Arc::new(CounterStore::new("ethernet", 2));
        let lane0 = store.claim_lane(0).unwrap();
        assert!(store.claim_lane(0).is_err());
        assert!(store.claim_lane(2).is_err());
        drop(lane0);
        assert!(store.claim_lane(0).is_ok());
    }

    #[test]
    fn test_read_sums_lanes() {
        let store = Arc::new(CounterStore::new("ethernet", 2));
        let mut a = store.claim_lane(0).unwrap();
        let mut b = store.claim_lane(1).unwrap();
        store.ensure_capacity(7).unwrap();

        a.increment(7, MetricKind::Seen, 1, 100);
        b.increment(7, MetricKind::Seen, 3, 60);

        assert_eq!(store.read(7, MetricKind::Seen), Counter::new(4, 160));
        assert_eq!(store.read_lane(1, 7, MetricKind::Seen), Counter::new(3, 60));
        assert_eq!(store.read(7, MetricKind::Failed), Counter::default());
        // beyond the mark reads as zero
        assert_eq!(store.read(1000, MetricKind::Seen), Counter::default());
    }

    #[test]
    fn test_snapshot_and_names() {
        let store = Arc::new(CounterStore::new("ethernet", 1));
        let mut lane = store.claim_lane(0).unwrap();
        store.ensure_capacity(2).unwrap();
        lane.increment(2, MetricKind::Failed, 1, 10);

        let snap = store.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[2].sw_if_index, 2);
        assert_eq!(snap[2].get(MetricKind::Failed), Counter::new(1, 10));
        assert_eq!(
            store.stat_name(MetricKind::Failed),
            "/detunnel/ethernet/failed"
        );
    }
}
