//! Tests for per-interface counters under concurrent workers

use std::sync::Arc;
use std::thread;

use detunnel::header::{ETHERTYPE_IP4, ETHERTYPE_VLAN, ETH_HDR_SIZE};
use detunnel::{
    Counter, CounterStore, DetunnelError, DetunnelNode, Frame, MetricKind, Packet, Tracer,
    CounterLane,
};

fn eth(sw_if_index: u32, ethertype: u16, payload: usize) -> Packet {
    let mut data = vec![0u8; ETH_HDR_SIZE + payload];
    data[12..14].copy_from_slice(&ethertype.to_be_bytes());
    Packet::new(sw_if_index, data)
}

// ============================================================================
// Capacity
// ============================================================================

#[test]
fn test_ensure_capacity_is_idempotent() {
    let store = CounterStore::new("ethernet", 2);
    assert_eq!(store.high_water_mark(), None);

    store.ensure_capacity(130).unwrap();
    store.ensure_capacity(130).unwrap();
    store.ensure_capacity(5).unwrap();
    assert_eq!(store.high_water_mark(), Some(130));
    assert_eq!(store.snapshot().len(), 131);
}

#[test]
fn test_growth_preserves_existing_values() {
    let store = Arc::new(CounterStore::new("vlan", 1));
    let mut lane = store.claim_lane(0).unwrap();

    lane.ensure_capacity(3).unwrap();
    lane.increment(3, MetricKind::Processed, 2, 8);
    lane.ensure_capacity(1000).unwrap();
    lane.increment(1000, MetricKind::Processed, 1, 4);

    assert_eq!(store.read(3, MetricKind::Processed), Counter::new(2, 8));
    assert_eq!(store.read(1000, MetricKind::Processed), Counter::new(1, 4));
    assert_eq!(store.read(999, MetricKind::Processed), Counter::default());
}

#[test]
fn test_read_above_high_water_mark_is_zero() {
    let store = CounterStore::new("ethernet", 1);
    store.ensure_capacity(2).unwrap();
    assert_eq!(store.read(4000, MetricKind::Seen), Counter::default());
    assert_eq!(store.read_lane(7, 0, MetricKind::Seen), Counter::default());
}

#[test]
fn test_capacity_ceiling() {
    let store = CounterStore::with_max_interfaces("ethernet", 1, 100);
    assert!(store.ensure_capacity(99).is_ok());
    assert_eq!(
        store.ensure_capacity(100),
        Err(DetunnelError::CounterCapacity {
            sw_if_index: 100,
            max: 100
        })
    );
}

#[test]
fn test_stat_names() {
    let store = CounterStore::new("ethernet", 1);
    assert_eq!(store.stat_name(MetricKind::Failed), "/detunnel/ethernet/failed");
    assert_eq!(
        store.stat_name(MetricKind::Unprocessed),
        "/detunnel/ethernet/unprocessed"
    );
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_growth_and_increments() {
    const WORKERS: usize = 4;
    const ROUNDS: u64 = 2000;

    let store = Arc::new(CounterStore::new("ethernet", WORKERS));
    let lanes: Vec<CounterLane> = (0..WORKERS)
        .map(|i| store.claim_lane(i).unwrap())
        .collect();

    thread::scope(|s| {
        for mut lane in lanes {
            s.spawn(move || {
                for round in 0..ROUNDS {
                    // every worker pushes the high-water mark up at its own pace
                    let sw_if_index = ((round * (lane.index() as u64 + 1)) % 500) as u32;
                    lane.ensure_capacity(sw_if_index).unwrap();
                    lane.increment(sw_if_index, MetricKind::Seen, 1, 100);
                    lane.increment(0, MetricKind::Processed, 1, 14);
                }
            });
        }
    });

    let total_seen: u64 = store.snapshot().iter().map(|c| c.seen.packets).sum();
    assert_eq!(total_seen, WORKERS as u64 * ROUNDS);
    assert_eq!(
        store.read(0, MetricKind::Processed),
        Counter::new(WORKERS as u64 * ROUNDS, WORKERS as u64 * ROUNDS * 14)
    );
    for lane in 0..WORKERS {
        assert_eq!(
            store.read_lane(lane, 0, MetricKind::Processed).packets,
            ROUNDS
        );
    }
}

#[test]
fn test_workers_on_separate_lanes_sum_exactly() {
    const WORKERS: usize = 3;
    const FRAMES: usize = 50;

    let node = Arc::new(DetunnelNode::ethernet(WORKERS));

    thread::scope(|s| {
        for index in 0..WORKERS {
            let node = Arc::clone(&node);
            s.spawn(move || {
                let mut worker = node.worker(index).unwrap();
                let mut tracer = Tracer::disabled();
                for f in 0..FRAMES {
                    let packets = (0..32)
                        .map(|i| {
                            let sw_if_index = (index * 100 + f % 7) as u32;
                            let ethertype = if i % 3 == 0 { ETHERTYPE_VLAN } else { ETHERTYPE_IP4 };
                            eth(sw_if_index, ethertype, 10)
                        })
                        .collect();
                    let mut frame = Frame::from_packets(packets).unwrap();
                    worker.process_frame(&mut frame, &mut tracer).unwrap();
                }
            });
        }
    });

    let snapshot = node.counters().snapshot();
    let processed: u64 = snapshot.iter().map(|c| c.processed.packets).sum();
    let processed_bytes: u64 = snapshot.iter().map(|c| c.processed.bytes).sum();
    let unprocessed_bytes: u64 = snapshot.iter().map(|c| c.unprocessed.bytes).sum();

    let expected = (WORKERS * FRAMES * 32) as u64;
    assert_eq!(processed, expected);
    assert_eq!(processed_bytes, expected * 14);
    assert_eq!(unprocessed_bytes, expected * 10);
    assert!(snapshot.iter().all(|c| c.failed == Counter::default()));
    assert_eq!(node.counters().high_water_mark(), Some(206));
}

// ============================================================================
// Export
// ============================================================================

#[test]
fn test_snapshot_serializes_for_stats_export() {
    let store = Arc::new(CounterStore::new("ethernet", 1));
    let mut lane = store.claim_lane(0).unwrap();
    lane.ensure_capacity(1).unwrap();
    lane.increment(1, MetricKind::Failed, 1, 10);

    let json = serde_json::to_value(store.snapshot()).unwrap();
    assert_eq!(json.as_array().unwrap().len(), 2);
    assert_eq!(json[1]["sw_if_index"], 1);
    assert_eq!(json[1]["failed"]["packets"], 1);
    assert_eq!(json[1]["failed"]["bytes"], 10);
    assert_eq!(json[0]["failed"]["packets"], 0);
}
