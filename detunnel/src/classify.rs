//! Batch classifier
//!
//! Walks a frame in groups of 8, then 4, then single packets. A group whose
//! packets are uniform (no chained segments, same rx interface, full header
//! present, and for `Uniformity::Strict` the same ethertype) is handled in one
//! pass with a single combined counter update. Any other group falls back to
//! the per-packet path, which is correct for every traffic mix.

use serde::{Deserialize, Serialize};

use crate::counters::{CounterLane, MetricKind};
use crate::error::{DetunnelError, DetunnelResult};
use crate::header::HeaderLayout;
use crate::next::NextIndex;
use crate::packet::Packet;
use crate::resolver::Resolver;
use crate::trace::Tracer;

/// Group widths tried in order against the packets left in the frame
pub const GROUP_WIDTHS: [usize; 3] = [8, 4, 1];

const MAX_GROUP: usize = 8;

/// How strict the fast-path precondition is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Uniformity {
    /// Same interface, unchained, full header. Types resolved per packet.
    #[default]
    Relaxed,
    /// As `Relaxed`, plus one ethertype for the whole group, resolved once
    Strict,
}

/// Per-frame classification summary
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyStats {
    pub fast_groups: usize,
    pub fast_packets: usize,
    pub scalar_packets: usize,
    pub dropped: usize,
}

/// Borrowed state for classifying one frame on one worker
pub struct Classifier<'a> {
    pub layout: HeaderLayout,
    pub uniformity: Uniformity,
    pub resolver: &'a dyn Resolver,
    pub lane: &'a mut CounterLane,
}

impl<'a> Classifier<'a> {
    pub fn new(
        layout: HeaderLayout,
        uniformity: Uniformity,
        resolver: &'a dyn Resolver,
        lane: &'a mut CounterLane,
    ) -> Self {
        Self {
            layout,
            uniformity,
            resolver,
            lane,
        }
    }

    /// Classify `packets` into `nexts`, grouping where the traffic allows.
    ///
    /// Only counter growth can fail; per-packet problems become drops. Growth
    /// is settled for the whole frame first, so on error no packet, counter
    /// or trace record has been touched.
    pub fn classify_frame(
        &mut self,
        packets: &mut [Packet],
        nexts: &mut [NextIndex],
        tracer: &mut Tracer,
    ) -> DetunnelResult<ClassifyStats> {
        check_lengths(packets, nexts)?;
        self.reserve_interfaces(packets)?;
        let mut stats = ClassifyStats::default();
        let n = packets.len();
        let mut i = 0;

        while i < n {
            let remaining = n - i;
            let width = GROUP_WIDTHS
                .iter()
                .copied()
                .find(|w| *w <= remaining)
                .unwrap_or(1);
            let group = &mut packets[i..i + width];
            let group_nexts = &mut nexts[i..i + width];

            if width > 1 && self.is_uniform(group) {
                self.classify_group(i, group, group_nexts, tracer);
                stats.fast_groups += 1;
                stats.fast_packets += width;
            } else {
                for (k, (packet, next)) in group.iter_mut().zip(group_nexts.iter_mut()).enumerate() {
                    *next = self.classify_one(i + k, packet, tracer)?;
                }
                stats.scalar_packets += width;
            }
            i += width;
        }

        stats.dropped = nexts.iter().filter(|n| n.is_drop()).count();
        Ok(stats)
    }

    /// Classify every packet on the per-packet path
    pub fn classify_scalar(
        &mut self,
        packets: &mut [Packet],
        nexts: &mut [NextIndex],
        tracer: &mut Tracer,
    ) -> DetunnelResult<ClassifyStats> {
        check_lengths(packets, nexts)?;
        self.reserve_interfaces(packets)?;
        for (i, (packet, next)) in packets.iter_mut().zip(nexts.iter_mut()).enumerate() {
            *next = self.classify_one(i, packet, tracer)?;
        }
        Ok(ClassifyStats {
            scalar_packets: packets.len(),
            dropped: nexts.iter().filter(|n| n.is_drop()).count(),
            ..Default::default()
        })
    }

    /// Make counters valid for every interface in `packets`. The mark only
    /// grows, so the largest index is enough.
    pub fn reserve_interfaces(&self, packets: &[Packet]) -> DetunnelResult<()> {
        match packets.iter().map(Packet::sw_if_index).max() {
            Some(max) => self.lane.ensure_capacity(max),
            None => Ok(()),
        }
    }

    /// Fast-path precondition
    #[inline(always)]
    pub fn is_uniform(&self, group: &[Packet]) -> bool {
        let Some(first) = group.first() else {
            return false;
        };
        let sw_if_index = first.sw_if_index();
        let hdr = self.layout.size();

        let shape_ok = group.iter().all(|p| {
            !p.has_next_segment() && p.sw_if_index() == sw_if_index && p.current_length() >= hdr
        });
        if !shape_ok {
            return false;
        }

        match self.uniformity {
            Uniformity::Relaxed => true,
            Uniformity::Strict => {
                let t0 = self.layout.ethertype(first.current());
                group[1..]
                    .iter()
                    .all(|p| self.layout.ethertype(p.current()) == t0)
            }
        }
    }

    /// Whole-group path. The caller has checked `is_uniform` and reserved
    /// the group's interface.
    #[inline]
    fn classify_group(
        &mut self,
        base: usize,
        group: &mut [Packet],
        nexts: &mut [NextIndex],
        tracer: &mut Tracer,
    ) {
        let w = group.len();
        let hdr = self.layout.size();
        let sw_if_index = group[0].sw_if_index();

        let mut types = [0u16; MAX_GROUP];
        let mut seen_bytes = 0u64;
        for (t, p) in types.iter_mut().zip(group.iter_mut()) {
            seen_bytes += p.current_length() as u64;
            *t = self.layout.ethertype(p.current());
            let stripped = p.advance(hdr);
            debug_assert!(stripped);
        }

        match self.uniformity {
            Uniformity::Strict => nexts.fill(self.resolver.resolve(types[0])),
            Uniformity::Relaxed => self.resolver.resolve_group(&types[..w], nexts),
        }

        let header_bytes = (w * hdr) as u64;
        let packets = w as u64;
        self.lane
            .increment(sw_if_index, MetricKind::Seen, packets, seen_bytes);
        self.lane
            .increment(sw_if_index, MetricKind::Processed, packets, header_bytes);
        self.lane.increment(
            sw_if_index,
            MetricKind::Unprocessed,
            packets,
            seen_bytes - header_bytes,
        );

        let (mut dropped, mut dropped_bytes) = (0u64, 0u64);
        for (p, next) in group.iter().zip(nexts.iter()) {
            if next.is_drop() {
                dropped += 1;
                dropped_bytes += p.current_length() as u64;
            }
        }
        if dropped > 0 {
            self.lane
                .increment(sw_if_index, MetricKind::Unrecognized, dropped, dropped_bytes);
        }

        if tracer.is_enabled() {
            for (k, p) in group.iter().enumerate() {
                tracer.maybe_trace(base + k, p, sw_if_index, types[k], nexts[k]);
            }
        }
    }

    /// Per-packet path
    #[inline]
    pub fn classify_one(
        &mut self,
        index: usize,
        packet: &mut Packet,
        tracer: &mut Tracer,
    ) -> DetunnelResult<NextIndex> {
        let sw_if_index = packet.sw_if_index();
        self.lane.ensure_capacity(sw_if_index)?;

        let len = packet.current_length();
        let hdr = self.layout.size();
        self.lane
            .increment(sw_if_index, MetricKind::Seen, 1, len as u64);

        let (ethertype, next) = if packet.has_next_segment() {
            // chained buffers are never parsed here
            (0, NextIndex::DROP)
        } else if len < hdr {
            self.lane
                .increment(sw_if_index, MetricKind::Failed, 1, len as u64);
            (0, NextIndex::DROP)
        } else {
            let ethertype = self.layout.ethertype(packet.current());
            let stripped = packet.advance(hdr);
            debug_assert!(stripped);

            let payload = (len - hdr) as u64;
            self.lane
                .increment(sw_if_index, MetricKind::Processed, 1, hdr as u64);
            self.lane
                .increment(sw_if_index, MetricKind::Unprocessed, 1, payload);

            let next = self.resolver.resolve(ethertype);
            if next.is_drop() {
                self.lane
                    .increment(sw_if_index, MetricKind::Unrecognized, 1, payload);
            }
            (ethertype, next)
        };

        tracer.maybe_trace(index, packet, sw_if_index, ethertype, next);
        Ok(next)
    }
}

fn check_lengths(packets: &[Packet], nexts: &[NextIndex]) -> DetunnelResult<()> {
    if packets.len() != nexts.len() {
        return Err(DetunnelError::NextArrayMismatch {
            packets: packets.len(),
            nexts: nexts.len(),
        });
    }
    Ok(())
}
