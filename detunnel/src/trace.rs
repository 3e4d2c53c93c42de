//! Per-invocation packet tracing
//!
//! Records are only produced when the frame has tracing enabled and the
//! packet itself carries `IS_TRACED`. Tracing never feeds back into counters
//! or next-node selection.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::next::NextIndex;
use crate::packet::Packet;

/// What the stage decided for one traced packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Position of the packet in its frame
    pub packet_index: usize,
    pub sw_if_index: u32,
    /// 0 when the header was never read
    pub ethertype: u16,
    pub next_index: NextIndex,
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sw_if_index {} ethertype 0x{:04x} next {}",
            self.sw_if_index, self.ethertype, self.next_index
        )
    }
}

/// Trace buffer for one stage invocation
#[derive(Debug, Default)]
pub struct Tracer {
    enabled: bool,
    records: Vec<TraceRecord>,
}

impl Tracer {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            records: Vec::new(),
        }
    }

    /// Tracer that never records
    pub fn disabled() -> Self {
        Self::new(false)
    }

    #[inline(always)]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[inline(always)]
    pub fn maybe_trace(
        &mut self,
        packet_index: usize,
        packet: &Packet,
        sw_if_index: u32,
        ethertype: u16,
        next_index: NextIndex,
    ) {
        if self.enabled && packet.is_traced() {
            self.records.push(TraceRecord {
                packet_index,
                sw_if_index,
                ethertype,
                next_index,
            });
        }
    }

    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Hand the records to the host trace buffer
    pub fn take(&mut self) -> Vec<TraceRecord> {
        std::mem::take(&mut self.records)
    }

    /// One line per record, prefixed with the stage name
    pub fn format_records(&self, stage: &str) -> Vec<String> {
        self.records
            .iter()
            .map(|r| format!("{}: {}", stage, r))
            .collect()
    }
}
