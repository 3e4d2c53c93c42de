//! Hand-off of classified packets to their next nodes
//!
//! The host forwarding mechanism sees the frame plus a parallel next array.
//! `NextFrames` is the in-process implementation: a stable partition into
//! one outgoing frame per declared next node.

use thiserror::Error;

use crate::error::{DetunnelError, DetunnelResult};
use crate::next::{NextIndex, NextNodes};
use crate::packet::{Frame, Packet};

/// Failed hand-off. Carries every packet that was not enqueued.
#[derive(Debug, Error)]
#[error("dispatch failed, {} packets returned", .packets.len())]
pub struct DispatchError {
    pub packets: Vec<Packet>,
    #[source]
    pub error: DetunnelError,
}

impl DispatchError {
    pub fn new(packets: Vec<Packet>, error: DetunnelError) -> Self {
        Self { packets, error }
    }
}

/// Host forwarding hook
pub trait Dispatcher {
    /// `nexts[i]` is the next node of `packets[i]`. Packets sharing a next
    /// node must keep their relative order.
    ///
    /// On error no packet may be kept: all of them come back in the
    /// `DispatchError`.
    fn enqueue_to_next(
        &mut self,
        packets: Vec<Packet>,
        nexts: &[NextIndex],
    ) -> Result<(), DispatchError>;
}

/// Per-next-node output frames
#[derive(Debug)]
pub struct NextFrames {
    stage: String,
    frames: Vec<Vec<Packet>>,
}

impl NextFrames {
    pub fn new(next_nodes: &NextNodes) -> Self {
        Self {
            stage: next_nodes.stage().to_string(),
            frames: (0..next_nodes.len()).map(|_| Vec::new()).collect(),
        }
    }

    /// Packets queued for `next`
    pub fn get(&self, next: NextIndex) -> &[Packet] {
        self.frames
            .get(next.as_usize())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Remove and return the packets queued for `next`
    pub fn take(&mut self, next: NextIndex) -> Vec<Packet> {
        self.frames
            .get_mut(next.as_usize())
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Packets queued for `next` as a frame for the next stage
    pub fn take_frame(&mut self, next: NextIndex, trace: bool) -> DetunnelResult<Frame> {
        Ok(Frame::from_packets(self.take(next))?.with_trace(trace))
    }

    /// Total packets queued across all next nodes
    pub fn total(&self) -> usize {
        self.frames.iter().map(Vec::len).sum()
    }

    /// Queue depth per next node, indexed like the next-node table
    pub fn counts(&self) -> Vec<usize> {
        self.frames.iter().map(Vec::len).collect()
    }
}

impl Dispatcher for NextFrames {
    fn enqueue_to_next(
        &mut self,
        packets: Vec<Packet>,
        nexts: &[NextIndex],
    ) -> Result<(), DispatchError> {
        if packets.len() != nexts.len() {
            let error = DetunnelError::NextArrayMismatch {
                packets: packets.len(),
                nexts: nexts.len(),
            };
            return Err(DispatchError::new(packets, error));
        }
        if let Some(bad) = nexts.iter().find(|n| n.as_usize() >= self.frames.len()) {
            let error = DetunnelError::InvalidNext {
                stage: self.stage.clone(),
                next: bad.0,
                declared: self.frames.len(),
            };
            return Err(DispatchError::new(packets, error));
        }

        for (packet, next) in packets.into_iter().zip(nexts) {
            self.frames[next.as_usize()].push(packet);
        }
        Ok(())
    }
}
