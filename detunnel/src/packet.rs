//! Packet buffers and frames handed to the stage by the host runtime
//!
//! A `Packet` is a read-only byte buffer with a movable cursor. The stage
//! never writes packet data, it only inspects the bytes at the cursor and
//! advances past headers it has consumed.

use bytes::Bytes;

use crate::error::{DetunnelError, DetunnelResult};

/// Maximum number of packets in one frame
pub const FRAME_SIZE: usize = 256;

/// Buffer flags set by the host runtime
pub mod packet_flags {
    /// Buffer continues in a chained segment
    pub const NEXT_PRESENT: u32 = 1 << 0;
    /// Buffer was selected for tracing
    pub const IS_TRACED: u32 = 1 << 1;
}

/// One packet buffer owned by the host for the duration of a pipeline call
#[derive(Debug, Clone)]
pub struct Packet {
    data: Bytes,
    current_data: usize,
    flags: u32,
    sw_if_index: u32,
}

impl Packet {
    pub fn new(sw_if_index: u32, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            current_data: 0,
            flags: 0,
            sw_if_index,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags |= flags;
        self
    }

    /// Receive interface
    #[inline(always)]
    pub fn sw_if_index(&self) -> u32 {
        self.sw_if_index
    }

    #[inline(always)]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    #[inline(always)]
    pub fn has_next_segment(&self) -> bool {
        self.flags & packet_flags::NEXT_PRESENT != 0
    }

    #[inline(always)]
    pub fn is_traced(&self) -> bool {
        self.flags & packet_flags::IS_TRACED != 0
    }

    /// Offset of the read cursor from the start of the buffer
    #[inline(always)]
    pub fn current_data(&self) -> usize {
        self.current_data
    }

    /// Bytes remaining from the cursor
    #[inline(always)]
    pub fn current_length(&self) -> usize {
        self.data.len() - self.current_data
    }

    /// Bytes from the cursor to the end of the buffer
    #[inline(always)]
    pub fn current(&self) -> &[u8] {
        &self.data[self.current_data..]
    }

    /// Move the cursor forward by `n` bytes.
    ///
    /// Returns false and leaves the cursor untouched if fewer than `n` bytes
    /// remain.
    #[inline(always)]
    pub fn advance(&mut self, n: usize) -> bool {
        if n > self.current_length() {
            return false;
        }
        self.current_data += n;
        true
    }

    /// The whole underlying buffer, including consumed headers
    pub fn buffer(&self) -> &Bytes {
        &self.data
    }
}

/// Ordered batch of packets for one pipeline invocation
#[derive(Debug, Default)]
pub struct Frame {
    packets: Vec<Packet>,
    trace: bool,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            packets: Vec::with_capacity(FRAME_SIZE),
            trace: false,
        }
    }

    /// Build a frame from packets, failing if there are more than FRAME_SIZE
    pub fn from_packets(packets: Vec<Packet>) -> DetunnelResult<Self> {
        if packets.len() > FRAME_SIZE {
            return Err(DetunnelError::FrameFull {
                capacity: FRAME_SIZE,
            });
        }
        Ok(Self {
            packets,
            trace: false,
        })
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn push(&mut self, packet: Packet) -> DetunnelResult<()> {
        if self.packets.len() >= FRAME_SIZE {
            return Err(DetunnelError::FrameFull {
                capacity: FRAME_SIZE,
            });
        }
        self.packets.push(packet);
        Ok(())
    }

    /// Node-level trace flag for this invocation
    #[inline(always)]
    pub fn trace_enabled(&self) -> bool {
        self.trace
    }

    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn packets_mut(&mut self) -> &mut [Packet] {
        &mut self.packets
    }

    /// Hand the packets back to the host, leaving the frame empty
    pub fn take_packets(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.packets)
    }

    /// Put packets back into the frame after a failed hand-off, replacing
    /// whatever it holds
    pub fn restore_packets(&mut self, packets: Vec<Packet>) -> DetunnelResult<()> {
        if packets.len() > FRAME_SIZE {
            return Err(DetunnelError::FrameFull {
                capacity: FRAME_SIZE,
            });
        }
        self.packets = packets;
        Ok(())
    }
}
