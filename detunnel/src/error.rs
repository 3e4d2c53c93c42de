//! Error taxonomy for the non-hot paths of the stage.
//!
//! Per-packet problems (truncated headers, unknown ethertypes, chained
//! buffers) never show up here: they are resolved into a drop next index and
//! a counter increment. What remains are resource and administrative errors
//! that the host runtime has to see.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DetunnelError {
    /// Interface index beyond the store's configured ceiling
    #[error("sw_if_index {sw_if_index} exceeds counter capacity of {max} interfaces")]
    CounterCapacity { sw_if_index: u32, max: u32 },

    /// Allocation failed while growing the counter table
    #[error("failed to allocate counters for sw_if_index {sw_if_index}")]
    CounterAlloc { sw_if_index: u32 },

    /// Worker lane is out of range or already owned by another worker
    #[error("counter lane {lane} unavailable ({lanes} lanes configured)")]
    LaneUnavailable { lane: usize, lanes: usize },

    /// Next index outside the stage's declared next nodes
    #[error("next index {next} is not declared by stage '{stage}' ({declared} next nodes)")]
    InvalidNext {
        stage: String,
        next: u16,
        declared: usize,
    },

    /// Next node name not declared by the stage
    #[error("next node '{name}' is not declared by stage '{stage}'")]
    UnknownNextName { stage: String, name: String },

    /// Dispatcher got a next array that does not line up with the frame
    #[error("next array has {nexts} entries for {packets} packets")]
    NextArrayMismatch { packets: usize, nexts: usize },

    /// Frame already holds FRAME_SIZE packets
    #[error("frame is full ({capacity} packets)")]
    FrameFull { capacity: usize },

    /// Type field does not fit inside the header
    #[error("type field at offset {type_offset} does not fit a {size}-byte header")]
    InvalidLayout { size: usize, type_offset: usize },

    /// Unknown ethertype name in configuration
    #[error("unknown ethertype '{0}'")]
    UnknownEthertype(String),
}

pub type DetunnelResult<T> = std::result::Result<T, DetunnelError>;
