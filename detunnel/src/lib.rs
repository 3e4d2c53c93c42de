//! Detunnel - batch classify-and-dispatch stages for packet pipelines
//!
//! A stage strips one fixed-size header from every packet in a frame, picks a
//! next node from the header's type field and keeps per-interface counters.
//! Two stages are provided and chain naturally:
//! - `ethernet`: 14-byte link-layer header → vlan / ip4 / ip6
//! - `vlan`: 4-byte 802.1Q tag → vlan / ip4 / ip6 / mpls
//!
//! Frames are walked in groups of 8 and 4 when the traffic is uniform and
//! packet by packet otherwise.

pub mod classify;
pub mod config;
pub mod counters;
pub mod dispatch;
pub mod error;
pub mod header;
pub mod next;
pub mod node;
pub mod packet;
pub mod resolver;
pub mod trace;

pub use classify::{ClassifyStats, Classifier, Uniformity, GROUP_WIDTHS};
pub use config::DetunnelConfig;
pub use counters::{Counter, CounterLane, CounterStore, InterfaceCounters, MetricKind};
pub use dispatch::{DispatchError, Dispatcher, NextFrames};
pub use error::{DetunnelError, DetunnelResult};
pub use header::HeaderLayout;
pub use next::{NextIndex, NextNodes};
pub use node::{DetunnelNode, NodeSpec, NodeWorker};
pub use packet::{packet_flags, Frame, Packet, FRAME_SIZE};
pub use resolver::{DynamicResolver, KnownEthertype, Resolver, StaticResolver};
pub use trace::{TraceRecord, Tracer};
