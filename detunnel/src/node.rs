//! Detunnel stage: shared node state plus per-worker runners
//!
//! `DetunnelNode` is created once per stage and shared by every worker
//! thread. Each worker calls `DetunnelNode::worker` to claim its own counter
//! lane and then feeds frames through `NodeWorker::run`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::classify::{ClassifyStats, Classifier, Uniformity};
use crate::config::{DetunnelConfig, ResolverKind, StageKind};
use crate::counters::{CounterLane, CounterStore};
use crate::dispatch::{DispatchError, Dispatcher};
use crate::error::DetunnelResult;
use crate::header::HeaderLayout;
use crate::next::{
    NextIndex, NextNodes, ERROR_DROP, IP4_INPUT, IP6_INPUT, MPLS_INPUT, VLAN_DETUNNEL,
};
use crate::packet::Frame;
use crate::resolver::{DynamicResolver, Resolver, StaticResolver};
use crate::trace::Tracer;

/// Static description of a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub name: String,
    pub layout: HeaderLayout,
    pub next_nodes: NextNodes,
    pub uniformity: Uniformity,
}

impl NodeSpec {
    /// Outer link-layer header
    pub fn ethernet() -> Self {
        Self {
            name: "ethernet".to_string(),
            layout: HeaderLayout::ETHERNET,
            next_nodes: NextNodes::new(
                "ethernet",
                [ERROR_DROP, VLAN_DETUNNEL, IP4_INPUT, IP6_INPUT],
            ),
            uniformity: Uniformity::Relaxed,
        }
    }

    /// 802.1Q tag, including stacked tags
    pub fn vlan() -> Self {
        Self {
            name: "vlan".to_string(),
            layout: HeaderLayout::VLAN,
            next_nodes: NextNodes::new(
                "vlan",
                [ERROR_DROP, VLAN_DETUNNEL, IP4_INPUT, IP6_INPUT, MPLS_INPUT],
            ),
            uniformity: Uniformity::Relaxed,
        }
    }

    pub fn for_stage(kind: StageKind) -> Self {
        match kind {
            StageKind::Ethernet => Self::ethernet(),
            StageKind::Vlan => Self::vlan(),
        }
    }

    pub fn with_uniformity(mut self, uniformity: Uniformity) -> Self {
        self.uniformity = uniformity;
        self
    }
}

/// Shared state of one detunnel stage
pub struct DetunnelNode {
    spec: NodeSpec,
    resolver: Arc<dyn Resolver>,
    counters: Arc<CounterStore>,
}

impl DetunnelNode {
    pub fn new(spec: NodeSpec, resolver: Arc<dyn Resolver>, counters: Arc<CounterStore>) -> Self {
        info!(
            stage = %spec.name,
            header = spec.layout.size(),
            next_nodes = spec.next_nodes.len(),
            lanes = counters.lanes(),
            uniformity = ?spec.uniformity,
            "detunnel stage created"
        );
        Self {
            spec,
            resolver,
            counters,
        }
    }

    /// Stage with the conventional static mapping and its own counter store
    pub fn with_static(spec: NodeSpec, workers: usize) -> Self {
        let resolver = Arc::new(StaticResolver::for_next_nodes(&spec.next_nodes));
        let counters = Arc::new(CounterStore::new(spec.name.clone(), workers));
        Self::new(spec, resolver, counters)
    }

    pub fn ethernet(workers: usize) -> Self {
        Self::with_static(NodeSpec::ethernet(), workers)
    }

    pub fn vlan(workers: usize) -> Self {
        Self::with_static(NodeSpec::vlan(), workers)
    }

    /// Build a stage from configuration
    pub fn from_config(config: &DetunnelConfig) -> Result<Self> {
        config.validate()?;
        let spec = NodeSpec::for_stage(config.stage).with_uniformity(config.uniformity);
        let counters = Arc::new(CounterStore::with_max_interfaces(
            spec.name.clone(),
            config.workers,
            config.max_interfaces,
        ));

        let resolver: Arc<dyn Resolver> = match config.resolver {
            ResolverKind::Static => Arc::new(StaticResolver::for_next_nodes(&spec.next_nodes)),
            ResolverKind::Dynamic => {
                let dynamic = DynamicResolver::new(spec.next_nodes.clone());
                for mapping in &config.mappings {
                    let ethertype = mapping.ethertype.resolve()?;
                    dynamic
                        .insert_named(ethertype, &mapping.next)
                        .with_context(|| {
                            format!("mapping 0x{:04x} -> {}", ethertype, mapping.next)
                        })?;
                }
                Arc::new(dynamic)
            }
        };

        Ok(Self::new(spec, resolver, counters))
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub fn next_nodes(&self) -> &NextNodes {
        &self.spec.next_nodes
    }

    /// Names to register with the host, indexed by `NextIndex`
    pub fn next_node_names(&self) -> &[String] {
        self.spec.next_nodes.names()
    }

    pub fn next_index(&self, name: &str) -> DetunnelResult<NextIndex> {
        self.spec.next_nodes.index_of(name)
    }

    pub fn counters(&self) -> &Arc<CounterStore> {
        &self.counters
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    /// Claim worker lane `index` and return a runner for it
    pub fn worker(self: &Arc<Self>, index: usize) -> DetunnelResult<NodeWorker> {
        let lane = self.counters.claim_lane(index)?;
        Ok(NodeWorker {
            node: Arc::clone(self),
            lane,
            nexts: Vec::new(),
            last_stats: ClassifyStats::default(),
        })
    }
}

impl std::fmt::Debug for DetunnelNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetunnelNode")
            .field("spec", &self.spec)
            .field("counters", &self.counters)
            .finish()
    }
}

/// One worker's handle on a stage
#[derive(Debug)]
pub struct NodeWorker {
    node: Arc<DetunnelNode>,
    lane: CounterLane,
    nexts: Vec<NextIndex>,
    last_stats: ClassifyStats,
}

impl NodeWorker {
    pub fn node(&self) -> &Arc<DetunnelNode> {
        &self.node
    }

    pub fn lane(&self) -> usize {
        self.lane.index()
    }

    /// Summary of the most recent frame
    pub fn last_stats(&self) -> ClassifyStats {
        self.last_stats
    }

    /// Classify a frame in place, returning the parallel next array.
    ///
    /// `tracer` is enabled for this call according to the frame's trace flag.
    pub fn process_frame(
        &mut self,
        frame: &mut Frame,
        tracer: &mut Tracer,
    ) -> DetunnelResult<&[NextIndex]> {
        tracer.set_enabled(frame.trace_enabled());
        self.nexts.clear();
        self.nexts.resize(frame.len(), NextIndex::DROP);

        let spec = &self.node.spec;
        let mut classifier = Classifier::new(
            spec.layout,
            spec.uniformity,
            self.node.resolver.as_ref(),
            &mut self.lane,
        );
        self.last_stats = classifier.classify_frame(frame.packets_mut(), &mut self.nexts, tracer)?;
        Ok(&self.nexts)
    }

    /// Classify a frame and hand it to `dispatcher`. Returns the number of
    /// packets dispatched.
    pub fn run<D: Dispatcher>(
        &mut self,
        frame: &mut Frame,
        dispatcher: &mut D,
        tracer: &mut Tracer,
    ) -> Result<usize> {
        self.process_frame(frame, tracer)
            .map(|_| ())
            .with_context(|| format!("classifying frame in stage '{}'", self.node.spec.name))?;
        self.dispatch(frame, dispatcher)
    }

    /// Hand an already classified frame to `dispatcher`, using the next
    /// indices of the last `process_frame`.
    ///
    /// On error the packets are back in `frame`, still classified, so the
    /// host can dispatch them again without reclassifying.
    pub fn dispatch<D: Dispatcher>(&self, frame: &mut Frame, dispatcher: &mut D) -> Result<usize> {
        let packets = frame.take_packets();
        let n = packets.len();
        match dispatcher.enqueue_to_next(packets, &self.nexts) {
            Ok(()) => Ok(n),
            Err(DispatchError { packets, error }) => {
                warn!(
                    stage = %self.node.spec.name,
                    packets = packets.len(),
                    %error,
                    "dispatch failed, packets kept in frame"
                );
                frame
                    .restore_packets(packets)
                    .context("restoring undelivered packets")?;
                Err(anyhow::Error::new(error).context(format!(
                    "dispatching frame from stage '{}'",
                    self.node.spec.name
                )))
            }
        }
    }
}
