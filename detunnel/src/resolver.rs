//! Ethertype to next-node resolution
//!
//! Two strategies behind one trait:
//! - `StaticResolver`: a closed set of well-known ethertypes bound at build
//!   time, everything else drops
//! - `DynamicResolver`: a runtime map, updated by copy-and-swap so lookups
//!   never wait on an administrative write

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::DetunnelResult;
use crate::header::{ETHERTYPE_DOT1AD, ETHERTYPE_IP4, ETHERTYPE_IP6, ETHERTYPE_MPLS, ETHERTYPE_VLAN};
use crate::next::{NextIndex, NextNodes, IP4_INPUT, IP6_INPUT, MPLS_INPUT, VLAN_DETUNNEL};

/// Maps an extracted type value to a next node. Misses resolve to
/// `NextIndex::DROP`.
pub trait Resolver: Send + Sync {
    fn resolve(&self, ethertype: u16) -> NextIndex;

    /// Resolve a whole group. `out` must be at least as long as `types`.
    fn resolve_group(&self, types: &[u16], out: &mut [NextIndex]) {
        for (t, o) in types.iter().zip(out.iter_mut()) {
            *o = self.resolve(*t);
        }
    }
}

/// Ethertypes a `StaticResolver` knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownEthertype {
    Vlan,
    Dot1ad,
    Ip4,
    Ip6,
    Mpls,
}

impl KnownEthertype {
    pub const ALL: [KnownEthertype; 5] = [
        KnownEthertype::Vlan,
        KnownEthertype::Dot1ad,
        KnownEthertype::Ip4,
        KnownEthertype::Ip6,
        KnownEthertype::Mpls,
    ];

    pub fn ethertype(self) -> u16 {
        match self {
            KnownEthertype::Vlan => ETHERTYPE_VLAN,
            KnownEthertype::Dot1ad => ETHERTYPE_DOT1AD,
            KnownEthertype::Ip4 => ETHERTYPE_IP4,
            KnownEthertype::Ip6 => ETHERTYPE_IP6,
            KnownEthertype::Mpls => ETHERTYPE_MPLS,
        }
    }

    #[inline(always)]
    fn slot(self) -> usize {
        self as usize
    }
}

/// Compiled mapping over `KnownEthertype`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticResolver {
    /// (ethertype, next) per known type; unbound types hold DROP
    table: [(u16, NextIndex); 5],
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticResolver {
    /// Resolver with every type unbound
    pub fn new() -> Self {
        Self {
            table: KnownEthertype::ALL.map(|k| (k.ethertype(), NextIndex::DROP)),
        }
    }

    pub fn bind(mut self, known: KnownEthertype, next: NextIndex) -> Self {
        self.table[known.slot()].1 = next;
        self
    }

    /// Bind every known type whose conventional next node is declared in
    /// `next_nodes`
    pub fn for_next_nodes(next_nodes: &NextNodes) -> Self {
        let mut resolver = Self::new();
        let conventional = [
            (KnownEthertype::Vlan, VLAN_DETUNNEL),
            (KnownEthertype::Ip4, IP4_INPUT),
            (KnownEthertype::Ip6, IP6_INPUT),
            (KnownEthertype::Mpls, MPLS_INPUT),
        ];
        for (known, name) in conventional {
            if let Ok(next) = next_nodes.index_of(name) {
                resolver = resolver.bind(known, next);
            }
        }
        resolver
    }

    pub fn binding(&self, known: KnownEthertype) -> NextIndex {
        self.table[known.slot()].1
    }
}

impl Resolver for StaticResolver {
    #[inline(always)]
    fn resolve(&self, ethertype: u16) -> NextIndex {
        match ethertype {
            ETHERTYPE_VLAN => self.table[KnownEthertype::Vlan.slot()].1,
            ETHERTYPE_DOT1AD => self.table[KnownEthertype::Dot1ad.slot()].1,
            ETHERTYPE_IP4 => self.table[KnownEthertype::Ip4.slot()].1,
            ETHERTYPE_IP6 => self.table[KnownEthertype::Ip6.slot()].1,
            ETHERTYPE_MPLS => self.table[KnownEthertype::Mpls.slot()].1,
            _ => NextIndex::DROP,
        }
    }

    /// Compare-and-select across the known table: each lane ORs in the next
    /// index of the single key it equals, or stays 0 (drop).
    #[inline]
    fn resolve_group(&self, types: &[u16], out: &mut [NextIndex]) {
        for (t, o) in types.iter().zip(out.iter_mut()) {
            let mut acc = 0u16;
            for &(key, next) in &self.table {
                let mask = ((*t == key) as u16).wrapping_neg();
                acc |= next.0 & mask;
            }
            *o = NextIndex(acc);
        }
    }
}

/// Runtime-mutable mapping
pub struct DynamicResolver {
    next_nodes: NextNodes,
    map: ArcSwap<HashMap<u16, NextIndex>>,
    /// Serialises writers only
    write_lock: Mutex<()>,
}

impl DynamicResolver {
    pub fn new(next_nodes: NextNodes) -> Self {
        Self {
            next_nodes,
            map: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn next_nodes(&self) -> &NextNodes {
        &self.next_nodes
    }

    /// Add or replace a mapping. Returns the previous next index, if any.
    pub fn insert(&self, ethertype: u16, next: NextIndex) -> DetunnelResult<Option<NextIndex>> {
        if let Err(e) = self.next_nodes.validate(next) {
            warn!(ethertype = format_args!("0x{:04x}", ethertype), %next, "rejected mapping");
            return Err(e);
        }

        let _guard = self.write_lock.lock();
        let mut updated = HashMap::clone(&self.map.load());
        let previous = updated.insert(ethertype, next);
        self.map.store(Arc::new(updated));

        debug!(
            stage = self.next_nodes.stage(),
            ethertype = format_args!("0x{:04x}", ethertype),
            next = self.next_nodes.name(next).unwrap_or("?"),
            "ethertype mapping added"
        );
        Ok(previous)
    }

    /// Add a mapping by next node name
    pub fn insert_named(&self, ethertype: u16, next: &str) -> DetunnelResult<Option<NextIndex>> {
        let next = self.next_nodes.index_of(next)?;
        self.insert(ethertype, next)
    }

    /// Remove a mapping. Later lookups of `ethertype` drop.
    pub fn remove(&self, ethertype: u16) -> Option<NextIndex> {
        let _guard = self.write_lock.lock();
        let current = self.map.load();
        if !current.contains_key(&ethertype) {
            return None;
        }
        let mut updated = HashMap::clone(&current);
        let previous = updated.remove(&ethertype);
        self.map.store(Arc::new(updated));

        debug!(
            stage = self.next_nodes.stage(),
            ethertype = format_args!("0x{:04x}", ethertype),
            "ethertype mapping removed"
        );
        previous
    }

    /// Current mappings sorted by ethertype
    pub fn mappings(&self) -> Vec<(u16, NextIndex)> {
        let mut all: Vec<_> = self.map.load().iter().map(|(k, v)| (*k, *v)).collect();
        all.sort_unstable();
        all
    }

    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.load().is_empty()
    }
}

impl Resolver for DynamicResolver {
    #[inline]
    fn resolve(&self, ethertype: u16) -> NextIndex {
        self.map
            .load()
            .get(&ethertype)
            .copied()
            .unwrap_or(NextIndex::DROP)
    }

    /// One snapshot load for the whole group
    #[inline]
    fn resolve_group(&self, types: &[u16], out: &mut [NextIndex]) {
        let map = self.map.load();
        for (t, o) in types.iter().zip(out.iter_mut()) {
            *o = map.get(t).copied().unwrap_or(NextIndex::DROP);
        }
    }
}

impl std::fmt::Debug for DynamicResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicResolver")
            .field("stage", &self.next_nodes.stage())
            .field("mappings", &self.mappings())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::next::ERROR_DROP;

    fn ethernet_nexts() -> NextNodes {
        NextNodes::new("ethernet", [ERROR_DROP, VLAN_DETUNNEL, IP4_INPUT, IP6_INPUT])
    }

    #[test]
    fn test_static_for_next_nodes() {
        let r = StaticResolver::for_next_nodes(&ethernet_nexts());
        assert_eq!(r.resolve(ETHERTYPE_VLAN), NextIndex(1));
        assert_eq!(r.resolve(ETHERTYPE_IP4), NextIndex(2));
        assert_eq!(r.resolve(ETHERTYPE_IP6), NextIndex(3));
        // not declared by the ethernet stage
        assert_eq!(r.resolve(ETHERTYPE_MPLS), NextIndex::DROP);
        assert_eq!(r.resolve(0x88CC), NextIndex::DROP);
    }

    #[test]
    fn test_static_group_matches_scalar() {
        let r = StaticResolver::new()
            .bind(KnownEthertype::Vlan, NextIndex(1))
            .bind(KnownEthertype::Dot1ad, NextIndex(1))
            .bind(KnownEthertype::Ip6, NextIndex(3))
            .bind(KnownEthertype::Mpls, NextIndex(4));
        let types = [
            ETHERTYPE_VLAN,
            ETHERTYPE_IP4,
            ETHERTYPE_IP6,
            0x0000,
            ETHERTYPE_MPLS,
            ETHERTYPE_DOT1AD,
            0xFFFF,
            ETHERTYPE_VLAN,
        ];
        let mut group = [NextIndex::DROP; 8];
        r.resolve_group(&types, &mut group);
        for (t, g) in types.iter().zip(group) {
            assert_eq!(r.resolve(*t), g, "ethertype 0x{:04x}", t);
        }
    }

    #[test]
    fn test_dynamic_insert_remove() {
        let r = DynamicResolver::new(ethernet_nexts());
        assert_eq!(r.resolve(0x88CC), NextIndex::DROP);

        assert_eq!(r.insert(0x88CC, NextIndex(2)).unwrap(), None);
        assert_eq!(r.resolve(0x88CC), NextIndex(2));
        assert_eq!(r.insert(0x88CC, NextIndex(3)).unwrap(), Some(NextIndex(2)));

        assert_eq!(r.remove(0x88CC), Some(NextIndex(3)));
        assert_eq!(r.remove(0x88CC), None);
        assert_eq!(r.resolve(0x88CC), NextIndex::DROP);
    }

    #[test]
    fn test_dynamic_rejects_undeclared_next() {
        let r = DynamicResolver::new(ethernet_nexts());
        assert!(r.insert(ETHERTYPE_IP4, NextIndex(4)).is_err());
        assert!(r.insert_named(ETHERTYPE_MPLS, MPLS_INPUT).is_err());
        assert!(r.is_empty());
    }

    #[test]
    fn test_dynamic_group_uses_one_snapshot() {
        let r = DynamicResolver::new(ethernet_nexts());
        r.insert_named(ETHERTYPE_IP4, IP4_INPUT).unwrap();
        r.insert_named(ETHERTYPE_IP6, IP6_INPUT).unwrap();

        let mut out = [NextIndex::DROP; 4];
        r.resolve_group(&[ETHERTYPE_IP6, 0x88CC, ETHERTYPE_IP4, ETHERTYPE_VLAN], &mut out);
        assert_eq!(
            out,
            [NextIndex(3), NextIndex::DROP, NextIndex(2), NextIndex::DROP]
        );
        assert_eq!(
            r.mappings(),
            vec![(ETHERTYPE_IP4, NextIndex(2)), (ETHERTYPE_IP6, NextIndex(3))]
        );
    }
}
