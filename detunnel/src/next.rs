//! Next-node indices and the per-stage next-node table

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DetunnelError, DetunnelResult};

/// Index into a stage's declared next nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct NextIndex(pub u16);

impl NextIndex {
    /// Always slot 0 of every stage's table
    pub const DROP: Self = NextIndex(0);

    #[inline(always)]
    pub fn is_drop(self) -> bool {
        self == Self::DROP
    }

    #[inline(always)]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NextIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const ERROR_DROP: &str = "error-drop";
pub const VLAN_DETUNNEL: &str = "vlan-detunnel";
pub const IP4_INPUT: &str = "ip4-input";
pub const IP6_INPUT: &str = "ip6-input";
pub const MPLS_INPUT: &str = "mpls-input";

/// Names of the next nodes a stage may send to, registered with the host.
///
/// Slot 0 is always `error-drop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextNodes {
    stage: String,
    names: Vec<String>,
}

impl NextNodes {
    /// Declare next nodes for `stage`. `error-drop` is inserted at slot 0
    /// when `names` does not already start with it.
    pub fn new<S: Into<String>>(stage: impl Into<String>, names: impl IntoIterator<Item = S>) -> Self {
        let mut declared: Vec<String> = names.into_iter().map(Into::into).collect();
        if declared.first().map(String::as_str) != Some(ERROR_DROP) {
            declared.insert(0, ERROR_DROP.to_string());
        }
        Self {
            stage: stage.into(),
            names: declared,
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, next: NextIndex) -> Option<&str> {
        self.names.get(next.as_usize()).map(String::as_str)
    }

    pub fn contains(&self, next: NextIndex) -> bool {
        next.as_usize() < self.names.len()
    }

    /// Look up a next node by name
    pub fn index_of(&self, name: &str) -> DetunnelResult<NextIndex> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| NextIndex(i as u16))
            .ok_or_else(|| DetunnelError::UnknownNextName {
                stage: self.stage.clone(),
                name: name.to_string(),
            })
    }

    /// Reject indices outside the declared set
    pub fn validate(&self, next: NextIndex) -> DetunnelResult<NextIndex> {
        if self.contains(next) {
            Ok(next)
        } else {
            Err(DetunnelError::InvalidNext {
                stage: self.stage.clone(),
                next: next.0,
                declared: self.names.len(),
            })
        }
    }
}
