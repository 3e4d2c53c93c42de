use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::classify::Uniformity;
use crate::counters::{DEFAULT_MAX_INTERFACES, MAX_INTERFACES_LIMIT, MAX_LANES};
use crate::error::DetunnelResult;
use crate::header::parse_ethertype;

/// Which header the stage strips
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    #[default]
    Ethernet,
    Vlan,
}

/// Ethertype to next-node strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverKind {
    #[default]
    Static,
    Dynamic,
}

/// Ethertype written either as a number (`0x88cc` in TOML) or a name
/// (`"lldp"`, `"0x88cc"`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EthertypeValue {
    Number(u16),
    Name(String),
}

impl EthertypeValue {
    pub fn resolve(&self) -> DetunnelResult<u16> {
        match self {
            EthertypeValue::Number(n) => Ok(*n),
            EthertypeValue::Name(s) => parse_ethertype(s),
        }
    }
}

/// One dynamic resolver entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingConfig {
    pub ethertype: EthertypeValue,
    /// Next node name, e.g. "ip4-input"
    pub next: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetunnelConfig {
    #[serde(default)]
    pub stage: StageKind,

    /// Number of worker threads, one counter lane each
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_max_interfaces")]
    pub max_interfaces: u32,

    #[serde(default)]
    pub uniformity: Uniformity,

    #[serde(default)]
    pub resolver: ResolverKind,

    /// Only used by the dynamic resolver
    #[serde(default)]
    pub mappings: Vec<MappingConfig>,
}

fn default_workers() -> usize {
    1
}

fn default_max_interfaces() -> u32 {
    DEFAULT_MAX_INTERFACES
}

impl Default for DetunnelConfig {
    fn default() -> Self {
        Self {
            stage: StageKind::Ethernet,
            workers: 1,
            max_interfaces: DEFAULT_MAX_INTERFACES,
            uniformity: Uniformity::Relaxed,
            resolver: ResolverKind::Static,
            mappings: Vec::new(),
        }
    }
}

impl DetunnelConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: DetunnelConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > MAX_LANES {
            bail!("workers must be between 1 and {}", MAX_LANES);
        }
        if self.max_interfaces == 0 || self.max_interfaces > MAX_INTERFACES_LIMIT {
            bail!("max_interfaces must be between 1 and {}", MAX_INTERFACES_LIMIT);
        }
        if self.resolver == ResolverKind::Static && !self.mappings.is_empty() {
            bail!("mappings require resolver = \"dynamic\"");
        }
        for mapping in &self.mappings {
            mapping.ethertype.resolve()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config = DetunnelConfig::from_toml_str("stage = \"vlan\"").unwrap();
        assert_eq!(config.stage, StageKind::Vlan);
        assert_eq!(config.workers, 1);
        assert_eq!(config.max_interfaces, DEFAULT_MAX_INTERFACES);
        assert_eq!(config.uniformity, Uniformity::Relaxed);
        assert_eq!(config.resolver, ResolverKind::Static);
    }

    #[test]
    fn test_mappings_accept_numbers_and_names() {
        let config = DetunnelConfig::from_toml_str(
            r#"
            resolver = "dynamic"

            [[mappings]]
            ethertype = 0x88CC
            next = "ip4-input"

            [[mappings]]
            ethertype = "ipv6"
            next = "ip6-input"
            "#,
        )
        .unwrap();
        assert_eq!(config.mappings[0].ethertype.resolve().unwrap(), 0x88CC);
        assert_eq!(config.mappings[1].ethertype.resolve().unwrap(), 0x86DD);
    }

    #[test]
    fn test_validate_rejects() {
        assert!(DetunnelConfig::from_toml_str("workers = 0").is_err());
        assert!(DetunnelConfig::from_toml_str("workers = 257").is_err());
        assert!(DetunnelConfig::from_toml_str("max_interfaces = 0").is_err());
        assert!(DetunnelConfig::from_toml_str("max_interfaces = 4294967295").is_err());
        assert!(DetunnelConfig::from_toml_str("max_interfaces = 1048576").is_ok());
        assert!(DetunnelConfig::from_toml_str(
            r#"
            [[mappings]]
            ethertype = 0x0800
            next = "ip4-input"
            "#
        )
        .is_err());
        assert!(DetunnelConfig::from_toml_str(
            r#"
            resolver = "dynamic"
            [[mappings]]
            ethertype = "ipx"
            next = "ip4-input"
            "#
        )
        .is_err());
    }
}
