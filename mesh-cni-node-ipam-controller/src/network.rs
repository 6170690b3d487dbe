use std::fmt::Display;
use std::str::FromStr;

use mesh_cni_ipam::{Families, SubnetRange};

use crate::{Error, Result};

pub const DEFAULT_NETWORK: &str = "default";
pub const DEFAULT_NETWORK_ID: i32 = 0;
/// Network id meaning "no network assigned"; writing it removes the id.
pub const INVALID_NETWORK_ID: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    #[default]
    Layer3,
    Layer2,
    Localnet,
}

impl FromStr for Topology {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "layer3" => Ok(Topology::Layer3),
            "layer2" => Ok(Topology::Layer2),
            "localnet" => Ok(Topology::Localnet),
            other => Err(Error::InvalidNetwork(format!("unknown topology {other}"))),
        }
    }
}

impl Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topology::Layer3 => f.write_str("layer3"),
            Topology::Layer2 => f.write_str("layer2"),
            Topology::Localnet => f.write_str("localnet"),
        }
    }
}

/// Static description of the logical network a reconciler serves.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkContext {
    pub name: String,
    pub id: i32,
    pub secondary: bool,
    pub topology: Topology,
    pub families: Families,
    pub cluster_subnets: Vec<SubnetRange>,
}

impl NetworkContext {
    /// The cluster default network; enabled families follow the ranges.
    pub fn default_network(cluster_subnets: Vec<SubnetRange>) -> Self {
        Self {
            name: DEFAULT_NETWORK.to_owned(),
            id: DEFAULT_NETWORK_ID,
            secondary: false,
            topology: Topology::Layer3,
            families: Families::from_ranges(&cluster_subnets),
            cluster_subnets,
        }
    }

    pub fn secondary(
        name: impl Into<String>,
        id: i32,
        topology: Topology,
        cluster_subnets: Vec<SubnetRange>,
    ) -> Self {
        Self {
            name: name.into(),
            id,
            secondary: true,
            topology,
            families: Families::from_ranges(&cluster_subnets),
            cluster_subnets,
        }
    }

    /// Per-node subnets exist for the default network and layer3 secondaries.
    pub fn has_node_subnet_allocation(&self) -> bool {
        !self.secondary || self.topology == Topology::Layer3
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidNetwork("network name is empty".into()));
        }
        if self.id == INVALID_NETWORK_ID {
            return Err(Error::InvalidNetwork(format!(
                "network {} uses the reserved id {}",
                self.name, INVALID_NETWORK_ID
            )));
        }
        if self.has_node_subnet_allocation() && self.families.is_empty() {
            return Err(Error::InvalidNetwork(format!(
                "network {} needs at least one cluster subnet",
                self.name
            )));
        }
        Ok(())
    }
}

/// Hybrid overlay address space, only used by the default network.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HybridOverlayConfig {
    pub enabled: bool,
    pub cluster_subnets: Vec<SubnetRange>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(values: &[&str]) -> Vec<SubnetRange> {
        values.iter().map(|v| v.parse().unwrap()).collect()
    }

    #[test]
    fn subnet_allocation_eligibility() {
        let default = NetworkContext::default_network(ranges(&["10.128.0.0/14/23"]));
        assert!(default.has_node_subnet_allocation());
        assert_eq!(default.families, Families::V4);

        let l3 = NetworkContext::secondary("blue", 2, Topology::Layer3, ranges(&["10.200.0.0/16"]));
        assert!(l3.has_node_subnet_allocation());

        let l2 = NetworkContext::secondary("green", 3, Topology::Layer2, vec![]);
        assert!(!l2.has_node_subnet_allocation());
        assert!(l2.validate().is_ok());
    }

    #[test]
    fn validation_rejects_unusable_networks() {
        assert!(NetworkContext::default_network(vec![]).validate().is_err());
        let mut network = NetworkContext::default_network(ranges(&["10.128.0.0/14"]));
        network.id = INVALID_NETWORK_ID;
        assert!(network.validate().is_err());
    }

    #[test]
    fn topology_parses_case_insensitively() {
        assert_eq!("Layer2".parse::<Topology>().unwrap(), Topology::Layer2);
        assert_eq!(Topology::Localnet.to_string(), "localnet");
        assert!("layer7".parse::<Topology>().is_err());
    }
}
