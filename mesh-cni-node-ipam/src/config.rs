use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};
use mesh_cni_ipam::SubnetRange;
use mesh_cni_node_ipam_controller::network::{DEFAULT_NETWORK, DEFAULT_NETWORK_ID};
use mesh_cni_node_ipam_controller::{HybridOverlayConfig, NetworkContext, Topology};

use crate::{Error, Result};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Allocate host subnets to nodes
    Controller(ControllerArgs),
    /// Remove a network from every node and exit
    Cleanup(CleanupArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NetworkArgs {
    /// Name of the network subnets are allocated for
    #[arg(long, env = "NETWORK_NAME", default_value = DEFAULT_NETWORK)]
    pub network_name: String,

    /// Numeric id recorded on nodes for the network
    #[arg(long, env = "NETWORK_ID", default_value_t = DEFAULT_NETWORK_ID)]
    pub network_id: i32,

    /// Network is a secondary network rather than the cluster default
    #[arg(long, env = "SECONDARY_NETWORK")]
    pub secondary: bool,

    /// Topology of a secondary network: layer3, layer2 or localnet
    #[arg(long, env = "NETWORK_TOPOLOGY", default_value = "layer3")]
    pub topology: Topology,

    /// Cluster subnets as cidr[/hostPrefix], e.g. 10.128.0.0/14/23
    #[arg(long, env = "CLUSTER_SUBNETS", value_delimiter = ',')]
    pub cluster_subnet: Vec<SubnetRange>,
}

impl NetworkArgs {
    /// The configured network, validated for allocation.
    pub fn network(&self) -> Result<NetworkContext> {
        let network = self.context()?;
        network.validate()?;
        Ok(network)
    }

    /// The configured network without the checks allocation needs; enough
    /// to remove the network from nodes.
    pub fn context(&self) -> Result<NetworkContext> {
        let network = if self.secondary {
            NetworkContext::secondary(
                self.network_name.clone(),
                self.network_id,
                self.topology,
                self.cluster_subnet.clone(),
            )
        } else {
            if self.network_name != DEFAULT_NETWORK {
                return Err(Error::InvalidConfig(format!(
                    "network {} must be declared with --secondary",
                    self.network_name
                )));
            }
            NetworkContext {
                id: self.network_id,
                ..NetworkContext::default_network(self.cluster_subnet.clone())
            }
        };
        Ok(network)
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    /// Metrics listener for the controller
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,

    #[command(flatten)]
    pub network: NetworkArgs,

    /// Allocate hybrid overlay subnets to windows nodes
    #[arg(long, env = "ENABLE_HYBRID_OVERLAY")]
    pub enable_hybrid_overlay: bool,

    /// Hybrid overlay subnets as cidr[/hostPrefix]
    #[arg(long, env = "HYBRID_OVERLAY_SUBNETS", value_delimiter = ',')]
    pub hybrid_overlay_subnet: Vec<SubnetRange>,

    /// Number of nodes reconciled at the same time
    #[arg(long, default_value_t = 10)]
    pub concurrency: u16,
}

impl ControllerArgs {
    pub fn hybrid_overlay(&self) -> Result<HybridOverlayConfig> {
        if self.enable_hybrid_overlay && self.hybrid_overlay_subnet.is_empty() {
            return Err(Error::InvalidConfig(
                "hybrid overlay is enabled without hybrid overlay subnets".into(),
            ));
        }
        Ok(HybridOverlayConfig {
            enabled: self.enable_hybrid_overlay,
            cluster_subnets: self.hybrid_overlay_subnet.clone(),
        })
    }
}

#[derive(Parser, Debug, Clone)]
pub struct CleanupArgs {
    #[command(flatten)]
    pub network: NetworkArgs,
}

#[cfg(test)]
mod tests {
    use mesh_cni_ipam::Families;

    use super::*;

    fn controller(args: &[&str]) -> ControllerArgs {
        let argv = ["mesh-cni-node-ipam", "controller"].iter().chain(args);
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Commands::Controller(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn default_network_from_flags() {
        let args = controller(&["--cluster-subnet", "10.128.0.0/14/23,fd00:10:128::/48"]);
        let network = args.network.network().unwrap();
        assert_eq!(network.name, "default");
        assert_eq!(network.families, Families::DUAL_STACK);
        assert_eq!(network.cluster_subnets[0].host_prefix, 23);
        assert_eq!(network.cluster_subnets[1].host_prefix, 64);
        assert_eq!(args.concurrency, 10);
        assert!(!args.hybrid_overlay().unwrap().enabled);
    }

    #[test]
    fn secondary_network_from_flags() {
        let args = controller(&[
            "--secondary",
            "--network-name",
            "blue",
            "--network-id",
            "4",
            "--topology",
            "layer2",
        ]);
        let network = args.network.network().unwrap();
        assert!(network.secondary);
        assert_eq!(network.topology, Topology::Layer2);
        assert!(!network.has_node_subnet_allocation());
    }

    #[test]
    fn rejects_inconsistent_flags() {
        let args = controller(&["--network-name", "blue", "--cluster-subnet", "10.200.0.0/16"]);
        assert!(args.network.network().is_err());

        let args = controller(&["--enable-hybrid-overlay", "--cluster-subnet", "10.128.0.0/14"]);
        assert!(args.hybrid_overlay().is_err());

        let argv = ["mesh-cni-node-ipam", "controller", "--cluster-subnet", "10.0.0.0/99"];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn cleanup_requires_nothing_but_the_network() {
        let cli = Cli::try_parse_from([
            "mesh-cni-node-ipam",
            "cleanup",
            "--secondary",
            "--network-name",
            "blue",
        ])
        .unwrap();
        let Commands::Cleanup(args) = cli.command else {
            panic!("expected cleanup");
        };
        assert_eq!(args.network.context().unwrap().name, "blue");
        assert!(args.network.network().is_err());
    }
}
