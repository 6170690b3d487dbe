use std::collections::BTreeMap;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::network::INVALID_NETWORK_ID;

/// Host subnets per network: `{"default":["10.128.0.0/23","fd00:10:128::/64"]}`.
pub const NODE_SUBNETS_ANNOTATION: &str = "mesh-cni.dev/node-subnets";
/// Network ids per network: `{"default":"0"}`.
pub const NETWORK_IDS_ANNOTATION: &str = "mesh-cni.dev/network-ids";
pub const HYBRID_OVERLAY_SUBNET_ANNOTATION: &str = "mesh-cni.dev/hybrid-overlay-node-subnet";
/// Nodes carrying this label are not managed by the mesh.
pub const NO_HOST_SUBNET_LABEL: &str = "mesh-cni.dev/no-host-subnet";
const OS_LABEL: &str = "kubernetes.io/os";
const HYBRID_OVERLAY_OS: &str = "windows";

type Annotations = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum AnnotationError {
    #[error("failed to decode annotation {key}: {source}")]
    Json {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value {value:?} in annotation {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SubnetsValue {
    List(Vec<String>),
    Single(String),
}

/// Host subnets declared on the node for `network`. `Ok(None)` when the node
/// declares nothing for the network.
pub fn node_subnets(
    node: &Node,
    network: &str,
) -> Result<Option<Vec<IpNetwork>>, AnnotationError> {
    let Some(raw) = node.annotations().get(NODE_SUBNETS_ANNOTATION) else {
        return Ok(None);
    };
    let mut by_network: BTreeMap<String, SubnetsValue> = decode(NODE_SUBNETS_ANNOTATION, raw)?;
    let values = match by_network.remove(network) {
        None => return Ok(None),
        Some(SubnetsValue::Single(value)) => vec![value],
        Some(SubnetsValue::List(values)) => values,
    };
    values
        .iter()
        .map(|v| parse_subnet(NODE_SUBNETS_ANNOTATION, v))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Writes `subnets` as the host subnets of `network`. An empty slice removes
/// the network, and the annotation goes away with its last network. A value
/// that does not decode is replaced.
pub fn set_node_subnets(
    annotations: &mut Annotations,
    network: &str,
    subnets: &[IpNetwork],
) -> Result<(), AnnotationError> {
    let mut by_network: BTreeMap<String, SubnetsValue> =
        decode_or_replace(annotations, NODE_SUBNETS_ANNOTATION);
    if subnets.is_empty() {
        by_network.remove(network);
    } else {
        by_network.insert(
            network.to_owned(),
            SubnetsValue::List(subnets.iter().map(ToString::to_string).collect()),
        );
    }
    let encoded: BTreeMap<String, Vec<String>> = by_network
        .into_iter()
        .map(|(k, v)| match v {
            SubnetsValue::List(values) => (k, values),
            SubnetsValue::Single(value) => (k, vec![value]),
        })
        .collect();
    store(annotations, NODE_SUBNETS_ANNOTATION, &encoded)
}

/// Network id declared on the node for `network`.
pub fn network_id(node: &Node, network: &str) -> Result<Option<i32>, AnnotationError> {
    let Some(raw) = node.annotations().get(NETWORK_IDS_ANNOTATION) else {
        return Ok(None);
    };
    let ids: BTreeMap<String, String> = decode(NETWORK_IDS_ANNOTATION, raw)?;
    ids.get(network)
        .map(|id| {
            id.parse::<i32>().map_err(|e| AnnotationError::Invalid {
                key: NETWORK_IDS_ANNOTATION,
                value: id.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

/// Writes the id of `network`; [`INVALID_NETWORK_ID`] removes it.
pub fn set_network_id(
    annotations: &mut Annotations,
    network: &str,
    id: i32,
) -> Result<(), AnnotationError> {
    let mut ids: BTreeMap<String, String> =
        decode_or_replace(annotations, NETWORK_IDS_ANNOTATION);
    if id == INVALID_NETWORK_ID {
        ids.remove(network);
    } else {
        ids.insert(network.to_owned(), id.to_string());
    }
    store(annotations, NETWORK_IDS_ANNOTATION, &ids)
}

pub fn hybrid_overlay_subnet(node: &Node) -> Result<Option<IpNetwork>, AnnotationError> {
    node.annotations()
        .get(HYBRID_OVERLAY_SUBNET_ANNOTATION)
        .map(|raw| parse_subnet(HYBRID_OVERLAY_SUBNET_ANNOTATION, raw))
        .transpose()
}

pub fn set_hybrid_overlay_subnet(annotations: &mut Annotations, subnet: &IpNetwork) {
    annotations.insert(HYBRID_OVERLAY_SUBNET_ANNOTATION.to_owned(), subnet.to_string());
}

pub fn no_host_subnet(node: &Node) -> bool {
    node.labels().contains_key(NO_HOST_SUBNET_LABEL)
}

pub fn is_hybrid_overlay_node(node: &Node) -> bool {
    node.labels().get(OS_LABEL).map(String::as_str) == Some(HYBRID_OVERLAY_OS)
}

fn decode<T: DeserializeOwned>(key: &'static str, raw: &str) -> Result<T, AnnotationError> {
    serde_json::from_str(raw).map_err(|source| AnnotationError::Json { key, source })
}

// a value that does not decode is overwritten by the next write
fn decode_or_replace<T: DeserializeOwned>(
    annotations: &Annotations,
    key: &'static str,
) -> BTreeMap<String, T> {
    let Some(raw) = annotations.get(key) else {
        return BTreeMap::new();
    };
    decode(key, raw).unwrap_or_else(|e| {
        warn!("replacing malformed annotation {} {:?}: {}", key, raw, e);
        BTreeMap::new()
    })
}

fn store<T: Serialize>(
    annotations: &mut Annotations,
    key: &'static str,
    value: &BTreeMap<String, T>,
) -> Result<(), AnnotationError> {
    if value.is_empty() {
        annotations.remove(key);
        return Ok(());
    }
    let encoded =
        serde_json::to_string(value).map_err(|source| AnnotationError::Json { key, source })?;
    annotations.insert(key.to_owned(), encoded);
    Ok(())
}

fn parse_subnet(key: &'static str, value: &str) -> Result<IpNetwork, AnnotationError> {
    IpNetwork::from_str(value.trim()).map_err(|e| AnnotationError::Invalid {
        key,
        value: value.to_owned(),
        reason: e.to_string(),
    })
}
