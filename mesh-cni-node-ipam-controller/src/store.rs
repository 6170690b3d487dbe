use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, ResourceExt};
use mesh_cni_k8s_utils::{is_conflict, is_not_found};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("node {0} was modified since it was read")]
    Conflict(String),

    #[error("node {0} not found")]
    NotFound(String),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("failed to encode node {0}: {1}")]
    Encode(String, String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Node records as seen by the reconciler.
///
/// Every call returns an owned copy, so callers are free to modify what they
/// get back. `update_status` is conditional on the `resourceVersion` of the
/// node it is given and fails with [`StoreError::Conflict`] when the record
/// changed in the meantime.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Node, StoreError>;

    async fn list(&self, label_selector: &str) -> Result<Vec<Node>, StoreError>;

    async fn update_status(&self, node: Node) -> Result<Node, StoreError>;
}

/// [`NodeStore`] backed by the API server.
#[derive(Clone)]
pub struct KubeNodeStore {
    api: Api<Node>,
}

impl KubeNodeStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeStore for KubeNodeStore {
    async fn get(&self, name: &str) -> Result<Node, StoreError> {
        self.api.get(name).await.map_err(|e| classify(name, e))
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<Node>, StoreError> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.api.list(&params).await?.items)
    }

    // annotations may be written through the node status subresource
    async fn update_status(&self, node: Node) -> Result<Node, StoreError> {
        let name = node.name_any();
        let data = serde_json::to_vec(&node)
            .map_err(|e| StoreError::Encode(name.clone(), e.to_string()))?;
        self.api
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| classify(&name, e))
    }
}

fn classify(name: &str, err: kube::Error) -> StoreError {
    if is_conflict(&err) {
        StoreError::Conflict(name.to_owned())
    } else if is_not_found(&err) {
        StoreError::NotFound(name.to_owned())
    } else {
        StoreError::KubeError(err)
    }
}
