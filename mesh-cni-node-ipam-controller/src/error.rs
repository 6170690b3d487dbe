use thiserror::Error;

use crate::annotations::AnnotationError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube utils error: {0}")]
    KubeUtils(#[from] mesh_cni_k8s_utils::Error),

    #[error("subnet pool error: {0}")]
    Pool(#[from] mesh_cni_ipam::Error),

    #[error("annotation error: {0}")]
    Annotation(#[from] AnnotationError),

    #[error("node store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to update node {node}: {source}")]
    UpdateNode {
        node: String,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid network configuration: {0}")]
    InvalidNetwork(String),
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Store(e) => e.is_conflict(),
            Error::UpdateNode { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    /// The node the error is about no longer exists.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Store(e) => e.is_not_found(),
            Error::UpdateNode { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeUtils(_) => "kube_utils",
            Error::Pool(_) => "pool",
            Error::Annotation(_) => "annotation",
            Error::Store(_) => "store",
            Error::UpdateNode { .. } => "update_node",
            Error::InvalidNetwork(_) => "invalid_network",
        }
        .to_owned()
    }
}
