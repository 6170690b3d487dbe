pub mod config;
pub mod controller;
pub mod http;
pub mod metrics;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("controller error: {0}")]
    Controller(#[from] mesh_cni_node_ipam_controller::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
