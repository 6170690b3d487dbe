use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::State as AxumState,
    response::{IntoResponse, Response},
    routing::get,
};
use http::StatusCode;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{Result, http::shutdown};

#[derive(Clone)]
pub(crate) struct State {
    registry: Arc<Registry>,
    ready: CancellationToken,
}

impl State {
    pub fn new(registry: Arc<Registry>, ready: CancellationToken) -> Self {
        Self { registry, ready }
    }

    pub fn ready(&self) -> Readiness {
        if self.ready.is_cancelled() {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }

    pub fn metrics(&self) -> String {
        let mut buffer = String::new();
        match prometheus_client::encoding::text::encode(&mut buffer, &self.registry) {
            Ok(_) => buffer,
            Err(e) => {
                error!(%e, "failed to encode metrics");
                "".into()
            }
        }
    }
}

pub(crate) async fn serve(
    addr: SocketAddr,
    state: Arc<State>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("metrics listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

pub(crate) fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn metrics(AxumState(handler): AxumState<Arc<State>>) -> String {
    handler.metrics()
}

async fn readyz(AxumState(handler): AxumState<Arc<State>>) -> Readiness {
    handler.ready()
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Readiness {
    Ready,
    NotReady,
}

impl IntoResponse for Readiness {
    fn into_response(self) -> Response {
        match self {
            Readiness::Ready => (StatusCode::OK, "Ok").into_response(),
            Readiness::NotReady => (StatusCode::INTERNAL_SERVER_ERROR, "NotReady").into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use mesh_cni_ipam::Family;

    use super::*;
    use crate::metrics::Metrics;

    #[test]
    fn ready_after_token_is_cancelled() {
        let ready = CancellationToken::new();
        let state = State::new(Arc::new(Registry::default()), ready.child_token());
        assert_eq!(state.ready(), Readiness::NotReady);
        assert_eq!(
            Readiness::NotReady.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        ready.cancel();
        assert_eq!(state.ready(), Readiness::Ready);
        assert_eq!(Readiness::Ready.into_response().status(), StatusCode::OK);
    }

    #[test]
    fn metrics_are_prefixed() {
        let metrics = Metrics::default();
        metrics.subnets.record_count((256, 0));
        assert_eq!(metrics.subnets.host_subnets(Family::V4), 256);

        let state = State::new(metrics.registry.clone(), CancellationToken::new());
        let body = state.metrics();
        assert!(body.contains(r#"mesh_cni_node_ipam_host_subnets{family="ipv4"} 256"#));
        assert!(body.contains("mesh_cni_node_ipam_reconcile_runs"));
    }
}
