mod retry;

use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::serde::de::DeserializeOwned;
use kube::runtime::reflector::{ReflectHandle, Store};
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Resource};
use thiserror::Error;
use tracing::{error, trace};

pub use retry::{Backoff, retry_with_backoff};

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to create store: {0}")]
    StoreCreation(String),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Whether the API server rejected a write because the object changed since
/// it was read.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Starts a shared reflector for `api` and waits, at most `timeout`, for its
/// initial list to land in the returned store.
pub async fn create_store_and_subscriber<K>(
    api: Api<K>,
    config: watcher::Config,
    timeout: Option<Duration>,
) -> Result<(Store<K>, ReflectHandle<K>)>
where
    K: Resource + Send + Clone + Debug + DeserializeOwned + Sync + 'static,
    <K as Resource>::DynamicType: Default + Eq + Send + DeserializeOwned + Hash + Clone,
{
    let (store, writer) = reflector::store_shared(1024);
    let subscriber: ReflectHandle<K> = writer
        .subscribe()
        .ok_or_else(|| Error::StoreCreation("failed to create subscriber".into()))?;

    let stream = watcher(api, config)
        .default_backoff()
        .reflect_shared(writer)
        .for_each(|res| async move {
            match res {
                Ok(ev) => trace!("received event: {:?}", ev),
                Err(e) => {
                    error!(%e, "unexpected error with stream")
                }
            }
        });

    tokio::spawn(stream);
    let wait = store.wait_until_ready();
    if let Some(timeout) = timeout {
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::StoreCreation("timed out waiting for store".into()))?
            .map_err(|e| Error::StoreCreation(e.to_string()))?;
    } else {
        wait.await
            .map_err(|e| Error::StoreCreation(e.to_string()))?;
    }
    Ok((store, subscriber))
}
