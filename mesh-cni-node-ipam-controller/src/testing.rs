use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use kube::api::ObjectMeta;

use crate::store::{NodeStore, StoreError};

/// In-memory [`NodeStore`] with `resourceVersion` checks.
#[derive(Default)]
pub(crate) struct FakeNodeStore {
    nodes: Mutex<BTreeMap<String, Node>>,
    conflicts: AtomicU32,
    fail_updates: AtomicBool,
    writes: AtomicU32,
}

impl FakeNodeStore {
    pub(crate) fn insert(&self, node: Node) {
        self.nodes.lock().unwrap().insert(node.name_any(), node);
    }

    pub(crate) fn remove(&self, name: &str) {
        self.nodes.lock().unwrap().remove(name);
    }

    pub(crate) fn node(&self, name: &str) -> Node {
        self.nodes.lock().unwrap().get(name).cloned().unwrap()
    }

    /// The next `n` updates fail with a conflict.
    pub(crate) fn conflict_next(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    pub(crate) fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Successful updates so far.
    pub(crate) fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeStore for FakeNodeStore {
    async fn get(&self, name: &str) -> Result<Node, StoreError> {
        self.nodes
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))
    }

    // supports "" and "!label" selectors
    async fn list(&self, label_selector: &str) -> Result<Vec<Node>, StoreError> {
        let excluded = label_selector.strip_prefix('!');
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .values()
            .filter(|n| excluded.is_none_or(|key| !n.labels().contains_key(key)))
            .cloned()
            .collect())
    }

    async fn update_status(&self, mut node: Node) -> Result<Node, StoreError> {
        let name = node.name_any();
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::NotFound(name));
        }
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Conflict(name));
        }
        let mut nodes = self.nodes.lock().unwrap();
        let Some(current) = nodes.get(&name) else {
            return Err(StoreError::NotFound(name));
        };
        if current.resource_version() != node.resource_version() {
            return Err(StoreError::Conflict(name));
        }
        let version: u64 = node
            .resource_version()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        node.metadata.resource_version = Some((version + 1).to_string());
        nodes.insert(name, node.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(node)
    }
}

pub(crate) fn make_node(name: &str, annotations: &[(&str, &str)], labels: &[(&str, &str)]) -> Node {
    let to_map = |pairs: &[(&str, &str)]| {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>()
    };
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            resource_version: Some("1".into()),
            annotations: Some(to_map(annotations)),
            labels: Some(to_map(labels)),
            ..Default::default()
        },
        ..Default::default()
    }
}
