//! Cluster View: enumerates managed pods on the local node from the
//! Kubernetes API and classifies them into HP/LP sets.
//!
//! Grounded on `other_examples/.../k8s_watcher.rs` for `kube`-crate client
//! construction and list-call idiom, and on
//! `drc_io_agent/k8s_utils.py::list_pods_on_node`/`group_pods_by_priority`
//! for the node/namespace filtering and priority-label classification.

use crate::types::{PodRef, Priority};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;

const RUNTIME_PREFIXES: &[&str] = &["docker://", "containerd://", "cri-o://"];

pub struct ClusterView {
    client: Client,
    node_name: String,
    namespace: Option<String>,
    priority_label_key: String,
    hp_value: String,
    lp_value: String,
}

impl ClusterView {
    pub fn new(
        client: Client,
        node_name: impl Into<String>,
        namespace: Option<String>,
        priority_label_key: impl Into<String>,
        hp_value: impl Into<String>,
        lp_value: impl Into<String>,
    ) -> Self {
        Self {
            client,
            node_name: node_name.into(),
            namespace,
            priority_label_key: priority_label_key.into(),
            hp_value: hp_value.into(),
            lp_value: lp_value.into(),
        }
    }

    /// Discover pods on the local node, split into (HP, LP) sets. Pods
    /// neither Running nor classified HP/LP are dropped silently; the
    /// caller never sees `Unmanaged` pods materialize here.
    ///
    /// Returns `Err` on any Kubernetes API failure so the caller can
    /// distinguish "API call failed" from "API call succeeded, zero pods
    /// matched" and count the former as a `pod_discovery` error; this
    /// collaborator stays metric-free itself, same separation as
    /// `LatencySignal`.
    pub async fn discover(&self) -> Result<(Vec<PodRef>, Vec<PodRef>), kube::Error> {
        let pods: Api<Pod> = match &self.namespace {
            Some(ns) if ns != "all" => Api::namespaced(self.client.clone(), ns),
            _ => Api::all(self.client.clone()),
        };

        let params = ListParams::default().fields(&format!("spec.nodeName={}", self.node_name));
        let list = pods.list(&params).await?;

        let mut hp = Vec::new();
        let mut lp = Vec::new();

        for pod in list.items {
            let Some(pod_ref) = self.classify(&pod) else {
                continue;
            };
            match pod_ref.priority {
                Priority::Hp => hp.push(pod_ref),
                Priority::Lp => lp.push(pod_ref),
                Priority::Unmanaged => {}
            }
        }

        Ok((hp, lp))
    }

    fn classify(&self, pod: &Pod) -> Option<PodRef> {
        let status = pod.status.as_ref()?;
        if status.phase.as_deref() != Some("Running") {
            return None;
        }

        let metadata = &pod.metadata;
        let pod_id = metadata.uid.clone()?;
        let namespace = metadata.namespace.clone().unwrap_or_default();
        let name = metadata.name.clone().unwrap_or_default();
        let labels = metadata.labels.clone().unwrap_or_default();

        let priority = match labels.get(&self.priority_label_key) {
            Some(v) if *v == self.hp_value => Priority::Hp,
            Some(v) if *v == self.lp_value => Priority::Lp,
            _ => Priority::Unmanaged,
        };
        if priority == Priority::Unmanaged {
            return None;
        }

        let container_ids = status
            .container_statuses
            .as_ref()
            .into_iter()
            .flatten()
            .filter_map(|cs| cs.container_id.as_deref())
            .map(strip_runtime_prefix)
            .collect();

        Some(PodRef {
            pod_id,
            namespace,
            name,
            node: self.node_name.clone(),
            priority,
            container_ids,
        })
    }
}

fn strip_runtime_prefix(id: &str) -> String {
    for prefix in RUNTIME_PREFIXES {
        if let Some(stripped) = id.strip_prefix(prefix) {
            return stripped.to_string();
        }
    }
    id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_known_runtime_prefixes() {
        assert_eq!(strip_runtime_prefix("docker://abc123"), "abc123");
        assert_eq!(strip_runtime_prefix("containerd://def456"), "def456");
        assert_eq!(strip_runtime_prefix("cri-o://ghi789"), "ghi789");
        assert_eq!(strip_runtime_prefix("abc123"), "abc123");
    }
}
