//! The `ClickHouseCluster` custom resource.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, Toleration};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired shape of a sharded, replicated ClickHouse cluster.
///
/// `dataCapacity`, `dataStorageClass` and `resources` cannot change once accepted;
/// the operator reverts such edits.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "clickhouse.chop.dev",
    version = "v1",
    kind = "ClickHouseCluster",
    plural = "clickhouseclusters",
    shortname = "chc",
    namespaced,
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Shards", "type":"integer", "jsonPath":".spec.shardsCount"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicasCount"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Server image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    /// Init container image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub init_image: String,

    /// Delete persistent volume claims when the cluster is deleted
    #[serde(default, rename = "deletePVC")]
    pub delete_pvc: bool,

    #[serde(default)]
    pub shards_count: i32,

    #[serde(default)]
    pub replicas_count: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zookeeper: Option<ZookeeperConfig>,

    /// Raw XML settings, e.g. `<yandex>...</yandex>`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub custom_settings: String,

    /// Raw users XML
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub users: String,

    /// Volume size for each replica
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_capacity: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_storage_class: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodPolicy>,

    #[serde(default)]
    pub resources: ClusterResources,
}

/// Placement policy for pods created by the operator.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodPolicy {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ClusterResources {
    #[serde(default)]
    pub requests: CpuAndMem,
    #[serde(default)]
    pub limits: CpuAndMem,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct CpuAndMem {
    #[serde(default)]
    pub cpu: String,
    #[serde(default)]
    pub memory: String,
}

impl CpuAndMem {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty() && self.memory.is_empty()
    }
}

/// Coordination service settings rendered into `zookeeper.xml`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ZookeeperConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<ZookeeperNode>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub session_timeout_ms: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub operation_timeout_ms: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub root: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ZookeeperNode {
    pub host: String,
    pub port: i32,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    Initializing,
    Running,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Initializing => f.write_str("Initializing"),
            Phase::Running => f.write_str("Running"),
        }
    }
}

/// Observed state. Recomputed on every pass.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    /// Keyed by shard workload name
    #[serde(default)]
    pub shard_status: BTreeMap<String, ShardStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct ShardStatus {
    pub phase: Phase,
}

impl ClusterStatus {
    /// Running only when exactly `shards_count` shards are tracked and all of them run.
    pub fn aggregate_phase(&self, shards_count: usize) -> Phase {
        let all_running = self.shard_status.values().all(|s| s.phase == Phase::Running);
        if shards_count > 0 && self.shard_status.len() == shards_count && all_running {
            Phase::Running
        } else {
            Phase::Initializing
        }
    }
}

impl ClickHouseCluster {
    pub fn phase(&self) -> Option<Phase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata.finalizers.as_ref().map(|f| f.iter().any(|x| x == finalizer)).unwrap_or(false)
    }

    /// Add or drop `finalizer`. Returns true when the list changed.
    pub fn set_finalizer(&mut self, finalizer: &str, present: bool) -> bool {
        if self.has_finalizer(finalizer) == present {
            return false;
        }
        let list = self.metadata.finalizers.get_or_insert_with(Vec::new);
        if present {
            list.push(finalizer.to_string());
        } else {
            list.retain(|f| f != finalizer);
        }
        true
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(|s| s.as_str())
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(phases: &[Phase]) -> ClusterStatus {
        let shard_status = phases
            .iter()
            .enumerate()
            .map(|(i, p)| (format!("clickhouse-demo-{}", i), ShardStatus { phase: *p }))
            .collect();
        ClusterStatus { phase: None, shard_status }
    }

    #[test]
    fn phase_runs_only_when_every_shard_runs() {
        use Phase::*;
        assert_eq!(status(&[Running, Running, Initializing]).aggregate_phase(3), Initializing);
        assert_eq!(status(&[Running, Running, Running]).aggregate_phase(3), Running);
    }

    #[test]
    fn phase_requires_every_shard_to_be_tracked() {
        use Phase::*;
        assert_eq!(status(&[Running, Running]).aggregate_phase(3), Initializing);
        assert_eq!(status(&[]).aggregate_phase(0), Initializing);
    }

    #[test]
    fn spec_uses_camel_case_and_delete_pvc_key() {
        let spec = ClusterSpec { delete_pvc: true, shards_count: 2, data_capacity: "10Gi".into(), ..Default::default() };
        let v = serde_json::to_value(&spec).unwrap();
        assert_eq!(v["deletePVC"], true);
        assert_eq!(v["shardsCount"], 2);
        assert_eq!(v["dataCapacity"], "10Gi");
        assert!(v.get("image").is_none());
    }

    #[test]
    fn finalizer_toggle_reports_changes() {
        let mut c = ClickHouseCluster::new("demo", ClusterSpec::default());
        assert!(c.set_finalizer("x/y", true));
        assert!(!c.set_finalizer("x/y", true));
        assert!(c.has_finalizer("x/y"));
        assert!(c.set_finalizer("x/y", false));
        assert!(!c.has_finalizer("x/y"));
    }
}
