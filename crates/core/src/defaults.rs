//! Operator-wide defaults document.
//!
//! Loaded once at startup and handed to the engine as an immutable value.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cluster::{ClickHouseCluster, ClusterResources, ClusterStatus, Phase, ZookeeperConfig};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/clickhouse-operator/config.yaml";
const DEFAULT_CUSTOM_SETTINGS: &str = "<yandex></yandex>";

#[derive(Debug, thiserror::Error)]
pub enum DefaultsError {
    #[error("reading {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("parsing defaults yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("defaults field {0} is empty")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessDefaults {
    /// ClusterRole bound to the pods' service account
    #[serde(default = "default_cluster_role")]
    pub cluster_role: String,
    #[serde(default = "default_service_account")]
    pub service_account: String,
}

impl Default for AccessDefaults {
    fn default() -> Self {
        Self { cluster_role: default_cluster_role(), service_account: default_service_account() }
    }
}

fn default_cluster_role() -> String {
    "clickhouse-operator-pod".to_string()
}

fn default_service_account() -> String {
    "default".to_string()
}

fn default_custom_settings() -> String {
    DEFAULT_CUSTOM_SETTINGS.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperatorDefaults {
    #[serde(rename = "default_clickhouse_image")]
    pub image: String,
    #[serde(rename = "default_clickhouse_init_image")]
    pub init_image: String,
    #[serde(rename = "default_shard_count")]
    pub shards_count: i32,
    #[serde(rename = "default_replicas_count")]
    pub replicas_count: i32,
    /// Extra XML files shipped verbatim in the common config map
    #[serde(rename = "default_config", default)]
    pub config_files: Vec<PathBuf>,
    #[serde(rename = "default_zookeeper")]
    pub zookeeper: ZookeeperConfig,
    #[serde(rename = "default_data_capacity")]
    pub data_capacity: String,
    #[serde(rename = "default_data_storage_class", default)]
    pub data_storage_class: Option<String>,
    #[serde(rename = "default_resources", default)]
    pub resources: ClusterResources,
    #[serde(rename = "default_custom_settings", default = "default_custom_settings")]
    pub custom_settings: String,
    #[serde(default)]
    pub access: AccessDefaults,
    /// File name -> content, filled from `config_files` on load
    #[serde(skip)]
    pub xml_config: BTreeMap<String, String>,
}

impl OperatorDefaults {
    /// Load the document at `path` and read every referenced XML file.
    pub fn load(path: &Path) -> Result<Self, DefaultsError> {
        let raw = std::fs::read_to_string(path).map_err(|source| DefaultsError::Read { path: path.to_path_buf(), source })?;
        let mut me = Self::from_yaml_str(&raw)?;
        for file in me.config_files.clone() {
            let content =
                std::fs::read_to_string(&file).map_err(|source| DefaultsError::Read { path: file.clone(), source })?;
            let key = file.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            me.xml_config.insert(key, content);
        }
        Ok(me)
    }

    /// Parse and validate without touching the file system.
    pub fn from_yaml_str(raw: &str) -> Result<Self, DefaultsError> {
        let me: Self = serde_yaml::from_str(raw)?;
        me.validate()?;
        Ok(me)
    }

    fn validate(&self) -> Result<(), DefaultsError> {
        if self.image.is_empty() {
            return Err(DefaultsError::Missing("default_clickhouse_image"));
        }
        if self.init_image.is_empty() {
            return Err(DefaultsError::Missing("default_clickhouse_init_image"));
        }
        if self.shards_count <= 0 {
            return Err(DefaultsError::Missing("default_shard_count"));
        }
        if self.replicas_count <= 0 {
            return Err(DefaultsError::Missing("default_replicas_count"));
        }
        if self.zookeeper.nodes.is_empty() {
            return Err(DefaultsError::Missing("default_zookeeper.nodes"));
        }
        if self.data_capacity.is_empty() {
            return Err(DefaultsError::Missing("default_data_capacity"));
        }
        Ok(())
    }

    /// Fill every empty spec field of a cluster seen for the first time and mark it
    /// Initializing. Returns true when anything changed.
    pub fn materialize(&self, cluster: &mut ClickHouseCluster) -> bool {
        let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
        let name = cluster.metadata.name.clone().unwrap_or_default();
        let spec = &mut cluster.spec;
        let mut changed = false;

        fn fill(slot: &mut String, value: &str, changed: &mut bool) {
            if slot.is_empty() && !value.is_empty() {
                *slot = value.to_string();
                *changed = true;
            }
        }

        fill(&mut spec.image, &self.image, &mut changed);
        fill(&mut spec.init_image, &self.init_image, &mut changed);
        fill(&mut spec.custom_settings, &self.custom_settings, &mut changed);
        fill(&mut spec.data_capacity, &self.data_capacity, &mut changed);
        if let Some(class) = &self.data_storage_class {
            fill(&mut spec.data_storage_class, class, &mut changed);
        }
        if spec.shards_count <= 0 {
            spec.shards_count = self.shards_count;
            changed = true;
        }
        if spec.replicas_count <= 0 {
            spec.replicas_count = self.replicas_count;
            changed = true;
        }
        if spec.zookeeper.is_none() {
            let mut zk = self.zookeeper.clone();
            zk.root = format!("{}/{}/{}", zk.root.trim_end_matches('/'), namespace, name);
            spec.zookeeper = Some(zk);
            changed = true;
        }

        let res = &mut spec.resources;
        fill(&mut res.requests.cpu, &self.resources.requests.cpu, &mut changed);
        fill(&mut res.requests.memory, &self.resources.requests.memory, &mut changed);
        let requests = res.requests.clone();
        fill(&mut res.limits.cpu, &requests.cpu, &mut changed);
        fill(&mut res.limits.memory, &requests.memory, &mut changed);

        let status = cluster.status.get_or_insert_with(ClusterStatus::default);
        if status.phase.is_none() {
            status.phase = Some(Phase::Initializing);
            status.shard_status.clear();
            changed = true;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterSpec;

    pub(crate) const SAMPLE: &str = r#"
default_clickhouse_image: clickhouse/clickhouse-server:23.8
default_clickhouse_init_image: chop/init:0.1
default_shard_count: 1
default_replicas_count: 2
default_zookeeper:
  nodes:
    - host: zk-0.zk
      port: 2181
  session_timeout_ms: 30000
  operation_timeout_ms: 10000
  root: /clickhouse
default_data_capacity: 10Gi
default_resources:
  requests:
    cpu: "1"
    memory: 2Gi
"#;

    #[test]
    fn parses_and_validates_sample() {
        let d = OperatorDefaults::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(d.replicas_count, 2);
        assert_eq!(d.custom_settings, "<yandex></yandex>");
        assert_eq!(d.access.service_account, "default");
        assert!(d.xml_config.is_empty());
    }

    #[test]
    fn missing_image_is_rejected() {
        let raw = SAMPLE.replace("default_clickhouse_image: clickhouse/clickhouse-server:23.8", "default_clickhouse_image: \"\"");
        let err = OperatorDefaults::from_yaml_str(&raw).unwrap_err();
        assert!(matches!(err, DefaultsError::Missing("default_clickhouse_image")), "err={}", err);
    }

    #[test]
    fn materialize_fills_empty_fields_and_roots_zookeeper() {
        let d = OperatorDefaults::from_yaml_str(SAMPLE).unwrap();
        let mut c = ClickHouseCluster::new("demo", ClusterSpec { shards_count: 3, ..Default::default() });
        c.metadata.namespace = Some("analytics".into());
        assert!(d.materialize(&mut c));
        assert_eq!(c.spec.shards_count, 3);
        assert_eq!(c.spec.replicas_count, 2);
        assert_eq!(c.spec.image, "clickhouse/clickhouse-server:23.8");
        assert_eq!(c.spec.zookeeper.as_ref().unwrap().root, "/clickhouse/analytics/demo");
        assert_eq!(c.spec.resources.limits.memory, "2Gi");
        assert_eq!(c.spec.custom_settings, "<yandex></yandex>");
        assert_eq!(c.phase(), Some(Phase::Initializing));
        // The injected defaults stay untouched.
        assert_eq!(d.zookeeper.root, "/clickhouse");
    }

    #[test]
    fn materialize_keeps_explicit_limits() {
        let d = OperatorDefaults::from_yaml_str(SAMPLE).unwrap();
        let mut spec = ClusterSpec::default();
        spec.resources.limits.cpu = "4".into();
        let mut c = ClickHouseCluster::new("demo", spec);
        d.materialize(&mut c);
        assert_eq!(c.spec.resources.limits.cpu, "4");
        assert_eq!(c.spec.resources.requests.cpu, "1");
    }
}
