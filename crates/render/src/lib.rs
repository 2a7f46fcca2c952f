//! chop render: maps a cluster object to the platform objects that run it.
//!
//! Pure and deterministic: the same cluster and defaults always produce the
//! same objects. No I/O happens here.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;

use chop_core::{
    AccessDefaults, ClickHouseCluster, ClusterSpec, OperatorDefaults, Replica, Shard, CLIENT_PORT, HTTP_PORT,
    LABEL_CLUSTER, LABEL_MANAGED_BY, LABEL_SHARD, MANAGED_BY_VALUE,
};

pub mod compare;
pub mod quantity;
mod workload;
pub mod xml;

pub use quantity::QuantityParser;
pub use workload::{DATA_VOLUME, INIT_CONTAINER, SERVER_CONTAINER};

pub const REMOTE_SERVERS_XML: &str = "remote_servers.xml";
pub const ZOOKEEPER_XML: &str = "zookeeper.xml";
pub const SETTINGS_XML: &str = "settings.xml";
pub const USERS_XML: &str = "users.xml";
pub const ALL_MACROS_JSON: &str = "all-macros.json";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("cluster object has no {0}")]
    MissingIdentity(&'static str),
    /// The name becomes an element of `remote_servers.xml`, which cannot start with a digit.
    #[error("cluster name {0:?} must start with a letter")]
    InvalidName(String),
    #[error("{field} must be positive, got {value}")]
    InvalidCount { field: &'static str, value: i32 },
    #[error("no zookeeper configuration")]
    MissingZookeeper,
    #[error("{field}: {value:?} is not a valid quantity")]
    InvalidQuantity { field: &'static str, value: String },
    #[error("workload {0} has no uid to own its service")]
    UnownedService(String),
    #[error("encoding macros table: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("quantity pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Labels carried by every object generated for cluster `name`, volume claims included.
pub fn cluster_labels(name: &str) -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    m.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    m.insert(LABEL_CLUSTER.to_string(), name.to_string());
    m
}

/// Desired-object factory for one cluster at one point in time.
pub struct Generator {
    name: String,
    namespace: String,
    spec: ClusterSpec,
    owner: OwnerReference,
    access: AccessDefaults,
    extra_files: BTreeMap<String, String>,
}

impl Generator {
    pub fn new(cluster: &ClickHouseCluster, defaults: &OperatorDefaults) -> Result<Self, RenderError> {
        let name = cluster.metadata.name.clone().ok_or(RenderError::MissingIdentity("name"))?;
        if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(RenderError::InvalidName(name));
        }
        let namespace = cluster.metadata.namespace.clone().ok_or(RenderError::MissingIdentity("namespace"))?;
        let owner = cluster.controller_owner_ref(&()).ok_or(RenderError::MissingIdentity("uid"))?;
        let spec = cluster.spec.clone();
        if spec.shards_count <= 0 {
            return Err(RenderError::InvalidCount { field: "shardsCount", value: spec.shards_count });
        }
        if spec.replicas_count <= 0 {
            return Err(RenderError::InvalidCount { field: "replicasCount", value: spec.replicas_count });
        }
        if spec.zookeeper.is_none() {
            return Err(RenderError::MissingZookeeper);
        }
        let q = QuantityParser::new()?;
        let r = &spec.resources;
        let checks = [
            ("dataCapacity", &spec.data_capacity, false),
            ("resources.requests.cpu", &r.requests.cpu, true),
            ("resources.requests.memory", &r.requests.memory, true),
            ("resources.limits.cpu", &r.limits.cpu, true),
            ("resources.limits.memory", &r.limits.memory, true),
        ];
        for (field, value, optional) in checks {
            if (optional && value.is_empty()) || q.is_valid(value) {
                continue;
            }
            return Err(RenderError::InvalidQuantity { field, value: value.clone() });
        }
        Ok(Self { name, namespace, spec, owner, access: defaults.access.clone(), extra_files: defaults.xml_config.clone() })
    }

    pub fn shard_count(&self) -> usize {
        self.spec.shards_count.max(0) as usize
    }

    pub fn replica_count(&self) -> usize {
        self.spec.replicas_count.max(0) as usize
    }

    pub fn stateful_set_name(&self, shard: usize) -> String {
        format!("clickhouse-{}-{}", self.name, shard)
    }

    /// Shard services share their workload's name.
    pub fn service_name(&self, shard: usize) -> String {
        self.stateful_set_name(shard)
    }

    pub fn common_config_name(&self) -> String {
        format!("clickhouse-{}-common-config", self.name)
    }

    pub fn cluster_service_name(&self) -> String {
        format!("clickhouse-{}", self.name)
    }

    pub fn role_binding_name(&self) -> String {
        format!("clickhouse-{}", self.name)
    }

    pub fn pod_name(&self, shard: usize, replica: usize) -> String {
        format!("{}-{}", self.stateful_set_name(shard), replica)
    }

    pub fn fqdn(&self, shard: usize, replica: usize) -> String {
        format!("{}.{}.{}.svc.cluster.local", self.pod_name(shard, replica), self.service_name(shard), self.namespace)
    }

    /// Labels selecting every object of this cluster.
    pub fn cluster_labels(&self) -> BTreeMap<String, String> {
        cluster_labels(&self.name)
    }

    pub fn shard_labels(&self, shard: usize) -> BTreeMap<String, String> {
        let mut m = self.cluster_labels();
        m.insert(LABEL_SHARD.to_string(), shard.to_string());
        m
    }

    fn shard_selector(&self, shard: usize) -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert(LABEL_CLUSTER.to_string(), self.name.clone());
        m.insert(LABEL_SHARD.to_string(), shard.to_string());
        m
    }

    fn meta(&self, name: &str, labels: BTreeMap<String, String>, owner: OwnerReference) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            owner_references: Some(vec![owner]),
            ..Default::default()
        }
    }

    pub fn topology(&self) -> Vec<Shard> {
        (0..self.shard_count())
            .map(|s| Shard {
                internal_replication: true,
                replicas: (0..self.replica_count()).map(|r| Replica::new(self.fqdn(s, r))).collect(),
            })
            .collect()
    }

    /// The configuration documents every server mounts, keyed by file name.
    pub fn config_documents(&self) -> Result<BTreeMap<String, String>, RenderError> {
        let zk = self.spec.zookeeper.as_ref().ok_or(RenderError::MissingZookeeper)?;
        let pods: Vec<(String, usize)> = (0..self.shard_count())
            .flat_map(|s| (0..self.replica_count()).map(move |r| (s, r)))
            .map(|(s, r)| (self.pod_name(s, r), s))
            .collect();
        let mut data = BTreeMap::new();
        data.insert(REMOTE_SERVERS_XML.to_string(), xml::remote_servers_xml(&self.name, &self.topology()));
        data.insert(ZOOKEEPER_XML.to_string(), xml::zookeeper_xml(zk));
        data.insert(SETTINGS_XML.to_string(), self.spec.custom_settings.clone());
        data.insert(ALL_MACROS_JSON.to_string(), xml::all_macros_json(&self.name, &pods)?);
        if !self.spec.users.is_empty() {
            data.insert(USERS_XML.to_string(), self.spec.users.clone());
        }
        for (file, content) in &self.extra_files {
            data.insert(file.clone(), content.clone());
        }
        Ok(data)
    }

    pub fn common_config_map(&self) -> Result<ConfigMap, RenderError> {
        Ok(ConfigMap {
            metadata: self.meta(&self.common_config_name(), self.cluster_labels(), self.owner.clone()),
            data: Some(self.config_documents()?),
            ..Default::default()
        })
    }

    fn ports() -> Vec<ServicePort> {
        let port = |name: &str, number: i32| ServicePort {
            name: Some(name.to_string()),
            port: number,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        };
        vec![port("http", HTTP_PORT), port("client", CLIENT_PORT)]
    }

    /// ClusterIP service selecting every server of the cluster.
    pub fn cluster_service(&self) -> Service {
        let mut selector = BTreeMap::new();
        selector.insert(LABEL_CLUSTER.to_string(), self.name.clone());
        Service {
            metadata: self.meta(&self.cluster_service_name(), self.cluster_labels(), self.owner.clone()),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                ports: Some(Self::ports()),
                selector: Some(selector),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Headless service giving the shard's pods stable DNS names. Owned by the
    /// stored workload so it goes away with it.
    pub fn shard_service(&self, shard: usize, workload: &StatefulSet) -> Result<Service, RenderError> {
        let owner = workload
            .controller_owner_ref(&())
            .ok_or_else(|| RenderError::UnownedService(self.stateful_set_name(shard)))?;
        Ok(Service {
            metadata: self.meta(&self.service_name(shard), self.shard_labels(shard), owner),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                cluster_ip: Some("None".to_string()),
                ports: Some(Self::ports()),
                selector: Some(self.shard_selector(shard)),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Grants the configured ClusterRole to the pods' service account.
    pub fn role_binding(&self) -> RoleBinding {
        RoleBinding {
            metadata: self.meta(&self.role_binding_name(), self.cluster_labels(), self.owner.clone()),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: self.access.cluster_role.clone(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: self.access.service_account.clone(),
                namespace: Some(self.namespace.clone()),
                api_group: None,
            }]),
        }
    }

    /// Shard index encoded in a workload name of this cluster.
    pub fn shard_index(&self, workload_name: &str) -> Option<usize> {
        workload_name.strip_prefix(&format!("clickhouse-{}-", self.name))?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn cluster() -> ClickHouseCluster {
        let mut c = ClickHouseCluster::new(
            "demo",
            ClusterSpec {
                image: "ch:23.8".into(),
                init_image: "init:0.1".into(),
                shards_count: 2,
                replicas_count: 2,
                data_capacity: "10Gi".into(),
                zookeeper: Some(chop_core::ZookeeperConfig {
                    nodes: vec![chop_core::ZookeeperNode { host: "zk".into(), port: 2181 }],
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        c.metadata.namespace = Some("ns".into());
        c.metadata.uid = Some("0b5b2f9e-6c1a-4d63-9f6e-3d0a9e7c1a11".into());
        c
    }

    fn defaults() -> OperatorDefaults {
        serde_yaml::from_str(
            r#"
default_clickhouse_image: ch:23.8
default_clickhouse_init_image: init:0.1
default_shard_count: 1
default_replicas_count: 1
default_zookeeper: { nodes: [ { host: zk, port: 2181 } ] }
default_data_capacity: 10Gi
"#,
        )
        .unwrap()
    }

    #[test]
    fn names_follow_cluster_and_shard() {
        let g = Generator::new(&cluster(), &defaults()).unwrap();
        assert_eq!(g.stateful_set_name(1), "clickhouse-demo-1");
        assert_eq!(g.common_config_name(), "clickhouse-demo-common-config");
        assert_eq!(g.fqdn(1, 0), "clickhouse-demo-1-0.clickhouse-demo-1.ns.svc.cluster.local");
        assert_eq!(g.shard_index("clickhouse-demo-7"), Some(7));
        assert_eq!(g.shard_index("clickhouse-other-7"), None);
    }

    #[test]
    fn rejects_bad_quantities_and_counts() {
        let mut c = cluster();
        c.spec.resources.requests.memory = "lots".into();
        assert!(matches!(
            Generator::new(&c, &defaults()),
            Err(RenderError::InvalidQuantity { field: "resources.requests.memory", .. })
        ));
        let mut c = cluster();
        c.spec.replicas_count = 0;
        assert!(matches!(Generator::new(&c, &defaults()), Err(RenderError::InvalidCount { .. })));
        let mut c = cluster();
        c.metadata.uid = None;
        assert!(matches!(Generator::new(&c, &defaults()), Err(RenderError::MissingIdentity("uid"))));
    }

    #[test]
    fn cluster_name_must_open_with_a_letter() {
        let mut c = cluster();
        c.metadata.name = Some("1st".into());
        assert!(matches!(Generator::new(&c, &defaults()), Err(RenderError::InvalidName(n)) if n == "1st"));
        c.metadata.name = Some("ch-1.eu".into());
        assert!(Generator::new(&c, &defaults()).is_ok());
    }

    #[test]
    fn users_document_only_when_given() {
        let g = Generator::new(&cluster(), &defaults()).unwrap();
        assert!(!g.config_documents().unwrap().contains_key(USERS_XML));
        let mut c = cluster();
        c.spec.users = "<yandex><users/></yandex>".into();
        let docs = Generator::new(&c, &defaults()).unwrap().config_documents().unwrap();
        assert_eq!(docs[USERS_XML], "<yandex><users/></yandex>");
    }

    #[test]
    fn shard_service_requires_stored_workload() {
        let g = Generator::new(&cluster(), &defaults()).unwrap();
        let unsaved = g.stateful_set(0);
        assert!(matches!(g.shard_service(0, &unsaved), Err(RenderError::UnownedService(_))));
        let mut saved = unsaved.clone();
        saved.metadata.uid = Some("4a1f3c2e-0000-4000-8000-000000000001".into());
        let svc = g.shard_service(0, &saved).unwrap();
        let owner = &svc.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "StatefulSet");
        assert_eq!(svc.spec.unwrap().cluster_ip.as_deref(), Some("None"));
    }
}
