//! Per-shard StatefulSet template.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    HTTPGetAction, ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec,
    Probe, ResourceRequirements, SecurityContext, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use chop_core::{CpuAndMem, CLIENT_PORT, HTTP_PORT, INTERSERVER_PORT};

use crate::Generator;

pub const SERVER_CONTAINER: &str = "clickhouse";
pub const INIT_CONTAINER: &str = "clickhouse-init";
pub const DATA_VOLUME: &str = "data";

const CONFIG_D: &str = "/etc/clickhouse-server/config.d/";
const CONF_D: &str = "/etc/clickhouse-server/conf.d/";
const DATA_DIR: &str = "/var/lib/clickhouse";
const CONFIG_MODE: i32 = 0o644;

fn pod_name_env() -> EnvVar {
    EnvVar {
        name: "POD_NAME".into(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector { field_path: "metadata.name".into(), api_version: None }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn port(name: &str, number: i32) -> ContainerPort {
    ContainerPort { name: Some(name.into()), container_port: number, ..Default::default() }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount { name: name.into(), mount_path: path.into(), ..Default::default() }
}

fn quantities(v: &CpuAndMem) -> Option<BTreeMap<String, Quantity>> {
    let mut m = BTreeMap::new();
    if !v.cpu.is_empty() {
        m.insert("cpu".to_string(), Quantity(v.cpu.clone()));
    }
    if !v.memory.is_empty() {
        m.insert("memory".to_string(), Quantity(v.memory.clone()));
    }
    (!m.is_empty()).then_some(m)
}

impl Generator {
    fn macros_volume(&self) -> String {
        format!("clickhouse-{}-macros", self.name)
    }

    fn resources(&self) -> Option<ResourceRequirements> {
        let r = &self.spec.resources;
        if r.requests.is_empty() && r.limits.is_empty() {
            return None;
        }
        Some(ResourceRequirements { requests: quantities(&r.requests), limits: quantities(&r.limits), ..Default::default() })
    }

    fn data_claim(&self) -> PersistentVolumeClaim {
        let mut storage = BTreeMap::new();
        storage.insert("storage".to_string(), Quantity(self.spec.data_capacity.clone()));
        let class = Some(self.spec.data_storage_class.clone()).filter(|c| !c.is_empty());
        PersistentVolumeClaim {
            metadata: ObjectMeta { name: Some(DATA_VOLUME.into()), labels: Some(self.cluster_labels()), ..Default::default() },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".into()]),
                resources: Some(VolumeResourceRequirements { requests: Some(storage), ..Default::default() }),
                storage_class_name: class,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_template(&self, shard: usize) -> PodTemplateSpec {
        let config = self.common_config_name();
        let macros = self.macros_volume();
        let mounts = vec![mount(&config, CONFIG_D), mount(&macros, CONF_D)];
        let mut server_mounts = mounts.clone();
        server_mounts.push(mount(DATA_VOLUME, DATA_DIR));

        let init = Container {
            name: INIT_CONTAINER.into(),
            image: Some(self.spec.init_image.clone()),
            env: Some(vec![pod_name_env()]),
            volume_mounts: Some(mounts),
            ..Default::default()
        };
        let server = Container {
            name: SERVER_CONTAINER.into(),
            image: Some(self.spec.image.clone()),
            env: Some(vec![pod_name_env()]),
            ports: Some(vec![port("http", HTTP_PORT), port("client", CLIENT_PORT), port("interserver", INTERSERVER_PORT)]),
            readiness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/ping".into()),
                    port: IntOrString::String("http".into()),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(10),
                period_seconds: Some(10),
                ..Default::default()
            }),
            security_context: Some(SecurityContext {
                capabilities: Some(Capabilities { add: Some(vec!["NET_ADMIN".into(), "SYS_NICE".into()]), drop: None }),
                ..Default::default()
            }),
            resources: self.resources(),
            volume_mounts: Some(server_mounts),
            ..Default::default()
        };

        let pod = self.spec.pod.clone().unwrap_or_default();
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(self.shard_labels(shard)),
                annotations: (!pod.annotations.is_empty()).then_some(pod.annotations),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                init_containers: Some(vec![init]),
                containers: vec![server],
                volumes: Some(vec![
                    Volume {
                        name: config.clone(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: Some(config),
                            default_mode: Some(CONFIG_MODE),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Volume { name: macros, empty_dir: Some(EmptyDirVolumeSource::default()), ..Default::default() },
                ]),
                tolerations: (!pod.tolerations.is_empty()).then_some(pod.tolerations),
                affinity: pod.affinity,
                node_selector: (!pod.node_selector.is_empty()).then_some(pod.node_selector),
                service_account_name: Some(self.access.service_account.clone()).filter(|s| !s.is_empty()),
                ..Default::default()
            }),
        }
    }

    /// Workload for shard `shard`, owned by the cluster.
    pub fn stateful_set(&self, shard: usize) -> StatefulSet {
        let name = self.stateful_set_name(shard);
        StatefulSet {
            metadata: self.meta(&name, self.shard_labels(shard), self.owner.clone()),
            spec: Some(StatefulSetSpec {
                replicas: Some(self.spec.replicas_count),
                selector: LabelSelector { match_labels: Some(self.shard_selector(shard)), match_expressions: None },
                service_name: self.service_name(shard),
                template: self.pod_template(shard),
                volume_claim_templates: Some(vec![self.data_claim()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
