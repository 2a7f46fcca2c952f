//! Field-by-field comparison of live objects against generated ones.
//!
//! Only the fields the operator decides on are compared; everything the
//! platform assigns or defaults is left to the platform. Each function returns
//! the names of the differing fields, empty when no update is needed.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, PodSpec, ResourceRequirements, Service, ServicePort,
};
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::quantity::QuantityParser;

fn map_or_empty(m: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    m.cloned().unwrap_or_default()
}

fn pod_spec(s: &StatefulSet) -> Option<&PodSpec> {
    s.spec.as_ref().and_then(|s| s.template.spec.as_ref())
}

fn images(spec: Option<&PodSpec>) -> Vec<(String, Option<String>)> {
    let Some(spec) = spec else { return Vec::new() };
    let init = spec.init_containers.iter().flatten();
    init.chain(spec.containers.iter()).map(|c| (c.name.clone(), c.image.clone())).collect()
}

fn containers(spec: Option<&PodSpec>) -> Vec<&Container> {
    let Some(spec) = spec else { return Vec::new() };
    spec.init_containers.iter().flatten().chain(spec.containers.iter()).collect()
}

fn same_quantities(q: &QuantityParser, a: Option<&BTreeMap<String, Quantity>>, b: Option<&BTreeMap<String, Quantity>>) -> bool {
    let empty = BTreeMap::new();
    let (a, b) = (a.unwrap_or(&empty), b.unwrap_or(&empty));
    a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).map(|w| q.same(&v.0, &w.0)).unwrap_or(false))
}

fn same_resources(q: &QuantityParser, a: Option<&ResourceRequirements>, b: Option<&ResourceRequirements>) -> bool {
    same_quantities(q, a.and_then(|r| r.requests.as_ref()), b.and_then(|r| r.requests.as_ref()))
        && same_quantities(q, a.and_then(|r| r.limits.as_ref()), b.and_then(|r| r.limits.as_ref()))
}

/// Differences between a live shard workload and the generated one.
pub fn workload_changes(q: &QuantityParser, live: &StatefulSet, desired: &StatefulSet) -> Vec<&'static str> {
    let mut out = Vec::new();
    let replicas = |s: &StatefulSet| s.spec.as_ref().and_then(|s| s.replicas);
    if replicas(live) != replicas(desired) {
        out.push("replicas");
    }

    let template_meta = |s: &StatefulSet| s.spec.as_ref().and_then(|s| s.template.metadata.clone()).unwrap_or_default();
    let (lt, dt) = (template_meta(live), template_meta(desired));
    if map_or_empty(lt.labels.as_ref()) != map_or_empty(dt.labels.as_ref()) {
        out.push("template.labels");
    }
    if map_or_empty(lt.annotations.as_ref()) != map_or_empty(dt.annotations.as_ref()) {
        out.push("template.annotations");
    }

    let (lp, dp) = (pod_spec(live), pod_spec(desired));
    if images(lp) != images(dp) {
        out.push("images");
    }
    let (lc, dc) = (containers(lp), containers(dp));
    if lc.len() != dc.len() || lc.iter().zip(dc.iter()).any(|(a, b)| !same_resources(q, a.resources.as_ref(), b.resources.as_ref())) {
        out.push("resources");
    }
    let tolerations = |p: Option<&PodSpec>| p.and_then(|p| p.tolerations.clone()).unwrap_or_default();
    if tolerations(lp) != tolerations(dp) {
        out.push("tolerations");
    }
    if map_or_empty(lp.and_then(|p| p.node_selector.as_ref())) != map_or_empty(dp.and_then(|p| p.node_selector.as_ref())) {
        out.push("node_selector");
    }
    if lp.and_then(|p| p.affinity.as_ref()) != dp.and_then(|p| p.affinity.as_ref()) {
        out.push("affinity");
    }
    let account = |p: Option<&PodSpec>| p.and_then(|p| p.service_account_name.clone()).filter(|s| !s.is_empty());
    if account(lp) != account(dp) {
        out.push("service_account");
    }
    out
}

/// Copy what the platform owns on a workload from `live` into the object about to be written.
/// Claim templates are fixed at creation, so they are carried rather than compared.
pub fn carry_workload_fields(live: &StatefulSet, desired: &mut StatefulSet) {
    if let (Some(l), Some(d)) = (live.spec.as_ref(), desired.spec.as_mut()) {
        d.volume_claim_templates = l.volume_claim_templates.clone();
        d.update_strategy = l.update_strategy.clone();
        d.revision_history_limit = l.revision_history_limit;
        d.pod_management_policy = l.pod_management_policy.clone();
    }
}

fn port_key(p: &ServicePort) -> (Option<String>, i32, String) {
    (p.name.clone(), p.port, p.protocol.clone().unwrap_or_else(|| "TCP".to_string()))
}

pub fn service_changes(live: &Service, desired: &Service) -> Vec<&'static str> {
    let mut out = Vec::new();
    if map_or_empty(live.metadata.labels.as_ref()) != map_or_empty(desired.metadata.labels.as_ref()) {
        out.push("labels");
    }
    let (ls, ds) = (live.spec.clone().unwrap_or_default(), desired.spec.clone().unwrap_or_default());
    let kind = |t: Option<String>| t.unwrap_or_else(|| "ClusterIP".to_string());
    if kind(ls.type_) != kind(ds.type_) {
        out.push("type");
    }
    let ports = |p: Option<Vec<ServicePort>>| p.unwrap_or_default().iter().map(port_key).collect::<Vec<_>>();
    if ports(ls.ports) != ports(ds.ports) {
        out.push("ports");
    }
    if map_or_empty(ls.selector.as_ref()) != map_or_empty(ds.selector.as_ref()) {
        out.push("selector");
    }
    out
}

/// Keep the allocated address of a live service on update.
pub fn carry_service_fields(live: &Service, desired: &mut Service) {
    if let (Some(l), Some(d)) = (live.spec.as_ref(), desired.spec.as_mut()) {
        d.cluster_ip = l.cluster_ip.clone();
        d.cluster_ips = l.cluster_ips.clone();
        d.ip_families = l.ip_families.clone();
        d.ip_family_policy = l.ip_family_policy.clone();
        d.session_affinity = l.session_affinity.clone();
    }
}

pub fn config_map_changes(live: &ConfigMap, desired: &ConfigMap) -> Vec<&'static str> {
    let mut out = Vec::new();
    if map_or_empty(live.metadata.labels.as_ref()) != map_or_empty(desired.metadata.labels.as_ref()) {
        out.push("labels");
    }
    if map_or_empty(live.data.as_ref()) != map_or_empty(desired.data.as_ref()) {
        out.push("data");
    }
    out
}

/// `role_ref` cannot be updated in place; a change there means delete and create.
pub fn role_binding_changes(live: &RoleBinding, desired: &RoleBinding) -> Vec<&'static str> {
    let mut out = Vec::new();
    if live.role_ref != desired.role_ref {
        out.push("role_ref");
    }
    if live.subjects.clone().unwrap_or_default() != desired.subjects.clone().unwrap_or_default() {
        out.push("subjects");
    }
    if map_or_empty(live.metadata.labels.as_ref()) != map_or_empty(desired.metadata.labels.as_ref()) {
        out.push("labels");
    }
    out
}
