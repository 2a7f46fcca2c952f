//! chop apply: converge generated objects against a resource store.
//!
//! Create when absent, replace only when a compared field differs, and log a
//! small diff summary for every replace.

#![forbid(unsafe_code)]

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::Resource;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

use chop_kubehub::{Managed, ResourceStore, StoreError};
use chop_render::{compare, QuantityParser};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("encoding object for diff: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("quantity pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Outcome of converging one object; carries the stored object.
#[derive(Debug, Clone)]
pub enum Applied<K> {
    Created(K),
    Updated(K),
    Recreated(K),
    Unchanged(K),
}

impl<K> Applied<K> {
    pub fn into_inner(self) -> K {
        match self {
            Applied::Created(k) | Applied::Updated(k) | Applied::Recreated(k) | Applied::Unchanged(k) => k,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Applied::Created(_) => "created",
            Applied::Updated(_) => "updated",
            Applied::Recreated(_) => "recreated",
            Applied::Unchanged(_) => "unchanged",
        }
    }

    pub fn wrote(&self) -> bool {
        !matches!(self, Applied::Unchanged(_))
    }
}

/// Per-kind comparison policy.
pub trait Convergent: Managed {
    /// Names of the compared fields that differ.
    fn changes(q: &QuantityParser, live: &Self, desired: &Self) -> Vec<&'static str>;

    /// Copy platform-owned fields from `live` into the object about to be written.
    fn carry(_live: &Self, _desired: &mut Self) {}

    /// Some fields cannot be updated in place.
    fn needs_recreate(_changes: &[&'static str]) -> bool {
        false
    }
}

impl Convergent for StatefulSet {
    fn changes(q: &QuantityParser, live: &Self, desired: &Self) -> Vec<&'static str> {
        compare::workload_changes(q, live, desired)
    }

    fn carry(live: &Self, desired: &mut Self) {
        compare::carry_workload_fields(live, desired)
    }
}

impl Convergent for Service {
    fn changes(_q: &QuantityParser, live: &Self, desired: &Self) -> Vec<&'static str> {
        compare::service_changes(live, desired)
    }

    fn carry(live: &Self, desired: &mut Self) {
        compare::carry_service_fields(live, desired)
    }
}

impl Convergent for ConfigMap {
    fn changes(_q: &QuantityParser, live: &Self, desired: &Self) -> Vec<&'static str> {
        compare::config_map_changes(live, desired)
    }
}

impl Convergent for RoleBinding {
    fn changes(_q: &QuantityParser, live: &Self, desired: &Self) -> Vec<&'static str> {
        compare::role_binding_changes(live, desired)
    }

    fn needs_recreate(changes: &[&'static str]) -> bool {
        changes.contains(&"role_ref")
    }
}

pub struct Applier<'a, S> {
    store: &'a S,
    quantities: QuantityParser,
}

impl<'a, S: ResourceStore> Applier<'a, S> {
    pub fn new(store: &'a S) -> Result<Self, ApplyError> {
        Ok(Self { store, quantities: QuantityParser::new()? })
    }

    /// Bring the stored object named like `desired` in line with it.
    pub async fn converge<K: Convergent>(&self, ns: &str, desired: K) -> Result<Applied<K>, ApplyError> {
        let t0 = std::time::Instant::now();
        let kind = K::kind(&()).to_string();
        let name = desired.meta().name.clone().unwrap_or_default();

        let live = match self.store.get::<K>(ns, &name).await? {
            Some(live) => live,
            None => match self.store.create(ns, &desired).await {
                Ok(created) => {
                    info!(%kind, %ns, %name, "created");
                    counter!("apply_created", 1u64, "kind" => kind);
                    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                    return Ok(Applied::Created(created));
                }
                // Lost a race with another writer; compare against what is there now.
                Err(StoreError::AlreadyExists { .. }) => match self.store.get::<K>(ns, &name).await? {
                    Some(live) => live,
                    None => return Err(StoreError::NotFound { kind, name }.into()),
                },
                Err(e) => return Err(e.into()),
            },
        };

        let changes = K::changes(&self.quantities, &live, &desired);
        if changes.is_empty() {
            debug!(%kind, %ns, %name, "unchanged");
            counter!("apply_unchanged", 1u64, "kind" => kind);
            return Ok(Applied::Unchanged(live));
        }

        if K::needs_recreate(&changes) {
            info!(%kind, %ns, %name, changed = ?changes, "recreating");
            self.store.delete::<K>(ns, &name).await?;
            let created = self.store.create(ns, &desired).await?;
            counter!("apply_recreated", 1u64, "kind" => kind);
            return Ok(Applied::Recreated(created));
        }

        let mut next = desired;
        K::carry(&live, &mut next);
        next.meta_mut().resource_version = live.meta().resource_version.clone();
        let summary = diff_summary(&strip_noisy(serde_json::to_value(&next)?), &strip_noisy(serde_json::to_value(&live)?));
        info!(
            %kind, %ns, %name, changed = ?changes,
            adds = summary.adds, updates = summary.updates, removes = summary.removes,
            "updating"
        );
        let updated = self.store.replace(ns, &next).await?;
        counter!("apply_updated", 1u64, "kind" => kind);
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(Applied::Updated(updated))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Drop fields that are server bookkeeping rather than intent.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for field in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid"] {
            meta.remove(field);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}
