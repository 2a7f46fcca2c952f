//! chop store: in-RAM `ResourceStore` with API-server write semantics.
//!
//! Objects are kept as JSON keyed by (kind, namespace, name). Writes bump a
//! global resource version, finalizers defer removal, and removing an owner
//! cascades to everything that lists it in `ownerReferences`.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chop_kubehub::{matches_labels, Managed, ResourceStore, StoreError};
use kube::Resource;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::debug;

type Key = (String, String, String);

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub op: &'static str,
    pub kind: String,
    pub name: String,
}

#[derive(Default)]
struct Inner {
    objects: FxHashMap<Key, Json>,
    rv: u64,
    writes: Vec<Write>,
}

impl Inner {
    fn next_rv(&mut self) -> String {
        self.rv += 1;
        self.rv.to_string()
    }

    fn record(&mut self, op: &'static str, kind: &str, name: &str) {
        self.writes.push(Write { op, kind: kind.to_string(), name: name.to_string() });
    }

    /// Drop the object and, transitively, everything it owns.
    fn remove_cascading(&mut self, key: &Key) {
        let Some(gone) = self.objects.remove(key) else { return };
        let Some(uid) = meta_str(&gone, "uid").map(str::to_string) else { return };
        let owned: Vec<Key> = self
            .objects
            .iter()
            .filter(|(k, v)| k.1 == key.1 && owned_by(v, &uid))
            .map(|(k, _)| k.clone())
            .collect();
        for k in owned {
            debug!(kind = %k.0, name = %k.2, owner = %key.2, "garbage collected");
            self.remove_cascading(&k);
        }
    }
}

fn meta_str<'a>(v: &'a Json, field: &str) -> Option<&'a str> {
    v.get("metadata").and_then(|m| m.get(field)).and_then(|x| x.as_str())
}

fn owned_by(v: &Json, uid: &str) -> bool {
    v.get("metadata")
        .and_then(|m| m.get("ownerReferences"))
        .and_then(|r| r.as_array())
        .map(|refs| refs.iter().any(|r| r.get("uid").and_then(|u| u.as_str()) == Some(uid)))
        .unwrap_or(false)
}

fn has_finalizers(v: &Json) -> bool {
    v.get("metadata").and_then(|m| m.get("finalizers")).and_then(|f| f.as_array()).map(|f| !f.is_empty()).unwrap_or(false)
}

fn set_meta(v: &mut Json, field: &str, value: Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.insert(field.to_string(), value);
    }
}

fn copy_meta(from: &Json, to: &mut Json, field: &str) {
    match from.get("metadata").and_then(|m| m.get(field)) {
        Some(x) => set_meta(to, field, x.clone()),
        None => {
            if let Some(meta) = to.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.remove(field);
            }
        }
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key<K: Managed>(ns: &str, name: &str) -> Key {
        (K::kind(&()).to_string(), ns.to_string(), name.to_string())
    }

    /// Overwrite an object's status without recording a write, standing in for
    /// controllers that are not part of this operator.
    pub fn set_status<K: Managed>(&self, ns: &str, name: &str, status: Json) -> bool {
        let mut inner = self.lock();
        let rv = inner.next_rv();
        match inner.objects.get_mut(&Self::key::<K>(ns, name)) {
            Some(obj) => {
                obj["status"] = status;
                set_meta(obj, "resourceVersion", Json::String(rv));
                true
            }
            None => false,
        }
    }

    pub fn writes(&self) -> Vec<Write> {
        self.lock().writes.clone()
    }

    pub fn reset_writes(&self) {
        self.lock().writes.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored object ordered by kind then name.
    pub fn dump(&self) -> Vec<Json> {
        let inner = self.lock();
        let mut keyed: Vec<(&Key, &Json)> = inner.objects.iter().collect();
        keyed.sort_by(|a, b| a.0.cmp(b.0));
        keyed.into_iter().map(|(_, v)| v.clone()).collect()
    }
}

#[async_trait]
impl ResourceStore for MemStore {
    async fn get<K: Managed>(&self, ns: &str, name: &str) -> Result<Option<K>, StoreError> {
        let inner = self.lock();
        match inner.objects.get(&Self::key::<K>(ns, name)) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    async fn list<K: Managed>(&self, ns: &str, labels: &BTreeMap<String, String>) -> Result<Vec<K>, StoreError> {
        let kind = K::kind(&()).to_string();
        let inner = self.lock();
        let mut out: Vec<(String, K)> = Vec::new();
        for ((k, n, name), v) in inner.objects.iter() {
            if *k != kind || n != ns {
                continue;
            }
            let obj: K = serde_json::from_value(v.clone())?;
            if matches_labels(obj.meta().labels.as_ref(), labels) {
                out.push((name.clone(), obj));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out.into_iter().map(|(_, o)| o).collect())
    }

    async fn create<K: Managed>(&self, ns: &str, obj: &K) -> Result<K, StoreError> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let key = Self::key::<K>(ns, &name);
        let mut inner = self.lock();
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind: key.0, name });
        }
        let mut v = serde_json::to_value(obj)?;
        let rv = inner.next_rv();
        set_meta(&mut v, "namespace", Json::String(ns.to_string()));
        set_meta(&mut v, "uid", Json::String(uuid::Uuid::new_v4().to_string()));
        set_meta(&mut v, "resourceVersion", Json::String(rv));
        set_meta(&mut v, "creationTimestamp", Json::String(now()));
        inner.record("create", &key.0, &name);
        inner.objects.insert(key, v.clone());
        Ok(serde_json::from_value(v)?)
    }

    async fn replace<K: Managed>(&self, ns: &str, obj: &K) -> Result<K, StoreError> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let key = Self::key::<K>(ns, &name);
        let mut inner = self.lock();
        let Some(stored) = inner.objects.get(&key).cloned() else {
            return Err(StoreError::NotFound { kind: key.0, name });
        };
        if let Some(rv) = obj.meta().resource_version.as_deref() {
            if Some(rv) != meta_str(&stored, "resourceVersion") {
                return Err(StoreError::Conflict { kind: key.0, name });
            }
        }
        let mut v = serde_json::to_value(obj)?;
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            copy_meta(&stored, &mut v, field);
        }
        set_meta(&mut v, "namespace", Json::String(ns.to_string()));
        match stored.get("status") {
            Some(s) => v["status"] = s.clone(),
            None => {
                if let Some(o) = v.as_object_mut() {
                    o.remove("status");
                }
            }
        }
        let rv = inner.next_rv();
        set_meta(&mut v, "resourceVersion", Json::String(rv));
        inner.record("replace", &key.0, &name);
        if meta_str(&v, "deletionTimestamp").is_some() && !has_finalizers(&v) {
            inner.objects.insert(key.clone(), v.clone());
            inner.remove_cascading(&key);
        } else {
            inner.objects.insert(key, v.clone());
        }
        Ok(serde_json::from_value(v)?)
    }

    async fn replace_status<K: Managed>(&self, ns: &str, obj: &K) -> Result<K, StoreError> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let key = Self::key::<K>(ns, &name);
        let incoming = serde_json::to_value(obj)?;
        let mut inner = self.lock();
        let Some(mut v) = inner.objects.get(&key).cloned() else {
            return Err(StoreError::NotFound { kind: key.0, name });
        };
        if let Some(rv) = obj.meta().resource_version.as_deref() {
            if Some(rv) != meta_str(&v, "resourceVersion") {
                return Err(StoreError::Conflict { kind: key.0, name });
            }
        }
        v["status"] = incoming.get("status").cloned().unwrap_or(Json::Null);
        let rv = inner.next_rv();
        set_meta(&mut v, "resourceVersion", Json::String(rv));
        inner.record("replace_status", &key.0, &name);
        inner.objects.insert(key, v.clone());
        Ok(serde_json::from_value(v)?)
    }

    async fn delete<K: Managed>(&self, ns: &str, name: &str) -> Result<(), StoreError> {
        let key = Self::key::<K>(ns, name);
        let mut inner = self.lock();
        let Some(stored) = inner.objects.get(&key).cloned() else { return Ok(()) };
        inner.record("delete", &key.0, name);
        if has_finalizers(&stored) {
            if meta_str(&stored, "deletionTimestamp").is_none() {
                let rv = inner.next_rv();
                if let Some(obj) = inner.objects.get_mut(&key) {
                    set_meta(obj, "deletionTimestamp", Json::String(now()));
                    set_meta(obj, "resourceVersion", Json::String(rv));
                }
            }
        } else {
            inner.remove_cascading(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Service};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn cm(name: &str, labels: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_assigns_identity_and_rejects_duplicates() {
        let s = MemStore::new();
        let got = s.create("ns", &cm("a", &[])).await.unwrap();
        assert!(got.metadata.uid.is_some());
        assert_eq!(got.metadata.resource_version.as_deref(), Some("1"));
        let err = s.create("ns", &cm("a", &[])).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
        assert_eq!(s.writes().len(), 1);
    }

    #[tokio::test]
    async fn stale_replace_conflicts() {
        let s = MemStore::new();
        let first = s.create("ns", &cm("a", &[])).await.unwrap();
        let second = s.replace("ns", &first).await.unwrap();
        assert_ne!(first.metadata.resource_version, second.metadata.resource_version);
        let err = s.replace("ns", &first).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn list_filters_by_labels_in_name_order() {
        let s = MemStore::new();
        s.create("ns", &cm("b", &[("app", "x")])).await.unwrap();
        s.create("ns", &cm("a", &[("app", "x")])).await.unwrap();
        s.create("ns", &cm("c", &[("app", "y")])).await.unwrap();
        s.create("other", &cm("d", &[("app", "x")])).await.unwrap();
        let sel: BTreeMap<String, String> = [("app".to_string(), "x".to_string())].into_iter().collect();
        let names: Vec<_> =
            s.list::<ConfigMap>("ns", &sel).await.unwrap().into_iter().map(|c| c.metadata.name.unwrap()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn finalizers_defer_removal_until_cleared() {
        let s = MemStore::new();
        let mut obj = cm("a", &[]);
        obj.metadata.finalizers = Some(vec!["x/y".into()]);
        s.create("ns", &obj).await.unwrap();
        s.delete::<ConfigMap>("ns", "a").await.unwrap();
        let mut pending = s.get::<ConfigMap>("ns", "a").await.unwrap().unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());
        pending.metadata.finalizers = Some(vec![]);
        s.replace("ns", &pending).await.unwrap();
        assert!(s.get::<ConfigMap>("ns", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deleting_owner_collects_dependents() {
        let s = MemStore::new();
        let owner = s.create("ns", &cm("owner", &[])).await.unwrap();
        let svc = Service {
            metadata: ObjectMeta {
                name: Some("dep".into()),
                owner_references: Some(vec![OwnerReference {
                    api_version: "v1".into(),
                    kind: "ConfigMap".into(),
                    name: "owner".into(),
                    uid: owner.metadata.uid.clone().unwrap(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };
        s.create("ns", &svc).await.unwrap();
        s.delete::<ConfigMap>("ns", "owner").await.unwrap();
        assert!(s.get::<Service>("ns", "dep").await.unwrap().is_none());
        assert!(s.is_empty());
    }

    #[tokio::test]
    async fn status_writes_leave_spec_alone() {
        let s = MemStore::new();
        let created = s.create("ns", &cm("a", &[("k", "v")])).await.unwrap();
        let mut changed = created.clone();
        changed.metadata.labels = None;
        s.replace_status("ns", &changed).await.unwrap();
        let got = s.get::<ConfigMap>("ns", "a").await.unwrap().unwrap();
        assert_eq!(got.metadata.labels, created.metadata.labels);
        assert!(s.delete::<ConfigMap>("ns", "missing").await.is_ok());
    }
}
