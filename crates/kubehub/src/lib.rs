//! chop kubehub: the typed resource store seam and its kube-backed implementation.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::NamespaceResourceScope,
    Client, Resource,
};
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

/// Namespaced, statically typed objects the operator reads and writes.
pub trait Managed:
    Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> Managed for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },
    #[error("{kind} {name}: resource version conflict")]
    Conflict { kind: String, name: String },
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("encoding object: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Kube(kube::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    fn from_kube(kind: &str, name: &str, e: kube::Error) -> Self {
        let (kind, name) = (kind.to_string(), name.to_string());
        match e {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound { kind, name },
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                StoreError::AlreadyExists { kind, name }
            }
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict { kind, name },
            other => StoreError::Kube(other),
        }
    }
}

/// Render a label map as an equality selector (`a=1,b=2`).
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Whether `obj` carries every label in `selector`.
pub fn matches_labels(obj_labels: Option<&BTreeMap<String, String>>, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| obj_labels.and_then(|l| l.get(k)) == Some(v))
}

/// Read/write access to cluster objects.
///
/// Writes carry the object's `resourceVersion`; a stale one yields `StoreError::Conflict`.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get<K: Managed>(&self, ns: &str, name: &str) -> Result<Option<K>, StoreError>;
    async fn list<K: Managed>(&self, ns: &str, labels: &BTreeMap<String, String>) -> Result<Vec<K>, StoreError>;
    async fn create<K: Managed>(&self, ns: &str, obj: &K) -> Result<K, StoreError>;
    async fn replace<K: Managed>(&self, ns: &str, obj: &K) -> Result<K, StoreError>;
    /// Write only the status subresource.
    async fn replace_status<K: Managed>(&self, ns: &str, obj: &K) -> Result<K, StoreError>;
    /// Delete by name. A missing object is not an error.
    async fn delete<K: Managed>(&self, ns: &str, name: &str) -> Result<(), StoreError>;
}

/// `ResourceStore` talking to the API server, every call bounded by `timeout`.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    timeout: Duration,
}

impl KubeStore {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn api<K: Managed>(&self, ns: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), ns)
    }

    async fn bounded<T, F>(&self, op: &'static str, kind: &str, name: &str, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, kube::Error>> + Send,
    {
        counter!("kube_requests_total", 1u64, "op" => op);
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(StoreError::from_kube(kind, name, e)),
            Err(_) => {
                counter!("kube_timeouts_total", 1u64, "op" => op);
                Err(StoreError::Timeout { op, after: self.timeout })
            }
        }
    }
}

fn name_of<K: Managed>(obj: &K) -> String {
    obj.meta().name.clone().unwrap_or_default()
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get<K: Managed>(&self, ns: &str, name: &str) -> Result<Option<K>, StoreError> {
        let api = self.api::<K>(ns);
        self.bounded("get", &K::kind(&()), name, api.get_opt(name)).await
    }

    async fn list<K: Managed>(&self, ns: &str, labels: &BTreeMap<String, String>) -> Result<Vec<K>, StoreError> {
        let api = self.api::<K>(ns);
        let lp = ListParams::default().labels(&label_selector(labels));
        let list = self.bounded("list", &K::kind(&()), "", api.list(&lp)).await?;
        Ok(list.items)
    }

    async fn create<K: Managed>(&self, ns: &str, obj: &K) -> Result<K, StoreError> {
        let api = self.api::<K>(ns);
        let name = name_of(obj);
        debug!(kind = %K::kind(&()), %ns, %name, "create");
        self.bounded("create", &K::kind(&()), &name, api.create(&PostParams::default(), obj)).await
    }

    async fn replace<K: Managed>(&self, ns: &str, obj: &K) -> Result<K, StoreError> {
        let api = self.api::<K>(ns);
        let name = name_of(obj);
        debug!(kind = %K::kind(&()), %ns, %name, "replace");
        self.bounded("replace", &K::kind(&()), &name, api.replace(&name, &PostParams::default(), obj)).await
    }

    async fn replace_status<K: Managed>(&self, ns: &str, obj: &K) -> Result<K, StoreError> {
        let api = self.api::<K>(ns);
        let name = name_of(obj);
        let body = serde_json::to_vec(obj)?;
        self.bounded("replace_status", &K::kind(&()), &name, api.replace_status(&name, &PostParams::default(), body))
            .await
    }

    async fn delete<K: Managed>(&self, ns: &str, name: &str) -> Result<(), StoreError> {
        let api = self.api::<K>(ns);
        info!(kind = %K::kind(&()), %ns, %name, "delete");
        match self.bounded("delete", &K::kind(&()), name, api.delete(name, &DeleteParams::background())).await {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Client from the ambient kubeconfig or in-cluster service account.
pub async fn get_kube_client() -> Result<Client> {
    let client = Client::try_default().await?;
    info!("kube client ready");
    Ok(client)
}
