//! Watch loop driving the engine from cluster and owned-object events.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::runtime::controller::{Action, Config, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use chop_core::ClickHouseCluster;
use chop_kubehub::{Managed, ResourceStore};

use crate::engine::{Engine, Outcome};
use crate::error::ReconcileError;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Watch a single namespace; every namespace when unset
    pub namespace: Option<String>,
    /// Clusters reconciled at the same time
    pub concurrency: u16,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { namespace: None, concurrency: 4 }
    }
}

fn scoped<K: Managed>(client: &Client, ns: Option<&str>) -> Api<K> {
    match ns {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn reconcile<S: ResourceStore + 'static>(
    obj: Arc<ClickHouseCluster>,
    engine: Arc<Engine<S>>,
) -> Result<Action, ReconcileError> {
    let ns = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    Ok(match engine.reconcile(&ns, &name).await? {
        Outcome::Gone => Action::await_change(),
        Outcome::Requeue(after) | Outcome::Rejected(after) => Action::requeue(after),
    })
}

fn error_policy<S: ResourceStore + 'static>(
    _obj: Arc<ClickHouseCluster>,
    _err: &ReconcileError,
    engine: Arc<Engine<S>>,
) -> Action {
    Action::requeue(engine.intervals().short)
}

/// Run until a shutdown signal arrives. Changes to owned workloads, services
/// and config maps requeue their cluster.
pub async fn run<S: ResourceStore + 'static>(client: Client, engine: Arc<Engine<S>>, cfg: WatchConfig) -> anyhow::Result<()> {
    let ns = cfg.namespace.as_deref();
    let clusters: Api<ClickHouseCluster> = scoped(&client, ns);
    // Fail fast when the CRD is not installed.
    clusters.list(&kube::api::ListParams::default().limit(1)).await?;

    info!(namespace = ns.unwrap_or("*"), concurrency = cfg.concurrency, "watching clickhouse clusters");
    Controller::new(clusters, watcher::Config::default())
        .owns(scoped::<StatefulSet>(&client, ns), watcher::Config::default())
        .owns(scoped::<Service>(&client, ns), watcher::Config::default())
        .owns(scoped::<ConfigMap>(&client, ns), watcher::Config::default())
        .owns(scoped::<RoleBinding>(&client, ns), watcher::Config::default())
        .with_config(Config::default().concurrency(cfg.concurrency))
        .shutdown_on_signal()
        .run(reconcile::<S>, error_policy::<S>, engine)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(name = %obj.name, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile event failed"),
            }
        })
        .await;
    info!("controller stopped");
    Ok(())
}
