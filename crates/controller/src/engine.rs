//! One level-triggered pass over a single cluster object.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use metrics::{counter, histogram};
use tracing::{debug, error, info, info_span, warn, Instrument};

use chop_apply::Applier;
use chop_core::topology::host_count;
use chop_core::{
    ClickHouseCluster, ClusterStatus, DeletionState, LastApplied, OperatorDefaults, Phase, SchemaSync, ShardStatus,
    DELETE_PVC_FINALIZER, LAST_APPLIED_ANNOTATION,
};
use chop_kubehub::ResourceStore;
use chop_render::Generator;

use crate::error::ReconcileError;
use crate::guard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    /// Poll interval while workloads converge, and after failures
    pub short: Duration,
    /// Back-off after a rejected immutable-field change
    pub long: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self { short: Duration::from_secs(5), long: Duration::from_secs(30) }
    }
}

/// What the scheduler should do after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The object is gone or about to be; wait for the next event.
    Gone,
    Requeue(Duration),
    /// An immutable-field edit was reverted.
    Rejected(Duration),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Gone => "gone",
            Outcome::Requeue(_) => "requeue",
            Outcome::Rejected(_) => "rejected",
        }
    }
}

pub struct Engine<S> {
    store: Arc<S>,
    schema: Arc<dyn SchemaSync>,
    defaults: Arc<OperatorDefaults>,
    intervals: Intervals,
}

impl<S: ResourceStore> Engine<S> {
    pub fn new(store: Arc<S>, schema: Arc<dyn SchemaSync>, defaults: Arc<OperatorDefaults>) -> Self {
        Self { store, schema, defaults, intervals: Intervals::default() }
    }

    pub fn with_intervals(mut self, intervals: Intervals) -> Self {
        self.intervals = intervals;
        self
    }

    pub fn intervals(&self) -> Intervals {
        self.intervals
    }

    /// Drive the cluster `ns/name` one step towards its spec.
    pub async fn reconcile(&self, ns: &str, name: &str) -> Result<Outcome, ReconcileError> {
        let t0 = Instant::now();
        let res = self.pass(ns, name).instrument(info_span!("reconcile", %ns, %name)).await;
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(outcome) => counter!("reconcile_total", 1u64, "outcome" => outcome.label()),
            Err(e) => {
                error!(%ns, %name, error = %e, "reconcile failed");
                counter!("reconcile_errors_total", 1u64, "stage" => e.stage());
            }
        }
        res
    }

    async fn pass(&self, ns: &str, name: &str) -> Result<Outcome, ReconcileError> {
        let Some(mut cluster) = self.store.get::<ClickHouseCluster>(ns, name).await? else {
            debug!("cluster gone");
            return Ok(Outcome::Gone);
        };

        if !cluster.is_deleting() && cluster.phase().is_none() && self.defaults.materialize(&mut cluster) {
            info!("operator defaults applied");
            cluster = self.persist(ns, &cluster).await?;
        }

        // A cluster on its way out only needs its volumes released.
        let rejected = !cluster.is_deleting() && self.enforce_immutable(&mut cluster)?;
        if rejected {
            cluster = self.persist(ns, &cluster).await?;
        }

        if cluster.is_deleting() {
            return self.finalize(ns, cluster).await;
        }

        let delete_pvc = cluster.spec.delete_pvc;
        if cluster.set_finalizer(DELETE_PVC_FINALIZER, delete_pvc) {
            info!(delete_pvc, "volume-deletion finalizer updated");
            cluster = self.persist(ns, &cluster).await?;
        }

        let mut status = cluster.status.clone().unwrap_or_default();
        if !rejected {
            self.converge(ns, &cluster, &mut status).await?;
        }
        self.commit(ns, cluster, status).await?;

        Ok(if rejected { Outcome::Rejected(self.intervals.long) } else { Outcome::Requeue(self.intervals.short) })
    }

    /// Write spec and metadata, then status when it differs from what the store kept.
    async fn persist(&self, ns: &str, cluster: &ClickHouseCluster) -> Result<ClickHouseCluster, ReconcileError> {
        let mut stored = self.store.replace(ns, cluster).await?;
        if stored.status != cluster.status {
            stored.status = cluster.status.clone();
            stored = self.store.replace_status(ns, &stored).await?;
        }
        Ok(stored)
    }

    /// Returns true when an edit was reverted. An annotation that does not decode
    /// fails the pass before anything is written, so the record is never re-seeded
    /// from an unchecked spec.
    fn enforce_immutable(&self, cluster: &mut ClickHouseCluster) -> Result<bool, ReconcileError> {
        let Some(raw) = cluster.annotation(LAST_APPLIED_ANNOTATION) else { return Ok(false) };
        let accepted = LastApplied::decode(raw).map_err(ReconcileError::UnreadableLastApplied)?;
        let rejections = guard::enforce(&accepted.spec, &mut cluster.spec);
        for r in &rejections {
            warn!(field = r.field, accepted = %r.accepted, requested = %r.requested, "immutable field change rejected");
        }
        if !rejections.is_empty() {
            counter!("reconcile_rejected_changes", rejections.len() as u64);
        }
        Ok(!rejections.is_empty())
    }

    async fn converge(&self, ns: &str, cluster: &ClickHouseCluster, status: &mut ClusterStatus) -> Result<(), ReconcileError> {
        let gen = Generator::new(cluster, &self.defaults)?;
        let applier = Applier::new(&*self.store)?;
        let topology = gen.topology();

        applier.converge(ns, gen.common_config_map()?).await?;
        applier.converge(ns, gen.cluster_service()).await?;
        applier.converge(ns, gen.role_binding()).await?;

        for shard in 0..gen.shard_count() {
            let workload = applier.converge(ns, gen.stateful_set(shard)).await?.into_inner();
            applier.converge(ns, gen.shard_service(shard, &workload)?).await?;

            let key = gen.stateful_set_name(shard);
            let was = status.shard_status.get(&key).map(|s| s.phase);
            let mut phase = if is_ready(&workload, gen.replica_count()) { Phase::Running } else { Phase::Initializing };
            if phase == Phase::Running && was != Some(Phase::Running) && host_count(&topology) > 1 {
                info!(shard, "shard ready, propagating schema");
                if let Err(e) = self.schema.sync_shard(cluster, shard, &topology).await {
                    error!(shard, error = %e, "schema propagation failed, shard stays initializing");
                    counter!("schema_sync_failures", 1u64);
                    phase = Phase::Initializing;
                }
            }
            if was != Some(phase) {
                info!(shard, %phase, "shard phase changed");
            }
            status.shard_status.insert(key, ShardStatus { phase });
        }

        let shards = gen.shard_count();
        for workload in self.store.list::<StatefulSet>(ns, &gen.cluster_labels()).await? {
            let Some(name) = workload.metadata.name.as_deref() else { continue };
            if let Some(shard) = gen.shard_index(name).filter(|i| *i >= shards) {
                info!(workload = name, shard, "removing shard beyond shardsCount");
                self.store.delete::<StatefulSet>(ns, name).await?;
            }
        }
        status.shard_status.retain(|key, _| gen.shard_index(key).map_or(false, |i| i < shards));
        Ok(())
    }

    /// Release volumes of a cluster under deletion, then let it go.
    async fn finalize(&self, ns: &str, mut cluster: ClickHouseCluster) -> Result<Outcome, ReconcileError> {
        let mut state = DeletionState::observe(&cluster, None);
        if state == DeletionState::Deleting {
            state = if cluster.spec.delete_pvc {
                let remaining = self.delete_volumes(ns, &cluster).await?;
                DeletionState::observe(&cluster, Some(remaining))
            } else {
                DeletionState::Removable
            };
        }
        match state {
            DeletionState::Removable => {
                if cluster.set_finalizer(DELETE_PVC_FINALIZER, false) {
                    info!("volumes released, dropping finalizer");
                    self.store.replace(ns, &cluster).await?;
                }
                Ok(Outcome::Gone)
            }
            DeletionState::AwaitingVolumeCleanup | DeletionState::Deleting | DeletionState::Active => {
                Ok(Outcome::Requeue(self.intervals.short))
            }
        }
    }

    /// Delete the cluster's workloads and volume claims. Returns how many claims
    /// are still listed afterwards.
    async fn delete_volumes(&self, ns: &str, cluster: &ClickHouseCluster) -> Result<usize, ReconcileError> {
        let labels = chop_render::cluster_labels(cluster.metadata.name.as_deref().unwrap_or_default());
        // Pods hold their claims; workloads go first so the claims can be released.
        for workload in self.store.list::<StatefulSet>(ns, &labels).await? {
            if let Some(name) = workload.metadata.name.as_deref() {
                self.store.delete::<StatefulSet>(ns, name).await?;
            }
        }
        for claim in self.store.list::<PersistentVolumeClaim>(ns, &labels).await? {
            if let Some(name) = claim.metadata.name.as_deref() {
                info!(claim = name, "deleting volume claim");
                self.store.delete::<PersistentVolumeClaim>(ns, name).await?;
            }
        }
        let remaining = self.store.list::<PersistentVolumeClaim>(ns, &labels).await?.len();
        if remaining > 0 {
            info!(remaining, "waiting for volume claims to go");
        }
        Ok(remaining)
    }

    /// Record the accepted spec and the recomputed status; writes only what changed.
    async fn commit(&self, ns: &str, mut cluster: ClickHouseCluster, mut status: ClusterStatus) -> Result<(), ReconcileError> {
        let shards = cluster.spec.shards_count.max(0) as usize;
        status.phase = Some(status.aggregate_phase(shards));

        let record = LastApplied::new(&cluster.spec).encode()?;
        if cluster.annotation(LAST_APPLIED_ANNOTATION) != Some(record.as_str()) {
            cluster.metadata.annotations.get_or_insert_with(BTreeMap::new).insert(LAST_APPLIED_ANNOTATION.to_string(), record);
            cluster = self.store.replace(ns, &cluster).await?;
            debug!("last-applied spec recorded");
        }
        if cluster.status.as_ref() != Some(&status) {
            debug!(phase = ?status.phase, "status updated");
            cluster.status = Some(status);
            self.store.replace_status(ns, &cluster).await?;
        }
        Ok(())
    }
}

fn is_ready(workload: &StatefulSet, desired: usize) -> bool {
    let desired = desired as i32;
    workload.status.as_ref().map_or(false, |s| s.replicas == desired && s.ready_replicas.unwrap_or(0) == desired)
}
