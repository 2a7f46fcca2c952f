//! chop core: cluster resource types, operator defaults and shared seams.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod defaults;
pub mod deletion;
pub mod last_applied;
pub mod topology;

pub use cluster::{
    ClickHouseCluster, ClusterResources, ClusterSpec, ClusterStatus, CpuAndMem, Phase, PodPolicy, ShardStatus,
    ZookeeperConfig, ZookeeperNode,
};
pub use defaults::{AccessDefaults, DefaultsError, OperatorDefaults};
pub use deletion::DeletionState;
pub use last_applied::{LastApplied, LastAppliedError};
pub use topology::{Replica, Shard};

/// Annotation carrying the last accepted spec.
pub const LAST_APPLIED_ANNOTATION: &str = "clickhouse.chop.dev/last-applied-configuration";

/// Finalizer held while `deletePVC` is enabled.
pub const DELETE_PVC_FINALIZER: &str = "clickhouse.chop.dev/delete-pvc";

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "clickhouse-operator";
pub const LABEL_CLUSTER: &str = "clickhouse-cluster";
pub const LABEL_SHARD: &str = "shard-id";

pub const HTTP_PORT: i32 = 8123;
pub const CLIENT_PORT: i32 = 9000;
pub const INTERSERVER_PORT: i32 = 9009;

pub mod prelude {
    pub use super::{
        ClickHouseCluster, ClusterSpec, ClusterStatus, DeletionState, LastApplied, OperatorDefaults, Phase, Replica,
        SchemaSync, Shard, ShardStatus,
    };
}

/// Propagates database schema onto the hosts of one shard.
///
/// Implemented by the schemer crate; the reconciliation engine only sees this seam so
/// passes stay testable without live database hosts.
#[async_trait::async_trait]
pub trait SchemaSync: Send + Sync {
    /// Bring the shard at `shard` up to the schema found on its peers and on the
    /// rest of the cluster. `topology` is the full cluster layout.
    async fn sync_shard(&self, cluster: &ClickHouseCluster, shard: usize, topology: &[Shard]) -> anyhow::Result<()>;
}

/// Schema propagation that does nothing; used by offline renders.
pub struct NoopSchemaSync;

#[async_trait::async_trait]
impl SchemaSync for NoopSchemaSync {
    async fn sync_shard(&self, _cluster: &ClickHouseCluster, _shard: usize, _topology: &[Shard]) -> anyhow::Result<()> {
        Ok(())
    }
}
