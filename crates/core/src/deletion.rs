//! Where a cluster stands on its way out.

use crate::cluster::ClickHouseCluster;
use crate::DELETE_PVC_FINALIZER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionState {
    /// No deletion requested
    Active,
    /// Deletion requested, finalizer held, volumes not inspected yet
    Deleting,
    /// Volume claims still present
    AwaitingVolumeCleanup,
    /// Nothing blocks removal any more
    Removable,
}

impl DeletionState {
    /// `remaining_volumes` is the number of labelled claims still present, or `None`
    /// when they were not listed on this pass.
    pub fn observe(cluster: &ClickHouseCluster, remaining_volumes: Option<usize>) -> Self {
        if !cluster.is_deleting() {
            return DeletionState::Active;
        }
        if !cluster.has_finalizer(DELETE_PVC_FINALIZER) {
            return DeletionState::Removable;
        }
        match remaining_volumes {
            None => DeletionState::Deleting,
            Some(0) => DeletionState::Removable,
            Some(_) => DeletionState::AwaitingVolumeCleanup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn deleting(with_finalizer: bool) -> ClickHouseCluster {
        let mut c = ClickHouseCluster::new("demo", ClusterSpec { delete_pvc: true, ..Default::default() });
        c.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        c.set_finalizer(DELETE_PVC_FINALIZER, with_finalizer);
        c
    }

    #[test]
    fn live_cluster_is_active() {
        let c = ClickHouseCluster::new("demo", ClusterSpec::default());
        assert_eq!(DeletionState::observe(&c, Some(3)), DeletionState::Active);
    }

    #[test]
    fn walks_through_volume_cleanup() {
        let c = deleting(true);
        assert_eq!(DeletionState::observe(&c, None), DeletionState::Deleting);
        assert_eq!(DeletionState::observe(&c, Some(2)), DeletionState::AwaitingVolumeCleanup);
        assert_eq!(DeletionState::observe(&c, Some(0)), DeletionState::Removable);
    }

    #[test]
    fn no_finalizer_means_removable() {
        assert_eq!(DeletionState::observe(&deleting(false), None), DeletionState::Removable);
    }
}
