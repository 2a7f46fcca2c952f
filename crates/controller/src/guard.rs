//! Fields that cannot change once a cluster has been accepted.

use chop_core::ClusterSpec;

/// One reverted edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub field: &'static str,
    pub accepted: String,
    pub requested: String,
}

fn pin(field: &'static str, accepted: &str, incoming: &mut String, out: &mut Vec<Rejection>) {
    if accepted != incoming {
        out.push(Rejection { field, accepted: accepted.to_string(), requested: std::mem::take(incoming) });
        *incoming = accepted.to_string();
    }
}

/// Revert every immutable field of `incoming` that differs from `accepted` and
/// report what was reverted. Comparison is textual: `10Gi` and `10240Mi` differ.
pub fn enforce(accepted: &ClusterSpec, incoming: &mut ClusterSpec) -> Vec<Rejection> {
    let mut out = Vec::new();
    pin("dataCapacity", &accepted.data_capacity, &mut incoming.data_capacity, &mut out);
    pin("dataStorageClass", &accepted.data_storage_class, &mut incoming.data_storage_class, &mut out);
    let (a, r) = (&accepted.resources, &mut incoming.resources);
    pin("resources.requests.cpu", &a.requests.cpu, &mut r.requests.cpu, &mut out);
    pin("resources.requests.memory", &a.requests.memory, &mut r.requests.memory, &mut out);
    pin("resources.limits.cpu", &a.limits.cpu, &mut r.limits.cpu, &mut out);
    pin("resources.limits.memory", &a.limits.memory, &mut r.limits.memory, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(capacity: &str, cpu: &str) -> ClusterSpec {
        let mut s = ClusterSpec { data_capacity: capacity.into(), shards_count: 1, ..Default::default() };
        s.resources.requests.cpu = cpu.into();
        s
    }

    #[test]
    fn capacity_change_is_reverted() {
        let accepted = spec("10Gi", "1");
        let mut incoming = spec("20Gi", "1");
        incoming.shards_count = 3;
        let got = enforce(&accepted, &mut incoming);
        assert_eq!(got, vec![Rejection { field: "dataCapacity", accepted: "10Gi".into(), requested: "20Gi".into() }]);
        assert_eq!(incoming.data_capacity, "10Gi");
        // mutable fields are left alone
        assert_eq!(incoming.shards_count, 3);
    }

    #[test]
    fn clearing_a_field_counts_as_a_change() {
        let accepted = spec("10Gi", "500m");
        let mut incoming = spec("10Gi", "");
        let got = enforce(&accepted, &mut incoming);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].field, "resources.requests.cpu");
        assert_eq!(incoming.resources.requests.cpu, "500m");
    }

    #[test]
    fn identical_specs_pass() {
        let accepted = spec("10Gi", "1");
        let mut incoming = accepted.clone();
        assert!(enforce(&accepted, &mut incoming).is_empty());
        assert_eq!(incoming, accepted);
    }
}
