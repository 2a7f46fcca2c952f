#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chop_apply::{Applied, Applier};
use chop_kubehub::ResourceStore;
use chop_store::MemStore;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta { name: Some(name.into()), ..Default::default() }
}

fn config(value: &str) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert("settings.xml".to_string(), value.to_string());
    ConfigMap { metadata: meta("cfg"), data: Some(data), ..Default::default() }
}

#[tokio::test]
async fn create_then_skip_then_update() {
    let store = MemStore::new();
    let applier = Applier::new(&store).unwrap();

    let first = applier.converge("ns", config("<a/>")).await.unwrap();
    assert!(matches!(first, Applied::Created(_)));

    store.reset_writes();
    let again = applier.converge("ns", config("<a/>")).await.unwrap();
    assert!(matches!(again, Applied::Unchanged(_)));
    assert!(store.writes().is_empty());

    let changed = applier.converge("ns", config("<b/>")).await.unwrap();
    assert_eq!(changed.label(), "updated");
    let stored = store.get::<ConfigMap>("ns", "cfg").await.unwrap().unwrap();
    assert_eq!(stored.data.unwrap()["settings.xml"], "<b/>");
}

#[tokio::test]
async fn service_update_keeps_cluster_ip() {
    let store = MemStore::new();
    let applier = Applier::new(&store).unwrap();
    let svc = |port: i32| Service {
        metadata: meta("svc"),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort { name: Some("http".into()), port, ..Default::default() }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    let mut created = applier.converge("ns", svc(8123)).await.unwrap().into_inner();
    // the platform allocates an address
    created.spec.as_mut().unwrap().cluster_ip = Some("10.1.2.3".into());
    store.replace("ns", &created).await.unwrap();

    let updated = applier.converge("ns", svc(8124)).await.unwrap();
    assert!(matches!(updated, Applied::Updated(_)));
    let spec = updated.into_inner().spec.unwrap();
    assert_eq!(spec.cluster_ip.as_deref(), Some("10.1.2.3"));
    assert_eq!(spec.ports.unwrap()[0].port, 8124);
}

#[tokio::test]
async fn role_ref_change_recreates_binding() {
    let store = MemStore::new();
    let applier = Applier::new(&store).unwrap();
    let binding = |role: &str| RoleBinding {
        metadata: meta("rb"),
        role_ref: RoleRef { api_group: "rbac.authorization.k8s.io".into(), kind: "ClusterRole".into(), name: role.into() },
        subjects: None,
    };
    let first = applier.converge("ns", binding("a")).await.unwrap().into_inner();
    let second = applier.converge("ns", binding("b")).await.unwrap();
    assert_eq!(second.label(), "recreated");
    let second = second.into_inner();
    assert_ne!(first.metadata.uid, second.metadata.uid);
    assert_eq!(second.role_ref.name, "b");
}
