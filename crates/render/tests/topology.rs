#![forbid(unsafe_code)]

use chop_core::{ClickHouseCluster, ClusterSpec, OperatorDefaults, ZookeeperConfig, ZookeeperNode};
use chop_render::{Generator, ALL_MACROS_JSON, REMOTE_SERVERS_XML};

fn defaults() -> OperatorDefaults {
    OperatorDefaults::from_yaml_str(
        r#"
default_clickhouse_image: ch:23.8
default_clickhouse_init_image: init:0.1
default_shard_count: 1
default_replicas_count: 1
default_zookeeper: { nodes: [ { host: zk, port: 2181 } ], root: /clickhouse }
default_data_capacity: 10Gi
access: { cluster_role: ch-pod, service_account: ch }
"#,
    )
    .unwrap()
}

fn cluster(shards: i32, replicas: i32) -> ClickHouseCluster {
    let mut c = ClickHouseCluster::new(
        "demo",
        ClusterSpec {
            image: "ch:23.8".into(),
            init_image: "init:0.1".into(),
            shards_count: shards,
            replicas_count: replicas,
            data_capacity: "10Gi".into(),
            data_storage_class: "fast".into(),
            custom_settings: "<yandex></yandex>".into(),
            zookeeper: Some(ZookeeperConfig {
                nodes: vec![ZookeeperNode { host: "zk".into(), port: 2181 }],
                root: "/clickhouse/analytics/demo".into(),
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    c.metadata.namespace = Some("analytics".into());
    c.metadata.uid = Some("0b5b2f9e-6c1a-4d63-9f6e-3d0a9e7c1a11".into());
    c
}

#[test]
fn two_by_two_topology_document() {
    let g = Generator::new(&cluster(2, 2), &defaults()).unwrap();
    let docs = g.config_documents().unwrap();
    let xml = &docs[REMOTE_SERVERS_XML];

    assert_eq!(xml.matches("<shard>").count(), 2);
    assert_eq!(xml.matches("<replica>").count(), 4);
    assert_eq!(xml.matches("<internal_replication>true</internal_replication>").count(), 2);
    for shard in 0..2 {
        for replica in 0..2 {
            let host = format!(
                "<host>clickhouse-demo-{s}-{r}.clickhouse-demo-{s}.analytics.svc.cluster.local</host>",
                s = shard,
                r = replica
            );
            assert!(xml.contains(&host), "missing {} in\n{}", host, xml);
        }
    }
    assert!(xml.contains("<port>9000</port>"));

    // each shard block holds exactly its own two replicas
    let blocks: Vec<&str> = xml.split("<shard>").skip(1).collect();
    assert_eq!(blocks.len(), 2);
    for (i, b) in blocks.iter().enumerate() {
        let block = b.split("</shard>").next().unwrap();
        assert_eq!(block.matches("<host>").count(), 2);
        assert_eq!(block.matches(&format!("clickhouse-demo-{}-", i)).count(), 2);
    }
}

#[test]
fn macros_are_keyed_by_pod_name() {
    let g = Generator::new(&cluster(2, 3), &defaults()).unwrap();
    let docs = g.config_documents().unwrap();
    let table: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&docs[ALL_MACROS_JSON]).unwrap();
    assert_eq!(table.len(), 6);
    let entry = table["clickhouse-demo-1-2"].as_str().unwrap();
    assert!(entry.contains("<shard>1</shard>"));
    assert!(entry.contains("<replica>clickhouse-demo-1-2</replica>"));
    assert!(entry.contains("<cluster>demo</cluster>"));
}

#[test]
fn workload_template_wires_config_and_storage() {
    let g = Generator::new(&cluster(1, 3), &defaults()).unwrap();
    let sts = g.stateful_set(0);
    let spec = sts.spec.unwrap();
    assert_eq!(spec.replicas, Some(3));
    assert_eq!(spec.service_name, "clickhouse-demo-0");

    let pod = spec.template.spec.unwrap();
    assert_eq!(pod.service_account_name.as_deref(), Some("ch"));
    let server = &pod.containers[0];
    assert_eq!(server.image.as_deref(), Some("ch:23.8"));
    let mounts: Vec<_> = server.volume_mounts.clone().unwrap().into_iter().map(|m| m.mount_path).collect();
    assert!(mounts.contains(&"/etc/clickhouse-server/config.d/".to_string()));
    assert!(mounts.contains(&"/etc/clickhouse-server/conf.d/".to_string()));
    assert!(mounts.contains(&"/var/lib/clickhouse".to_string()));

    let claim = &spec.volume_claim_templates.unwrap()[0];
    let claim_spec = claim.spec.clone().unwrap();
    assert_eq!(claim_spec.storage_class_name.as_deref(), Some("fast"));
    let storage = claim_spec.resources.unwrap().requests.unwrap()["storage"].0.clone();
    assert_eq!(storage, "10Gi");
}

#[test]
fn role_binding_uses_access_defaults() {
    let g = Generator::new(&cluster(1, 1), &defaults()).unwrap();
    let rb = g.role_binding();
    assert_eq!(rb.role_ref.name, "ch-pod");
    let subject = &rb.subjects.unwrap()[0];
    assert_eq!(subject.name, "ch");
    assert_eq!(subject.namespace.as_deref(), Some("analytics"));
}
