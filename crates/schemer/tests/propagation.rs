#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chop_connect::Pool;
use chop_core::Replica;
use chop_schemer::{Credentials, RetryPolicy, Schemer, SchemerError};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn replica(server: &MockServer) -> Replica {
    Replica { host: server.address().ip().to_string(), port: 9000, http_port: server.address().port() as i32 }
}

async fn ping_ok(server: &MockServer) {
    Mock::given(method("GET")).and(path("/ping")).respond_with(ResponseTemplate::new(200).set_body_string("Ok.\n")).mount(server).await;
}

fn schemer(attempts: u32) -> Schemer {
    let pool = Arc::new(Pool::new(Duration::from_secs(5)));
    let retry = RetryPolicy { max_attempts: attempts, step: Duration::from_millis(1) };
    Schemer::new(pool, Credentials::default(), retry).unwrap()
}

#[tokio::test]
async fn registered_replica_falls_back_to_attach() {
    let server = MockServer::start().await;
    ping_ok(&server).await;
    Mock::given(method("POST"))
        .and(body_string_contains("CREATE TABLE"))
        .respond_with(ResponseTemplate::new(500).set_body_string(
            "Code: 253. DB::Exception: Replica /clickhouse/tables/0/db.t/replicas/r0 already exists. (REPLICA_ALREADY_EXISTS)",
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("ATTACH TABLE IF NOT EXISTS db.t"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let stmt = "CREATE TABLE IF NOT EXISTS db.t (x UInt8) ENGINE = ReplicatedMergeTree('/t', 'r') ORDER BY x".to_string();
    schemer(10).apply_objects(&[replica(&server)], &[stmt]).await.unwrap();
}

#[tokio::test]
async fn discovery_uses_first_answering_host() {
    let down = MockServer::start().await;
    Mock::given(method("GET")).and(path("/ping")).respond_with(ResponseTemplate::new(503)).mount(&down).await;

    let up = MockServer::start().await;
    ping_ok(&up).await;
    Mock::given(method("POST"))
        .and(body_string_contains("create_db_query"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"data":[["db","CREATE DATABASE IF NOT EXISTS \"db\""]]}"#))
        .expect(1)
        .mount(&up)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains(".inner."))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"data":[["t","CREATE TABLE db.t (x UInt8) ENGINE = ReplicatedMergeTree('/t', '{replica}') ORDER BY x"]]}"#,
        ))
        .expect(1)
        .mount(&up)
        .await;

    let got = schemer(1).discover_replica_objects(&[replica(&down), replica(&up)]).await.unwrap();
    assert_eq!(got.names, vec!["db".to_string(), "t".to_string()]);
    assert_eq!(got.statements[0], "CREATE DATABASE IF NOT EXISTS \"db\"");
    assert!(got.statements[1].starts_with("CREATE TABLE IF NOT EXISTS db.t"));
}

#[tokio::test]
async fn distributed_discovery_orders_databases_then_local_then_distributed() {
    let server = MockServer::start().await;
    ping_ok(&server).await;
    Mock::given(method("POST"))
        .and(body_string_contains("create_query"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"data":[["db","CREATE DATABASE IF NOT EXISTS \"db\""],["raw","CREATE DATABASE IF NOT EXISTS \"raw\""]]}"#,
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("ORDER BY order"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"data":[
                ["raw.events_local","CREATE TABLE raw.events_local (x UInt8) ENGINE = ReplicatedMergeTree('/t', '{replica}') ORDER BY x"],
                ["db.events","CREATE TABLE db.events (x UInt8) ENGINE = Distributed('c', 'raw', 'events_local', rand())"]
            ]}"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let got = schemer(1).discover_distributed_objects(&[replica(&server)]).await.unwrap();
    assert_eq!(got.names, vec!["db", "raw", "raw.events_local", "db.events"]);
    assert_eq!(got.statements[0], "CREATE DATABASE IF NOT EXISTS \"db\"");
    assert!(got.statements[2].starts_with("CREATE TABLE IF NOT EXISTS raw.events_local"), "{}", got.statements[2]);
    assert!(got.statements[3].starts_with("CREATE TABLE IF NOT EXISTS db.events"), "{}", got.statements[3]);
    assert!(got.statements.iter().all(|s| !s.contains("IF NOT EXISTS IF NOT EXISTS")));
}

#[tokio::test]
async fn discovery_fails_when_no_host_answers() {
    let a = MockServer::start().await;
    let b = MockServer::start().await;
    for s in [&a, &b] {
        Mock::given(method("GET")).and(path("/ping")).respond_with(ResponseTemplate::new(503)).mount(s).await;
    }
    let err = schemer(1).discover_distributed_objects(&[replica(&a), replica(&b)]).await.unwrap_err();
    assert!(matches!(err, SchemerError::Discovery(_)), "{}", err);
}

#[tokio::test]
async fn failing_host_does_not_block_the_others() {
    let bad = MockServer::start().await;
    ping_ok(&bad).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Code: 60. DB::Exception: Table db.x doesn't exist"))
        .expect(2)
        .mount(&bad)
        .await;

    let good = MockServer::start().await;
    ping_ok(&good).await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).expect(2).mount(&good).await;

    let stmts = vec!["CREATE DATABASE IF NOT EXISTS \"db\"".to_string(), "CREATE TABLE IF NOT EXISTS db.t (x UInt8) ENGINE = Memory".to_string()];
    let err = schemer(2).apply_objects(&[replica(&bad), replica(&good)], &stmts).await.unwrap_err();
    match err {
        SchemerError::Apply { host, statement, source } => {
            assert_eq!(host, replica(&bad).host);
            assert_eq!(statement, stmts[0]);
            assert_eq!(source.code(), Some(60));
        }
        other => panic!("unexpected {}", other),
    }
}
