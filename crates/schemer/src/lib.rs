//! chop schemer: copy database schema onto new or recovering hosts.
//!
//! Discovery reads definitions from peers through the server's `remote()`
//! table function; apply runs the resulting DDL host by host with bounded
//! linear retry.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, info, warn};

use chop_connect::{Connection, ConnectionParams, DbError, Pool};
use chop_core::topology::host_count;
use chop_core::{ClickHouseCluster, Replica, SchemaSync, Shard};

pub mod sql;

pub use sql::{Credentials, Rewriter};

#[derive(Debug, thiserror::Error)]
pub enum SchemerError {
    #[error("discovery failed on every candidate host: {0}")]
    Discovery(#[source] DbError),
    #[error("discovery row has {0} columns, expected 2")]
    Shape(usize),
    #[error("applying schema on {host}: {source}")]
    Apply {
        host: String,
        statement: String,
        #[source]
        source: DbError,
    },
    #[error("pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Attempt `n` failing waits `n * step` before attempt `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 10, step: Duration::from_secs(5) }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.step * attempt
    }
}

/// Names and DDL of discovered objects, in apply order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Objects {
    pub names: Vec<String>,
    pub statements: Vec<String>,
}

impl Objects {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    fn extend(&mut self, other: Objects) {
        self.names.extend(other.names);
        self.statements.extend(other.statements);
    }
}

pub struct Schemer {
    pool: Arc<Pool>,
    credentials: Credentials,
    retry: RetryPolicy,
    rewrite: Rewriter,
}

impl Schemer {
    pub fn new(pool: Arc<Pool>, credentials: Credentials, retry: RetryPolicy) -> Result<Self, SchemerError> {
        Ok(Self { pool, credentials, retry, rewrite: Rewriter::new()? })
    }

    fn conn(&self, r: &Replica) -> Arc<Connection> {
        self.pool.acquire(&ConnectionParams::new(
            r.host.clone(),
            r.http_port,
            self.credentials.username.clone(),
            self.credentials.password.clone(),
        ))
    }

    fn remote(&self, hosts: &[Replica]) -> String {
        sql::remote_tables(hosts, &self.credentials.username, &self.credentials.password)
    }

    /// Run `query` on the first host that answers.
    async fn fetch(&self, hosts: &[Replica], query: &str) -> Result<Objects, SchemerError> {
        let mut last = None;
        for r in hosts {
            match self.conn(r).query_strings(query).await {
                Ok(rows) => {
                    let mut out = Objects::default();
                    for mut row in rows {
                        if row.len() != 2 {
                            return Err(SchemerError::Shape(row.len()));
                        }
                        let stmt = row.pop().unwrap_or_default();
                        let name = row.pop().unwrap_or_default();
                        out.names.push(name);
                        out.statements.push(self.rewrite.if_not_exists(&stmt));
                    }
                    return Ok(out);
                }
                Err(e) => {
                    debug!(host = %r.host, error = %e, "discovery query failed, trying next host");
                    last = Some(e);
                }
            }
        }
        match last {
            Some(e) => Err(SchemerError::Discovery(e)),
            None => Ok(Objects::default()),
        }
    }

    /// Databases and tables present on the peers of a shard.
    pub async fn discover_replica_objects(&self, hosts: &[Replica]) -> Result<Objects, SchemerError> {
        if hosts.len() <= 1 {
            debug!("single replica, nothing to copy schema from");
            return Ok(Objects::default());
        }
        let tables = self.remote(hosts);
        let mut out = self.fetch(hosts, &sql::replica_databases(&tables)).await?;
        out.extend(self.fetch(hosts, &sql::replica_tables(&tables)).await?);
        Ok(out)
    }

    /// Distributed tables across the cluster, preceded by the databases and local
    /// tables they reference.
    pub async fn discover_distributed_objects(&self, hosts: &[Replica]) -> Result<Objects, SchemerError> {
        if hosts.is_empty() {
            return Ok(Objects::default());
        }
        let tables = self.remote(hosts);
        let mut out = self.fetch(hosts, &sql::distributed_databases(&tables)).await?;
        out.extend(self.fetch(hosts, &sql::distributed_tables(&tables)).await?);
        Ok(out)
    }

    async fn exec_with_retry(&self, conn: &Connection, stmt: &str) -> Result<(), DbError> {
        let mut attempt = 1;
        loop {
            let err = match conn.exec(stmt).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_replica_already_exists() && self.rewrite.is_create_table(stmt) => {
                    info!(host = %conn.params().host, "replica already registered, attaching table instead");
                    return conn.exec(&self.rewrite.attach(stmt)).await;
                }
                Err(e) => e,
            };
            if attempt >= self.retry.max_attempts {
                return Err(err);
            }
            let wait = self.retry.delay(attempt);
            warn!(host = %conn.params().host, attempt, max = self.retry.max_attempts, ?wait, error = %err, "statement failed, retrying");
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    /// Run `statements` in order on every host. A failing statement stops that
    /// host; the remaining hosts still run. Returns the first host failure.
    pub async fn apply_objects(&self, hosts: &[Replica], statements: &[String]) -> Result<(), SchemerError> {
        let mut first_err = None;
        for r in hosts {
            let conn = self.conn(r);
            for stmt in statements.iter().filter(|s| !s.trim().is_empty()) {
                if let Err(source) = self.exec_with_retry(&conn, stmt).await {
                    counter!("schema_statements_failed", 1u64);
                    warn!(host = %r.host, error = %source, "schema apply stopped for host");
                    if first_err.is_none() {
                        first_err = Some(SchemerError::Apply { host: r.host.clone(), statement: stmt.clone(), source });
                    }
                    break;
                }
                counter!("schema_statements_applied", 1u64);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Replica objects from the shard's peers, then distributed objects from the
    /// whole cluster, both applied to the shard's hosts. Both steps run; the
    /// first error is returned.
    pub async fn sync_shard_hosts(&self, shard_hosts: &[Replica], cluster_hosts: &[Replica]) -> Result<(), SchemerError> {
        let replica = self.discover_replica_objects(shard_hosts).await?;
        info!(objects = ?replica.names, "creating replica objects");
        let replica_res = self.apply_objects(shard_hosts, &replica.statements).await;

        let distributed = self.discover_distributed_objects(cluster_hosts).await?;
        info!(objects = ?distributed.names, "creating distributed objects");
        let distributed_res = self.apply_objects(shard_hosts, &distributed.statements).await;
        replica_res.and(distributed_res)
    }
}

/// `SchemaSync` backed by a shared connection pool.
pub struct PooledSchemaSync {
    pool: Arc<Pool>,
    retry: RetryPolicy,
    http_port: Option<i32>,
}

impl PooledSchemaSync {
    pub fn new(pool: Arc<Pool>, retry: RetryPolicy) -> Self {
        Self { pool, retry, http_port: None }
    }

    /// Reach every host on `port` instead of the port carried by the topology.
    pub fn with_http_port(mut self, port: i32) -> Self {
        self.http_port = Some(port);
        self
    }

    fn hosts<'a>(&self, replicas: impl Iterator<Item = &'a Replica>) -> Vec<Replica> {
        replicas
            .map(|r| match self.http_port {
                Some(http_port) => Replica { http_port, ..r.clone() },
                None => r.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl SchemaSync for PooledSchemaSync {
    async fn sync_shard(&self, cluster: &ClickHouseCluster, shard: usize, topology: &[Shard]) -> anyhow::Result<()> {
        if host_count(topology) <= 1 {
            return Ok(());
        }
        let Some(target) = topology.get(shard) else {
            anyhow::bail!("shard {} outside topology of {} shards", shard, topology.len());
        };
        let credentials = Credentials::from_users_xml(&cluster.spec.users)?;
        let schemer = Schemer::new(Arc::clone(&self.pool), credentials, self.retry)?;
        let shard_hosts = self.hosts(target.replicas.iter());
        let all = self.hosts(topology.iter().flat_map(|s| s.replicas.iter()));
        schemer.sync_shard_hosts(&shard_hosts, &all).await?;
        Ok(())
    }
}
