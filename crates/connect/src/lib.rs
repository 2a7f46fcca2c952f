//! chop connect: process-lifetime cache of lazily connecting database handles.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::debug;

mod conn;

pub use conn::{parse_code, Connection, ConnectionParams, DbError, REPLICA_ALREADY_EXISTS};

/// Handles keyed by host, port and credentials. Entries are never evicted; a
/// failing handle reconnects on its next use.
pub struct Pool {
    conns: RwLock<FxHashMap<ConnectionParams, Arc<Connection>>>,
    init: Mutex<()>,
    timeout: Duration,
}

impl Pool {
    pub fn new(timeout: Duration) -> Self {
        Self { conns: RwLock::new(FxHashMap::default()), init: Mutex::new(()), timeout }
    }

    fn cached(&self, params: &ConnectionParams) -> Option<Arc<Connection>> {
        self.conns.read().unwrap_or_else(|e| e.into_inner()).get(params).cloned()
    }

    /// Cached handle for `params`, created on first request. Concurrent callers
    /// for the same key end up with the same handle.
    pub fn acquire(&self, params: &ConnectionParams) -> Arc<Connection> {
        if let Some(c) = self.cached(params) {
            counter!("pool_hits", 1u64);
            return c;
        }
        let _guard = self.init.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(c) = self.cached(params) {
            counter!("pool_hits", 1u64);
            return c;
        }
        let conn = Arc::new(Connection::new(params.clone(), self.timeout));
        self.conns.write().unwrap_or_else(|e| e.into_inner()).insert(params.clone(), Arc::clone(&conn));
        counter!("pool_misses", 1u64);
        debug!(host = %params.host, port = params.port, user = %params.username, "pooled new connection");
        conn
    }

    pub fn len(&self) -> usize {
        self.conns.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
