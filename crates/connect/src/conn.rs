//! One database endpoint reached over its HTTP interface.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value as Json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Server error code for a replica already registered in the coordination service.
pub const REPLICA_ALREADY_EXISTS: u32 = 253;

/// Identity of a pooled connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionParams {
    pub host: String,
    pub port: i32,
    pub username: String,
    pub password: String,
}

impl ConnectionParams {
    pub fn new(host: impl Into<String>, port: i32, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { host: host.into(), port, username: username.into(), password: password.into() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("connecting to {host}: {source}")]
    Connect { host: String, source: reqwest::Error },
    #[error("{host} is not ready: HTTP {status}")]
    NotReady { host: String, status: u16 },
    #[error("request to {host}: {source}")]
    Transport { host: String, source: reqwest::Error },
    #[error("{host}: {message}")]
    Server { host: String, code: Option<u32>, message: String },
    #[error("decoding response from {host}: {source}")]
    Decode { host: String, source: serde_json::Error },
}

impl DbError {
    pub fn code(&self) -> Option<u32> {
        match self {
            DbError::Server { code, .. } => *code,
            _ => None,
        }
    }

    pub fn is_replica_already_exists(&self) -> bool {
        match self {
            DbError::Server { code, message, .. } => {
                *code == Some(REPLICA_ALREADY_EXISTS) || message.contains("REPLICA_ALREADY_EXISTS")
            }
            _ => false,
        }
    }
}

/// `Code: 253. DB::Exception: ...` -> 253
pub fn parse_code(body: &str) -> Option<u32> {
    let rest = &body[body.find("Code: ")? + "Code: ".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[derive(Deserialize)]
struct Compact {
    data: Vec<Vec<Json>>,
}

/// Connects on first use; a transport failure drops the client so the next
/// call connects again.
pub struct Connection {
    params: ConnectionParams,
    timeout: Duration,
    client: Mutex<Option<reqwest::Client>>,
}

impl Connection {
    pub fn new(params: ConnectionParams, timeout: Duration) -> Self {
        Self { params, timeout, client: Mutex::new(None) }
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.params.host, self.params.port, path)
    }

    pub async fn is_connected(&self) -> bool {
        self.client.lock().await.is_some()
    }

    async fn client(&self) -> Result<reqwest::Client, DbError> {
        let mut slot = self.client.lock().await;
        if let Some(c) = slot.as_ref() {
            return Ok(c.clone());
        }
        let host = self.params.host.clone();
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|source| DbError::Connect { host: host.clone(), source })?;
        let resp = client.get(self.url("/ping")).send().await.map_err(|source| DbError::Connect { host: host.clone(), source })?;
        if !resp.status().is_success() {
            return Err(DbError::NotReady { host, status: resp.status().as_u16() });
        }
        debug!(host = %self.params.host, port = self.params.port, "connected");
        *slot = Some(client.clone());
        Ok(client)
    }

    async fn post(&self, sql: &str, path: &str) -> Result<String, DbError> {
        let client = self.client().await?;
        let host = self.params.host.clone();
        let sent = client
            .post(self.url(path))
            .header("X-ClickHouse-User", &self.params.username)
            .header("X-ClickHouse-Key", &self.params.password)
            .body(sql.to_string())
            .send()
            .await;
        let resp = match sent {
            Ok(r) => r,
            Err(source) => {
                warn!(%host, error = %source, "transport failure, dropping client");
                *self.client.lock().await = None;
                return Err(DbError::Transport { host, source });
            }
        };
        let status = resp.status();
        let body = resp.text().await.map_err(|source| DbError::Transport { host: host.clone(), source })?;
        if !status.is_success() {
            return Err(DbError::Server { host, code: parse_code(&body), message: body.trim().to_string() });
        }
        Ok(body)
    }

    /// Run a statement that returns rows.
    pub async fn query(&self, sql: &str) -> Result<Vec<Vec<Json>>, DbError> {
        let body = self.post(sql, "/?default_format=JSONCompact").await?;
        let parsed: Compact =
            serde_json::from_str(&body).map_err(|source| DbError::Decode { host: self.params.host.clone(), source })?;
        Ok(parsed.data)
    }

    /// Rows with every cell rendered as text.
    pub async fn query_strings(&self, sql: &str) -> Result<Vec<Vec<String>>, DbError> {
        let rows = self.query(sql).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|cell| match cell {
                        Json::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect()
            })
            .collect())
    }

    /// Run a statement and discard its output.
    pub async fn exec(&self, sql: &str) -> Result<(), DbError> {
        self.post(sql, "/").await.map(|_| ())
    }
}
