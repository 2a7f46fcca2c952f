//! Discovery queries, statement rewrites and credential extraction.

use regex::Regex;

use chop_core::Replica;

/// Text-level rewrites applied to discovered DDL.
pub struct Rewriter {
    create: Regex,
    create_table: Regex,
}

impl Rewriter {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            create: Regex::new(r"^(\s*)CREATE (TABLE|VIEW|MATERIALIZED VIEW) ")?,
            create_table: Regex::new(r"^(\s*)CREATE TABLE ")?,
        })
    }

    /// `CREATE TABLE t` -> `CREATE TABLE IF NOT EXISTS t`; other statements and
    /// already idempotent ones pass through unchanged.
    pub fn if_not_exists(&self, stmt: &str) -> String {
        if self.create.find(stmt).map(|m| stmt[m.end()..].starts_with("IF NOT EXISTS")).unwrap_or(true) {
            return stmt.to_string();
        }
        self.create.replace(stmt, "${1}CREATE ${2} IF NOT EXISTS ").into_owned()
    }

    pub fn is_create_table(&self, stmt: &str) -> bool {
        self.create_table.is_match(stmt)
    }

    /// `CREATE TABLE ...` -> `ATTACH TABLE ...`
    pub fn attach(&self, stmt: &str) -> String {
        self.create_table.replace(stmt, "${1}ATTACH TABLE ").into_owned()
    }
}

fn quote(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// `remote('h1:9000,h2:9000', system, tables, 'user', 'password')`
pub fn remote_tables(hosts: &[Replica], username: &str, password: &str) -> String {
    let addrs: Vec<String> = hosts.iter().map(|r| format!("{}:{}", r.host, r.port)).collect();
    format!("remote('{}', system, tables, '{}', '{}')", quote(&addrs.join(",")), quote(username), quote(password))
}

pub fn replica_databases(tables: &str) -> String {
    format!(
        r#"SELECT DISTINCT
    database AS name,
    concat('CREATE DATABASE IF NOT EXISTS "', name, '"') AS create_db_query
FROM {tables}
WHERE database != 'system'
SETTINGS skip_unavailable_shards = 1"#
    )
}

pub fn replica_tables(tables: &str) -> String {
    format!(
        r#"SELECT DISTINCT
    name,
    create_table_query
FROM {tables}
WHERE database != 'system' AND create_table_query != '' AND name NOT LIKE '.inner.%'
SETTINGS skip_unavailable_shards = 1"#
    )
}

pub fn distributed_databases(tables: &str) -> String {
    format!(
        r#"SELECT DISTINCT
    database AS name,
    concat('CREATE DATABASE IF NOT EXISTS "', name, '"') AS create_query
FROM
(
    SELECT DISTINCT arrayJoin([database, extract(engine_full, 'Distributed\\([^,]+, *\'?([^,\']+)\'?, *[^,]+')]) database
    FROM {tables} tables
    WHERE engine = 'Distributed'
    SETTINGS skip_unavailable_shards = 1
)"#
    )
}

/// Local tables (order 1) come before the distributed tables over them (order 2).
pub fn distributed_tables(tables: &str) -> String {
    format!(
        r#"SELECT DISTINCT
    concat(database, '.', name) AS name,
    create_table_query
FROM
(
    SELECT database, name, create_table_query, 2 AS order
    FROM {tables} tables
    WHERE engine = 'Distributed'
    SETTINGS skip_unavailable_shards = 1
    UNION ALL
    SELECT
        extract(engine_full, 'Distributed\\([^,]+, *\'?([^,\']+)\'?, *[^,]+') AS database,
        extract(engine_full, 'Distributed\\([^,]+, [^,]+, *\'?([^,\\\')]+)') AS name,
        t.create_table_query,
        1 AS order
    FROM {tables} tables
    LEFT JOIN (SELECT DISTINCT database, name, create_table_query
               FROM {tables} SETTINGS skip_unavailable_shards = 1) t USING (database, name)
    WHERE engine = 'Distributed' AND t.create_table_query != ''
    SETTINGS skip_unavailable_shards = 1
) tables
ORDER BY order"#
    )
}

/// Username and password used for schema work on a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self { username: "default".to_string(), password: String::new() }
    }
}

impl Credentials {
    /// First user declared under `<users>` and its `<password>`; the `default`
    /// user when the document is empty or declares nobody.
    pub fn from_users_xml(xml: &str) -> Result<Self, regex::Error> {
        let user = Regex::new(r"<users>\s*<([A-Za-z_][A-Za-z0-9_.-]*)\s*>")?;
        let Some(caps) = user.captures(xml) else { return Ok(Self::default()) };
        let (name, start) = match caps.get(1) {
            Some(m) => (m.as_str().to_string(), caps.get(0).map(|m| m.end()).unwrap_or(0)),
            None => return Ok(Self::default()),
        };
        let block = match xml[start..].find(&format!("</{}>", name)) {
            Some(end) => &xml[start..start + end],
            None => &xml[start..],
        };
        let password = Regex::new(r"<password>([^<]*)</password>")?
            .captures(block)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        Ok(Self { username: name, password })
    }
}
