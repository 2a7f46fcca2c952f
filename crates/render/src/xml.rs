//! Typed encoders for the server configuration documents.
//!
//! Every document is a `<yandex>` root with a fixed element layout; values are
//! escaped, element order follows the input order.

use std::borrow::Cow;
use std::collections::BTreeMap;

use chop_core::{Shard, ZookeeperConfig};

const INDENT: &str = "    ";

pub(crate) struct XmlWriter {
    out: String,
    depth: usize,
}

impl XmlWriter {
    pub(crate) fn new() -> Self {
        Self { out: String::from("<yandex>\n"), depth: 1 }
    }

    fn indent(&mut self) {
        for _ in 0..self.depth {
            self.out.push_str(INDENT);
        }
    }

    pub(crate) fn open(&mut self, tag: &str) -> &mut Self {
        self.indent();
        self.out.push('<');
        self.out.push_str(tag);
        self.out.push_str(">\n");
        self.depth += 1;
        self
    }

    pub(crate) fn close(&mut self, tag: &str) -> &mut Self {
        self.depth = self.depth.saturating_sub(1);
        self.indent();
        self.out.push_str("</");
        self.out.push_str(tag);
        self.out.push_str(">\n");
        self
    }

    pub(crate) fn leaf(&mut self, tag: &str, value: &str) -> &mut Self {
        self.indent();
        self.out.push('<');
        self.out.push_str(tag);
        self.out.push('>');
        self.out.push_str(&escape(value));
        self.out.push_str("</");
        self.out.push_str(tag);
        self.out.push_str(">\n");
        self
    }

    pub(crate) fn finish(mut self) -> String {
        self.out.push_str("</yandex>\n");
        self.out
    }
}

pub fn escape(s: &str) -> Cow<'_, str> {
    if !s.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// `remote_servers.xml`: one `<shard>` per topology entry under the cluster's name.
pub fn remote_servers_xml(cluster: &str, topology: &[Shard]) -> String {
    let mut w = XmlWriter::new();
    w.open("remote_servers").open(cluster);
    for shard in topology {
        w.open("shard").leaf("internal_replication", if shard.internal_replication { "true" } else { "false" });
        for r in &shard.replicas {
            w.open("replica").leaf("host", &r.host).leaf("port", &r.port.to_string()).close("replica");
        }
        w.close("shard");
    }
    w.close(cluster).close("remote_servers");
    w.finish()
}

/// `zookeeper.xml`. Unset timeouts, root and identity are left out.
pub fn zookeeper_xml(zk: &ZookeeperConfig) -> String {
    let mut w = XmlWriter::new();
    w.open("zookeeper");
    for (i, node) in zk.nodes.iter().enumerate() {
        w.open(&format!("node index=\"{}\"", i + 1));
        w.leaf("host", &node.host).leaf("port", &node.port.to_string());
        w.close("node");
    }
    if zk.session_timeout_ms > 0 {
        w.leaf("session_timeout_ms", &zk.session_timeout_ms.to_string());
    }
    if zk.operation_timeout_ms > 0 {
        w.leaf("operation_timeout_ms", &zk.operation_timeout_ms.to_string());
    }
    if !zk.root.is_empty() {
        w.leaf("root", &zk.root);
    }
    if !zk.identity.is_empty() {
        w.leaf("identity", &zk.identity);
    }
    w.close("zookeeper");
    w.finish()
}

/// Macros file for one replica pod.
pub fn macros_xml(cluster: &str, shard: usize, replica: &str) -> String {
    let mut w = XmlWriter::new();
    w.open("macros").leaf("cluster", cluster).leaf("shard", &shard.to_string()).leaf("replica", replica).close("macros");
    w.finish()
}

/// `all-macros.json`: pod name -> macros XML, keys sorted.
pub fn all_macros_json(cluster: &str, pods: &[(String, usize)]) -> Result<String, serde_json::Error> {
    let table: BTreeMap<&str, String> =
        pods.iter().map(|(pod, shard)| (pod.as_str(), macros_xml(cluster, *shard, pod))).collect();
    serde_json::to_string_pretty(&table)
}
