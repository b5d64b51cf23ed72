//! Uniform node model shared by the parser, selector and config generator.

use std::fmt;

/// `latency_ms` value recorded for a node that was probed and could not be
/// reached.
pub const UNREACHABLE: i64 = -1;

/// Proxy protocol of a node.
///
/// Only the first four variants map onto an engine outbound. `Other` keeps
/// YAML entries of any other type so they survive parsing and probing;
/// generating a config for them fails.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum NodeKind {
    VMess,
    VLess,
    Trojan,
    Shadowsocks,
    Other(String),
}

impl NodeKind {
    /// Map a Clash-style `type` value onto a kind.
    pub fn from_type_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "vmess" => Self::VMess,
            "vless" => Self::VLess,
            "trojan" => Self::Trojan,
            "ss" | "shadowsocks" => Self::Shadowsocks,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VMess => write!(f, "vmess"),
            Self::VLess => write!(f, "vless"),
            Self::Trojan => write!(f, "trojan"),
            Self::Shadowsocks => write!(f, "ss"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// A single proxy endpoint with its credentials and transport parameters.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub server: String,
    pub port: u16,
    /// UUID for vmess/vless, password for trojan/shadowsocks.
    pub credential: String,
    /// Shadowsocks method.
    pub cipher: Option<String>,
    /// vless `security` query parameter.
    pub security: Option<String>,
    pub network: Option<String>,
    pub tls: Option<String>,
    pub sni: Option<String>,
    /// `None` until probed, `Some(UNREACHABLE)` when the probe failed.
    pub latency_ms: Option<i64>,
}

impl Node {
    /// Build a node with only the addressing fields set.
    ///
    /// Returns `None` unless `server` is non-empty and `port` is non-zero, so
    /// a malformed entry can never turn into a zero-valued node.
    pub fn new(kind: NodeKind, server: impl Into<String>, port: u16) -> Option<Self> {
        let server = server.into();
        if server.trim().is_empty() || port == 0 {
            return None;
        }
        Some(Self {
            name: String::new(),
            kind,
            server,
            port,
            credential: String::new(),
            cipher: None,
            security: None,
            network: None,
            tls: None,
            sni: None,
            latency_ms: None,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = credential.into();
        self
    }

    /// Server name for the TLS handshake; the server address when unset.
    pub fn sni_or_server(&self) -> &str {
        match self.sni.as_deref() {
            Some(sni) if !sni.is_empty() => sni,
            _ => &self.server,
        }
    }

    pub fn is_probed(&self) -> bool {
        self.latency_ms.is_some()
    }

    /// Measured latency, only for nodes that were probed and answered.
    pub fn reachable_latency(&self) -> Option<i64> {
        self.latency_ms.filter(|ms| *ms >= 0)
    }
}

/// An ordered set of nodes from one source.
///
/// Order is first-seen order from the source and decides selection ties.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// URL or local path the nodes came from.
    pub source: String,
    pub nodes: Vec<Node>,
}

impl Subscription {
    pub fn new(source: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            source: source.into(),
            nodes,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
