//! Subscription parser for proxy nodes.
//!
//! Accepts the two formats providers publish: a newline-delimited list of
//! `vmess://`, `vless://`, `trojan://` and `ss://` links (usually base64
//! wrapped as a whole), and a Clash-style YAML `proxies:` list. Both are
//! reduced to ordered `Node`s; entries that cannot be decoded are skipped.

use std::borrow::Cow;
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Deserializer};
use tracing::debug;
use url::{Host, Url};

use super::error::{ProxyError, Result};
use super::node::{Node, NodeKind, Subscription};

/// HTTP fetch timeout for subscription URLs.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout for subscription fetch.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Markers that make the parser try the YAML interpretation first.
const YAML_MARKERS: &[&str] = &["proxies:", "- {name:"];

/// Subscription fetcher and parser.
pub struct SubscriptionParser;

impl SubscriptionParser {
    /// Fetch a subscription over HTTP and parse it.
    ///
    /// Uses a direct (no-proxy) client: the subscription has to be reachable
    /// before any proxy is up.
    pub async fn fetch(url: &str) -> Result<Subscription> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(FETCH_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                ProxyError::Download(format!("failed to build subscription HTTP client: {e}"))
            })?;

        let resp = client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::Download(format!("subscription fetch timed out: {url}"))
            } else {
                ProxyError::Download(format!("subscription fetch failed: {url}: {e}"))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProxyError::Download(format!(
                "subscription returned HTTP {status}: {url}"
            )));
        }

        let body = resp.bytes().await.map_err(|e| {
            ProxyError::Download(format!("failed to read subscription response body: {e}"))
        })?;

        let content = Self::decode_body(&body);
        let nodes = Self::parse_str(&content)?;
        Ok(Subscription::new(url, nodes))
    }

    /// Read a local subscription file and parse it.
    pub async fn load_file(path: &Path) -> Result<Subscription> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| ProxyError::io(path, e))?;
        let nodes = Self::parse(&data)?;
        Ok(Subscription::new(path.display().to_string(), nodes))
    }

    /// Undo the whole-body base64 wrapping most providers apply.
    ///
    /// Falls back to the raw body when it is not valid standard base64 or
    /// does not decode to UTF-8.
    pub fn decode_body(body: &[u8]) -> Cow<'_, str> {
        let compact: Vec<u8> = body
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        if let Ok(decoded) = STANDARD.decode(&compact) {
            if let Ok(text) = String::from_utf8(decoded) {
                return Cow::Owned(text);
            }
        }
        String::from_utf8_lossy(body)
    }

    /// Parse raw subscription bytes.
    pub fn parse(content: &[u8]) -> Result<Vec<Node>> {
        Self::parse_str(&String::from_utf8_lossy(content))
    }

    /// Parse decoded subscription text.
    ///
    /// YAML detection is only a hint: when the YAML attempt fails or yields
    /// nothing, the content is re-read as a link list.
    pub fn parse_str(content: &str) -> Result<Vec<Node>> {
        if YAML_MARKERS.iter().any(|m| content.contains(m)) {
            match Self::parse_clash_yaml(content) {
                Ok(nodes) => return Ok(nodes),
                Err(e) => debug!("YAML interpretation failed, trying link list: {e}"),
            }
        }

        let nodes = Self::parse_links(content);
        if nodes.is_empty() {
            return Err(ProxyError::Parse(
                "no valid nodes found in subscription".into(),
            ));
        }
        Ok(nodes)
    }

    /// Parse a newline-delimited link list, skipping lines that do not decode.
    pub fn parse_links(content: &str) -> Vec<Node> {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                let node = Self::parse_link(line);
                if node.is_none() {
                    debug!("skipping unrecognized subscription line");
                }
                node
            })
            .collect()
    }

    /// Parse one share link.
    pub fn parse_link(line: &str) -> Option<Node> {
        if let Some(rest) = line.strip_prefix("vmess://") {
            parse_vmess(rest)
        } else if line.starts_with("vless://") {
            parse_vless(line)
        } else if line.starts_with("trojan://") {
            parse_trojan(line)
        } else if line.starts_with("ss://") {
            parse_shadowsocks(line)
        } else {
            None
        }
    }

    /// Parse a Clash-style YAML proxy list.
    ///
    /// Accepts a document with a top-level `proxies` sequence, or a bare
    /// sequence of inline proxy mappings.
    pub fn parse_clash_yaml(content: &str) -> Result<Vec<Node>> {
        let doc: serde_yaml::Value = serde_yaml::from_str(content)
            .map_err(|e| ProxyError::Parse(format!("invalid YAML: {e}")))?;

        let entries = match &doc {
            serde_yaml::Value::Mapping(map) => map
                .get("proxies")
                .and_then(serde_yaml::Value::as_sequence)
                .cloned()
                .unwrap_or_default(),
            serde_yaml::Value::Sequence(seq) => seq.clone(),
            _ => Vec::new(),
        };

        if entries.is_empty() {
            return Err(ProxyError::Parse("no proxies found in YAML".into()));
        }

        let nodes: Vec<Node> = entries
            .into_iter()
            .filter_map(|entry| match serde_yaml::from_value::<ClashProxy>(entry) {
                Ok(proxy) => proxy.into_node(),
                Err(e) => {
                    debug!("skipping malformed YAML proxy entry: {e}");
                    None
                }
            })
            .collect();

        if nodes.is_empty() {
            return Err(ProxyError::Parse(
                "no valid proxy nodes found in YAML".into(),
            ));
        }
        Ok(nodes)
    }
}

// ── YAML entries ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ClashProxy {
    #[serde(default, deserialize_with = "scalar_string")]
    name: Option<String>,
    #[serde(rename = "type", default, deserialize_with = "scalar_string")]
    proxy_type: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    server: Option<String>,
    #[serde(default)]
    port: serde_yaml::Value,
    #[serde(default, deserialize_with = "scalar_string")]
    password: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    uuid: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    cipher: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    sni: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    network: Option<String>,
}

/// Read any YAML scalar as text, so `password: 123456` or `name: 1` stay
/// usable. Sequences and mappings are rejected.
fn scalar_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<serde_yaml::Value>::deserialize(deserializer)? {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(serde_yaml::Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "expected a scalar, found {other:?}"
        ))),
    }
}

impl ClashProxy {
    /// Entries without a server or port (traffic and expiry banners) yield
    /// `None`.
    fn into_node(self) -> Option<Node> {
        let port = yaml_port(&self.port)?;
        let kind = NodeKind::from_type_name(self.proxy_type.as_deref().unwrap_or_default());
        let mut node = Node::new(kind.clone(), self.server.unwrap_or_default(), port)?
            .with_name(self.name.unwrap_or_default());

        match kind {
            NodeKind::Trojan => {
                node.credential = self.password.unwrap_or_default();
                node.sni = Some(
                    self.sni
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| node.server.clone()),
                );
            }
            NodeKind::VMess | NodeKind::VLess => {
                node.credential = self.uuid.unwrap_or_default();
                node.network = self.network;
            }
            NodeKind::Shadowsocks => {
                node.credential = self.password.unwrap_or_default();
                node.cipher = self.cipher;
            }
            NodeKind::Other(_) => {}
        }
        Some(node)
    }
}

fn yaml_port(value: &serde_yaml::Value) -> Option<u16> {
    match value {
        serde_yaml::Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        serde_yaml::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|p| *p != 0)
}

// ── Share links ─────────────────────────────────────────────────────

/// `vmess://<base64 JSON>`
fn parse_vmess(payload: &str) -> Option<Node> {
    let decoded = decode_base64(payload, &[&STANDARD, &STANDARD_NO_PAD])?;
    let json: serde_json::Value = serde_json::from_slice(&decoded).ok()?;

    let server = json_str(&json, "add")?;
    let port = json_port(&json, "port")?;
    let mut node = Node::new(NodeKind::VMess, server, port)?
        .with_name(json_str(&json, "ps").unwrap_or_default())
        .with_credential(json_str(&json, "id").unwrap_or_default());
    node.network = json_str(&json, "net").filter(|s| !s.is_empty());
    node.tls = match json.get("tls") {
        Some(serde_json::Value::Bool(true)) => Some("tls".into()),
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    };
    Some(node)
}

/// `vless://<uuid>@<server>:<port>?<query>#<name>`
fn parse_vless(line: &str) -> Option<Node> {
    let url = Url::parse(line).ok()?;
    let (server, port) = host_port(&url)?;
    let mut node = Node::new(NodeKind::VLess, server, port)?
        .with_name(link_name(&url))
        .with_credential(link_user(&url)?);
    node.network = query_param(&url, "type");
    node.security = query_param(&url, "security");
    Some(node)
}

/// `trojan://<password>@<server>:<port>?<query>#<name>`
fn parse_trojan(line: &str) -> Option<Node> {
    let url = Url::parse(line).ok()?;
    let (server, port) = host_port(&url)?;
    let node = Node::new(NodeKind::Trojan, server, port)?
        .with_name(link_name(&url))
        .with_credential(link_user(&url)?);
    Some(node)
}

/// `ss://<base64(method:password)>@<server>:<port>#<name>`, or the legacy
/// `ss://<base64(method:password@server:port)>#<name>`.
fn parse_shadowsocks(line: &str) -> Option<Node> {
    let sip002 = Url::parse(&escape_ss_userinfo(line))
        .ok()
        .filter(|url| !url.username().is_empty());

    let (name, credentials, (server, port)) = match sip002 {
        Some(url) => (
            link_name(&url),
            decode_ss_credentials(url.username())?,
            host_port(&url)?,
        ),
        None => {
            let rest = line.strip_prefix("ss://")?;
            let (body, name) = match rest.split_once('#') {
                Some((body, fragment)) => (body, decode_component(fragment)),
                None => (rest, String::new()),
            };
            let body = body.split_once('?').map_or(body, |(head, _)| head);
            let whole = decode_ss_credentials(body.trim_end_matches('/'))?;
            let (credentials, authority) = whole.rsplit_once('@')?;
            let url = Url::parse(&format!("ss://{authority}")).ok()?;
            (name, credentials.to_string(), host_port(&url)?)
        }
    };

    let (method, password) = credentials.split_once(':')?;
    let mut node = Node::new(NodeKind::Shadowsocks, server, port)?
        .with_name(name)
        .with_credential(password);
    node.cipher = Some(method.to_string());
    Some(node)
}

/// Standard alphabet first, URL-safe second, then the unpadded variants.
fn decode_ss_credentials(encoded: &str) -> Option<String> {
    let encoded = percent_decode(encoded);
    let bytes = decode_base64(
        &encoded,
        &[&STANDARD, &URL_SAFE, &STANDARD_NO_PAD, &URL_SAFE_NO_PAD],
    )?;
    String::from_utf8(bytes).ok()
}

fn decode_base64(input: &str, engines: &[&base64::engine::GeneralPurpose]) -> Option<Vec<u8>> {
    let input = input.trim();
    engines.iter().find_map(|engine| engine.decode(input).ok())
}

/// Standard-alphabet userinfo may carry a raw `/`, which would otherwise end
/// the authority.
fn escape_ss_userinfo(line: &str) -> Cow<'_, str> {
    let Some(rest) = line.strip_prefix("ss://") else {
        return Cow::Borrowed(line);
    };
    let body_end = rest.find('#').unwrap_or(rest.len());
    match rest[..body_end].rsplit_once('@') {
        Some((userinfo, _)) if userinfo.contains('/') => Cow::Owned(format!(
            "ss://{}{}",
            userinfo.replace('/', "%2F"),
            &rest[userinfo.len()..]
        )),
        _ => Cow::Borrowed(line),
    }
}

/// Host without IPv6 brackets, and the explicit port.
fn host_port(url: &Url) -> Option<(String, u16)> {
    let host = match url.host()? {
        Host::Domain(domain) => domain.to_string(),
        Host::Ipv4(addr) => addr.to_string(),
        Host::Ipv6(addr) => addr.to_string(),
    };
    Some((host, url.port()?))
}

/// Decoded userinfo; links without one are rejected.
fn link_user(url: &Url) -> Option<String> {
    let user = percent_decode(url.username());
    (!user.is_empty()).then_some(user)
}

fn link_name(url: &Url) -> String {
    url.fragment().map(decode_component).unwrap_or_default()
}

fn query_param(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

/// Percent-decode a fragment, treating `+` as a space.
fn decode_component(raw: &str) -> String {
    percent_decode(&raw.replace('+', " "))
}

/// Percent-decode userinfo; `+` is literal here since base64 uses it.
fn percent_decode(raw: &str) -> String {
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}

fn json_str(obj: &serde_json::Value, key: &str) -> Option<String> {
    match obj.get(key)? {
        serde_json::Value::String(s) => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_port(obj: &serde_json::Value, key: &str) -> Option<u16> {
    match obj.get(key)? {
        serde_json::Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
