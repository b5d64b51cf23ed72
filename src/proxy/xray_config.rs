//! Xray-core configuration generation.
//!
//! Produces a config with:
//! - one SOCKS inbound on `127.0.0.1:{local_port}` with UDP relay
//! - a `proxy` outbound built from the selected node
//! - a `direct` freedom outbound
//! - routing that sends private, CN IP and CN domain traffic to `direct`
//!
//! Anything no rule matches leaves through the first outbound, `proxy`.
//! Each protocol block is a concrete record; the whole document goes through
//! serde once, so a missing or misspelled key is a compile error.

use std::path::Path;

use serde::Serialize;

use super::atomic::write_atomic;
use super::error::{ProxyError, Result};
use super::node::{Node, NodeKind};

/// Outbound tag traffic is tunnelled through.
pub const PROXY_TAG: &str = "proxy";

/// Outbound tag for bypassed traffic.
pub const DIRECT_TAG: &str = "direct";

/// Address the SOCKS inbound binds to.
pub const LISTEN_ADDRESS: &str = "127.0.0.1";

// ── Document ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct XrayConfig {
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub routing: Routing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inbound {
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    pub settings: SocksSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SocksSettings {
    pub udp: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outbound {
    pub tag: String,
    #[serde(flatten)]
    pub protocol: OutboundProtocol,
    #[serde(rename = "streamSettings", skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
}

/// Protocol-specific outbound settings, serialized as
/// `"protocol": "<name>", "settings": {...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "protocol", content = "settings", rename_all = "lowercase")]
pub enum OutboundProtocol {
    VMess(VnextSettings<VMessUser>),
    VLess(VnextSettings<VLessUser>),
    Trojan(ServerSettings<TrojanServer>),
    Shadowsocks(ServerSettings<ShadowsocksServer>),
    Freedom(FreedomSettings),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VnextSettings<U> {
    pub vnext: Vec<VnextServer<U>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VnextServer<U> {
    pub address: String,
    pub port: u16,
    pub users: Vec<U>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VMessUser {
    pub id: String,
    #[serde(rename = "alterId")]
    pub alter_id: u16,
    pub security: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VLessUser {
    pub id: String,
    pub encryption: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerSettings<S> {
    pub servers: Vec<S>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrojanServer {
    pub address: String,
    pub port: u16,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShadowsocksServer {
    pub address: String,
    pub port: u16,
    pub method: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FreedomSettings {}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSettings {
    pub network: String,
    pub security: String,
    #[serde(rename = "tlsSettings")]
    pub tls_settings: TlsSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    pub server_name: String,
    pub allow_insecure: bool,
    pub alpn: Vec<String>,
    pub disable_system_root: bool,
    pub enable_session_resumption: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Routing {
    #[serde(rename = "domainStrategy")]
    pub domain_strategy: String,
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ip: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domain: Vec<String>,
    #[serde(rename = "outboundTag")]
    pub outbound_tag: String,
}

// ── Generation ──────────────────────────────────────────────────────

/// Build the engine config for `node` with a SOCKS inbound on `local_port`.
///
/// # Errors
/// `UnsupportedKind` for nodes outside vmess, vless, trojan and shadowsocks.
pub fn generate(node: &Node, local_port: u16) -> Result<XrayConfig> {
    Ok(XrayConfig {
        inbounds: vec![socks_inbound(local_port)],
        outbounds: vec![proxy_outbound(node)?, direct_outbound()],
        routing: split_tunnel_routing(),
    })
}

/// Serialize `config` as pretty JSON and write it atomically to `path`.
pub async fn write_config(config: &XrayConfig, path: &Path) -> Result<()> {
    let json = serde_json::to_vec_pretty(config)?;
    write_atomic(path, &json).await?;
    tracing::debug!("wrote engine config to {}", path.display());
    Ok(())
}

fn socks_inbound(port: u16) -> Inbound {
    Inbound {
        listen: LISTEN_ADDRESS.to_string(),
        port,
        protocol: "socks".to_string(),
        settings: SocksSettings { udp: true },
    }
}

fn proxy_outbound(node: &Node) -> Result<Outbound> {
    let address = node.server.clone();
    let port = node.port;

    let (protocol, stream_settings) = match &node.kind {
        NodeKind::VMess => (
            OutboundProtocol::VMess(VnextSettings {
                vnext: vec![VnextServer {
                    address,
                    port,
                    users: vec![VMessUser {
                        id: node.credential.clone(),
                        alter_id: 0,
                        security: "auto".to_string(),
                    }],
                }],
            }),
            None,
        ),
        NodeKind::VLess => (
            OutboundProtocol::VLess(VnextSettings {
                vnext: vec![VnextServer {
                    address,
                    port,
                    users: vec![VLessUser {
                        id: node.credential.clone(),
                        encryption: "none".to_string(),
                    }],
                }],
            }),
            None,
        ),
        NodeKind::Trojan => (
            OutboundProtocol::Trojan(ServerSettings {
                servers: vec![TrojanServer {
                    address,
                    port,
                    password: node.credential.clone(),
                }],
            }),
            Some(trojan_tls(node)),
        ),
        NodeKind::Shadowsocks => (
            OutboundProtocol::Shadowsocks(ServerSettings {
                servers: vec![ShadowsocksServer {
                    address,
                    port,
                    method: node.cipher.clone().unwrap_or_default(),
                    password: node.credential.clone(),
                }],
            }),
            None,
        ),
        NodeKind::Other(kind) => return Err(ProxyError::UnsupportedKind(kind.clone())),
    };

    Ok(Outbound {
        tag: PROXY_TAG.to_string(),
        protocol,
        stream_settings,
    })
}

/// TLS over TCP with certificate validation left on.
fn trojan_tls(node: &Node) -> StreamSettings {
    StreamSettings {
        network: "tcp".to_string(),
        security: "tls".to_string(),
        tls_settings: TlsSettings {
            server_name: node.sni_or_server().to_string(),
            allow_insecure: false,
            alpn: vec!["h2".to_string(), "http/1.1".to_string()],
            disable_system_root: false,
            enable_session_resumption: true,
        },
    }
}

fn direct_outbound() -> Outbound {
    Outbound {
        tag: DIRECT_TAG.to_string(),
        protocol: OutboundProtocol::Freedom(FreedomSettings {}),
        stream_settings: None,
    }
}

/// Private and CN destinations go direct; first match wins. Domains are only
/// resolved for IP rules when no domain rule matched (`IPIfNonMatch`).
fn split_tunnel_routing() -> Routing {
    let direct_ip = |cidr: &str| RoutingRule {
        rule_type: "field".to_string(),
        ip: vec![cidr.to_string()],
        domain: Vec::new(),
        outbound_tag: DIRECT_TAG.to_string(),
    };
    Routing {
        domain_strategy: "IPIfNonMatch".to_string(),
        rules: vec![
            direct_ip("geoip:private"),
            direct_ip("geoip:cn"),
            RoutingRule {
                rule_type: "field".to_string(),
                ip: Vec::new(),
                domain: vec!["geosite:cn".to_string()],
                outbound_tag: DIRECT_TAG.to_string(),
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn node(kind: NodeKind) -> Node {
        Node::new(kind, "proxy.example.com", 443)
            .unwrap()
            .with_name("n")
            .with_credential("secret-or-uuid")
    }

    fn to_json(node: &Node) -> Value {
        serde_json::to_value(generate(node, 10808).unwrap()).unwrap()
    }

    #[test]
    fn fixed_structure_for_every_kind() {
        for kind in [
            NodeKind::VMess,
            NodeKind::VLess,
            NodeKind::Trojan,
            NodeKind::Shadowsocks,
        ] {
            let cfg = to_json(&node(kind));
            assert_eq!(
                cfg["inbounds"],
                json!([{
                    "listen": "127.0.0.1",
                    "port": 10808,
                    "protocol": "socks",
                    "settings": {"udp": true}
                }])
            );
            assert_eq!(cfg["outbounds"][0]["tag"], "proxy");
            assert_eq!(
                cfg["outbounds"][1],
                json!({"tag": "direct", "protocol": "freedom", "settings": {}})
            );
        }
    }

    #[test]
    fn routing_rules_in_order() {
        let cfg = to_json(&node(NodeKind::VMess));
        assert_eq!(
            cfg["routing"],
            json!({
                "domainStrategy": "IPIfNonMatch",
                "rules": [
                    {"type": "field", "ip": ["geoip:private"], "outboundTag": "direct"},
                    {"type": "field", "ip": ["geoip:cn"], "outboundTag": "direct"},
                    {"type": "field", "domain": ["geosite:cn"], "outboundTag": "direct"}
                ]
            })
        );
    }

    #[test]
    fn vmess_outbound() {
        let cfg = to_json(&node(NodeKind::VMess));
        assert_eq!(
            cfg["outbounds"][0],
            json!({
                "tag": "proxy",
                "protocol": "vmess",
                "settings": {"vnext": [{
                    "address": "proxy.example.com",
                    "port": 443,
                    "users": [{"id": "secret-or-uuid", "alterId": 0, "security": "auto"}]
                }]}
            })
        );
    }

    #[test]
    fn vless_outbound() {
        let cfg = to_json(&node(NodeKind::VLess));
        let out = &cfg["outbounds"][0];
        assert_eq!(out["protocol"], "vless");
        assert_eq!(
            out["settings"]["vnext"][0]["users"][0],
            json!({"id": "secret-or-uuid", "encryption": "none"})
        );
        assert!(out.get("streamSettings").is_none());
    }

    #[test]
    fn trojan_outbound_with_tls() {
        let mut n = node(NodeKind::Trojan);
        n.sni = Some("cdn.example.com".into());
        let cfg = to_json(&n);
        let out = &cfg["outbounds"][0];
        assert_eq!(out["protocol"], "trojan");
        assert_eq!(
            out["settings"]["servers"][0],
            json!({"address": "proxy.example.com", "port": 443, "password": "secret-or-uuid"})
        );
        assert_eq!(
            out["streamSettings"],
            json!({
                "network": "tcp",
                "security": "tls",
                "tlsSettings": {
                    "serverName": "cdn.example.com",
                    "allowInsecure": false,
                    "alpn": ["h2", "http/1.1"],
                    "disableSystemRoot": false,
                    "enableSessionResumption": true
                }
            })
        );
    }

    #[test]
    fn trojan_empty_sni_uses_server() {
        let mut n = node(NodeKind::Trojan);
        n.sni = Some(String::new());
        let cfg = to_json(&n);
        assert_eq!(
            cfg["outbounds"][0]["streamSettings"]["tlsSettings"]["serverName"],
            "proxy.example.com"
        );
    }

    #[test]
    fn shadowsocks_outbound() {
        let mut n = node(NodeKind::Shadowsocks);
        n.cipher = Some("aes-256-gcm".into());
        let cfg = to_json(&n);
        let out = &cfg["outbounds"][0];
        assert_eq!(out["protocol"], "shadowsocks");
        assert_eq!(
            out["settings"]["servers"][0],
            json!({
                "address": "proxy.example.com",
                "port": 443,
                "method": "aes-256-gcm",
                "password": "secret-or-uuid"
            })
        );
    }

    #[test]
    fn other_kind_is_unsupported() {
        let err = generate(&node(NodeKind::Other("http".into())), 10808).unwrap_err();
        assert!(matches!(err, ProxyError::UnsupportedKind(ref k) if k == "http"));
    }

    #[test]
    fn never_binds_all_interfaces() {
        let text = serde_json::to_string(&generate(&node(NodeKind::VMess), 1080).unwrap()).unwrap();
        assert!(!text.contains("0.0.0.0"));
    }

    #[tokio::test]
    async fn write_config_produces_parseable_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = generate(&node(NodeKind::Trojan), 10808).unwrap();
        write_config(&cfg, &path).await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        for key in ["inbounds", "outbounds", "routing"] {
            assert!(parsed.get(key).is_some(), "missing top-level key {key}");
        }
        assert_eq!(parsed, serde_json::to_value(&cfg).unwrap());
    }
}
