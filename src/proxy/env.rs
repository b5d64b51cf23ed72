//! Proxy environment for consumers of the local SOCKS listener.
//!
//! Tools disagree on casing, so every variable is emitted both upper- and
//! lowercase.

use super::xray_config::LISTEN_ADDRESS;

/// Variables pointed at the local listener, in output order.
pub const PROXY_ENV_KEYS: [&str; 6] = [
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ALL_PROXY",
    "http_proxy",
    "https_proxy",
    "all_proxy",
];

/// `socks5://127.0.0.1:{port}`. Never an externally reachable address.
pub fn local_proxy_url(port: u16) -> String {
    format!("socks5://{LISTEN_ADDRESS}:{port}")
}

pub fn proxy_env_vars(port: u16) -> Vec<(&'static str, String)> {
    let url = local_proxy_url(port);
    PROXY_ENV_KEYS
        .iter()
        .map(|key| (*key, url.clone()))
        .collect()
}

/// `export KEY=value` lines for a POSIX shell.
pub fn export_lines(port: u16) -> Vec<String> {
    proxy_env_vars(port)
        .into_iter()
        .map(|(key, value)| format!("export {key}={value}"))
        .collect()
}

/// `unset` line clearing everything `export_lines` sets.
pub fn unset_line() -> String {
    format!("unset {}", PROXY_ENV_KEYS.join(" "))
}
