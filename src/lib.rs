//! Picks the fastest node from a proxy subscription and runs Xray-core
//! with it as a local SOCKS5 proxy.

pub mod config;
pub mod proxy;
