//! Subscription-driven proxy support on top of an external Xray-core
//! process.
//!
//! Nodes come from a subscription feed, are probed for latency, and the
//! fastest reachable one is written into an engine config that a supervised
//! `xray` process runs with.

mod atomic;
pub mod controller;
pub mod download;
pub mod env;
pub mod error;
pub mod health;
pub mod node;
pub mod node_manager;
pub mod process;
pub mod runtime;
pub mod subscription;
pub mod xray_config;

pub use controller::{Activation, ProxyController, ProxyStatus};
pub use download::{
    default_data_files, default_sources, DataFile, DownloadSource, EngineInstaller, VersionFormat,
};
pub use env::{local_proxy_url, proxy_env_vars};
pub use error::{ProcessError, ProxyError, Result};
pub use health::{LatencyProbe, TcpProbe};
pub use node::{Node, NodeKind, Subscription};
pub use node_manager::{NodeManager, DEFAULT_PROBE_CONCURRENCY};
pub use process::{ProcessRegistry, SystemRegistry};
pub use runtime::{EnginePaths, EngineSupervisor};
pub use subscription::SubscriptionParser;
pub use xray_config::{generate, write_config, XrayConfig};
