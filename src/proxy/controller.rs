//! Enable/disable/status orchestration over the proxy components.
//!
//! ```text
//! enable()
//!   → install engine + data files
//!   → fetch subscription (or load a local file)
//!   → probe and select the fastest node
//!   → write config.json
//!   → (re)start xray-core
//!   → record current node in settings
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use super::download::EngineInstaller;
use super::env::local_proxy_url;
use super::health::{LatencyProbe, TcpProbe};
use super::node::{Node, Subscription};
use super::node_manager::NodeManager;
use super::process::{ProcessRegistry, SystemRegistry};
use super::runtime::{EnginePaths, EngineSupervisor};
use super::subscription::SubscriptionParser;
use super::xray_config;
use crate::config::Settings;

/// Outcome of a successful enable.
#[derive(Debug, Clone)]
pub struct Activation {
    pub node: Node,
    pub total_nodes: usize,
    pub pid: u32,
    pub local_port: u16,
}

impl Activation {
    pub fn proxy_url(&self) -> String {
        local_proxy_url(self.local_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyStatus {
    /// No subscription URL has been saved.
    NotConfigured,
    Stopped,
    Running { pid: u32, port: u16, node: String },
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConfigured => write!(f, "not configured"),
            Self::Stopped => write!(f, "stopped"),
            Self::Running { pid, port, node } if node.is_empty() => {
                write!(f, "running (PID {pid}, port {port})")
            }
            Self::Running { pid, port, node } => {
                write!(f, "running (PID {pid}, port {port}, node: {node})")
            }
        }
    }
}

pub struct ProxyController<R = SystemRegistry, P = TcpProbe> {
    settings: Settings,
    settings_path: PathBuf,
    installer: EngineInstaller,
    selector: NodeManager<P>,
    supervisor: EngineSupervisor<R>,
}

impl ProxyController<SystemRegistry, TcpProbe> {
    /// Controller wired to the public mirrors, TCP probing and the host OS.
    pub fn new(settings: Settings, settings_path: impl Into<PathBuf>) -> Result<Self> {
        let binary = settings.proxy.binary_path();
        let installer = EngineInstaller::with_defaults(&binary)?;
        let selector = NodeManager::new().concurrency(settings.proxy.probe_concurrency);
        let supervisor = EngineSupervisor::new(EnginePaths::for_binary(binary));
        Ok(Self::from_parts(
            settings,
            settings_path,
            installer,
            selector,
            supervisor,
        ))
    }
}

impl<R: ProcessRegistry, P: LatencyProbe> ProxyController<R, P> {
    pub fn from_parts(
        settings: Settings,
        settings_path: impl Into<PathBuf>,
        installer: EngineInstaller,
        selector: NodeManager<P>,
        supervisor: EngineSupervisor<R>,
    ) -> Self {
        Self {
            settings,
            settings_path: settings_path.into(),
            installer,
            selector,
            supervisor,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Download the engine and its data files if missing.
    pub async fn install(&self) -> Result<()> {
        self.installer
            .install()
            .await
            .context("failed to install xray-core")
    }

    /// Save `url` as the subscription and enable the proxy with it.
    ///
    /// The URL is persisted before anything else so a failed start can be
    /// retried with `on`.
    pub async fn subscribe(&mut self, url: &str) -> Result<Activation> {
        let url = url.trim();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            bail!("subscription URL must start with http:// or https://: {url}");
        }
        self.settings.proxy.subscription_url = url.to_string();
        self.settings.proxy.enabled = true;
        self.save_settings()?;
        tracing::info!("subscription URL saved");
        self.enable().await
    }

    /// Enable the proxy from the saved subscription.
    pub async fn enable(&mut self) -> Result<Activation> {
        if !self.settings.proxy.has_subscription() {
            bail!("no subscription URL configured, run `subscribe <url>` first");
        }
        self.settings.proxy.enabled = true;
        self.install().await?;

        let url = self.settings.proxy.subscription_url.clone();
        tracing::info!("fetching subscription");
        let subscription = SubscriptionParser::fetch(&url)
            .await
            .context("failed to fetch subscription")?;
        self.activate(subscription).await
    }

    /// Enable the proxy from a local subscription file without saving its
    /// path.
    pub async fn enable_from_file(&mut self, path: &Path) -> Result<Activation> {
        self.install().await?;
        let subscription = SubscriptionParser::load_file(path)
            .await
            .with_context(|| format!("failed to load {}", path.display()))?;
        self.activate(subscription).await
    }

    async fn activate(&mut self, mut subscription: Subscription) -> Result<Activation> {
        let total_nodes = subscription.len();
        tracing::info!("found {total_nodes} nodes");

        let node = self
            .selector
            .select_best(&mut subscription)
            .await
            .context("failed to select node")?;

        let local_port = self.settings.proxy.local_port;
        let config =
            xray_config::generate(&node, local_port).context("failed to generate xray config")?;
        xray_config::write_config(&config, &self.supervisor.paths().config)
            .await
            .context("failed to write xray config")?;

        if self.supervisor.is_running() {
            tracing::info!("restarting xray-core with the new node");
            self.supervisor
                .stop()
                .await
                .context("failed to stop running xray-core")?;
        }
        let pid = self
            .supervisor
            .start()
            .await
            .context("failed to start xray-core")?;

        self.settings.proxy.enabled = true;
        self.settings.proxy.current_node = node.name.clone();
        if let Err(e) = self.save_settings() {
            tracing::warn!("failed to save settings: {e:#}");
        }

        Ok(Activation {
            node,
            total_nodes,
            pid,
            local_port,
        })
    }

    /// Stop the engine and mark the proxy disabled.
    pub async fn disable(&mut self) -> Result<()> {
        self.supervisor
            .stop()
            .await
            .context("failed to stop xray-core")?;
        self.settings.proxy.enabled = false;
        self.settings.proxy.current_node.clear();
        self.save_settings()
    }

    pub fn status(&mut self) -> ProxyStatus {
        match self.supervisor.running_pid() {
            Some(pid) => ProxyStatus::Running {
                pid,
                port: self.settings.proxy.local_port,
                node: self.settings.proxy.current_node.clone(),
            },
            None if self.settings.proxy.has_subscription() => ProxyStatus::Stopped,
            None => ProxyStatus::NotConfigured,
        }
    }

    fn save_settings(&self) -> Result<()> {
        self.settings.save(&self.settings_path)
    }
}
