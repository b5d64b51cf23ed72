//! Persisted settings at `~/.xray-pilot/config.toml`.
//!
//! ```toml
//! [proxy]
//! enabled = true
//! subscription_url = "https://example.com/sub"
//! local_port = 10808
//! xray_path = "~/.xray-pilot/bin/xray"
//! current_node = "hk-01"
//! probe_concurrency = 8
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::proxy::DEFAULT_PROBE_CONCURRENCY;

/// Directory under the home directory holding settings and the engine.
pub const APP_DIR: &str = ".xray-pilot";

pub const DEFAULT_LOCAL_PORT: u16 = 10808;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub proxy: ProxySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub enabled: bool,
    pub subscription_url: String,
    pub local_port: u16,
    /// Engine binary. A leading `~` is expanded.
    pub xray_path: String,
    /// Name of the node the engine was last started with.
    pub current_node: String,
    pub probe_concurrency: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            subscription_url: String::new(),
            local_port: DEFAULT_LOCAL_PORT,
            xray_path: format!("~/{APP_DIR}/bin/xray{}", std::env::consts::EXE_SUFFIX),
            current_node: String::new(),
            probe_concurrency: DEFAULT_PROBE_CONCURRENCY,
        }
    }
}

impl ProxySettings {
    pub fn binary_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.xray_path).as_ref())
    }

    pub fn has_subscription(&self) -> bool {
        !self.subscription_url.trim().is_empty()
    }
}

/// `~/.xray-pilot`, or `./.xray-pilot` when no home directory is known.
pub fn app_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn default_settings_path() -> PathBuf {
    app_dir().join("config.toml")
}

impl Settings {
    /// Read settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Write settings to `path` via a temp file and rename.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("failed to serialize settings")?;

        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, content.as_bytes())
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path).with_context(|| {
            format!("failed to rename {} to {}", tmp_path.display(), path.display())
        })?;
        Ok(())
    }
}
