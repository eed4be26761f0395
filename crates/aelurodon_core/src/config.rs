/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Outbound proxy profile, chosen once per process, not per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    Direct,
    Tor,
    I2p,
    Gnunet,
}

impl ProxyKind {
    pub fn socks_url(&self) -> Option<&'static str> {
        match self {
            ProxyKind::Direct => None,
            ProxyKind::Tor => Some("socks5h://127.0.0.1:9050"),
            ProxyKind::I2p => Some("socks5h://127.0.0.1:4447"),
            ProxyKind::Gnunet => Some("socks5h://127.0.0.1:7777"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliverySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_attempt_log_len")]
    pub attempt_log_len: usize,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_interval_secs: default_retry_interval_secs(),
            max_pending: default_max_pending(),
            attempt_log_len: default_attempt_log_len(),
        }
    }
}

fn default_max_attempts() -> u32 {
    20
}

fn default_retry_interval_secs() -> u64 {
    30
}

fn default_max_pending() -> usize {
    1000
}

fn default_attempt_log_len() -> usize {
    16
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// Instance domain, `host` or `host:port`.
    pub domain: String,
    #[serde(default, alias = "base_url")]
    pub public_base_url: String,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub proxy: ProxyKind,
    /// When set, remote fetches are signed ("authorized fetch") so
    /// secure-mode instances answer them.
    #[serde(default)]
    pub secure_mode: bool,
    /// News instances let classified bots read public content.
    #[serde(default)]
    pub news_instance: bool,
    #[serde(default)]
    pub crawler_allow: Vec<String>,
    #[serde(default)]
    pub ua_block: Vec<String>,
    /// Domains participating in shared-items federation get Origin and
    /// SharesCatalog headers on delivery.
    #[serde(default)]
    pub shared_items_domains: Vec<String>,
    #[serde(default = "default_block_cache_refresh_secs")]
    pub block_cache_refresh_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub delivery: DeliverySettings,
    #[serde(default)]
    pub data_dir: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1:7430".to_string()
}

fn default_block_cache_refresh_secs() -> u64 {
    120
}

fn default_http_timeout_secs() -> u64 {
    20
}

impl InstanceConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let mut cfg: InstanceConfig =
            serde_json::from_str(&text).with_context(|| format!("parse config: {}", path.display()))?;
        if cfg.public_base_url.trim().is_empty() {
            cfg.public_base_url = format!("https://{}", cfg.domain);
        }
        Ok(cfg)
    }

    pub fn base_url(&self) -> &str {
        self.public_base_url.trim_end_matches('/')
    }

    pub fn actor_url(&self, nickname: &str) -> String {
        format!("{}/users/{nickname}", self.base_url())
    }

    pub fn followers_url(&self, nickname: &str) -> String {
        format!("{}/followers", self.actor_url(nickname))
    }

    pub fn shared_inbox_url(&self) -> String {
        format!("{}/inbox", self.base_url())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn block_cache_refresh(&self) -> Duration {
        Duration::from_secs(self.block_cache_refresh_secs)
    }

    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = self.data_dir.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        default_data_dir()
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("AELURODON_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("social", "aelurodon", "Aelurodon")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}
