//! Runtime configuration overlay.
//!
//! Hosts that keep component secrets in a central config service plug in a
//! [`ConfigProvider`]. [`ConfigHandle`] merges provider results into a fresh
//! immutable snapshot; readers hold an `Arc<WechatConfig>` for the length of
//! one call and never see a half-applied update.

use super::WechatConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Partial configuration from a provider. Only non-empty fields apply.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct WechatOverlay {
    pub component_app_id: Option<String>,
    pub component_app_secret: Option<String>,
    pub component_token: Option<String>,
    pub component_encoding_aes_key: Option<String>,
    pub public_base_url: Option<String>,
}

impl WechatOverlay {
    /// Trims values and drops empty ones. Returns `None` when nothing is left.
    pub fn normalized(self) -> Option<Self> {
        fn clean(v: Option<String>) -> Option<String> {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        }

        let overlay = Self {
            component_app_id: clean(self.component_app_id),
            component_app_secret: clean(self.component_app_secret),
            component_token: clean(self.component_token),
            component_encoding_aes_key: clean(self.component_encoding_aes_key),
            public_base_url: clean(self.public_base_url),
        };

        if overlay == Self::default() {
            None
        } else {
            Some(overlay)
        }
    }

    /// New config with the overlay's fields replacing `base`'s.
    pub fn apply_to(&self, base: &WechatConfig) -> WechatConfig {
        let mut next = base.clone();
        if let Some(v) = &self.component_app_id {
            next.component_app_id = v.clone();
        }
        if let Some(v) = &self.component_app_secret {
            next.component_app_secret = v.clone();
        }
        if let Some(v) = &self.component_token {
            next.component_token = v.clone();
        }
        if let Some(v) = &self.component_encoding_aes_key {
            next.component_encoding_aes_key = v.clone();
        }
        if let Some(v) = &self.public_base_url {
            next.public_base_url = Some(v.clone());
        }
        next
    }
}

/// Source of runtime configuration overrides.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Current overrides, or `None` when the source has nothing to say.
    async fn load(&self) -> Result<Option<WechatOverlay>>;
}

/// Re-reads the `[wechat]` table of a TOML file.
pub struct FileConfigProvider {
    path: PathBuf,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Deserialize)]
struct OverlayFile {
    #[serde(default)]
    wechat: WechatOverlay,
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load(&self) -> Result<Option<WechatOverlay>> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let file: OverlayFile =
            toml::from_str(&contents).context("Failed to parse config overlay")?;
        Ok(file.wechat.normalized())
    }
}

/// Result of one provider refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// A provider is registered
    pub enabled: bool,
    /// The provider returned something and it was merged
    pub applied: bool,
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Shared, swappable configuration snapshot.
#[derive(Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<WechatConfig>>>,
    provider: Option<Arc<dyn ConfigProvider>>,
    env_lookup: Option<EnvLookup>,
}

impl ConfigHandle {
    pub fn new(config: WechatConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            provider: None,
            env_lookup: None,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Environment source re-applied on top of every merged overlay, so
    /// `WECHAT_*` variables keep precedence over provider values.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env_lookup = Some(Arc::new(lookup));
        self
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    /// The configuration in effect right now.
    pub fn snapshot(&self) -> Arc<WechatConfig> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Publishes a new snapshot with `overlay` merged in.
    pub fn apply(&self, overlay: &WechatOverlay) -> Arc<WechatConfig> {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = overlay.apply_to(&current);
        if let Some(lookup) = &self.env_lookup {
            next.apply_env_with(|name| lookup(name));
        }
        let next = Arc::new(next.normalized());
        *current = next.clone();
        next
    }

    /// Pulls once from the provider and merges the result.
    pub async fn refresh(&self) -> RefreshOutcome {
        let Some(provider) = &self.provider else {
            return RefreshOutcome {
                enabled: false,
                applied: false,
            };
        };

        match provider.load().await {
            Ok(Some(overlay)) => {
                self.apply(&overlay);
                RefreshOutcome {
                    enabled: true,
                    applied: true,
                }
            }
            Ok(None) => RefreshOutcome {
                enabled: true,
                applied: false,
            },
            Err(e) => {
                warn!(error = %e, "Config provider refresh failed");
                RefreshOutcome {
                    enabled: true,
                    applied: false,
                }
            }
        }
    }

    /// Snapshot satisfying `ready`, refreshing once from the provider if the
    /// current one does not.
    pub async fn ensure<F>(&self, ready: F) -> Arc<WechatConfig>
    where
        F: Fn(&WechatConfig) -> bool,
    {
        let snapshot = self.snapshot();
        if ready(&snapshot) || self.provider.is_none() {
            return snapshot;
        }

        debug!("Config incomplete, refreshing from provider");
        self.refresh().await;
        self.snapshot()
    }
}

/// Background task that periodically refreshes `handle` from its provider.
///
/// Logs presence flags only, never values.
pub async fn run_config_refresh(handle: ConfigHandle) {
    if !handle.has_provider() {
        return;
    }

    let mut interval = tokio::time::interval(handle.snapshot().refresh_interval());

    loop {
        interval.tick().await;
        let outcome = handle.refresh().await;
        let cfg = handle.snapshot();
        debug!(
            applied = outcome.applied,
            component_app_id_present = !cfg.component_app_id.is_empty(),
            component_secret_present = !cfg.component_app_secret.is_empty(),
            component_token_present = !cfg.component_token.is_empty(),
            encoding_aes_key_present = !cfg.component_encoding_aes_key.is_empty(),
            "Config refresh complete"
        );
    }
}

/// Logs which configuration fields are present after startup.
pub fn log_config_presence(cfg: &WechatConfig, provider_enabled: bool) {
    info!(
        provider_enabled,
        mock_mode = cfg.mock_mode,
        key_strategy = ?cfg.key_strategy,
        component_app_id_present = !cfg.component_app_id.is_empty(),
        component_secret_present = !cfg.component_app_secret.is_empty(),
        component_token_present = !cfg.component_token.is_empty(),
        encoding_aes_key_present = !cfg.component_encoding_aes_key.is_empty(),
        public_base_url_present = cfg.public_base_url.is_some(),
        "Wechat config initialized"
    );
}
