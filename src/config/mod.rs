pub mod runtime;
pub use runtime::{
    run_config_refresh, ConfigHandle, ConfigProvider, FileConfigProvider, RefreshOutcome,
    WechatOverlay,
};

use crate::keys::KeyStrategy;
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

/// Tenant parameter name used when none is configured.
pub const DEFAULT_TENANT_PARAM: &str = "daoId";

/// Query keys always accepted for the tenant id, after the configured ones.
const HISTORICAL_TENANT_KEYS: &[&str] = &["daoId", "dao_id"];

/// Complete service configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub wechat: WechatConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7001
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Open-platform component configuration.
///
/// Snapshots of this struct are handed to the token chain and the webhook
/// handler per call; nothing in the crate mutates one in place.
#[derive(Debug, Clone, Deserialize)]
pub struct WechatConfig {
    #[serde(default)]
    pub component_app_id: String,
    #[serde(default)]
    pub component_app_secret: String,
    /// Token used for message signatures
    #[serde(default)]
    pub component_token: String,
    /// 43-character EncodingAESKey
    #[serde(default)]
    pub component_encoding_aes_key: String,

    #[serde(default, alias = "redis_key_strategy")]
    pub key_strategy: KeyStrategy,

    /// Return pc/mobile auth URLs instead of a single one
    #[serde(default, deserialize_with = "flexible_bool")]
    pub auth_url_return_object: bool,

    #[serde(default = "default_tenant_param")]
    pub tenant_id_param_name: String,
    #[serde(default, deserialize_with = "string_list")]
    pub tenant_id_query_keys: Vec<String>,

    /// Offline mode: placeholder tokens and a local mock authorization page
    #[serde(default, deserialize_with = "flexible_bool")]
    pub mock_mode: bool,
    #[serde(default, deserialize_with = "string_list")]
    pub mock_authorize_allowed_hosts: Vec<String>,

    #[serde(default)]
    pub public_base_url: Option<String>,

    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_auth_page_url")]
    pub auth_page_url: String,

    #[serde(default = "default_refresh_interval_ms")]
    pub config_refresh_interval_ms: u64,
}

fn default_tenant_param() -> String {
    DEFAULT_TENANT_PARAM.to_string()
}

fn default_api_base_url() -> String {
    "https://api.weixin.qq.com".to_string()
}

fn default_auth_page_url() -> String {
    "https://mp.weixin.qq.com/cgi-bin/componentloginpage".to_string()
}

fn default_refresh_interval_ms() -> u64 {
    30_000
}

impl Default for WechatConfig {
    fn default() -> Self {
        Self {
            component_app_id: String::new(),
            component_app_secret: String::new(),
            component_token: String::new(),
            component_encoding_aes_key: String::new(),
            key_strategy: KeyStrategy::default(),
            auth_url_return_object: false,
            tenant_id_param_name: default_tenant_param(),
            tenant_id_query_keys: Vec::new(),
            mock_mode: false,
            mock_authorize_allowed_hosts: Vec::new(),
            public_base_url: None,
            api_base_url: default_api_base_url(),
            auth_page_url: default_auth_page_url(),
            config_refresh_interval_ms: default_refresh_interval_ms(),
        }
    }
}

impl WechatConfig {
    /// Trims every string field and drops empty optionals.
    pub fn normalized(mut self) -> Self {
        for field in [
            &mut self.component_app_id,
            &mut self.component_app_secret,
            &mut self.component_token,
            &mut self.component_encoding_aes_key,
            &mut self.tenant_id_param_name,
            &mut self.api_base_url,
            &mut self.auth_page_url,
        ] {
            *field = field.trim().to_string();
        }
        self.public_base_url = self
            .public_base_url
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self.api_base_url = self.api_base_url.trim_end_matches('/').to_string();
        self
    }

    /// Token, AES key and app id are all present.
    pub fn has_crypto_config(&self) -> bool {
        !self.component_token.is_empty()
            && !self.component_encoding_aes_key.is_empty()
            && !self.component_app_id.is_empty()
    }

    /// Parameter name embedded into generated callback URLs.
    pub fn tenant_param_name(&self) -> &str {
        let name = self.tenant_id_param_name.trim();
        if name.is_empty() {
            DEFAULT_TENANT_PARAM
        } else {
            name
        }
    }

    /// Query keys accepted for the tenant id, in lookup order.
    pub fn tenant_query_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        let candidates = self
            .tenant_id_query_keys
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.tenant_param_name()))
            .chain(HISTORICAL_TENANT_KEYS.iter().copied());

        for key in candidates {
            let key = key.trim();
            if !key.is_empty() && !keys.iter().any(|k| k == key) {
                keys.push(key.to_string());
            }
        }
        keys
    }

    /// Refresh interval, floored at one second.
    pub fn refresh_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config_refresh_interval_ms.max(1000))
    }

    /// Applies `WECHAT_*` environment overrides through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let string_vars: [(&str, &mut String); 5] = [
            ("WECHAT_COMPONENT_APP_ID", &mut self.component_app_id),
            ("WECHAT_COMPONENT_APP_SECRET", &mut self.component_app_secret),
            ("WECHAT_COMPONENT_TOKEN", &mut self.component_token),
            (
                "WECHAT_COMPONENT_ENCODING_AES_KEY",
                &mut self.component_encoding_aes_key,
            ),
            ("WECHAT_TENANT_ID_PARAM_NAME", &mut self.tenant_id_param_name),
        ];
        for (name, field) in string_vars {
            if let Some(v) = lookup(name) {
                *field = v.trim().to_string();
            }
        }

        if let Some(v) = lookup("WECHAT_PUBLIC_BASE_URL") {
            self.public_base_url = Some(v.trim().to_string()).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("WECHAT_MOCK_MODE") {
            self.mock_mode = parse_flag(&v);
        }
        if let Some(v) = lookup("WECHAT_KEY_STRATEGY") {
            match v.trim().to_lowercase().as_str() {
                "legacy" => self.key_strategy = KeyStrategy::Legacy,
                "scoped" => self.key_strategy = KeyStrategy::Scoped,
                other => tracing::warn!(value = %other, "Ignoring unknown WECHAT_KEY_STRATEGY"),
            }
        }
        if let Some(v) = lookup("WECHAT_MOCK_AUTHORIZE_ALLOWED_HOSTS") {
            self.mock_authorize_allowed_hosts = split_list(&v);
        }
        if let Some(v) = lookup("WECHAT_API_BASE_URL") {
            self.api_base_url = v.trim().trim_end_matches('/').to_string();
        }
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|name| std::env::var(name).ok());
    }
}

/// `"1"` and `"true"` (any case) are true; everything else is false.
pub fn parse_flag(raw: &str) -> bool {
    let v = raw.trim();
    v == "1" || v.eq_ignore_ascii_case("true")
}

/// Comma-separated list, trimmed, empties and duplicates removed.
pub fn split_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !out.iter().any(|o| o == item) {
            out.push(item.to_string());
        }
    }
    out
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlexibleBool {
    Bool(bool),
    Int(i64),
    Str(String),
}

fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match FlexibleBool::deserialize(deserializer)? {
        FlexibleBool::Bool(b) => b,
        FlexibleBool::Int(n) => n != 0,
        FlexibleBool::Str(s) => parse_flag(&s),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringList {
    List(Vec<String>),
    Joined(String),
}

fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match StringList::deserialize(deserializer)? {
        StringList::List(items) => split_list(&items.join(",")),
        StringList::Joined(s) => split_list(&s),
    })
}

/// Load configuration from a TOML file.
pub fn load_config(path: &str) -> Result<GatewayConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    parse_config(&contents)
}

/// Parse configuration from TOML text.
pub fn parse_config(contents: &str) -> Result<GatewayConfig> {
    let mut config: GatewayConfig =
        toml::from_str(contents).context("Failed to parse config TOML")?;
    config.wechat = config.wechat.normalized();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.port, 7001);
        assert_eq!(config.wechat.key_strategy, KeyStrategy::Scoped);
        assert_eq!(config.wechat.tenant_param_name(), "daoId");
        assert_eq!(config.wechat.api_base_url, "https://api.weixin.qq.com");
        assert!(!config.wechat.mock_mode);
        assert!(config.wechat.component_app_id.is_empty());
        assert!(config.wechat.component_app_secret.is_empty());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            port = 8080

            [wechat]
            component_app_id = " wx_component "
            component_app_secret = "secret"
            component_token = "token"
            component_encoding_aes_key = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG"
            redis_key_strategy = "legacy"
            mock_mode = "1"
            auth_url_return_object = "true"
            tenant_id_param_name = "tenantId"
            tenant_id_query_keys = "orgId, spaceId"
            mock_authorize_allowed_hosts = ["localhost", "admin.example.com"]
            public_base_url = "https://public.example.com"
        "#;

        let config = parse_config(toml).unwrap();
        let w = &config.wechat;
        assert_eq!(config.server.port, 8080);
        assert_eq!(w.component_app_id, "wx_component");
        assert_eq!(w.key_strategy, KeyStrategy::Legacy);
        assert!(w.mock_mode);
        assert!(w.auth_url_return_object);
        assert_eq!(w.component_app_secret, "secret");
        assert!(w.has_crypto_config());
        assert_eq!(w.mock_authorize_allowed_hosts, vec!["localhost", "admin.example.com"]);
        assert_eq!(
            w.tenant_query_keys(),
            vec!["orgId", "spaceId", "tenantId", "daoId", "dao_id"]
        );
    }

    #[test]
    fn test_string_flags() {
        for (raw, expected) in [
            ("mock_mode = true", true),
            ("mock_mode = false", false),
            ("mock_mode = \"TRUE\"", true),
            ("mock_mode = \"0\"", false),
            ("mock_mode = \"yes\"", false),
            ("mock_mode = 1", true),
        ] {
            let config = parse_config(&format!("[wechat]\n{}", raw)).unwrap();
            assert_eq!(config.wechat.mock_mode, expected, "{}", raw);
        }
    }

    #[test]
    fn test_tenant_keys_dedupe() {
        let config = WechatConfig {
            tenant_id_query_keys: vec!["daoId".to_string(), " ".to_string()],
            ..WechatConfig::default()
        };
        assert_eq!(config.tenant_query_keys(), vec!["daoId", "dao_id"]);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("WECHAT_COMPONENT_APP_ID", "wx_env"),
            ("WECHAT_MOCK_MODE", "true"),
            ("WECHAT_KEY_STRATEGY", "LEGACY"),
            ("WECHAT_PUBLIC_BASE_URL", " "),
            ("WECHAT_API_BASE_URL", "http://127.0.0.1:9000/"),
        ]
        .into_iter()
        .collect();

        let mut config = WechatConfig::default();
        config.apply_env_with(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.component_app_id, "wx_env");
        assert!(config.mock_mode);
        assert_eq!(config.key_strategy, KeyStrategy::Legacy);
        assert_eq!(config.public_base_url, None);
        assert_eq!(config.api_base_url, "http://127.0.0.1:9000");
    }

    #[test]
    fn test_refresh_interval_floor() {
        let config = WechatConfig {
            config_refresh_interval_ms: 10,
            ..WechatConfig::default()
        };
        assert_eq!(config.refresh_interval(), std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[wechat]\ncomponent_app_id = \"wx_file\"").unwrap();

        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.wechat.component_app_id, "wx_file");
        assert_eq!(config.server.port, 7001);

        assert!(load_config("/nonexistent/wxcomponent.toml").is_err());
    }
}
