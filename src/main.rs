use anyhow::{Context, Result};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;
use wxcomponent::api::{create_wechat_router, WechatAppState};
use wxcomponent::auth_flow::AuthFlow;
use wxcomponent::cache::MemoryCache;
use wxcomponent::config::runtime::log_config_presence;
use wxcomponent::config::{load_config, run_config_refresh, ConfigHandle, FileConfigProvider};
use wxcomponent::credentials::CredentialStore;
use wxcomponent::host::HostHandlers;
use wxcomponent::remote::HttpPlatformApi;
use wxcomponent::token::TokenManager;
use wxcomponent::webhook::WebhookHandler;

const DEFAULT_CONFIG_PATH: &str = "wxcomponent.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wxcomponent=info".into()),
        )
        .init();

    info!("wxcomponent starting...");

    // File config, then environment overrides
    let config_path =
        std::env::var("WXCOMPONENT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = if std::path::Path::new(&config_path).exists() {
        load_config(&config_path)?
    } else {
        info!(path = %config_path, "Config file not found, using defaults");
        Default::default()
    };
    config.wechat.apply_env();
    let server = config.server.clone();

    let mut config_handle = ConfigHandle::new(config.wechat.normalized())
        .with_env_lookup(|name| std::env::var(name).ok());
    if std::path::Path::new(&config_path).exists() {
        config_handle = config_handle.with_provider(Arc::new(FileConfigProvider::new(&config_path)));
    }
    log_config_presence(&config_handle.snapshot(), config_handle.has_provider());

    // Token chain over the in-memory cache
    let api = HttpPlatformApi::new().context("Failed to build platform HTTP client")?;
    let store = CredentialStore::new(Arc::new(MemoryCache::new()));
    let tokens = TokenManager::new(config_handle.clone(), store, Arc::new(api));

    // The standalone binary registers no host hooks
    let hosts = HostHandlers::new();
    let state = WechatAppState {
        webhook: WebhookHandler::new(tokens.clone(), hosts.clone()),
        auth_flow: AuthFlow::new(tokens, hosts),
    };
    let router = create_wechat_router(state).layer(CorsLayer::permissive());

    let refresh_handle = tokio::spawn(run_config_refresh(config_handle));

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, "Component API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Component API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    refresh_handle.abort();
    info!("wxcomponent stopped");

    Ok(())
}
