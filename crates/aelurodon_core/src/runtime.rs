/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::account::{normalize_domain, set_password, Handle, LocalAccount};
use crate::actor_cache::ActorCache;
use crate::blocking::BlockEngine;
use crate::box_store::BoxStore;
use crate::config::InstanceConfig;
use crate::conversation::ConversationIndex;
use crate::crawlers::CrawlerFilter;
use crate::delivery::Deliverer;
use crate::delivery_queue::{DeliveryPool, QueueSettings};
use crate::keys::load_or_generate_account_keys;
use crate::layout::{ensure_dir, DataLayout};
use crate::locks::AccountLocks;
use crate::recent_cache::RecentPostsCache;
use crate::server::{handle_request, AppState};
use crate::transport::{HttpFetch, Transport};
use anyhow::{Context, Result};
use axum::{routing::any, Router};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Creates (or reopens) a local account directory with its keypair, and
/// sets the c2s credential when one is given.
pub fn ensure_account(
    cfg: &InstanceConfig,
    layout: &DataLayout,
    nickname: &str,
    password: Option<&str>,
) -> Result<LocalAccount> {
    let handle = Handle::new(nickname, &cfg.domain);
    let account_key = handle.account_key();
    let dir = layout.account_dir(&account_key);
    ensure_dir(&dir)?;

    let actor_url = cfg.actor_url(nickname);
    let keys = load_or_generate_account_keys(&dir, &actor_url)?;
    if let Some(password) = password {
        set_password(layout, &account_key, password)?;
    }
    Ok(LocalAccount {
        handle,
        actor_url,
        keys,
    })
}

fn load_accounts(cfg: &InstanceConfig, layout: &DataLayout) -> Result<HashMap<String, LocalAccount>> {
    let mut accounts = HashMap::new();
    let domain = normalize_domain(&cfg.domain);
    let accounts_dir = layout.accounts_dir();
    if !accounts_dir.exists() {
        return Ok(accounts);
    }
    for entry in std::fs::read_dir(&accounts_dir)
        .with_context(|| format!("read {}", accounts_dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(handle) = Handle::parse(&name) else {
            continue;
        };
        if handle.domain != domain {
            continue;
        }
        let account = ensure_account(cfg, layout, &handle.nickname, None)?;
        accounts.insert(handle.nickname, account);
    }
    Ok(accounts)
}

pub fn build_state(cfg: InstanceConfig, shutdown: watch::Receiver<bool>) -> Result<AppState> {
    let data_dir = cfg.resolve_data_dir()?;
    let layout = DataLayout::new(&data_dir);
    ensure_dir(&layout.accounts_dir())?;
    ensure_dir(&layout.actor_cache_dir())?;

    let http: Arc<dyn HttpFetch> =
        Arc::new(Transport::new(cfg.proxy, cfg.http_timeout()).context("build transport")?);
    let locks = Arc::new(AccountLocks::new());
    let actors = Arc::new(ActorCache::new(Some(layout.actor_cache_dir())));
    let engine = Arc::new(BlockEngine::new(
        layout.clone(),
        locks.clone(),
        cfg.block_cache_refresh(),
    ));
    let crawlers = Arc::new(CrawlerFilter::new(
        layout.clone(),
        cfg.news_instance,
        cfg.crawler_allow.clone(),
        cfg.ua_block.clone(),
    ));
    let deliverer = Arc::new(Deliverer::new(
        http.clone(),
        actors.clone(),
        normalize_domain(&cfg.domain),
        cfg.base_url().to_string(),
        cfg.shared_items_domains.clone(),
        cfg.secure_mode,
    ));
    let pool = Arc::new(DeliveryPool::new(
        deliverer.clone(),
        QueueSettings::from(&cfg.delivery),
        shutdown,
    ));
    let accounts = load_accounts(&cfg, &layout)?;
    info!(
        "instance {} with {} local account(s), data dir {}",
        cfg.domain,
        accounts.len(),
        data_dir.display()
    );

    Ok(AppState {
        cfg,
        layout: layout.clone(),
        http,
        actors,
        engine,
        crawlers,
        store: Arc::new(BoxStore::new(layout.clone(), locks.clone())),
        conversations: Arc::new(ConversationIndex::new(layout, locks)),
        recent: Arc::new(RecentPostsCache::new(256)),
        deliverer,
        pool,
        accounts,
    })
}

/// Binds the federation surface and serves until interrupted. Background
/// delivery workers stop through the same shutdown channel.
pub async fn start(cfg: InstanceConfig) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bind = cfg.bind.clone();
    let state = build_state(cfg, shutdown_rx)?;

    let state_for_router = state.clone();
    let router = Router::new()
        .fallback(any(move |req| {
            let state = state_for_router.clone();
            async move { handle_request(&state, req).await }
        }))
        .layer(axum::extract::DefaultBodyLimit::max(2 * 1024 * 1024))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = bind.parse().context("parse bind address")?;
    let listener = tokio::net::TcpListener::bind(addr).await.context("bind")?;
    info!("federation server listening on http://{addr}");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("serve")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(dir: &std::path::Path) -> InstanceConfig {
        serde_json::from_str(&format!(
            r#"{{"domain": "dogwood.example", "data_dir": "{}"}}"#,
            dir.display()
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn ensure_account_is_idempotent_and_discoverable() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config_for(dir.path());
        let layout = DataLayout::new(dir.path());

        let first = ensure_account(&cfg, &layout, "alice", Some("hunter2")).unwrap();
        let second = ensure_account(&cfg, &layout, "alice", None).unwrap();
        assert_eq!(first.keys.public_key_pem, second.keys.public_key_pem);
        assert_eq!(first.actor_url, "https://dogwood.example/users/alice");

        let (_tx, rx) = watch::channel(false);
        let state = build_state(cfg, rx).unwrap();
        assert!(state.accounts.contains_key("alice"));
        assert!(crate::account::verify_password(
            &state.layout,
            "alice@dogwood.example",
            "hunter2"
        ));
    }

    #[tokio::test]
    async fn build_state_tolerates_an_empty_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = watch::channel(false);
        let state = build_state(config_for(dir.path()), rx).unwrap();
        assert!(state.accounts.is_empty());
        assert!(!state.engine.lockdown_active());
    }
}
