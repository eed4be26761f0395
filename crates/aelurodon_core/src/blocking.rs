/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::account::{normalize_domain, Handle, LocalAccount};
use crate::box_store::BoxStore;
use crate::layout::{append_line, read_lines, remove_line, write_lines, DataLayout};
use crate::locks::AccountLocks;
use aelurodon_protocol::{Envelope, Kind};
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::info;

/// Compiled-in blocks. These cannot be overridden by any list on disk.
const EVIL_DOMAINS: &[&str] = &["gab.com", "gabfed.com", "spinster.xyz", "kiwifarms.cc"];

/// Last two dot-separated labels; defeats subdomain-rotation evasion.
pub fn short_domain(domain: &str) -> String {
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() <= 2 {
        return domain.to_string();
    }
    labels[labels.len() - 2..].join(".")
}

fn domain_entry_matches(entry: &str, domain: &str) -> bool {
    entry == domain || entry == short_domain(domain)
}

/// Block/allow list matching over raw file lines. Lines are
/// `nickname@domain`, `*@domain`, or `#hashtag`; hashtag entries never
/// match actors.
fn lines_match_actor(lines: &[String], nickname: &str, domain: &str) -> bool {
    for line in lines {
        if line.starts_with('#') {
            continue;
        }
        if let Some(entry_domain) = line.strip_prefix("*@") {
            if domain_entry_matches(entry_domain, domain) {
                return true;
            }
        } else if let Some((entry_nick, entry_domain)) = line.split_once('@') {
            if entry_nick == nickname && entry_domain == domain {
                return true;
            }
        }
    }
    false
}

fn allow_lines_permit(lines: &[String], domain: &str) -> bool {
    lines
        .iter()
        .any(|entry| domain_entry_matches(entry.trim_start_matches("*@"), domain))
}

struct BlockCache {
    lines: Vec<String>,
    loaded_at: Option<Instant>,
}

/// Layered boolean gates evaluated short-circuit, most specific first:
/// compiled-in domains, lockdown allow list, instance block list, then the
/// per-account allow/block lists. The instance list is served from a cache
/// refreshed at most once per interval; matching semantics are identical
/// to the direct file read.
pub struct BlockEngine {
    layout: DataLayout,
    locks: Arc<AccountLocks>,
    refresh: Duration,
    cache: RwLock<BlockCache>,
}

impl BlockEngine {
    pub fn new(layout: DataLayout, locks: Arc<AccountLocks>, refresh: Duration) -> Self {
        Self {
            layout,
            locks,
            refresh,
            cache: RwLock::new(BlockCache {
                lines: Vec::new(),
                loaded_at: None,
            }),
        }
    }

    /// Lockdown is active exactly while the allow-list file exists.
    pub fn lockdown_active(&self) -> bool {
        self.layout.instance_allow_file().exists()
    }

    pub async fn cache_refreshed_at(&self) -> Option<Instant> {
        self.cache.read().await.loaded_at
    }

    async fn instance_lines(&self) -> Vec<String> {
        {
            let cache = self.cache.read().await;
            if let Some(loaded_at) = cache.loaded_at {
                if loaded_at.elapsed() < self.refresh {
                    return cache.lines.clone();
                }
            }
        }
        let mut cache = self.cache.write().await;
        cache.lines = read_lines(&self.layout.instance_block_file());
        cache.loaded_at = Some(Instant::now());
        cache.lines.clone()
    }

    async fn invalidate_cache(&self) {
        self.cache.write().await.loaded_at = None;
    }

    /// Instance-level gate: compiled-in domains, then lockdown (which
    /// supersedes the ordinary block list entirely), then the block list.
    pub async fn is_actor_blocked(&self, nickname: &str, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        if EVIL_DOMAINS
            .iter()
            .any(|evil| domain_entry_matches(evil, &domain))
        {
            return true;
        }

        if self.lockdown_active() {
            let allow = read_lines(&self.layout.instance_allow_file());
            return !allow_lines_permit(&allow, &domain);
        }

        let lines = self.instance_lines().await;
        lines_match_actor(&lines, nickname, &domain)
    }

    /// Full gate stack for one local account.
    pub async fn is_blocked_for_account(
        &self,
        account: &str,
        nickname: &str,
        domain: &str,
    ) -> bool {
        if self.is_actor_blocked(nickname, domain).await {
            return true;
        }
        let domain = normalize_domain(domain);

        // A per-account allow list turns the account into allow-list-only.
        let allow_path = self.layout.account_allow_file(account);
        if allow_path.exists() && !allow_lines_permit(&read_lines(&allow_path), &domain) {
            return true;
        }

        lines_match_actor(
            &read_lines(&self.layout.account_block_file(account)),
            nickname,
            &domain,
        )
    }

    pub async fn is_handle_blocked_for_account(&self, account: &str, handle: &Handle) -> bool {
        self.is_blocked_for_account(account, &handle.nickname, &handle.domain)
            .await
    }

    /// `#tag` entries gate content, not actors.
    pub async fn is_hashtag_blocked(&self, account: Option<&str>, tag: &str) -> bool {
        let needle = format!("#{}", tag.trim_start_matches('#').to_ascii_lowercase());
        let instance = self.instance_lines().await;
        if instance.iter().any(|l| l.to_ascii_lowercase() == needle) {
            return true;
        }
        match account {
            Some(account) => read_lines(&self.layout.account_block_file(account))
                .iter()
                .any(|l| l.to_ascii_lowercase() == needle),
            None => false,
        }
    }

    pub async fn add_instance_block(&self, entry: &str) -> Result<()> {
        append_line(&self.layout.instance_block_file(), entry.trim())?;
        self.invalidate_cache().await;
        Ok(())
    }

    pub async fn remove_instance_block(&self, entry: &str) -> Result<()> {
        remove_line(&self.layout.instance_block_file(), entry.trim())?;
        self.invalidate_cache().await;
        Ok(())
    }

    /// Adds an account-level block and drops any follow relationship with
    /// the blocked party, all under the account lock.
    pub async fn add_account_block(&self, account: &str, entry: &str) -> Result<()> {
        let lock = self.locks.for_account(account);
        let _guard = lock.lock().await;

        let entry = entry.trim();
        append_line(&self.layout.account_block_file(account), entry)?;

        for path in [
            self.layout.following_file(account),
            self.layout.followers_file(account),
        ] {
            let lines = read_lines(&path);
            let kept: Vec<String> = lines
                .into_iter()
                .filter(|line| {
                    let Some(handle) = Handle::parse(line) else {
                        return true;
                    };
                    !lines_match_actor(
                        &[entry.to_string()],
                        &handle.nickname,
                        &handle.domain,
                    )
                })
                .collect();
            write_lines(&path, &kept)?;
        }
        Ok(())
    }

    pub async fn remove_account_block(&self, account: &str, entry: &str) -> Result<()> {
        let lock = self.locks.for_account(account);
        let _guard = lock.lock().await;
        remove_line(&self.layout.account_block_file(account), entry.trim())?;
        Ok(())
    }
}

fn post_author(post: &Envelope) -> Option<String> {
    let object = match post.kind {
        Kind::Create | Kind::Announce | Kind::Update => post.inner().unwrap_or(post),
        _ => post,
    };
    object
        .attributed_to
        .clone()
        .or_else(|| object.actor.clone())
        .or_else(|| post.actor.clone())
}

/// c2s `Block` acceptance: the object must name a locatable post and the
/// actor must be the authenticated account. Any failed check is a silent
/// no-op — these are best-effort conveniences.
pub async fn outbox_block(
    engine: &BlockEngine,
    store: &BoxStore,
    account: &LocalAccount,
    activity: &Envelope,
) -> Option<()> {
    if activity.kind != Kind::Block {
        return None;
    }
    if activity.actor.as_deref() != Some(account.actor_url.as_str()) {
        return None;
    }
    let object_id = activity.object_id()?;
    let (_, post) = store
        .locate(&account.account_key(), object_id)
        .await
        .ok()
        .flatten()?;
    let author = post_author(&post)?;
    let handle = Handle::from_actor_url(&author)?;
    info!("blocking {} for {}", handle, account.handle);
    engine
        .add_account_block(&account.account_key(), &handle.account_key())
        .await
        .ok()?;
    Some(())
}

pub async fn outbox_undo_block(
    engine: &BlockEngine,
    store: &BoxStore,
    account: &LocalAccount,
    activity: &Envelope,
) -> Option<()> {
    if activity.kind != Kind::Undo {
        return None;
    }
    if activity.actor.as_deref() != Some(account.actor_url.as_str()) {
        return None;
    }
    let inner = activity.inner()?;
    if inner.kind != Kind::Block {
        return None;
    }
    let object_id = inner.object_id()?;
    let (_, post) = store
        .locate(&account.account_key(), object_id)
        .await
        .ok()
        .flatten()?;
    let author = post_author(&post)?;
    let handle = Handle::from_actor_url(&author)?;
    engine
        .remove_account_block(&account.account_key(), &handle.account_key())
        .await
        .ok()?;
    Some(())
}
