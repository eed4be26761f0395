/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::layout::{ensure_dir, id_from_key, safe_key, DataLayout};
use crate::locks::AccountLocks;
use aelurodon_protocol::Envelope;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxKind {
    Inbox,
    Outbox,
    TlBlogs,
    Dm,
    TlReplies,
    TlMedia,
    TlBookmarks,
    Scheduled,
    Moderation,
}

impl BoxKind {
    pub const ALL: [BoxKind; 9] = [
        BoxKind::Outbox,
        BoxKind::Inbox,
        BoxKind::TlBlogs,
        BoxKind::Dm,
        BoxKind::TlReplies,
        BoxKind::TlMedia,
        BoxKind::TlBookmarks,
        BoxKind::Scheduled,
        BoxKind::Moderation,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            BoxKind::Inbox => "inbox",
            BoxKind::Outbox => "outbox",
            BoxKind::TlBlogs => "tlblogs",
            BoxKind::Dm => "dm",
            BoxKind::TlReplies => "tlreplies",
            BoxKind::TlMedia => "tlmedia",
            BoxKind::TlBookmarks => "tlbookmarks",
            BoxKind::Scheduled => "scheduled",
            BoxKind::Moderation => "moderation",
        }
    }
}

/// Sidecar flag files next to a post file. Invisible to the index; readers
/// must check them separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sidecar {
    Muted,
    Reject,
}

impl Sidecar {
    fn extension(&self) -> &'static str {
        match self {
            Sidecar::Muted => "muted",
            Sidecar::Reject => "reject",
        }
    }
}

/// One JSON file per post plus a flat newest-first index per box. The index
/// and the file store may disagree: an index key without a file is a silent
/// tombstone, never an error.
pub struct BoxStore {
    layout: DataLayout,
    locks: Arc<AccountLocks>,
    seq: AtomicU64,
}

impl BoxStore {
    pub fn new(layout: DataLayout, locks: Arc<AccountLocks>) -> Self {
        Self {
            layout,
            locks,
            seq: AtomicU64::new(0),
        }
    }

    /// Deterministic, stable post id from a monotonic
    /// (timestamp, counter) status number.
    pub fn new_post_id(&self, actor_url: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) % 1000;
        format!("{}/statuses/{}{seq:03}", actor_url.trim_end_matches('/'), now_ms())
    }

    /// Writes the post file and prepends its key to the box index. Index
    /// dedup only happens where the caller asks for it.
    pub async fn save(
        &self,
        account: &str,
        box_kind: BoxKind,
        post: &mut Envelope,
        actor_url: &str,
        dedup_index: bool,
    ) -> Result<PathBuf> {
        if post.id.is_none() {
            post.id = Some(self.new_post_id(actor_url));
        }
        let post_id = post.id.clone().unwrap_or_default();
        let key = safe_key(&post_id);

        let dir = self.layout.box_dir(account, box_kind.dir_name());
        ensure_dir(&dir)?;
        let path = self.layout.post_file(account, box_kind.dir_name(), &key);
        std::fs::write(&path, serde_json::to_vec(post).context("encode post")?)
            .with_context(|| format!("write {}", path.display()))?;

        let lock = self.locks.for_account(account);
        let _guard = lock.lock().await;
        let index_path = self.layout.box_index_file(account, box_kind.dir_name());
        let mut keys = read_index(&index_path);
        if !(dedup_index && keys.iter().any(|k| k == &key)) {
            keys.insert(0, key);
            write_index(&index_path, &keys)?;
        }
        Ok(path)
    }

    /// `Ok(None)` covers both "never stored" and "index tombstone".
    pub async fn load(
        &self,
        account: &str,
        box_kind: BoxKind,
        post_id: &str,
    ) -> Result<Option<Envelope>> {
        let path = self
            .layout
            .post_file(account, box_kind.dir_name(), &safe_key(post_id));
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(_) => return Ok(None),
        };
        let env: Envelope =
            serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(env))
    }

    /// Rewrites an existing post file in place without touching the index
    /// (mute toggles, edits).
    pub async fn update(&self, account: &str, box_kind: BoxKind, post: &Envelope) -> Result<()> {
        let post_id = post.id.as_deref().unwrap_or_default();
        let path = self
            .layout
            .post_file(account, box_kind.dir_name(), &safe_key(post_id));
        std::fs::write(&path, serde_json::to_vec(post).context("encode post")?)
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub async fn remove(&self, account: &str, box_kind: BoxKind, post_id: &str) -> Result<()> {
        let key = safe_key(post_id);
        let path = self.layout.post_file(account, box_kind.dir_name(), &key);
        let _ = std::fs::remove_file(&path);
        for sidecar in [Sidecar::Muted, Sidecar::Reject] {
            let _ = std::fs::remove_file(sidecar_path(&path, sidecar));
        }

        let lock = self.locks.for_account(account);
        let _guard = lock.lock().await;
        let index_path = self.layout.box_index_file(account, box_kind.dir_name());
        let keys: Vec<String> = read_index(&index_path)
            .into_iter()
            .filter(|k| k != &key)
            .collect();
        write_index(&index_path, &keys)?;
        Ok(())
    }

    pub async fn index_keys(&self, account: &str, box_kind: BoxKind) -> Vec<String> {
        read_index(&self.layout.box_index_file(account, box_kind.dir_name()))
    }

    /// Walks the index newest-first, skipping tombstones.
    pub async fn list(&self, account: &str, box_kind: BoxKind, limit: usize) -> Vec<Envelope> {
        let mut out = Vec::new();
        for key in self.index_keys(account, box_kind).await {
            if out.len() >= limit {
                break;
            }
            let post_id = id_from_key(&key);
            match self.load(account, box_kind, &post_id).await {
                Ok(Some(env)) => out.push(env),
                Ok(None) => debug!("tombstone in {}: {key}", box_kind.dir_name()),
                Err(e) => debug!("unreadable post {key}: {e:#}"),
            }
        }
        out
    }

    /// Finds a post in any box of the account.
    pub async fn locate(
        &self,
        account: &str,
        post_id: &str,
    ) -> Result<Option<(BoxKind, Envelope)>> {
        for box_kind in BoxKind::ALL {
            if let Some(env) = self.load(account, box_kind, post_id).await? {
                return Ok(Some((box_kind, env)));
            }
        }
        Ok(None)
    }

    pub fn set_sidecar(
        &self,
        account: &str,
        box_kind: BoxKind,
        post_id: &str,
        sidecar: Sidecar,
    ) -> Result<()> {
        let path = self
            .layout
            .post_file(account, box_kind.dir_name(), &safe_key(post_id));
        let flag = sidecar_path(&path, sidecar);
        if let Some(parent) = flag.parent() {
            ensure_dir(parent)?;
        }
        std::fs::write(&flag, b"").with_context(|| format!("write {}", flag.display()))
    }

    pub fn clear_sidecar(
        &self,
        account: &str,
        box_kind: BoxKind,
        post_id: &str,
        sidecar: Sidecar,
    ) {
        let path = self
            .layout
            .post_file(account, box_kind.dir_name(), &safe_key(post_id));
        let _ = std::fs::remove_file(sidecar_path(&path, sidecar));
    }

    pub fn has_sidecar(
        &self,
        account: &str,
        box_kind: BoxKind,
        post_id: &str,
        sidecar: Sidecar,
    ) -> bool {
        let path = self
            .layout
            .post_file(account, box_kind.dir_name(), &safe_key(post_id));
        sidecar_path(&path, sidecar).exists()
    }
}

fn sidecar_path(post_path: &std::path::Path, sidecar: Sidecar) -> PathBuf {
    let mut os = post_path.as_os_str().to_os_string();
    os.push(format!(".{}", sidecar.extension()));
    PathBuf::from(os)
}

fn read_index(path: &std::path::Path) -> Vec<String> {
    crate::layout::read_lines(path)
}

fn write_index(path: &std::path::Path, keys: &[String]) -> Result<()> {
    crate::layout::write_lines(path, keys)
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
