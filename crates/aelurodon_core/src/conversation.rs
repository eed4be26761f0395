/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::layout::{ensure_dir, read_lines, safe_key, write_lines, DataLayout};
use crate::locks::AccountLocks;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// Per-account conversation-id → post-id index, one file per conversation.
/// A `.muted` sidecar on the index file silences the whole thread without
/// touching any post JSON.
pub struct ConversationIndex {
    layout: DataLayout,
    locks: Arc<AccountLocks>,
}

impl ConversationIndex {
    pub fn new(layout: DataLayout, locks: Arc<AccountLocks>) -> Self {
        Self { layout, locks }
    }

    fn index_file(&self, account: &str, conversation_id: &str) -> PathBuf {
        self.layout
            .conversation_file(account, &safe_key(conversation_id))
    }

    fn muted_file(&self, account: &str, conversation_id: &str) -> PathBuf {
        let mut os = self.index_file(account, conversation_id).into_os_string();
        os.push(".muted");
        PathBuf::from(os)
    }

    pub async fn add(&self, account: &str, conversation_id: &str, post_id: &str) -> Result<()> {
        let lock = self.locks.for_account(account);
        let _guard = lock.lock().await;

        let path = self.index_file(account, conversation_id);
        let mut lines = read_lines(&path);
        if lines.iter().any(|l| l == post_id) {
            return Ok(());
        }
        lines.push(post_id.to_string());
        write_lines(&path, &lines)
    }

    pub fn posts(&self, account: &str, conversation_id: &str) -> Vec<String> {
        read_lines(&self.index_file(account, conversation_id))
    }

    pub fn mute(&self, account: &str, conversation_id: &str) -> Result<()> {
        let path = self.muted_file(account, conversation_id);
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        std::fs::write(&path, b"").with_context(|| format!("write {}", path.display()))
    }

    pub fn unmute(&self, account: &str, conversation_id: &str) {
        let _ = std::fs::remove_file(self.muted_file(account, conversation_id));
    }

    pub fn is_muted(&self, account: &str, conversation_id: &str) -> bool {
        self.muted_file(account, conversation_id).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCOUNT: &str = "alice@dogwood.example";
    const CONV: &str = "https://dogwood.example/users/alice/statuses/100";

    fn index(dir: &std::path::Path) -> ConversationIndex {
        ConversationIndex::new(DataLayout::new(dir), Arc::new(AccountLocks::new()))
    }

    #[tokio::test]
    async fn add_is_ordered_and_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path());
        idx.add(ACCOUNT, CONV, "https://dogwood.example/users/alice/statuses/100")
            .await
            .unwrap();
        idx.add(ACCOUNT, CONV, "https://birch.example/users/bob/statuses/7")
            .await
            .unwrap();
        idx.add(ACCOUNT, CONV, "https://birch.example/users/bob/statuses/7")
            .await
            .unwrap();

        assert_eq!(
            idx.posts(ACCOUNT, CONV),
            vec![
                "https://dogwood.example/users/alice/statuses/100".to_string(),
                "https://birch.example/users/bob/statuses/7".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn thread_mute_is_a_sidecar_only() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(dir.path());
        idx.add(ACCOUNT, CONV, CONV).await.unwrap();

        assert!(!idx.is_muted(ACCOUNT, CONV));
        idx.mute(ACCOUNT, CONV).unwrap();
        assert!(idx.is_muted(ACCOUNT, CONV));
        // The index itself is untouched.
        assert_eq!(idx.posts(ACCOUNT, CONV).len(), 1);

        idx.unmute(ACCOUNT, CONV);
        assert!(!idx.is_muted(ACCOUNT, CONV));
    }
}
