/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// All on-disk paths hang off one data root. Account directories are keyed
/// by the full `nickname@domain` handle.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn accounts_dir(&self) -> PathBuf {
        self.root.join("accounts")
    }

    pub fn instance_block_file(&self) -> PathBuf {
        self.accounts_dir().join("blocking.txt")
    }

    /// Presence of this file is the lockdown-mode switch.
    pub fn instance_allow_file(&self) -> PathBuf {
        self.accounts_dir().join("allowedinstances.txt")
    }

    pub fn known_bots_file(&self) -> PathBuf {
        self.accounts_dir().join("knownBots.txt")
    }

    pub fn known_crawlers_file(&self) -> PathBuf {
        self.accounts_dir().join("knownCrawlers.json")
    }

    pub fn account_dir(&self, account: &str) -> PathBuf {
        self.accounts_dir().join(account)
    }

    pub fn account_block_file(&self, account: &str) -> PathBuf {
        self.account_dir(account).join("blocking.txt")
    }

    pub fn account_allow_file(&self, account: &str) -> PathBuf {
        self.account_dir(account).join("allowedinstances.txt")
    }

    pub fn following_file(&self, account: &str) -> PathBuf {
        self.account_dir(account).join("following.txt")
    }

    pub fn followers_file(&self, account: &str) -> PathBuf {
        self.account_dir(account).join("followers.txt")
    }

    pub fn auto_cw_file(&self, account: &str) -> PathBuf {
        self.account_dir(account).join("autocw.txt")
    }

    pub fn password_file(&self, account: &str) -> PathBuf {
        self.account_dir(account).join("password")
    }

    pub fn box_dir(&self, account: &str, box_name: &str) -> PathBuf {
        self.account_dir(account).join(box_name)
    }

    pub fn box_index_file(&self, account: &str, box_name: &str) -> PathBuf {
        self.box_dir(account, box_name).join(format!("{box_name}.index"))
    }

    pub fn post_file(&self, account: &str, box_name: &str, post_key: &str) -> PathBuf {
        self.box_dir(account, box_name).join(format!("{post_key}.json"))
    }

    pub fn conversation_dir(&self, account: &str) -> PathBuf {
        self.account_dir(account).join("conversation")
    }

    pub fn conversation_file(&self, account: &str, conv_key: &str) -> PathBuf {
        self.conversation_dir(account).join(conv_key)
    }

    pub fn tags_dir(&self, account: &str) -> PathBuf {
        self.account_dir(account).join("tags")
    }

    pub fn tag_file(&self, account: &str, tag: &str) -> PathBuf {
        self.tags_dir(account).join(format!("{tag}.txt"))
    }

    pub fn actor_cache_dir(&self) -> PathBuf {
        self.root.join("cache").join("actors")
    }
}

/// Filesystem-safe transform of an id URL, reversible.
pub fn safe_key(id: &str) -> String {
    id.replace('/', "#")
}

pub fn id_from_key(key: &str) -> String {
    key.replace('#', "/")
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create dir: {}", path.display()))
}

/// Newline-delimited list files; a missing file reads as empty.
pub fn read_lines(path: &Path) -> Vec<String> {
    let Ok(text) = fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

pub fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    fs::write(path, text).with_context(|| format!("write {}", path.display()))
}

pub fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut lines = read_lines(path);
    if lines.iter().any(|l| l == line) {
        return Ok(());
    }
    lines.push(line.to_string());
    write_lines(path, &lines)
}

pub fn remove_line(path: &Path, line: &str) -> Result<bool> {
    let lines = read_lines(path);
    let kept: Vec<String> = lines.iter().filter(|l| l.as_str() != line).cloned().collect();
    let removed = kept.len() != lines.len();
    if removed {
        write_lines(path, &kept)?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_transform_round_trips() {
        let id = "https://dogwood.example/users/alice/statuses/17";
        assert_eq!(id_from_key(&safe_key(id)), id);
        assert!(!safe_key(id).contains('/'));
    }

    #[test]
    fn line_files_append_dedup_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocking.txt");
        append_line(&path, "*@spam.example").unwrap();
        append_line(&path, "eve@bad.example").unwrap();
        append_line(&path, "*@spam.example").unwrap();
        assert_eq!(read_lines(&path).len(), 2);

        assert!(remove_line(&path, "*@spam.example").unwrap());
        assert!(!remove_line(&path, "*@spam.example").unwrap());
        assert_eq!(read_lines(&path), vec!["eve@bad.example".to_string()]);
    }

    #[test]
    fn missing_list_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_lines(&dir.path().join("nope.txt")).is_empty());
    }
}
