/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::keys::AccountKeys;
use crate::layout::DataLayout;
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fmt;

/// `nickname@domain` pair. The domain keeps any explicit port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub nickname: String,
    pub domain: String,
}

impl Handle {
    pub fn new(nickname: &str, domain: &str) -> Self {
        Self {
            nickname: nickname.to_string(),
            domain: normalize_domain(domain),
        }
    }

    /// Accepts `nick@domain` and `@nick@domain`.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim().trim_start_matches('@');
        let (nick, domain) = input.split_once('@')?;
        if !valid_nickname(nick) || domain.trim().is_empty() || !domain.contains('.') {
            return None;
        }
        Some(Self::new(nick, domain))
    }

    /// Best-effort handle from an actor URL: host plus last path segment.
    pub fn from_actor_url(url: &str) -> Option<Self> {
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))?;
        let (host, path) = rest.split_once('/')?;
        let nick = path.trim_end_matches('/').rsplit('/').next()?;
        if host.is_empty() || nick.is_empty() {
            return None;
        }
        Some(Self::new(nick, host))
    }

    /// The account-directory key, `nickname@domain`.
    pub fn account_key(&self) -> String {
        format!("{}@{}", self.nickname, self.domain)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.nickname, self.domain)
    }
}

/// Lowercase, drop default ports and trailing dots so equality checks do
/// not depend on how the peer spelled its own domain.
pub fn normalize_domain(domain: &str) -> String {
    let d = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    d.trim_end_matches(":443").trim_end_matches(":80").to_string()
}

pub fn valid_nickname(nick: &str) -> bool {
    !nick.is_empty()
        && nick
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// A locally-hosted account: its handle, actor id and signing keys.
#[derive(Clone)]
pub struct LocalAccount {
    pub handle: Handle,
    pub actor_url: String,
    pub keys: AccountKeys,
}

impl LocalAccount {
    pub fn account_key(&self) -> String {
        self.handle.account_key()
    }

    pub fn followers_url(&self) -> String {
        format!("{}/followers", self.actor_url)
    }
}

pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

pub fn set_password(layout: &DataLayout, account: &str, password: &str) -> Result<()> {
    let path = layout.password_file(account);
    if let Some(parent) = path.parent() {
        crate::layout::ensure_dir(parent)?;
    }
    std::fs::write(&path, hash_password(password))
        .with_context(|| format!("write {}", path.display()))
}

/// Constant-time comparison over the stored hash.
pub fn verify_password(layout: &DataLayout, account: &str, password: &str) -> bool {
    let Ok(stored) = std::fs::read_to_string(layout.password_file(account)) else {
        return false;
    };
    let stored = stored.trim().as_bytes();
    let candidate = hash_password(password);
    let candidate = candidate.as_bytes();
    if stored.len() != candidate.len() {
        return false;
    }
    stored
        .iter()
        .zip(candidate.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_leading_at() {
        let h = Handle::parse("@alice@dogwood.example").unwrap();
        assert_eq!(h.nickname, "alice");
        assert_eq!(h.domain, "dogwood.example");
        assert_eq!(h.account_key(), "alice@dogwood.example");
    }

    #[test]
    fn parse_rejects_bad_nicknames() {
        assert!(Handle::parse("al ice@dogwood.example").is_none());
        assert!(Handle::parse("alice").is_none());
        assert!(Handle::parse("alice@nodots").is_none());
    }

    #[test]
    fn domain_normalization_strips_default_ports() {
        assert_eq!(normalize_domain("Dogwood.Example:443"), "dogwood.example");
        assert_eq!(normalize_domain("dogwood.example."), "dogwood.example");
        assert_eq!(normalize_domain("dogwood.example:8080"), "dogwood.example:8080");
    }

    #[test]
    fn handle_from_actor_url() {
        let h = Handle::from_actor_url("https://dogwood.example/users/alice").unwrap();
        assert_eq!(h.account_key(), "alice@dogwood.example");
    }

    #[test]
    fn password_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        set_password(&layout, "alice@dogwood.example", "hunter2").unwrap();
        assert!(verify_password(&layout, "alice@dogwood.example", "hunter2"));
        assert!(!verify_password(&layout, "alice@dogwood.example", "hunter3"));
        assert!(!verify_password(&layout, "bob@dogwood.example", "hunter2"));
    }
}
