/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::layout::{ensure_dir, safe_key};
use crate::transport::{Fetched, HttpFetch, RequestKey, ACTIVITY_ACCEPT};
use aelurodon_protocol::Kind;
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Remote actor cache entries go stale after two days of disuse.
const ACTOR_TTL: Duration = Duration::from_secs(2 * 24 * 3600);

/// An actor's verification key. FEP-521a actors publish multibase keys; we
/// carry them as-is and only PEM keys participate in HTTP-signature checks.
#[derive(Debug, Clone, PartialEq)]
pub enum ActorKey {
    Pem { id: String, pem: String },
    Multibase { id: String, value: String },
}

impl ActorKey {
    pub fn id(&self) -> &str {
        match self {
            ActorKey::Pem { id, .. } => id,
            ActorKey::Multibase { id, .. } => id,
        }
    }

    pub fn pem(&self) -> Option<&str> {
        match self {
            ActorKey::Pem { pem, .. } => Some(pem),
            ActorKey::Multibase { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActorRecord {
    pub id: String,
    pub kind: Kind,
    pub preferred_username: Option<String>,
    pub inbox: Option<String>,
    pub shared_inbox: Option<String>,
    pub outbox: Option<String>,
    pub followers: Option<String>,
    pub following: Option<String>,
    pub moved_to: Option<String>,
    pub key: Option<ActorKey>,
}

impl ActorRecord {
    pub fn from_value(doc: &Value, wanted_key_id: Option<&str>) -> Result<Self> {
        let obj = doc.as_object().ok_or_else(|| anyhow!("actor document is not an object"))?;
        let id = obj
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("actor missing id"))?
            .to_string();
        let kind = obj
            .get("type")
            .and_then(|v| v.as_str())
            .map(Kind::from)
            .unwrap_or(Kind::Person);

        let endpoints = obj.get("endpoints");
        let shared_inbox = endpoints
            .and_then(|e| e.get("sharedInbox"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let str_field = |name: &str| {
            obj.get(name)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };

        Ok(Self {
            id,
            kind,
            preferred_username: str_field("preferredUsername"),
            inbox: str_field("inbox"),
            shared_inbox,
            outbox: str_field("outbox"),
            followers: str_field("followers"),
            following: str_field("following"),
            moved_to: str_field("movedTo"),
            key: extract_public_key(doc, wanted_key_id),
        })
    }

    pub fn domain(&self) -> Option<String> {
        let rest = self
            .id
            .strip_prefix("https://")
            .or_else(|| self.id.strip_prefix("http://"))?;
        let host = rest.split('/').next()?;
        Some(crate::account::normalize_domain(host))
    }

    /// Inbox used for individual delivery to this actor.
    pub fn delivery_inbox(&self) -> Option<&str> {
        self.inbox.as_deref().or(self.shared_inbox.as_deref())
    }
}

/// Extraction priority: `publicKey.publicKeyPem`, then a FEP-521a
/// `authentication` entry matching the requested key id, then a bare
/// `publicKeyPem` field. First match wins.
pub fn extract_public_key(doc: &Value, wanted_key_id: Option<&str>) -> Option<ActorKey> {
    if let Some(pk) = doc.get("publicKey") {
        let pem = pk.get("publicKeyPem").and_then(|v| v.as_str());
        if let Some(pem) = pem {
            let id = pk
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            return Some(ActorKey::Pem {
                id,
                pem: pem.to_string(),
            });
        }
    }

    if let Some(entries) = doc.get("authentication").and_then(|v| v.as_array()) {
        for entry in entries {
            let id = entry.get("id").and_then(|v| v.as_str()).unwrap_or("");
            if let Some(wanted) = wanted_key_id {
                if id != wanted {
                    continue;
                }
            }
            if let Some(pem) = entry.get("publicKeyPem").and_then(|v| v.as_str()) {
                return Some(ActorKey::Pem {
                    id: id.to_string(),
                    pem: pem.to_string(),
                });
            }
            if let Some(mb) = entry.get("publicKeyMultibase").and_then(|v| v.as_str()) {
                return Some(ActorKey::Multibase {
                    id: id.to_string(),
                    value: mb.to_string(),
                });
            }
        }
    }

    if let Some(pem) = doc.get("publicKeyPem").and_then(|v| v.as_str()) {
        return Some(ActorKey::Pem {
            id: String::new(),
            pem: pem.to_string(),
        });
    }
    None
}

/// Actors referenced in shared-inbox delivery are often not real accounts;
/// normalize their URLs onto the plain `/inbox` endpoint before lookup.
pub fn normalize_actor_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    for suffix in ["/sharedInbox", "/shared-inbox", "/sharedinbox"] {
        if let Some(base) = trimmed.strip_suffix(suffix) {
            return format!("{base}/inbox");
        }
    }
    trimmed.to_string()
}

struct CacheEntry {
    doc: Value,
    timestamp: OffsetDateTime,
}

/// In-memory actor cache with an optional on-disk mirror. Disk entries are
/// a cold-cache seed: written once, never overwritten, refreshed only by
/// an explicit [`ActorCache::clear`].
pub struct ActorCache {
    mem: RwLock<HashMap<String, CacheEntry>>,
    disk_dir: Option<PathBuf>,
    ttl: Duration,
}

impl ActorCache {
    pub fn new(disk_dir: Option<PathBuf>) -> Self {
        Self {
            mem: RwLock::new(HashMap::new()),
            disk_dir,
            ttl: ACTOR_TTL,
        }
    }

    pub fn with_ttl(disk_dir: Option<PathBuf>, ttl: Duration) -> Self {
        Self {
            mem: RwLock::new(HashMap::new()),
            disk_dir,
            ttl,
        }
    }

    pub async fn resolve(
        &self,
        http: &dyn HttpFetch,
        url: &str,
        key: Option<&RequestKey>,
    ) -> Result<ActorRecord> {
        self.resolve_with_key_id(http, url, None, key).await
    }

    pub async fn resolve_with_key_id(
        &self,
        http: &dyn HttpFetch,
        url: &str,
        wanted_key_id: Option<&str>,
        key: Option<&RequestKey>,
    ) -> Result<ActorRecord> {
        let url = normalize_actor_url(url);

        if let Some(doc) = self.fresh_from_memory(&url).await {
            return ActorRecord::from_value(&doc, wanted_key_id);
        }

        if let Some((doc, timestamp)) = self.load_from_disk(&url) {
            if OffsetDateTime::now_utc() - timestamp <= self.ttl {
                // A fresh file-load does not touch the timestamp.
                self.mem
                    .write()
                    .await
                    .insert(url.clone(), CacheEntry { doc: doc.clone(), timestamp });
                return ActorRecord::from_value(&doc, wanted_key_id);
            }
        }

        let doc = match http.get(&url, ACTIVITY_ACCEPT, key).await {
            Fetched::Json(v) if v.is_object() => v,
            Fetched::Json(_) => return Err(anyhow!("actor document is not an object: {url}")),
            Fetched::Bytes(bytes) => serde_json::from_slice::<Value>(&bytes)
                .ok()
                .filter(|v| v.is_object())
                .ok_or_else(|| anyhow!("actor fetch returned non-json: {url}"))?,
            Fetched::Absent(status) => return Err(anyhow!("actor not found: {url} ({status})")),
            Fetched::Unreachable => return Err(anyhow!("actor fetch failed: {url}")),
        };

        self.store(&url, doc.clone()).await;
        ActorRecord::from_value(&doc, wanted_key_id)
    }

    pub async fn store(&self, url: &str, doc: Value) {
        let url = normalize_actor_url(url);
        let now = OffsetDateTime::now_utc();
        self.mem
            .write()
            .await
            .insert(url.clone(), CacheEntry { doc: doc.clone(), timestamp: now });
        self.write_disk_once(&url, &doc, now);
    }

    pub async fn get_cached(&self, url: &str) -> Option<Value> {
        self.fresh_from_memory(&normalize_actor_url(url)).await
    }

    /// Caller-triggered eviction of entries older than the TTL. Idempotent.
    pub async fn sweep(&self) {
        let now = OffsetDateTime::now_utc();
        let ttl = self.ttl;
        let mut mem = self.mem.write().await;
        let before = mem.len();
        mem.retain(|_, entry| now - entry.timestamp <= ttl);
        let evicted = before - mem.len();
        if evicted > 0 {
            debug!("actor cache sweep evicted {evicted} entries");
        }
    }

    /// Drops memory and the disk mirror; the only way disk entries refresh.
    pub async fn clear(&self) -> Result<()> {
        self.mem.write().await.clear();
        if let Some(dir) = &self.disk_dir {
            if dir.exists() {
                std::fs::remove_dir_all(dir).with_context(|| format!("clear {}", dir.display()))?;
            }
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.mem.read().await.len()
    }

    async fn fresh_from_memory(&self, url: &str) -> Option<Value> {
        let mut mem = self.mem.write().await;
        let entry = mem.get_mut(url)?;
        let now = OffsetDateTime::now_utc();
        if now - entry.timestamp > self.ttl {
            return None;
        }
        // A memory hit extends the entry's life.
        entry.timestamp = now;
        Some(entry.doc.clone())
    }

    fn disk_path(&self, url: &str) -> Option<PathBuf> {
        self.disk_dir
            .as_ref()
            .map(|d| d.join(format!("{}.json", safe_key(url))))
    }

    fn load_from_disk(&self, url: &str) -> Option<(Value, OffsetDateTime)> {
        let path = self.disk_path(url)?;
        let text = std::fs::read_to_string(path).ok()?;
        let wrapper: Value = serde_json::from_str(&text).ok()?;
        let doc = wrapper.get("actor")?.clone();
        let timestamp = wrapper
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())?;
        Some((doc, timestamp))
    }

    fn write_disk_once(&self, url: &str, doc: &Value, timestamp: OffsetDateTime) {
        let Some(path) = self.disk_path(url) else {
            return;
        };
        if path.exists() {
            return;
        }
        let Some(parent) = path.parent() else {
            return;
        };
        if let Err(e) = ensure_dir(parent) {
            warn!("actor cache dir: {e:#}");
            return;
        }
        let wrapper = serde_json::json!({
            "actor": doc,
            "timestamp": timestamp.format(&Rfc3339).unwrap_or_default(),
        });
        if let Err(e) = std::fs::write(&path, serde_json::to_vec(&wrapper).unwrap_or_default()) {
            warn!("actor cache write {}: {e}", path.display());
        }
    }

    #[cfg(test)]
    async fn insert_with_timestamp(&self, url: &str, doc: Value, timestamp: OffsetDateTime) {
        self.mem
            .write()
            .await
            .insert(normalize_actor_url(url), CacheEntry { doc, timestamp });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeHttp;
    use serde_json::json;

    fn bob_doc() -> Value {
        json!({
            "id": "https://birch.example/users/bob",
            "type": "Person",
            "preferredUsername": "bob",
            "inbox": "https://birch.example/users/bob/inbox",
            "outbox": "https://birch.example/users/bob/outbox",
            "endpoints": {"sharedInbox": "https://birch.example/inbox"},
            "publicKey": {
                "id": "https://birch.example/users/bob#main-key",
                "owner": "https://birch.example/users/bob",
                "publicKeyPem": "-----BEGIN PUBLIC KEY-----\nAA==\n-----END PUBLIC KEY-----\n",
            },
        })
    }

    #[test]
    fn key_extraction_prefers_public_key_pem() {
        let key = extract_public_key(&bob_doc(), None).unwrap();
        assert_eq!(key.id(), "https://birch.example/users/bob#main-key");
        assert!(key.pem().unwrap().contains("BEGIN PUBLIC KEY"));
    }

    #[test]
    fn key_extraction_falls_back_to_authentication_entry() {
        let doc = json!({
            "id": "https://fir.example/users/eve",
            "authentication": [
                {"id": "https://fir.example/users/eve#other", "publicKeyMultibase": "zAAA"},
                {"id": "https://fir.example/users/eve#sig", "publicKeyMultibase": "zBBB"},
            ],
        });
        let key =
            extract_public_key(&doc, Some("https://fir.example/users/eve#sig")).unwrap();
        assert_eq!(key, ActorKey::Multibase {
            id: "https://fir.example/users/eve#sig".to_string(),
            value: "zBBB".to_string(),
        });
    }

    #[test]
    fn key_extraction_accepts_bare_pem() {
        let doc = json!({
            "id": "https://fir.example/users/old",
            "publicKeyPem": "-----BEGIN PUBLIC KEY-----\nBB==\n-----END PUBLIC KEY-----\n",
        });
        let key = extract_public_key(&doc, None).unwrap();
        assert!(key.pem().is_some());
    }

    #[test]
    fn shared_inbox_paths_rewrite_to_inbox() {
        assert_eq!(
            normalize_actor_url("https://birch.example/sharedInbox"),
            "https://birch.example/inbox"
        );
        assert_eq!(
            normalize_actor_url("https://birch.example/users/bob"),
            "https://birch.example/users/bob"
        );
    }

    #[tokio::test]
    async fn resolve_hits_network_once_then_memory() {
        let http = FakeHttp::new();
        http.insert_json("https://birch.example/users/bob", bob_doc());
        let cache = ActorCache::new(None);

        let first = cache
            .resolve(&http, "https://birch.example/users/bob", None)
            .await
            .unwrap();
        assert_eq!(first.shared_inbox.as_deref(), Some("https://birch.example/inbox"));

        let second = cache
            .resolve(&http, "https://birch.example/users/bob", None)
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(http.get_calls().len(), 1);
    }

    #[tokio::test]
    async fn stale_entries_are_refetched_and_swept() {
        let http = FakeHttp::new();
        http.insert_json("https://birch.example/users/bob", bob_doc());
        let cache = ActorCache::with_ttl(None, Duration::from_secs(60));

        let old = OffsetDateTime::now_utc() - time::Duration::seconds(3600);
        cache
            .insert_with_timestamp("https://birch.example/users/bob", bob_doc(), old)
            .await;
        cache
            .insert_with_timestamp("https://fir.example/users/eve", json!({"id": "x"}), old)
            .await;

        // Stale entry is ignored and refetched over the network.
        cache
            .resolve(&http, "https://birch.example/users/bob", None)
            .await
            .unwrap();
        assert_eq!(http.get_calls().len(), 1);

        cache.sweep().await;
        cache.sweep().await;
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn disk_mirror_written_once_and_seeds_cold_cache() {
        let dir = tempfile::tempdir().unwrap();
        let http = FakeHttp::new();
        http.insert_json("https://birch.example/users/bob", bob_doc());

        let cache = ActorCache::new(Some(dir.path().to_path_buf()));
        cache
            .resolve(&http, "https://birch.example/users/bob", None)
            .await
            .unwrap();
        let path = dir
            .path()
            .join(format!("{}.json", safe_key("https://birch.example/users/bob")));
        let first_content = std::fs::read_to_string(&path).unwrap();

        // A second store must not overwrite the seed file.
        let mut changed = bob_doc();
        changed["preferredUsername"] = json!("robert");
        cache.store("https://birch.example/users/bob", changed).await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first_content);

        // A cold cache loads from disk without touching the network.
        let cold = ActorCache::new(Some(dir.path().to_path_buf()));
        let fresh_http = FakeHttp::new();
        let rec = cold
            .resolve(&fresh_http, "https://birch.example/users/bob", None)
            .await
            .unwrap();
        assert_eq!(rec.preferred_username.as_deref(), Some("bob"));
        assert!(fresh_http.get_calls().is_empty());
    }
}
