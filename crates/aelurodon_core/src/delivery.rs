/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::account::Handle;
use crate::actor_cache::ActorCache;
use crate::transport::{HttpFetch, RequestKey};
use crate::webfinger;
use std::sync::Arc;
use tracing::debug;

/// Outcome of one delivery attempt. Unauthorized answers are terminal for
/// the target; transient failures feed the retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Unauthorized(u16),
    Transient(String),
}

pub struct Deliverer {
    http: Arc<dyn HttpFetch>,
    actors: Arc<ActorCache>,
    local_domain: String,
    base_url: String,
    shared_items_domains: Vec<String>,
    secure_mode: bool,
}

impl Deliverer {
    pub fn new(
        http: Arc<dyn HttpFetch>,
        actors: Arc<ActorCache>,
        local_domain: String,
        base_url: String,
        shared_items_domains: Vec<String>,
        secure_mode: bool,
    ) -> Self {
        Self {
            http,
            actors,
            local_domain,
            base_url,
            shared_items_domains,
            secure_mode,
        }
    }

    pub fn http(&self) -> &dyn HttpFetch {
        self.http.as_ref()
    }

    fn fetch_key<'a>(&self, key: &'a RequestKey) -> Option<&'a RequestKey> {
        if self.secure_mode {
            Some(key)
        } else {
            None
        }
    }

    /// Webfinger the handle, fetch its actor document and return the inbox
    /// for individual delivery. `Err` carries the reason; the caller aborts
    /// this one target and leaves its siblings alone.
    pub async fn resolve_inbox_for_handle(
        &self,
        handle: &Handle,
        key: &RequestKey,
    ) -> Result<String, String> {
        let actor_url = webfinger::resolve_handle(self.http.as_ref(), handle, self.fetch_key(key))
            .await
            .ok_or_else(|| format!("webfinger failed for {handle}"))?;
        self.resolve_inbox_for_actor(&actor_url, key).await
    }

    pub async fn resolve_inbox_for_actor(
        &self,
        actor_url: &str,
        key: &RequestKey,
    ) -> Result<String, String> {
        let record = self
            .actors
            .resolve(self.http.as_ref(), actor_url, self.fetch_key(key))
            .await
            .map_err(|e| format!("actor fetch failed for {actor_url}: {e:#}"))?;
        record
            .delivery_inbox()
            .map(|s| s.to_string())
            .ok_or_else(|| format!("actor has no inbox: {actor_url}"))
    }

    /// Probes the domain for a shared inbox via the `inbox@domain` /
    /// `domain@domain` pseudo-accounts.
    pub async fn resolve_shared_inbox(&self, domain: &str, key: &RequestKey) -> Option<String> {
        let candidate =
            webfinger::shared_inbox_candidate(self.http.as_ref(), domain, self.fetch_key(key))
                .await?;
        let record = self
            .actors
            .resolve(self.http.as_ref(), &candidate, self.fetch_key(key))
            .await
            .ok()?;
        record
            .shared_inbox
            .or(record.inbox)
            .or_else(|| Some(format!("https://{domain}/inbox")))
    }

    /// One signed POST to an inbox.
    pub async fn send(&self, key: &RequestKey, inbox_url: &str, body: &[u8]) -> SendOutcome {
        let mut extra_headers = Vec::new();
        if let Some(domain) = domain_of(inbox_url) {
            if self
                .shared_items_domains
                .iter()
                .any(|d| crate::account::normalize_domain(d) == domain)
            {
                extra_headers.push(("Origin".to_string(), self.local_domain.clone()));
                extra_headers.push((
                    "SharesCatalog".to_string(),
                    format!("{}/catalog", self.base_url),
                ));
            }
        }

        let outcome = self
            .http
            .post_json(inbox_url, body, &extra_headers, Some(key))
            .await;
        if outcome.accepted {
            return SendOutcome::Delivered;
        }
        if outcome.unauthorized {
            return SendOutcome::Unauthorized(outcome.status.unwrap_or(401));
        }
        debug!("transient delivery failure to {inbox_url}: {:?}", outcome.status);
        SendOutcome::Transient(match outcome.status {
            Some(status) => format!("status {status}"),
            None => "unreachable".to_string(),
        })
    }
}

pub fn domain_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split('/').next()?;
    if host.is_empty() {
        return None;
    }
    Some(crate::account::normalize_domain(host))
}
