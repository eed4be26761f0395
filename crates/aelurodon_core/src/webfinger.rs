/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::account::Handle;
use crate::transport::{Fetched, HttpFetch, RequestKey, JRD_ACCEPT};
use serde_json::Value;
use tracing::debug;
use urlencoding::encode;

/// Resolves `nick@domain` to an actor URL.
///
/// Fallback order: the JRD's activity+json `self` link, a `/users/` rewrite
/// of any `/@nick` profile link, and — when webfinger itself fails — the
/// bare `https://domain` single-user-instance guess.
pub async fn resolve_handle(
    http: &dyn HttpFetch,
    handle: &Handle,
    key: Option<&RequestKey>,
) -> Option<String> {
    let resource = format!("acct:{}@{}", handle.nickname, handle.domain);
    let url = format!(
        "https://{}/.well-known/webfinger?resource={}",
        handle.domain,
        encode(&resource)
    );

    match http.get(&url, JRD_ACCEPT, key).await {
        Fetched::Json(jrd) => actor_url_from_jrd(&jrd),
        Fetched::Bytes(bytes) => serde_json::from_slice::<Value>(&bytes)
            .ok()
            .and_then(|jrd| actor_url_from_jrd(&jrd)),
        Fetched::Absent(status) => {
            debug!("webfinger {resource}: {status}, trying single-user guess");
            Some(format!("https://{}", handle.domain))
        }
        Fetched::Unreachable => {
            debug!("webfinger {resource}: unreachable, trying single-user guess");
            Some(format!("https://{}", handle.domain))
        }
    }
}

pub fn actor_url_from_jrd(jrd: &Value) -> Option<String> {
    let links = jrd.get("links")?.as_array()?;

    for link in links {
        let rel = link.get("rel").and_then(|v| v.as_str()).unwrap_or("");
        if rel != "self" {
            continue;
        }
        let ty = link.get("type").and_then(|v| v.as_str()).unwrap_or("");
        if !(ty.contains("application/activity+json") || ty.contains("application/ld+json")) {
            continue;
        }
        let href = link.get("href").and_then(|v| v.as_str()).unwrap_or("").trim();
        if !href.is_empty() {
            return Some(href.to_string());
        }
    }

    // Some servers only advertise an HTML profile link shaped /@nick.
    for link in links {
        let href = link.get("href").and_then(|v| v.as_str()).unwrap_or("");
        if href.contains("/@") {
            return Some(href.replacen("/@", "/users/", 1));
        }
    }
    None
}

/// Probes whether a domain exposes a shared inbox by webfingering the
/// conventional `inbox@domain` and `domain@domain` pseudo-accounts.
/// Returns the pseudo-actor URL; the actor cache turns it into an inbox.
pub async fn shared_inbox_candidate(
    http: &dyn HttpFetch,
    domain: &str,
    key: Option<&RequestKey>,
) -> Option<String> {
    for nickname in ["inbox", domain] {
        let resource = format!("acct:{nickname}@{domain}");
        let url = format!(
            "https://{domain}/.well-known/webfinger?resource={}",
            encode(&resource)
        );
        if let Fetched::Json(jrd) = http.get(&url, JRD_ACCEPT, key).await {
            if let Some(actor_url) = actor_url_from_jrd(&jrd) {
                return Some(actor_url);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefers_activity_json_self_link() {
        let jrd = json!({
            "subject": "acct:bob@birch.example",
            "links": [
                {"rel": "http://webfinger.net/rel/profile-page", "type": "text/html",
                 "href": "https://birch.example/@bob"},
                {"rel": "self", "type": "application/activity+json",
                 "href": "https://birch.example/users/bob"},
            ],
        });
        assert_eq!(
            actor_url_from_jrd(&jrd).as_deref(),
            Some("https://birch.example/users/bob")
        );
    }

    #[test]
    fn falls_back_to_profile_link_rewrite() {
        let jrd = json!({
            "links": [
                {"rel": "http://webfinger.net/rel/profile-page", "type": "text/html",
                 "href": "https://birch.example/@bob"},
            ],
        });
        assert_eq!(
            actor_url_from_jrd(&jrd).as_deref(),
            Some("https://birch.example/users/bob")
        );
    }

    #[test]
    fn no_links_resolves_nothing() {
        assert!(actor_url_from_jrd(&json!({"subject": "acct:x@y"})).is_none());
        assert!(actor_url_from_jrd(&json!({"links": []})).is_none());
    }
}
