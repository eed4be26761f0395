/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::ProxyKind;
use crate::http_sig::sign_request;
use anyhow::{Context, Result};
use async_trait::async_trait;
use http::{HeaderMap, Method, Uri};
use rand::{thread_rng, Rng};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

pub const ACTIVITY_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";
pub const JRD_ACCEPT: &str = "application/jrd+json, application/json";

/// Identity used to sign an outbound request ("authorized fetch").
#[derive(Debug, Clone)]
pub struct RequestKey {
    pub key_id: String,
    pub private_key_pem: String,
}

/// GET result. `Absent` is a confirmed miss (401/403/404/410);
/// `Unreachable` is unknown — callers must not treat it as absent.
#[derive(Debug)]
pub enum Fetched {
    Json(Value),
    Bytes(Vec<u8>),
    Absent(u16),
    Unreachable,
}

impl Fetched {
    pub fn into_json(self) -> Option<Value> {
        match self {
            Fetched::Json(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PostOutcome {
    pub accepted: bool,
    pub unauthorized: bool,
    pub status: Option<u16>,
}

impl PostOutcome {
    pub fn unreachable() -> Self {
        Self {
            accepted: false,
            unauthorized: false,
            status: None,
        }
    }
}

/// Seam between the federation logic and the network. Production uses
/// [`Transport`]; tests inject a recording fake.
#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn get(&self, url: &str, accept: &str, key: Option<&RequestKey>) -> Fetched;

    async fn post_json(
        &self,
        url: &str,
        body: &[u8],
        extra_headers: &[(String, String)],
        key: Option<&RequestKey>,
    ) -> PostOutcome;

    /// Cheap liveness probe; any HTTP answer counts as alive.
    async fn probe_domain(&self, domain: &str) -> bool;
}

pub struct Transport {
    client: reqwest::Client,
}

impl Transport {
    /// The proxy profile is bound to the client once per logical session.
    pub fn new(proxy: ProxyKind, timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(socks) = proxy.socks_url() {
            builder = builder.proxy(reqwest::Proxy::all(socks).context("configure proxy")?);
        }
        Ok(Self {
            client: builder.build().context("build http client")?,
        })
    }

    pub async fn post_file(
        &self,
        url: &str,
        path: &Path,
        key: Option<&RequestKey>,
    ) -> Result<PostOutcome> {
        let body = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let mut headers = HeaderMap::new();
        headers.insert(
            "Content-Type",
            mime.essence_str().parse().context("content type")?,
        );
        Ok(self.post_bytes(url, &body, headers, key).await)
    }

    async fn post_bytes(
        &self,
        url: &str,
        body: &[u8],
        mut headers: HeaderMap,
        key: Option<&RequestKey>,
    ) -> PostOutcome {
        if let Some(key) = key {
            let Ok(uri) = url.parse::<Uri>() else {
                return PostOutcome::unreachable();
            };
            if let Err(e) = sign_request(
                &key.private_key_pem,
                &key.key_id,
                &Method::POST,
                &uri,
                &mut headers,
                body,
                &["(request-target)", "host", "date", "digest", "content-type"],
            ) {
                warn!("sign post to {url}: {e:#}");
                return PostOutcome::unreachable();
            }
        }

        let mut req = self.client.post(url);
        for (k, v) in headers.iter() {
            req = req.header(k.as_str(), v.to_str().unwrap_or_default());
        }
        match req.body(body.to_vec()).send().await {
            Ok(resp) => classify_post(resp.status().as_u16()),
            Err(e) => {
                debug!("post {url}: {e}");
                PostOutcome::unreachable()
            }
        }
    }
}

#[async_trait]
impl HttpFetch for Transport {
    async fn get(&self, url: &str, accept: &str, key: Option<&RequestKey>) -> Fetched {
        let mut headers = HeaderMap::new();
        let Ok(accept_value) = accept.parse() else {
            return Fetched::Unreachable;
        };
        headers.insert("Accept", accept_value);

        if let Some(key) = key {
            let Ok(uri) = url.parse::<Uri>() else {
                return Fetched::Unreachable;
            };
            if let Err(e) = sign_request(
                &key.private_key_pem,
                &key.key_id,
                &Method::GET,
                &uri,
                &mut headers,
                &[],
                &["(request-target)", "host", "date"],
            ) {
                warn!("sign get {url}: {e:#}");
                return Fetched::Unreachable;
            }
        }

        // Timeouts and resets get a couple of quick retries here; anything
        // smarter is the caller's retry policy.
        let mut backoff = Duration::from_millis(200);
        for attempt in 0..3u32 {
            let mut req = self.client.get(url);
            for (k, v) in headers.iter() {
                req = req.header(k.as_str(), v.to_str().unwrap_or_default());
            }
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if status == 200 || status == 304 {
                        let is_json = resp
                            .headers()
                            .get("content-type")
                            .and_then(|v| v.to_str().ok())
                            .map(|ct| ct.contains("json"))
                            .unwrap_or(false);
                        let Ok(bytes) = resp.bytes().await else {
                            return Fetched::Unreachable;
                        };
                        if is_json {
                            match serde_json::from_slice(&bytes) {
                                Ok(v) => return Fetched::Json(v),
                                Err(_) => return Fetched::Bytes(bytes.to_vec()),
                            }
                        }
                        return Fetched::Bytes(bytes.to_vec());
                    }
                    if matches!(status, 401 | 403 | 404 | 410) {
                        debug!("get {url}: expected absence ({status})");
                        return Fetched::Absent(status);
                    }
                    debug!("get {url}: transient status {status}");
                    return Fetched::Unreachable;
                }
                Err(e) => {
                    if attempt + 1 >= 3 {
                        debug!("get {url}: {e}");
                        return Fetched::Unreachable;
                    }
                    sleep_with_jitter(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
        Fetched::Unreachable
    }

    async fn post_json(
        &self,
        url: &str,
        body: &[u8],
        extra_headers: &[(String, String)],
        key: Option<&RequestKey>,
    ) -> PostOutcome {
        let mut headers = HeaderMap::new();
        headers.insert("Accept", "application/activity+json".parse().expect("static header"));
        headers.insert(
            "Content-Type",
            "application/activity+json".parse().expect("static header"),
        );
        for (k, v) in extra_headers {
            let (Ok(name), Ok(value)) = (
                http::header::HeaderName::from_bytes(k.as_bytes()),
                v.parse::<http::HeaderValue>(),
            ) else {
                continue;
            };
            headers.insert(name, value);
        }
        self.post_bytes(url, body, headers, key).await
    }

    async fn probe_domain(&self, domain: &str) -> bool {
        let url = format!("https://{domain}/");
        match self.client.head(&url).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!("probe {domain}: {e}");
                false
            }
        }
    }
}

/// 2xx accepted; 401–405 (except 404) is an authorization rejection and
/// must not be retried.
fn classify_post(status: u16) -> PostOutcome {
    PostOutcome {
        accepted: (200..300).contains(&status),
        unauthorized: (401..=405).contains(&status) && status != 404,
        status: Some(status),
    }
}

async fn sleep_with_jitter(base: Duration) {
    let jitter = Duration::from_millis(thread_rng().gen_range(0..=200));
    tokio::time::sleep(base + jitter).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_classification() {
        assert!(classify_post(200).accepted);
        assert!(classify_post(202).accepted);

        let unauthorized = classify_post(401);
        assert!(!unauthorized.accepted);
        assert!(unauthorized.unauthorized);
        assert!(classify_post(403).unauthorized);
        assert!(classify_post(405).unauthorized);

        // 404 is absence, not an authorization failure.
        assert!(!classify_post(404).unauthorized);
        // 5xx is transient: neither accepted nor terminal.
        let flaky = classify_post(502);
        assert!(!flaky.accepted);
        assert!(!flaky.unauthorized);
    }
}
