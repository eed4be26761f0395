/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::account::{verify_password, Handle, LocalAccount};
use crate::actor_cache::ActorCache;
use crate::blocking::BlockEngine;
use crate::box_store::{BoxKind, BoxStore};
use crate::config::InstanceConfig;
use crate::conversation::ConversationIndex;
use crate::crawlers::CrawlerFilter;
use crate::delivery::Deliverer;
use crate::delivery_queue::DeliveryPool;
use crate::layout::DataLayout;
use crate::outbox::{outbox_accept, OutboxRejection};
use crate::recent_cache::RecentPostsCache;
use crate::transport::HttpFetch;
use axum::body::Body;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use http::{header, HeaderValue, Request, Response, StatusCode};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct AppState {
    pub cfg: InstanceConfig,
    pub layout: DataLayout,
    pub http: Arc<dyn HttpFetch>,
    pub actors: Arc<ActorCache>,
    pub engine: Arc<BlockEngine>,
    pub crawlers: Arc<CrawlerFilter>,
    pub store: Arc<BoxStore>,
    pub conversations: Arc<ConversationIndex>,
    pub recent: Arc<RecentPostsCache>,
    pub deliverer: Arc<Deliverer>,
    pub pool: Arc<DeliveryPool>,
    /// Local accounts keyed by nickname.
    pub accounts: HashMap<String, LocalAccount>,
}

#[derive(Serialize)]
struct Webfinger {
    subject: String,
    links: Vec<WebfingerLink>,
}

#[derive(Serialize)]
struct WebfingerLink {
    rel: String,
    #[serde(rename = "type")]
    ty: String,
    href: String,
}

#[derive(Serialize)]
#[allow(non_snake_case)]
struct PublicKey {
    id: String,
    owner: String,
    publicKeyPem: String,
}

#[derive(Serialize)]
struct ActorEndpoints {
    #[serde(rename = "sharedInbox")]
    shared_inbox: String,
}

#[derive(Serialize)]
#[allow(non_snake_case)]
struct ActorDoc {
    #[serde(rename = "@context")]
    context: Vec<String>,
    id: String,
    #[serde(rename = "type")]
    ty: String,
    preferredUsername: String,
    inbox: String,
    outbox: String,
    followers: String,
    following: String,
    endpoints: ActorEndpoints,
    publicKey: PublicKey,
}

#[derive(Serialize)]
struct OrderedCollection {
    #[serde(rename = "@context")]
    context: String,
    id: String,
    #[serde(rename = "type")]
    ty: String,
    #[serde(rename = "totalItems")]
    total_items: usize,
    #[serde(rename = "orderedItems")]
    ordered_items: Vec<serde_json::Value>,
}

pub async fn handle_request(state: &AppState, req: Request<Body>) -> Response<Body> {
    // Crawler gate sits in front of everything, fail closed on missing UA.
    let ua = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok());
    let (ua_blocked, _) = state.crawlers.ua_blocked(&state.engine, ua).await;
    if ua_blocked {
        return add_security_headers(simple(StatusCode::FORBIDDEN, "blocked"));
    }

    let path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();
    let resp = match (method.as_str(), path.as_str()) {
        ("GET", "/healthz") => simple(StatusCode::OK, "ok"),
        ("GET", "/.well-known/webfinger") => webfinger_get(state, req),
        ("POST", "/inbox") => inbox_post(state, req).await,
        ("GET", "/inbox") => simple(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        _ => match parse_user_route(&path) {
            Some((nickname, tail)) => user_route(state, req, &method, &nickname, tail).await,
            None => simple(StatusCode::NOT_FOUND, "not found"),
        },
    };
    add_security_headers(resp)
}

fn parse_user_route(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix("/users/")?;
    match rest.split_once('/') {
        Some((nick, tail)) => Some((nick.to_string(), format!("/{tail}"))),
        None => Some((rest.to_string(), String::new())),
    }
}

async fn user_route(
    state: &AppState,
    req: Request<Body>,
    method: &str,
    nickname: &str,
    tail: String,
) -> Response<Body> {
    let Some(account) = state.accounts.get(nickname) else {
        return simple(StatusCode::NOT_FOUND, "no such user");
    };
    match (method, tail.as_str()) {
        ("GET", "") => actor_get(state, account),
        ("GET", "/outbox") => outbox_get(state, account).await,
        ("POST", "/outbox") => outbox_post(state, account, req).await,
        ("GET", "/followers") => handle_collection_get(state, account, "followers"),
        ("GET", "/following") => handle_collection_get(state, account, "following"),
        ("POST", "/inbox") => inbox_post(state, req).await,
        ("GET", "/inbox") => simple(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        _ => simple(StatusCode::NOT_FOUND, "not found"),
    }
}

fn webfinger_get(state: &AppState, req: Request<Body>) -> Response<Body> {
    let resource = req
        .uri()
        .query()
        .and_then(|q| q.split('&').find(|p| p.starts_with("resource=")))
        .and_then(|p| p.split_once('='))
        .map(|(_, v)| urlencoding::decode(v).unwrap_or_default().to_string())
        .unwrap_or_default();
    if resource.is_empty() {
        return simple(StatusCode::BAD_REQUEST, "missing resource");
    }

    for account in state.accounts.values() {
        let acct = format!("acct:{}", account.handle);
        if resource == acct || resource == account.actor_url {
            let body = Webfinger {
                subject: acct,
                links: vec![WebfingerLink {
                    rel: "self".to_string(),
                    ty: "application/activity+json".to_string(),
                    href: account.actor_url.clone(),
                }],
            };
            return jrd(StatusCode::OK, &body);
        }
    }
    simple(StatusCode::NOT_FOUND, "not found")
}

fn actor_get(state: &AppState, account: &LocalAccount) -> Response<Body> {
    let id = account.actor_url.clone();
    let doc = ActorDoc {
        context: vec![
            aelurodon_protocol::AS_CONTEXT.to_string(),
            aelurodon_protocol::SECURITY_CONTEXT.to_string(),
        ],
        id: id.clone(),
        ty: "Person".to_string(),
        preferredUsername: account.handle.nickname.clone(),
        inbox: format!("{id}/inbox"),
        outbox: format!("{id}/outbox"),
        followers: format!("{id}/followers"),
        following: format!("{id}/following"),
        endpoints: ActorEndpoints {
            shared_inbox: state.cfg.shared_inbox_url(),
        },
        publicKey: PublicKey {
            id: account.keys.key_id.clone(),
            owner: id,
            publicKeyPem: account.keys.public_key_pem.clone(),
        },
    };
    json_activity(StatusCode::OK, &doc)
}

async fn outbox_get(state: &AppState, account: &LocalAccount) -> Response<Body> {
    let items = state
        .store
        .list(&account.account_key(), BoxKind::Outbox, 20)
        .await;
    let total = state
        .store
        .index_keys(&account.account_key(), BoxKind::Outbox)
        .await
        .len();
    let collection = OrderedCollection {
        context: aelurodon_protocol::AS_CONTEXT.to_string(),
        id: format!("{}/outbox", account.actor_url),
        ty: "OrderedCollection".to_string(),
        total_items: total,
        ordered_items: items
            .iter()
            .filter_map(|env| serde_json::to_value(env).ok())
            .collect(),
    };
    json_activity(StatusCode::OK, &collection)
}

fn handle_collection_get(
    state: &AppState,
    account: &LocalAccount,
    which: &str,
) -> Response<Body> {
    let path = if which == "followers" {
        state.layout.followers_file(&account.account_key())
    } else {
        state.layout.following_file(&account.account_key())
    };
    let items: Vec<serde_json::Value> = crate::layout::read_lines(&path)
        .iter()
        .filter_map(|line| Handle::parse(line))
        .map(|h| serde_json::Value::String(format!("https://{}/users/{}", h.domain, h.nickname)))
        .collect();
    let collection = OrderedCollection {
        context: aelurodon_protocol::AS_CONTEXT.to_string(),
        id: format!("{}/{which}", account.actor_url),
        ty: "OrderedCollection".to_string(),
        total_items: items.len(),
        ordered_items: items,
    };
    json_activity(StatusCode::OK, &collection)
}

/// c2s outbox POST: HTTP Basic credential, then the acceptance pipeline.
/// The response only signals acceptance; delivery results never surface.
async fn outbox_post(
    state: &AppState,
    account: &LocalAccount,
    req: Request<Body>,
) -> Response<Body> {
    let (parts, body) = req.into_parts();
    if !basic_auth_ok(state, account, &parts.headers) {
        return simple(StatusCode::UNAUTHORIZED, "authentication required");
    }

    let body_bytes = match axum::body::to_bytes(body, 2 * 1024 * 1024).await {
        Ok(b) => b,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid body"),
    };
    let raw: serde_json::Value = match serde_json::from_slice(&body_bytes) {
        Ok(v) => v,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid json"),
    };

    match outbox_accept(state, account, raw).await {
        Ok(accepted) => {
            info!("outbox accepted {}", accepted.activity_id);
            simple(StatusCode::ACCEPTED, "accepted")
        }
        Err(OutboxRejection::SelfBlocked) => simple(StatusCode::FORBIDDEN, "blocked"),
        Err(OutboxRejection::DangerousMarkup) => {
            simple(StatusCode::BAD_REQUEST, "dangerous markup")
        }
        Err(OutboxRejection::InvalidJson) => simple(StatusCode::BAD_REQUEST, "invalid activity"),
        Err(OutboxRejection::Invalid(reason)) => {
            debug!("outbox rejected: {reason}");
            simple(StatusCode::BAD_REQUEST, reason)
        }
    }
}

/// Inbound s2s POST. Full inbox processing lives behind this surface; here
/// the sender only passes the same blocking gate deliveries do.
async fn inbox_post(state: &AppState, req: Request<Body>) -> Response<Body> {
    let body = match axum::body::to_bytes(req.into_body(), 2 * 1024 * 1024).await {
        Ok(b) => b,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid body"),
    };
    let activity: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return simple(StatusCode::BAD_REQUEST, "invalid json"),
    };
    let Some(actor) = activity.get("actor").and_then(|v| v.as_str()) else {
        return simple(StatusCode::BAD_REQUEST, "missing actor");
    };
    if let Some(handle) = Handle::from_actor_url(actor) {
        if state
            .engine
            .is_actor_blocked(&handle.nickname, &handle.domain)
            .await
        {
            return simple(StatusCode::FORBIDDEN, "blocked");
        }
    }
    simple(StatusCode::ACCEPTED, "accepted")
}

fn basic_auth_ok(state: &AppState, account: &LocalAccount, headers: &http::HeaderMap) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = B64.decode(encoded.trim().as_bytes()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((nickname, password)) = credentials.split_once(':') else {
        return false;
    };
    nickname == account.handle.nickname
        && verify_password(&state.layout, &account.account_key(), password)
}

fn add_security_headers(mut resp: Response<Body>) -> Response<Body> {
    let headers = resp.headers_mut();
    headers
        .entry("X-Content-Type-Options")
        .or_insert(HeaderValue::from_static("nosniff"));
    headers
        .entry("X-Frame-Options")
        .or_insert(HeaderValue::from_static("DENY"));
    headers
        .entry("Referrer-Policy")
        .or_insert(HeaderValue::from_static("no-referrer"));
    resp
}

fn simple(status: StatusCode, msg: &str) -> Response<Body> {
    let mut resp = Response::new(Body::from(msg.to_string()));
    *resp.status_mut() = status;
    resp
}

fn jrd<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/jrd+json; charset=utf-8"),
    );
    resp
}

fn json_activity<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/activity+json; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::set_password;
    use crate::actor_cache::ActorCache;
    use crate::delivery_queue::QueueSettings;
    use crate::keys::AccountKeys;
    use crate::locks::AccountLocks;
    use crate::testutil::FakeHttp;
    use std::time::Duration;
    use tokio::sync::watch;

    const UA: &str = "Mozilla/5.0 (X11; Linux x86_64)";

    fn test_state(dir: &std::path::Path) -> (AppState, watch::Sender<bool>) {
        let cfg: InstanceConfig =
            serde_json::from_str(r#"{"domain": "dogwood.example"}"#).unwrap();
        let layout = DataLayout::new(dir);
        let locks = Arc::new(AccountLocks::new());
        let http: Arc<FakeHttp> = Arc::new(FakeHttp::new());
        let actors = Arc::new(ActorCache::new(None));
        let engine = Arc::new(BlockEngine::new(
            layout.clone(),
            locks.clone(),
            Duration::from_secs(0),
        ));
        let deliverer = Arc::new(Deliverer::new(
            http.clone(),
            actors.clone(),
            "dogwood.example".to_string(),
            "https://dogwood.example".to_string(),
            Vec::new(),
            false,
        ));
        let (tx, rx) = watch::channel(false);
        let pool = Arc::new(DeliveryPool::new(
            deliverer.clone(),
            QueueSettings::default(),
            rx,
        ));
        let account = LocalAccount {
            handle: Handle::new("alice", "dogwood.example"),
            actor_url: "https://dogwood.example/users/alice".to_string(),
            keys: AccountKeys {
                private_key_pem: String::new(),
                public_key_pem: "-----BEGIN PUBLIC KEY-----\nAA==\n-----END PUBLIC KEY-----\n"
                    .to_string(),
                key_id: "https://dogwood.example/users/alice#main-key".to_string(),
            },
        };
        set_password(&layout, "alice@dogwood.example", "hunter2").unwrap();
        let http_dyn: Arc<dyn HttpFetch> = http;
        let state = AppState {
            cfg,
            layout: layout.clone(),
            http: http_dyn,
            actors,
            engine,
            crawlers: Arc::new(CrawlerFilter::new(layout.clone(), false, Vec::new(), Vec::new())),
            store: Arc::new(BoxStore::new(layout.clone(), locks.clone())),
            conversations: Arc::new(ConversationIndex::new(layout, locks)),
            recent: Arc::new(RecentPostsCache::new(64)),
            deliverer,
            pool,
            accounts: HashMap::from([(
                "alice".to_string(),
                account,
            )]),
        };
        (state, tx)
    }

    async fn body_json(resp: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(path)
            .header(header::USER_AGENT, UA)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn webfinger_resolves_local_account() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _tx) = test_state(dir.path());
        let resp = handle_request(
            &state,
            get("/.well-known/webfinger?resource=acct:alice@dogwood.example"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let jrd = body_json(resp).await;
        assert_eq!(jrd["subject"], "acct:alice@dogwood.example");
        assert_eq!(jrd["links"][0]["href"], "https://dogwood.example/users/alice");

        let miss = handle_request(
            &state,
            get("/.well-known/webfinger?resource=acct:nobody@dogwood.example"),
        )
        .await;
        assert_eq!(miss.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn actor_document_carries_key_and_shared_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _tx) = test_state(dir.path());
        let resp = handle_request(&state, get("/users/alice")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("application/activity+json"));
        let doc = body_json(resp).await;
        assert_eq!(doc["preferredUsername"], "alice");
        assert_eq!(doc["endpoints"]["sharedInbox"], "https://dogwood.example/inbox");
        assert!(doc["publicKey"]["publicKeyPem"]
            .as_str()
            .unwrap()
            .contains("BEGIN PUBLIC KEY"));
    }

    #[tokio::test]
    async fn missing_user_agent_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _tx) = test_state(dir.path());
        let req = Request::builder()
            .method("GET")
            .uri("/users/alice")
            .body(Body::empty())
            .unwrap();
        let resp = handle_request(&state, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn outbox_post_requires_basic_auth() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _tx) = test_state(dir.path());
        let note = r#"{"type": "Note", "content": "hi", "to": ["https://www.w3.org/ns/activitystreams#Public"]}"#;

        let unauthed = Request::builder()
            .method("POST")
            .uri("/users/alice/outbox")
            .header(header::USER_AGENT, UA)
            .body(Body::from(note))
            .unwrap();
        assert_eq!(
            handle_request(&state, unauthed).await.status(),
            StatusCode::UNAUTHORIZED
        );

        let wrong = Request::builder()
            .method("POST")
            .uri("/users/alice/outbox")
            .header(header::USER_AGENT, UA)
            .header(header::AUTHORIZATION, format!("Basic {}", B64.encode("alice:wrong")))
            .body(Body::from(note))
            .unwrap();
        assert_eq!(handle_request(&state, wrong).await.status(), StatusCode::UNAUTHORIZED);

        let authed = Request::builder()
            .method("POST")
            .uri("/users/alice/outbox")
            .header(header::USER_AGENT, UA)
            .header(header::AUTHORIZATION, format!("Basic {}", B64.encode("alice:hunter2")))
            .body(Body::from(note))
            .unwrap();
        assert_eq!(handle_request(&state, authed).await.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn inbox_post_applies_the_blocking_gate() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _tx) = test_state(dir.path());
        state.engine.add_instance_block("*@evil.example").await.unwrap();

        let blocked = Request::builder()
            .method("POST")
            .uri("/inbox")
            .header(header::USER_AGENT, UA)
            .body(Body::from(
                r#"{"type": "Create", "actor": "https://evil.example/users/mallory"}"#,
            ))
            .unwrap();
        assert_eq!(handle_request(&state, blocked).await.status(), StatusCode::FORBIDDEN);

        let fine = Request::builder()
            .method("POST")
            .uri("/inbox")
            .header(header::USER_AGENT, UA)
            .body(Body::from(
                r#"{"type": "Create", "actor": "https://birch.example/users/bob"}"#,
            ))
            .unwrap();
        assert_eq!(handle_request(&state, fine).await.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _tx) = test_state(dir.path());
        let resp = handle_request(&state, get("/users/nobody")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = handle_request(&state, get("/whatever")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        // Security headers ride on every response.
        let resp = handle_request(&state, get("/healthz")).await;
        assert_eq!(
            resp.headers().get("X-Content-Type-Options").unwrap(),
            "nosniff"
        );
    }
}
