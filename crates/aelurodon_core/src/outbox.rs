/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::account::{Handle, LocalAccount};
use crate::box_store::BoxKind;
use crate::delivery_queue::DeliveryReport;
use crate::posts::{contains_dangerous_markup, now_rfc3339, post_object, wrap_create};
use crate::server::AppState;
use crate::transport::RequestKey;
use aelurodon_protocol::{Envelope, Kind};
use bytes::Bytes;
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Synchronous rejection reasons; anything past acceptance is fire-and-forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxRejection {
    InvalidJson,
    Invalid(&'static str),
    DangerousMarkup,
    SelfBlocked,
}

pub struct OutboxAccepted {
    pub activity_id: String,
    /// Per-batch result channel. The c2s contract never exposes it, but
    /// tests and operators can watch it.
    pub reports: mpsc::UnboundedReceiver<DeliveryReport>,
}

pub(crate) fn request_key(account: &LocalAccount) -> RequestKey {
    RequestKey {
        key_id: account.keys.key_id.clone(),
        private_key_pem: account.keys.private_key_pem.clone(),
    }
}

/// Client-to-server outbox acceptance: wrap, validate, persist, run side
/// effects, then spawn the fan-out and return immediately. The caller gets
/// an acceptance signal only — never synchronous delivery results.
pub async fn outbox_accept(
    state: &AppState,
    account: &LocalAccount,
    raw: Value,
) -> Result<OutboxAccepted, OutboxRejection> {
    let parsed: Envelope = serde_json::from_value(raw).map_err(|_| OutboxRejection::InvalidJson)?;

    // A bare object is the client's post; wrap it in Create for the wire.
    let mut env = if parsed.kind.is_post() {
        let mut object = parsed;
        if object.id.is_none() {
            object.id = Some(state.store.new_post_id(&account.actor_url));
        }
        if object.attributed_to.is_none() {
            object.attributed_to = Some(account.actor_url.clone());
        }
        if object.published.is_none() {
            object.published = Some(now_rfc3339());
        }
        wrap_create(&account.actor_url, object)
    } else {
        parsed
    };

    match env.actor.as_deref() {
        None => env.actor = Some(account.actor_url.clone()),
        Some(actor) if actor == account.actor_url => {}
        Some(_) => return Err(OutboxRejection::Invalid("actor mismatch")),
    }
    if env.id.is_none() {
        env.id = Some(format!(
            "{}/activity",
            state.store.new_post_id(&account.actor_url)
        ));
    }
    if env.published.is_none() {
        env.published = Some(now_rfc3339());
    }

    if env.kind == Kind::Create && (env.to.is_empty() || env.object.is_none()) {
        return Err(OutboxRejection::Invalid("create requires to and object"));
    }

    if let Some(content) = post_object(&env).content.as_deref() {
        if contains_dangerous_markup(content) {
            return Err(OutboxRejection::DangerousMarkup);
        }
    }

    // Self-block guard: an account that blocked itself publishes nothing.
    let own = &account.handle;
    if state
        .engine
        .is_blocked_for_account(&account.account_key(), &own.nickname, &own.domain)
        .await
    {
        return Err(OutboxRejection::SelfBlocked);
    }

    let account_key = account.account_key();
    let box_kind = if post_object(&env).kind == Kind::Article {
        BoxKind::TlBlogs
    } else {
        BoxKind::Outbox
    };
    if let Err(e) = state
        .store
        .save(&account_key, box_kind, &mut env, &account.actor_url, false)
        .await
    {
        warn!("outbox persist failed: {e:#}");
        return Err(OutboxRejection::Invalid("storage failure"));
    }
    let activity_id = env.id.clone().unwrap_or_default();

    let object = post_object(&env);
    if object.kind.is_post() {
        if let (Some(conversation), Some(post_id)) = (
            object
                .conversation
                .clone()
                .or_else(|| object.id.clone()),
            object.id.clone(),
        ) {
            if let Err(e) = state
                .conversations
                .add(&account_key, &conversation, &post_id)
                .await
            {
                warn!("conversation index: {e:#}");
            }
        }
    }

    run_side_effects(state, account, &env).await;

    // Fan-out is background work; resolution and signed fetches stay off
    // the request thread.
    let (reports_tx, reports_rx) = mpsc::unbounded_channel();
    let state = state.clone();
    let account = account.clone();
    let activity = env.clone();
    tokio::spawn(async move {
        state.actors.sweep().await;
        let plan = plan_fanout(&state, &account, &activity).await;
        let Ok(body) = serde_json::to_vec(&activity) else {
            return;
        };
        let body = Bytes::from(body);
        let key = request_key(&account);
        for inbox in plan.targets {
            state
                .pool
                .spawn_send(key.clone(), inbox, body.clone(), reports_tx.clone());
        }
    });

    Ok(OutboxAccepted {
        activity_id,
        reports: reports_rx,
    })
}

/// Independently idempotent side-effect handlers; each no-ops unless the
/// activity type matches.
async fn run_side_effects(state: &AppState, account: &LocalAccount, env: &Envelope) {
    crate::blocking::outbox_block(&state.engine, &state.store, account, env).await;
    crate::blocking::outbox_undo_block(&state.engine, &state.store, account, env).await;
    crate::mutes::outbox_mute(&state.store, &state.recent, account, env).await;
    crate::mutes::outbox_undo_mute(&state.store, &state.recent, account, env).await;
    outbox_like(state, env).await;
    outbox_share(state, env).await;
    outbox_bookmark(state, account, env).await;
}

/// Likes change the rendered counts of their target.
async fn outbox_like(state: &AppState, env: &Envelope) {
    if env.kind != Kind::Like {
        return;
    }
    if let Some(object_id) = env.object_id() {
        state.recent.invalidate(object_id);
    }
}

async fn outbox_share(state: &AppState, env: &Envelope) {
    if env.kind != Kind::Announce {
        return;
    }
    if let Some(object_id) = env.object_id() {
        state.recent.invalidate(object_id);
    }
}

/// `Add` bookmarks a locally-known post; `Remove` reverses it.
async fn outbox_bookmark(state: &AppState, account: &LocalAccount, env: &Envelope) {
    let account_key = account.account_key();
    match env.kind {
        Kind::Add => {
            let Some(object_id) = env.object_id() else {
                return;
            };
            let Ok(Some((_, mut post))) = state.store.locate(&account_key, object_id).await else {
                return;
            };
            let _ = state
                .store
                .save(&account_key, BoxKind::TlBookmarks, &mut post, &account.actor_url, true)
                .await;
        }
        Kind::Remove => {
            if let Some(object_id) = env.object_id() {
                let _ = state
                    .store
                    .remove(&account_key, BoxKind::TlBookmarks, object_id)
                    .await;
            }
        }
        _ => {}
    }
}

#[derive(Debug, Default)]
pub struct FanoutPlan {
    /// Deduplicated inbox URLs, in planning order.
    pub targets: Vec<String>,
}

impl FanoutPlan {
    fn admit(&mut self, notified: &mut HashSet<String>, inbox: String) {
        if notified.insert(inbox.clone()) {
            self.targets.push(inbox);
        }
    }
}

/// Resolves an activity's audience into concrete inbox URLs.
///
/// Followers are grouped per domain; live domains with more than one local
/// follower (or any profile update) are probed for a shared inbox so one
/// POST replaces N. Named recipients resolve individually. A per-activity
/// set of already-notified inboxes deduplicates the two paths.
pub async fn plan_fanout(state: &AppState, account: &LocalAccount, env: &Envelope) -> FanoutPlan {
    let mut plan = FanoutPlan::default();
    let mut notified = HashSet::new();
    let key = request_key(account);
    let account_key = account.account_key();
    let followers_url = account.followers_url();

    let profile_update = env.kind == Kind::Update && post_object(env).kind.is_actor();
    let recipients = env.recipients();

    // Followers fan-out, grouped by domain.
    if recipients.iter().any(|r| r == &followers_url) {
        let mut by_domain: HashMap<String, Vec<Handle>> = HashMap::new();
        for line in crate::layout::read_lines(&state.layout.followers_file(&account_key)) {
            let Some(handle) = Handle::parse(&line) else {
                continue;
            };
            by_domain.entry(handle.domain.clone()).or_default().push(handle);
        }

        for (domain, members) in by_domain {
            let mut live_members = Vec::new();
            for member in members {
                if state
                    .engine
                    .is_handle_blocked_for_account(&account_key, &member)
                    .await
                {
                    info!("delivery blocked, skipping follower {member}");
                    continue;
                }
                live_members.push(member);
            }
            if live_members.is_empty() {
                continue;
            }

            // Dead domains are skipped without consuming any retry budget.
            if !state.deliverer.http().probe_domain(&domain).await {
                info!("domain {domain} not responding, skipping followers batch");
                continue;
            }

            // Profile updates always prefer the shared inbox so key
            // rotations are not announced N times.
            if live_members.len() > 1 || profile_update {
                if let Some(shared) = state.deliverer.resolve_shared_inbox(&domain, &key).await {
                    plan.admit(&mut notified, shared);
                    continue;
                }
            }

            // Per-member resolution runs concurrently; one slow host must
            // not serialize the whole domain batch.
            let resolved = join_all(
                live_members
                    .iter()
                    .map(|member| state.deliverer.resolve_inbox_for_handle(member, &key)),
            )
            .await;
            for result in resolved {
                match result {
                    Ok(inbox) => plan.admit(&mut notified, inbox),
                    Err(reason) => warn!("follower resolution failed: {reason}"),
                }
            }
        }
    }

    // Named (non-collection) recipients.
    for recipient in &recipients {
        if recipient == &followers_url || recipient.ends_with("/followers") {
            continue;
        }

        // The block check runs before any webfinger traffic.
        if let Some(handle) = Handle::from_actor_url(recipient) {
            if state
                .engine
                .is_handle_blocked_for_account(&account_key, &handle)
                .await
            {
                info!("delivery blocked, skipping named recipient {handle}");
                continue;
            }
            // Profile updates are never delivered back to the sender.
            if profile_update && handle == account.handle {
                continue;
            }
        }

        match state.deliverer.resolve_inbox_for_actor(recipient, &key).await {
            Ok(inbox) => plan.admit(&mut notified, inbox),
            Err(reason) => warn!("recipient resolution failed: {reason}"),
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor_cache::ActorCache;
    use crate::blocking::BlockEngine;
    use crate::box_store::BoxStore;
    use crate::config::InstanceConfig;
    use crate::conversation::ConversationIndex;
    use crate::crawlers::CrawlerFilter;
    use crate::delivery::Deliverer;
    use crate::delivery_queue::{DeliveryPool, QueueSettings};
    use crate::keys::AccountKeys;
    use crate::layout::{write_lines, DataLayout};
    use crate::locks::AccountLocks;
    use crate::recent_cache::RecentPostsCache;
    use crate::testutil::FakeHttp;
    use aelurodon_protocol::{ObjectRef, AS_PUBLIC};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    const ACTOR: &str = "https://dogwood.example/users/alice";

    fn alice() -> LocalAccount {
        LocalAccount {
            handle: Handle::new("alice", "dogwood.example"),
            actor_url: ACTOR.to_string(),
            keys: AccountKeys {
                private_key_pem: String::new(),
                public_key_pem: String::new(),
                key_id: format!("{ACTOR}#main-key"),
            },
        }
    }

    fn test_state(dir: &std::path::Path, http: Arc<FakeHttp>) -> (AppState, watch::Sender<bool>) {
        let cfg: InstanceConfig =
            serde_json::from_str(r#"{"domain": "dogwood.example"}"#).unwrap();
        let layout = DataLayout::new(dir);
        let locks = Arc::new(AccountLocks::new());
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
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = Arc::new(DeliveryPool::new(
            deliverer.clone(),
            QueueSettings {
                max_attempts: 2,
                retry_interval: Duration::from_millis(5),
                max_pending: 100,
                log_len: 16,
            },
            shutdown_rx,
        ));
        let http_dyn: Arc<dyn crate::transport::HttpFetch> = http.clone();
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
            accounts: HashMap::from([("alice".to_string(), alice())]),
        };
        (state, shutdown_tx)
    }

    fn seed_remote_actor(http: &FakeHttp, nick: &str, domain: &str) {
        let actor = format!("https://{domain}/users/{nick}");
        http.insert_json(
            &format!(
                "https://{domain}/.well-known/webfinger?resource=acct%3A{nick}%40{domain}"
            ),
            json!({"links": [{"rel": "self", "type": "application/activity+json", "href": actor}]}),
        );
        http.insert_json(
            &actor,
            json!({"id": actor, "inbox": format!("{actor}/inbox")}),
        );
    }

    fn seed_shared_inbox(http: &FakeHttp, domain: &str) {
        http.insert_json(
            &format!(
                "https://{domain}/.well-known/webfinger?resource=acct%3Ainbox%40{domain}"
            ),
            json!({"links": [{"rel": "self", "type": "application/activity+json",
                              "href": format!("https://{domain}/inbox")}]}),
        );
        http.insert_json(
            &format!("https://{domain}/inbox"),
            json!({"id": format!("https://{domain}/inbox"),
                   "endpoints": {"sharedInbox": format!("https://{domain}/inbox")}}),
        );
    }

    fn followers_post(account: &LocalAccount) -> Envelope {
        let mut env = Envelope::new(Kind::Create);
        env.id = Some(format!("{ACTOR}/statuses/1/activity"));
        env.actor = Some(account.actor_url.clone());
        env.to = vec![AS_PUBLIC.to_string()];
        env.cc = vec![account.followers_url()];
        let mut note = Envelope::new(Kind::Note);
        note.id = Some(format!("{ACTOR}/statuses/1"));
        note.content = Some("hello".to_string());
        env.object = Some(ObjectRef::Node(Box::new(note)));
        env
    }

    #[tokio::test]
    async fn fanout_uses_shared_inboxes_where_it_can() {
        let dir = tempfile::tempdir().unwrap();
        let http = Arc::new(FakeHttp::new());
        let (state, _tx) = test_state(dir.path(), http.clone());
        let account = alice();

        // 3 followers behind a shared inbox, 2 without one, 1 alone.
        write_lines(
            &state.layout.followers_file(&account.account_key()),
            &[
                "bob@birch.example".to_string(),
                "beth@birch.example".to_string(),
                "bill@birch.example".to_string(),
                "fred@fir.example".to_string(),
                "faye@fir.example".to_string(),
                "eve@elm.example".to_string(),
            ],
        )
        .unwrap();
        seed_shared_inbox(&http, "birch.example");
        for (nick, domain) in [
            ("fred", "fir.example"),
            ("faye", "fir.example"),
            ("eve", "elm.example"),
        ] {
            seed_remote_actor(&http, nick, domain);
        }
        // elm.example also has a shared inbox, but with one local follower
        // it must not be probed.
        seed_shared_inbox(&http, "elm.example");

        let plan = plan_fanout(&state, &account, &followers_post(&account)).await;

        // N=6 followers, 3 on the shared-inbox domain, k=1 shared delivery:
        // (6 - 3) + 1 = 4 outbound posts.
        assert_eq!(plan.targets.len(), 4);
        assert!(plan.targets.contains(&"https://birch.example/inbox".to_string()));
        assert!(plan.targets.contains(&"https://fir.example/users/fred/inbox".to_string()));
        assert!(plan.targets.contains(&"https://fir.example/users/faye/inbox".to_string()));
        assert!(plan.targets.contains(&"https://elm.example/users/eve/inbox".to_string()));
        assert!(!http
            .get_calls()
            .iter()
            .any(|u| u.contains("acct%3Ainbox%40elm.example")));
    }

    #[tokio::test]
    async fn blocked_named_recipient_skipped_before_webfinger() {
        let dir = tempfile::tempdir().unwrap();
        let http = Arc::new(FakeHttp::new());
        let (state, _tx) = test_state(dir.path(), http.clone());
        let account = alice();

        state
            .engine
            .add_account_block(&account.account_key(), "alice@evil.example")
            .await
            .unwrap();

        let mut env = Envelope::new(Kind::Create);
        env.actor = Some(account.actor_url.clone());
        env.to = vec!["https://evil.example/users/alice".to_string()];
        let mut note = Envelope::new(Kind::Note);
        note.content = Some("psst".to_string());
        env.object = Some(ObjectRef::Node(Box::new(note)));

        let plan = plan_fanout(&state, &account, &env).await;
        assert!(plan.targets.is_empty());
        // No resolution traffic at all for the blocked recipient.
        assert!(http.get_calls().is_empty());
    }

    #[tokio::test]
    async fn named_recipient_deduped_against_followers_path() {
        let dir = tempfile::tempdir().unwrap();
        let http = Arc::new(FakeHttp::new());
        let (state, _tx) = test_state(dir.path(), http.clone());
        let account = alice();

        write_lines(
            &state.layout.followers_file(&account.account_key()),
            &["bob@birch.example".to_string()],
        )
        .unwrap();
        seed_remote_actor(&http, "bob", "birch.example");

        let mut env = followers_post(&account);
        // bob is both a follower and a named mention target.
        env.cc.push("https://birch.example/users/bob".to_string());

        let plan = plan_fanout(&state, &account, &env).await;
        assert_eq!(plan.targets, vec!["https://birch.example/users/bob/inbox".to_string()]);
    }

    #[tokio::test]
    async fn dead_domains_are_skipped_without_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let http = Arc::new(FakeHttp::new());
        let (state, _tx) = test_state(dir.path(), http.clone());
        let account = alice();

        write_lines(
            &state.layout.followers_file(&account.account_key()),
            &["fred@fir.example".to_string(), "bob@birch.example".to_string()],
        )
        .unwrap();
        seed_remote_actor(&http, "fred", "fir.example");
        seed_remote_actor(&http, "bob", "birch.example");
        http.mark_domain_dead("fir.example");

        let plan = plan_fanout(&state, &account, &followers_post(&account)).await;
        assert_eq!(plan.targets, vec!["https://birch.example/users/bob/inbox".to_string()]);
        assert!(!http.get_calls().iter().any(|u| u.contains("fir.example")));
    }

    #[tokio::test]
    async fn profile_updates_force_shared_inbox_and_skip_self() {
        let dir = tempfile::tempdir().unwrap();
        let http = Arc::new(FakeHttp::new());
        let (state, _tx) = test_state(dir.path(), http.clone());
        let account = alice();

        write_lines(
            &state.layout.followers_file(&account.account_key()),
            &["bob@birch.example".to_string()],
        )
        .unwrap();
        seed_shared_inbox(&http, "birch.example");
        seed_remote_actor(&http, "bob", "birch.example");

        let mut update = Envelope::new(Kind::Update);
        update.id = Some(format!("{ACTOR}#updates/1"));
        update.actor = Some(account.actor_url.clone());
        update.to = vec![account.followers_url()];
        // The sender's own actor sneaks into cc; it must be skipped.
        update.cc = vec![ACTOR.to_string()];
        let mut person = Envelope::new(Kind::Person);
        person.id = Some(ACTOR.to_string());
        update.object = Some(ObjectRef::Node(Box::new(person)));

        let plan = plan_fanout(&state, &account, &update).await;
        // Single follower, but a profile update still takes the shared inbox.
        assert_eq!(plan.targets, vec!["https://birch.example/inbox".to_string()]);
    }

    #[tokio::test]
    async fn outbox_accept_wraps_persists_and_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let http = Arc::new(FakeHttp::new());
        let (state, _tx) = test_state(dir.path(), http.clone());
        let account = alice();

        seed_remote_actor(&http, "bob", "birch.example");
        let raw = json!({
            "type": "Note",
            "content": "hi bob",
            "to": ["https://birch.example/users/bob"],
        });

        let accepted = outbox_accept(&state, &account, raw).await.unwrap();
        assert!(accepted.activity_id.ends_with("/activity"));

        // Persisted as the wrapped s2s shape in the outbox box.
        let stored = state
            .store
            .list(&account.account_key(), BoxKind::Outbox, 10)
            .await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].kind, Kind::Create);
        assert_eq!(stored[0].inner().unwrap().content.as_deref(), Some("hi bob"));

        // Delivery happened in the background; the report channel sees it.
        let mut reports = accepted.reports;
        let report = tokio::time::timeout(Duration::from_secs(5), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(report.delivered);
        assert_eq!(report.inbox, "https://birch.example/users/bob/inbox");
        assert_eq!(http.post_count("https://birch.example/users/bob/inbox"), 1);
    }

    #[tokio::test]
    async fn outbox_accept_rejects_bad_input_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        let http = Arc::new(FakeHttp::new());
        let (state, _tx) = test_state(dir.path(), http.clone());
        let account = alice();

        // Foreign actor.
        let foreign = json!({
            "type": "Like",
            "actor": "https://birch.example/users/bob",
            "object": "https://dogwood.example/users/alice/statuses/1",
        });
        assert_eq!(
            outbox_accept(&state, &account, foreign).await.err(),
            Some(OutboxRejection::Invalid("actor mismatch"))
        );

        // Create without recipients.
        let no_to = json!({
            "type": "Create",
            "object": {"type": "Note", "content": "x"},
        });
        assert!(matches!(
            outbox_accept(&state, &account, no_to).await.err(),
            Some(OutboxRejection::Invalid(_))
        ));

        // Dangerous markup.
        let markup = json!({
            "type": "Note",
            "content": "<script>alert(1)</script>",
            "to": [AS_PUBLIC],
        });
        assert_eq!(
            outbox_accept(&state, &account, markup).await.err(),
            Some(OutboxRejection::DangerousMarkup)
        );
    }

    #[tokio::test]
    async fn articles_land_in_the_blog_box() {
        let dir = tempfile::tempdir().unwrap();
        let http = Arc::new(FakeHttp::new());
        let (state, _tx) = test_state(dir.path(), http.clone());
        let account = alice();

        let raw = json!({
            "type": "Article",
            "content": "long form",
            "to": [AS_PUBLIC],
        });
        outbox_accept(&state, &account, raw).await.unwrap();
        assert_eq!(
            state.store.list(&account.account_key(), BoxKind::TlBlogs, 10).await.len(),
            1
        );
        assert!(state.store.list(&account.account_key(), BoxKind::Outbox, 10).await.is_empty());
    }

    #[tokio::test]
    async fn self_blocked_account_cannot_publish() {
        let dir = tempfile::tempdir().unwrap();
        let http = Arc::new(FakeHttp::new());
        let (state, _tx) = test_state(dir.path(), http.clone());
        let account = alice();

        state
            .engine
            .add_account_block(&account.account_key(), "alice@dogwood.example")
            .await
            .unwrap();

        let raw = json!({"type": "Note", "content": "void", "to": [AS_PUBLIC]});
        assert_eq!(
            outbox_accept(&state, &account, raw).await.err(),
            Some(OutboxRejection::SelfBlocked)
        );
    }
}
