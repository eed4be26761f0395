/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::account::LocalAccount;
use crate::box_store::{BoxStore, Sidecar};
use crate::posts::post_object_mut;
use crate::recent_cache::RecentPostsCache;
use aelurodon_protocol::{Collection, Envelope, Kind};
use anyhow::Result;
use tracing::debug;

/// Mutes a post for one actor: flips the `muted` flag on the stored JSON,
/// appends a deduplicated `Ignore` marker to the post's `ignores`
/// collection, drops cached renders (including the announce target's) and
/// writes the `.muted` sidecar. Muting an already-muted post by the same
/// actor adds nothing.
pub async fn mute_post(
    store: &BoxStore,
    recent: &RecentPostsCache,
    account: &str,
    post_id: &str,
    muting_actor: &str,
) -> Result<bool> {
    let Some((box_kind, mut env)) = store.locate(account, post_id).await? else {
        return Ok(false);
    };

    let share_target = share_target(&env);
    let object = post_object_mut(&mut env);

    let ignores = object.ignores.get_or_insert_with(|| {
        Collection::empty(Some(format!("{post_id}/ignores")))
    });
    let already = ignores
        .items
        .iter()
        .any(|entry| entry.actor.as_deref() == Some(muting_actor));
    if !already {
        let mut marker = Envelope::new(Kind::Ignore);
        marker.actor = Some(muting_actor.to_string());
        ignores.items.push(marker);
    }
    ignores.total_items = ignores.items.len() as u64;
    object.muted = Some(true);

    store.update(account, box_kind, &env).await?;
    store.set_sidecar(account, box_kind, post_id, Sidecar::Muted)?;

    recent.invalidate(post_id);
    if let Some(target) = share_target {
        recent.invalidate(&target);
    }
    debug!("muted {post_id} for {muting_actor}");
    Ok(true)
}

/// Exact reverse of [`mute_post`]; the `ignores` collection disappears
/// entirely once its last entry is removed.
pub async fn unmute_post(
    store: &BoxStore,
    recent: &RecentPostsCache,
    account: &str,
    post_id: &str,
    muting_actor: &str,
) -> Result<bool> {
    let Some((box_kind, mut env)) = store.locate(account, post_id).await? else {
        return Ok(false);
    };

    let share_target = share_target(&env);
    let object = post_object_mut(&mut env);

    if let Some(ignores) = object.ignores.as_mut() {
        ignores
            .items
            .retain(|entry| entry.actor.as_deref() != Some(muting_actor));
        ignores.total_items = ignores.items.len() as u64;
        if ignores.items.is_empty() {
            object.ignores = None;
        }
    }
    object.muted = None;

    store.update(account, box_kind, &env).await?;
    store.clear_sidecar(account, box_kind, post_id, Sidecar::Muted);

    recent.invalidate(post_id);
    if let Some(target) = share_target {
        recent.invalidate(&target);
    }
    Ok(true)
}

/// For an announce, the cached render of the shared post is stale too.
fn share_target(env: &Envelope) -> Option<String> {
    if env.kind == Kind::Announce {
        env.object_id().map(|s| s.to_string())
    } else {
        None
    }
}

/// c2s `Ignore` acceptance. Every check failing is a silent no-op: wrong
/// type, foreign actor, or an object that is not a locatable post.
pub async fn outbox_mute(
    store: &BoxStore,
    recent: &RecentPostsCache,
    account: &LocalAccount,
    activity: &Envelope,
) -> Option<bool> {
    if activity.kind != Kind::Ignore {
        return None;
    }
    if activity.actor.as_deref() != Some(account.actor_url.as_str()) {
        return None;
    }
    let post_id = activity.object_id()?;
    match mute_post(store, recent, &account.account_key(), post_id, &account.actor_url).await {
        Ok(true) => Some(true),
        _ => None,
    }
}

pub async fn outbox_undo_mute(
    store: &BoxStore,
    recent: &RecentPostsCache,
    account: &LocalAccount,
    activity: &Envelope,
) -> Option<bool> {
    if activity.kind != Kind::Undo {
        return None;
    }
    if activity.actor.as_deref() != Some(account.actor_url.as_str()) {
        return None;
    }
    let inner = activity.inner()?;
    if inner.kind != Kind::Ignore {
        return None;
    }
    let post_id = inner.object_id()?;
    match unmute_post(store, recent, &account.account_key(), post_id, &account.actor_url).await {
        Ok(true) => Some(true),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Handle;
    use crate::box_store::BoxKind;
    use crate::keys::AccountKeys;
    use crate::layout::DataLayout;
    use crate::locks::AccountLocks;
    use crate::recent_cache::CachedPost;
    use aelurodon_protocol::ObjectRef;
    use std::sync::Arc;

    const ACCOUNT: &str = "mod@x.example";
    const MOD: &str = "https://x.example/users/mod";

    fn fixtures(dir: &std::path::Path) -> (BoxStore, RecentPostsCache) {
        (
            BoxStore::new(DataLayout::new(dir), Arc::new(AccountLocks::new())),
            RecentPostsCache::new(16),
        )
    }

    fn local_account() -> LocalAccount {
        LocalAccount {
            handle: Handle::new("mod", "x.example"),
            actor_url: MOD.to_string(),
            keys: AccountKeys {
                private_key_pem: String::new(),
                public_key_pem: String::new(),
                key_id: format!("{MOD}#main-key"),
            },
        }
    }

    async fn seed_note(store: &BoxStore, id: &str) -> Envelope {
        let mut env = Envelope::new(Kind::Note);
        env.id = Some(id.to_string());
        env.attributed_to = Some(MOD.to_string());
        env.content = Some("a post".to_string());
        store
            .save(ACCOUNT, BoxKind::Inbox, &mut env, MOD, false)
            .await
            .unwrap();
        env
    }

    #[tokio::test]
    async fn mute_builds_the_ignores_collection_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let (store, recent) = fixtures(dir.path());
        let post_id = "https://x.example/statuses/1";
        seed_note(&store, post_id).await;
        recent.insert(post_id, CachedPost {
            activity: Envelope::new(Kind::Note),
            rendered: Some("<p>a post</p>".to_string()),
        });

        assert!(mute_post(&store, &recent, ACCOUNT, post_id, MOD).await.unwrap());

        let muted = store.load(ACCOUNT, BoxKind::Inbox, post_id).await.unwrap().unwrap();
        assert_eq!(muted.muted, Some(true));
        let ignores = muted.ignores.as_ref().unwrap();
        assert_eq!(ignores.total_items, 1);
        assert_eq!(ignores.items.len(), 1);
        assert_eq!(ignores.items[0].kind, Kind::Ignore);
        assert_eq!(ignores.items[0].actor.as_deref(), Some(MOD));
        assert!(store.has_sidecar(ACCOUNT, BoxKind::Inbox, post_id, Sidecar::Muted));
        // Cached render dropped.
        assert!(recent.get(post_id).is_none());
    }

    #[tokio::test]
    async fn unmute_of_mute_restores_the_post_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let (store, recent) = fixtures(dir.path());
        let post_id = "https://x.example/statuses/1";
        let original = seed_note(&store, post_id).await;

        mute_post(&store, &recent, ACCOUNT, post_id, MOD).await.unwrap();
        unmute_post(&store, &recent, ACCOUNT, post_id, MOD).await.unwrap();

        let restored = store.load(ACCOUNT, BoxKind::Inbox, post_id).await.unwrap().unwrap();
        // Collection deleted entirely because totalItems was exactly 1.
        assert!(restored.ignores.is_none());
        assert!(restored.muted.is_none());
        assert_eq!(restored, original);
        assert!(!store.has_sidecar(ACCOUNT, BoxKind::Inbox, post_id, Sidecar::Muted));
    }

    #[tokio::test]
    async fn repeated_mute_by_same_actor_adds_no_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let (store, recent) = fixtures(dir.path());
        let post_id = "https://x.example/statuses/1";
        seed_note(&store, post_id).await;

        mute_post(&store, &recent, ACCOUNT, post_id, MOD).await.unwrap();
        mute_post(&store, &recent, ACCOUNT, post_id, MOD).await.unwrap();

        let muted = store.load(ACCOUNT, BoxKind::Inbox, post_id).await.unwrap().unwrap();
        assert_eq!(muted.ignores.as_ref().unwrap().total_items, 1);
    }

    #[tokio::test]
    async fn second_actor_leaves_collection_after_first_unmutes() {
        let dir = tempfile::tempdir().unwrap();
        let (store, recent) = fixtures(dir.path());
        let post_id = "https://x.example/statuses/1";
        seed_note(&store, post_id).await;
        let other = "https://x.example/users/aide";

        mute_post(&store, &recent, ACCOUNT, post_id, MOD).await.unwrap();
        mute_post(&store, &recent, ACCOUNT, post_id, other).await.unwrap();
        unmute_post(&store, &recent, ACCOUNT, post_id, MOD).await.unwrap();

        let env = store.load(ACCOUNT, BoxKind::Inbox, post_id).await.unwrap().unwrap();
        let ignores = env.ignores.as_ref().unwrap();
        assert_eq!(ignores.total_items, 1);
        assert_eq!(ignores.items[0].actor.as_deref(), Some(other));
    }

    #[tokio::test]
    async fn muting_an_announce_invalidates_the_shared_post_too() {
        let dir = tempfile::tempdir().unwrap();
        let (store, recent) = fixtures(dir.path());
        let announce_id = "https://x.example/statuses/2";
        let shared_id = "https://birch.example/users/bob/statuses/9";

        let mut announce = Envelope::new(Kind::Announce);
        announce.id = Some(announce_id.to_string());
        announce.actor = Some(MOD.to_string());
        announce.object = Some(ObjectRef::Reference(shared_id.to_string()));
        store
            .save(ACCOUNT, BoxKind::Inbox, &mut announce, MOD, false)
            .await
            .unwrap();

        recent.insert(shared_id, CachedPost {
            activity: Envelope::new(Kind::Note),
            rendered: Some("<p>shared</p>".to_string()),
        });
        mute_post(&store, &recent, ACCOUNT, announce_id, MOD).await.unwrap();
        assert!(recent.get(shared_id).is_none());
    }

    #[tokio::test]
    async fn outbox_mute_silently_rejects_bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let (store, recent) = fixtures(dir.path());
        let acct = local_account();
        let post_id = "https://x.example/statuses/1";
        seed_note(&store, post_id).await;

        // Wrong type.
        let mut like = Envelope::new(Kind::Like);
        like.actor = Some(MOD.to_string());
        like.object = Some(ObjectRef::Reference(post_id.to_string()));
        assert!(outbox_mute(&store, &recent, &acct, &like).await.is_none());

        // Foreign actor.
        let mut foreign = Envelope::new(Kind::Ignore);
        foreign.actor = Some("https://birch.example/users/bob".to_string());
        foreign.object = Some(ObjectRef::Reference(post_id.to_string()));
        assert!(outbox_mute(&store, &recent, &acct, &foreign).await.is_none());

        // Unlocatable object.
        let mut missing = Envelope::new(Kind::Ignore);
        missing.actor = Some(MOD.to_string());
        missing.object = Some(ObjectRef::Reference("https://x.example/statuses/404".to_string()));
        assert!(outbox_mute(&store, &recent, &acct, &missing).await.is_none());

        // And the valid shape goes through, reversible via Undo.
        let mut good = Envelope::new(Kind::Ignore);
        good.actor = Some(MOD.to_string());
        good.object = Some(ObjectRef::Reference(post_id.to_string()));
        assert_eq!(outbox_mute(&store, &recent, &acct, &good).await, Some(true));

        let mut undo = Envelope::new(Kind::Undo);
        undo.actor = Some(MOD.to_string());
        undo.object = Some(ObjectRef::Node(Box::new(good)));
        assert_eq!(outbox_undo_mute(&store, &recent, &acct, &undo).await, Some(true));
        let env = store.load(ACCOUNT, BoxKind::Inbox, post_id).await.unwrap().unwrap();
        assert!(env.ignores.is_none());
    }
}
