/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::account::{valid_nickname, Handle, LocalAccount};
use crate::box_store::BoxStore;
use crate::layout::{append_line, read_lines, DataLayout};
use aelurodon_protocol::{
    Attachment, Envelope, Kind, ObjectRef, Tag, AS_CONTEXT, AS_PUBLIC, SECURITY_CONTEXT,
};
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub struct NewPost<'a> {
    pub kind: Kind,
    /// Primary audience: `AS_PUBLIC`, a `/followers` collection URL, or a
    /// specific actor URL.
    pub audience: String,
    pub cc_followers: bool,
    pub content: &'a str,
    /// Content warning; presence implies `sensitive`.
    pub summary: Option<&'a str>,
    pub language: &'a str,
    pub attachments: Vec<Attachment>,
    /// The parent post object when this is a reply.
    pub in_reply_to: Option<&'a Envelope>,
    pub conversation: Option<String>,
}

impl<'a> NewPost<'a> {
    pub fn public_note(content: &'a str) -> Self {
        Self {
            kind: Kind::Note,
            audience: AS_PUBLIC.to_string(),
            cc_followers: true,
            content,
            summary: None,
            language: "en",
            attachments: Vec::new(),
            in_reply_to: None,
            conversation: None,
        }
    }
}

/// Builds the client-to-server (flat) shape of a post. The outbox handler
/// wraps it in `Create` for the wire.
pub async fn build_post(
    store: &BoxStore,
    layout: &DataLayout,
    account: &LocalAccount,
    params: NewPost<'_>,
) -> Result<Envelope> {
    if !params.kind.is_post() {
        return Err(anyhow!("not a post type: {}", params.kind.as_str()));
    }

    let id = store.new_post_id(&account.actor_url);
    let parent = params.in_reply_to.map(post_object);

    let mentions = extract_mentions(params.content, &account.handle.domain);
    let hashtags = extract_hashtags(params.content);

    // CW precedence: explicit, else inherited from a CW'd parent; automatic
    // rules accumulate after either.
    let mut summary = params
        .summary
        .map(|s| s.to_string())
        .or_else(|| parent.and_then(|p| p.summary.clone()));
    let rules = load_auto_cw_rules(layout, &account.account_key());
    summary = apply_auto_cw(&rules, params.content, summary);

    let mut env = Envelope::new(params.kind.clone());
    env.context = Some(serde_json::json!([AS_CONTEXT, SECURITY_CONTEXT]));
    env.id = Some(id.clone());
    env.attributed_to = Some(account.actor_url.clone());
    env.published = Some(now_rfc3339());
    env.content = Some(params.content.to_string());
    env.content_map = Some(BTreeMap::from([(
        params.language.to_string(),
        params.content.to_string(),
    )]));
    env.sensitive = Some(summary.is_some());
    env.summary = summary;
    env.attachment = params.attachments;
    env.in_reply_to = parent.and_then(|p| p.id.clone());
    env.conversation = params
        .conversation
        .or_else(|| parent.and_then(|p| p.conversation.clone()))
        .or_else(|| Some(id.clone()));
    env.replies = Some(serde_json::json!({
        "id": format!("{id}/replies"),
        "type": "Collection",
        "totalItems": 0,
        "items": [],
    }));

    // Addressing: the primary audience goes in `to`, everyone else in `cc`.
    // Mention targets always land in `cc` so followers-only delivery cannot
    // suppress them.
    env.to = vec![params.audience.clone()];
    if params.cc_followers && params.audience != account.followers_url() {
        env.cc.push(account.followers_url());
    }

    let base = instance_base(&account.actor_url);
    for handle in &mentions {
        let actor_guess = format!("https://{}/users/{}", handle.domain, handle.nickname);
        env.tag.push(Tag {
            kind: Kind::Mention,
            name: Some(format!("@{handle}")),
            href: Some(actor_guess.clone()),
        });
        if !env.has_recipient(&actor_guess) {
            env.cc.push(actor_guess);
        }
    }
    for tag in &hashtags {
        env.tag.push(Tag {
            kind: Kind::Hashtag,
            name: Some(format!("#{tag}")),
            href: Some(format!("{base}/tags/{tag}")),
        });
    }

    // The per-tag index only ever sees public posts.
    if env.is_public() {
        index_hashtags(layout, &account.account_key(), &id, &hashtags)?;
    }

    Ok(env)
}

/// Server-to-server shape: an explicit outer `Create` whose id, published
/// and addressing stay consistent with the inner object.
pub fn wrap_create(actor_url: &str, object: Envelope) -> Envelope {
    let mut create = Envelope::new(Kind::Create);
    create.context = object.context.clone();
    create.id = object.id.as_ref().map(|id| format!("{id}/activity"));
    create.actor = Some(actor_url.to_string());
    create.published = object.published.clone();
    create.to = object.to.clone();
    create.cc = object.cc.clone();
    create.object = Some(ObjectRef::Node(Box::new(object)));
    create
}

/// The post object inside an activity wrapper, or the envelope itself.
pub fn post_object(env: &Envelope) -> &Envelope {
    match env.kind {
        Kind::Create | Kind::Update | Kind::Announce => env.inner().unwrap_or(env),
        _ => env,
    }
}

pub fn post_object_mut(env: &mut Envelope) -> &mut Envelope {
    let wrapped = matches!(env.kind, Kind::Create | Kind::Update | Kind::Announce);
    if wrapped && matches!(env.object, Some(ObjectRef::Node(_))) {
        match env.object.as_mut() {
            Some(ObjectRef::Node(node)) => node,
            _ => unreachable!(),
        }
    } else {
        env
    }
}

/// `@nick@domain` and bare `@nick` tokens; bare nicknames resolve to the
/// local domain. Illegal nicknames are dropped, not errors.
pub fn extract_mentions(content: &str, local_domain: &str) -> Vec<Handle> {
    let mut out = Vec::new();
    for token in content.split(|c: char| c.is_whitespace() || matches!(c, '<' | '>' | '(' | ')' | ',')) {
        let Some(rest) = token.strip_prefix('@') else {
            continue;
        };
        let rest = rest.trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?'));
        if rest.is_empty() {
            continue;
        }
        let handle = match rest.split_once('@') {
            Some((nick, domain)) => {
                if !valid_nickname(nick) || !domain.contains('.') {
                    continue;
                }
                Handle::new(nick, domain)
            }
            None => {
                if !valid_nickname(rest) {
                    continue;
                }
                Handle::new(rest, local_domain)
            }
        };
        if !out.contains(&handle) {
            out.push(handle);
        }
    }
    out
}

pub fn extract_hashtags(content: &str) -> Vec<String> {
    let mut out = Vec::new();
    for token in content.split(|c: char| c.is_whitespace() || matches!(c, '<' | '>' | '(' | ')' | ',')) {
        let Some(rest) = token.strip_prefix('#') else {
            continue;
        };
        let tag: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        if tag.is_empty() {
            continue;
        }
        let tag = tag.to_ascii_lowercase();
        if !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

/// `autocw.txt` rules, one per line: `match -> warning text`.
pub fn load_auto_cw_rules(layout: &DataLayout, account: &str) -> Vec<(String, String)> {
    read_lines(&layout.auto_cw_file(account))
        .iter()
        .filter_map(|line| {
            let (pattern, warning) = line.split_once("->")?;
            let pattern = pattern.trim();
            let warning = warning.trim();
            if pattern.is_empty() || warning.is_empty() {
                return None;
            }
            Some((pattern.to_string(), warning.to_string()))
        })
        .collect()
}

/// Each rule line fires at most once, in file order; warnings accumulate
/// comma-joined after any existing CW text and duplicates are dropped.
/// Later rules never suppress earlier ones.
pub fn apply_auto_cw(
    rules: &[(String, String)],
    content: &str,
    existing: Option<String>,
) -> Option<String> {
    let mut warnings: Vec<String> = existing
        .iter()
        .flat_map(|s| s.split(','))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    for (pattern, warning) in rules {
        if content.contains(pattern.as_str()) && !warnings.iter().any(|w| w == warning) {
            warnings.push(warning.clone());
        }
    }

    if warnings.is_empty() {
        None
    } else {
        Some(warnings.join(", "))
    }
}

fn index_hashtags(
    layout: &DataLayout,
    account: &str,
    post_id: &str,
    tags: &[String],
) -> Result<()> {
    for tag in tags {
        append_line(&layout.tag_file(account, tag), post_id)?;
    }
    Ok(())
}

/// Markup that must never leave the outbox.
pub fn contains_dangerous_markup(content: &str) -> bool {
    let lower = content.to_ascii_lowercase();
    const FORBIDDEN: &[&str] = &[
        "<script",
        "<iframe",
        "<object",
        "<embed",
        "<applet",
        "<meta",
        "javascript:",
        "onclick=",
        "onload=",
        "onerror=",
    ];
    FORBIDDEN.iter().any(|needle| lower.contains(needle))
}

fn instance_base(actor_url: &str) -> String {
    match actor_url.find("/users/") {
        Some(idx) => actor_url[..idx].to_string(),
        None => actor_url.trim_end_matches('/').to_string(),
    }
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .replace_nanosecond(0)
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .format(&Rfc3339)
        .unwrap_or_default()
}
