/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::blocking::BlockEngine;
use crate::layout::{write_lines, DataLayout};
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, warn};

/// Known aggressive crawlers, blocked before any heuristics run.
const DEFAULT_UA_BLOCK: &[&str] = &[
    "Bytespider",
    "PetalBot",
    "SemrushBot",
    "AhrefsBot",
    "MJ12bot",
    "DotBot",
    "DataForSeoBot",
];

/// User-agent gate in front of the HTTP surface. Decision order: compiled
/// block list, bot heuristics (with the news-instance / crawler allow-list
/// escape), the configured UA substring list, and finally the domain
/// embedded in the UA string through the domain blocking engine.
pub struct CrawlerFilter {
    layout: DataLayout,
    news_instance: bool,
    crawler_allow: Vec<String>,
    ua_block: Vec<String>,
    known_bots: Mutex<BTreeSet<String>>,
}

impl CrawlerFilter {
    pub fn new(
        layout: DataLayout,
        news_instance: bool,
        mut crawler_allow: Vec<String>,
        ua_block: Vec<String>,
    ) -> Self {
        let known_bots = crate::layout::read_lines(&layout.known_bots_file())
            .into_iter()
            .collect();
        // Operator-curated crawler allow list persisted next to the bots file.
        if let Ok(text) = std::fs::read_to_string(layout.known_crawlers_file()) {
            if let Ok(extra) = serde_json::from_str::<Vec<String>>(&text) {
                crawler_allow.extend(extra);
            }
        }
        crawler_allow.sort();
        crawler_allow.dedup();
        Self {
            layout,
            news_instance,
            crawler_allow,
            ua_block,
            known_bots: Mutex::new(known_bots),
        }
    }

    /// Returns the decision plus the block-cache refresh timestamp the
    /// domain check ran against. A missing UA header fails closed.
    pub async fn ua_blocked(
        &self,
        engine: &BlockEngine,
        user_agent: Option<&str>,
    ) -> (bool, Option<Instant>) {
        let cache_ts = engine.cache_refreshed_at().await;
        let Some(ua) = user_agent.map(str::trim).filter(|s| !s.is_empty()) else {
            return (true, cache_ts);
        };

        if DEFAULT_UA_BLOCK.iter().any(|needle| ua.contains(needle)) {
            debug!("ua blocked (default list): {ua}");
            return (true, cache_ts);
        }

        if is_bot_user_agent(ua) {
            self.record_known_bot(ua);
            let allowed = self.news_instance
                || self.crawler_allow.iter().any(|allow| ua.contains(allow.as_str()));
            if !allowed {
                debug!("ua blocked (bot heuristic): {ua}");
                return (true, cache_ts);
            }
        }

        if self.ua_block.iter().any(|needle| ua.contains(needle.as_str())) {
            debug!("ua blocked (instance list): {ua}");
            return (true, cache_ts);
        }

        if let Some(domain) = domain_from_user_agent(ua) {
            if engine.is_actor_blocked("", &domain).await {
                debug!("ua blocked (domain {domain}): {ua}");
                return (true, cache_ts);
            }
        }

        (false, cache_ts)
    }

    fn record_known_bot(&self, ua: &str) {
        let mut bots = self.known_bots.lock().unwrap_or_else(|e| e.into_inner());
        if !bots.insert(ua.to_string()) {
            return;
        }
        // BTreeSet keeps the persisted list sorted and deduplicated.
        let lines: Vec<String> = bots.iter().cloned().collect();
        if let Err(e) = write_lines(&self.layout.known_bots_file(), &lines) {
            warn!("persist known bots: {e:#}");
        }
    }

    pub fn known_bots(&self) -> Vec<String> {
        self.known_bots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// `bot/`, `bot-`, `/bot` and `/robot` substrings mark a bot, but a `/bot`
/// that is part of a `://bot...` URL does not.
pub fn is_bot_user_agent(ua: &str) -> bool {
    let lower = ua.to_ascii_lowercase().replace("://", "\0\0\0");
    lower.contains("bot/")
        || lower.contains("bot-")
        || lower.contains("/bot")
        || lower.contains("/robot")
}

/// Crawler UAs conventionally embed their operator's URL.
fn domain_from_user_agent(ua: &str) -> Option<String> {
    let idx = ua.find("https://").map(|i| i + 8).or_else(|| ua.find("http://").map(|i| i + 7))?;
    let host: String = ua[idx..]
        .chars()
        .take_while(|c| !matches!(c, '/' | ')' | ';' | ',' | ' ' | '+'))
        .collect();
    if host.is_empty() || !host.contains('.') {
        return None;
    }
    Some(crate::account::normalize_domain(&host))
}
