/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use aelurodon_protocol::Envelope;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Clone)]
pub struct CachedPost {
    pub activity: Envelope,
    /// Rendered HTML, filled in lazily by the presentation layer.
    pub rendered: Option<String>,
}

/// Process-wide cache of recently touched posts, shared between the request
/// path and background delivery workers. Constructed once at startup and
/// passed by reference; all mutation goes through the inner mutex.
pub struct RecentPostsCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    map: HashMap<String, CachedPost>,
    order: VecDeque<String>,
}

impl RecentPostsCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity,
        }
    }

    pub fn insert(&self, post_id: &str, entry: CachedPost) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.map.insert(post_id.to_string(), entry).is_none() {
            inner.order.push_back(post_id.to_string());
        }
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.map.remove(&evicted);
            }
        }
    }

    pub fn get(&self, post_id: &str) -> Option<CachedPost> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map
            .get(post_id)
            .cloned()
    }

    /// Drops any cached render for the post (mute/unmute, edits).
    pub fn invalidate(&self, post_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.map.remove(post_id);
        inner.order.retain(|id| id != post_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
