/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::transport::{Fetched, HttpFetch, PostOutcome, RequestKey};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;

/// Recording HTTP fake: canned JSON per GET url, scripted status codes per
/// POST url, and a dead-domain set for liveness probes.
#[derive(Default)]
pub struct FakeHttp {
    json: Mutex<HashMap<String, Value>>,
    get_calls: Mutex<Vec<String>>,
    posts: Mutex<Vec<(String, Vec<u8>)>>,
    post_scripts: Mutex<HashMap<String, Vec<u16>>>,
    default_post_status: AtomicU16,
    dead_domains: Mutex<HashSet<String>>,
}

impl FakeHttp {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.default_post_status.store(202, Ordering::SeqCst);
        fake
    }

    pub fn insert_json(&self, url: &str, value: Value) {
        self.json.lock().unwrap().insert(url.to_string(), value);
    }

    pub fn set_default_post_status(&self, status: u16) {
        self.default_post_status.store(status, Ordering::SeqCst);
    }

    /// Statuses consumed one per POST to `url`; afterwards the default applies.
    pub fn script_post_statuses(&self, url: &str, statuses: Vec<u16>) {
        self.post_scripts.lock().unwrap().insert(url.to_string(), statuses);
    }

    pub fn mark_domain_dead(&self, domain: &str) {
        self.dead_domains.lock().unwrap().insert(domain.to_string());
    }

    pub fn get_calls(&self) -> Vec<String> {
        self.get_calls.lock().unwrap().clone()
    }

    pub fn posts(&self) -> Vec<(String, Vec<u8>)> {
        self.posts.lock().unwrap().clone()
    }

    pub fn post_count(&self, url: &str) -> usize {
        self.posts.lock().unwrap().iter().filter(|(u, _)| u == url).count()
    }
}

#[async_trait]
impl HttpFetch for FakeHttp {
    async fn get(&self, url: &str, _accept: &str, _key: Option<&RequestKey>) -> Fetched {
        self.get_calls.lock().unwrap().push(url.to_string());
        match self.json.lock().unwrap().get(url) {
            Some(v) => Fetched::Json(v.clone()),
            None => Fetched::Absent(404),
        }
    }

    async fn post_json(
        &self,
        url: &str,
        body: &[u8],
        _extra_headers: &[(String, String)],
        _key: Option<&RequestKey>,
    ) -> PostOutcome {
        self.posts.lock().unwrap().push((url.to_string(), body.to_vec()));
        let status = {
            let mut scripts = self.post_scripts.lock().unwrap();
            match scripts.get_mut(url) {
                Some(seq) if !seq.is_empty() => seq.remove(0),
                _ => self.default_post_status.load(Ordering::SeqCst),
            }
        };
        PostOutcome {
            accepted: (200..300).contains(&status),
            unauthorized: (401..=405).contains(&status) && status != 404,
            status: Some(status),
        }
    }

    async fn probe_domain(&self, domain: &str) -> bool {
        !self.dead_domains.lock().unwrap().contains(domain)
    }
}
