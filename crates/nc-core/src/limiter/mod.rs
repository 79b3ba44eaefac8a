//! Inline limiter: per-connection speed throttling and device counting.
//!
//! One [`InboundLimits`] per inbound tag holds the node limit, the per-user
//! limits, lazily created token buckets and the online-IP book for the
//! current report cycle. The dispatcher calls [`Limiter::check`] on every
//! accepted link; the controller owns add/update/delete; the report task
//! drains the online book.

mod bucket;
mod global;

pub use bucket::{CountingWriter, RateLimitedWriter, TokenBucket};
pub use global::GlobalLimiter;

use crate::tag;
use dashmap::DashMap;
use nc_panel::types::{OnlineUser, UserInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("no such inbound in limiter: {0}")]
    NoSuchInbound(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UserLimit {
    pub uid: i64,
    /// Bytes per second; 0 = unlimited.
    pub speed_limit: u64,
    /// 0 = unlimited.
    pub device_limit: i32,
}

/// Outcome of an admission check.
#[derive(Default)]
pub struct Admission {
    pub bucket: Option<Arc<TokenBucket>>,
    pub speed_limited: bool,
    pub reject: bool,
}

impl Admission {
    fn reject() -> Self {
        Self {
            reject: true,
            ..Default::default()
        }
    }
}

struct InboundLimits {
    node_speed_limit: u64,
    /// Keyed by user tag.
    users: DashMap<String, UserLimit>,
    buckets: DashMap<String, Arc<TokenBucket>>,
    /// User tag → (source ip → uid); inner map serialized per email.
    online: DashMap<String, Mutex<HashMap<String, i64>>>,
    global: Option<Arc<GlobalLimiter>>,
}

#[derive(Default)]
pub struct Limiter {
    inbounds: DashMap<String, Arc<InboundLimits>>,
}

/// `min` of two limits where 0 means unlimited.
pub fn effective_rate(node_limit: u64, user_limit: u64) -> u64 {
    match (node_limit, user_limit) {
        (0, user) => user,
        (node, 0) => node,
        (node, user) => node.min(user),
    }
}

impl Limiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// (Re)initialize the state for a tag. Called on startup and after a
    /// full tag swap; any previous state for the tag is discarded.
    pub fn add(
        &self,
        inbound_tag: &str,
        node_speed_limit: u64,
        users: &[UserInfo],
        global: Option<Arc<GlobalLimiter>>,
    ) {
        let limits = InboundLimits {
            node_speed_limit,
            users: DashMap::new(),
            buckets: DashMap::new(),
            online: DashMap::new(),
            global,
        };
        for user in users {
            limits.users.insert(
                tag::user_tag(inbound_tag, &user.email, user.uid),
                UserLimit {
                    uid: user.uid,
                    speed_limit: user.speed_limit,
                    device_limit: user.device_limit,
                },
            );
        }
        self.inbounds.insert(inbound_tag.to_string(), Arc::new(limits));
    }

    /// Merge user updates. A bucket whose effective limit drops to zero is
    /// deleted so a fresh one is created on the next admission; a nonzero
    /// one is retuned in place.
    pub fn update(&self, inbound_tag: &str, users: &[UserInfo]) -> Result<(), LimiterError> {
        let limits = self
            .inbounds
            .get(inbound_tag)
            .map(|l| l.clone())
            .ok_or_else(|| LimiterError::NoSuchInbound(inbound_tag.to_string()))?;
        for user in users {
            let user_tag = tag::user_tag(inbound_tag, &user.email, user.uid);
            limits.users.insert(
                user_tag.clone(),
                UserLimit {
                    uid: user.uid,
                    speed_limit: user.speed_limit,
                    device_limit: user.device_limit,
                },
            );
            let rate = effective_rate(limits.node_speed_limit, user.speed_limit);
            if rate > 0 {
                if let Some(bucket) = limits.buckets.get(&user_tag) {
                    bucket.set_rate(rate);
                }
            } else {
                limits.buckets.remove(&user_tag);
            }
        }
        Ok(())
    }

    pub fn delete(&self, inbound_tag: &str) {
        self.inbounds.remove(inbound_tag);
    }

    pub fn has_inbound(&self, inbound_tag: &str) -> bool {
        self.inbounds.contains_key(inbound_tag)
    }

    /// Admission check for one new link.
    ///
    /// `email` is the engine-level user tag. The insert-and-count on the
    /// online book is atomic per email; a rejected IP leaves no trace.
    pub async fn check(&self, inbound_tag: &str, email: &str, ip: &str) -> Admission {
        let Some(limits) = self.inbounds.get(inbound_tag).map(|l| l.clone()) else {
            tracing::debug!(inbound_tag, "admission check for unknown inbound");
            return Admission::default();
        };
        let user = limits.users.get(email).map(|u| *u).unwrap_or_default();

        // Local device accounting.
        let mut is_new_ip = false;
        {
            let entry = limits
                .online
                .entry(email.to_string())
                .or_insert_with(|| Mutex::new(HashMap::new()));
            let mut ips = entry.lock();
            if !ips.contains_key(ip) {
                is_new_ip = true;
                ips.insert(ip.to_string(), user.uid);
                if user.device_limit > 0 && ips.len() as i32 > user.device_limit {
                    ips.remove(ip);
                    return Admission::reject();
                }
            }
        }

        // Fleet-wide accounting, only consulted for IPs the local book has
        // just admitted.
        if is_new_ip && user.device_limit > 0 {
            if let Some(global) = &limits.global {
                let panel_email = email.split_once('|').map(|(_, rest)| rest).unwrap_or(email);
                if global.check(panel_email, ip, user.device_limit).await {
                    if let Some(entry) = limits.online.get(email) {
                        entry.lock().remove(ip);
                    }
                    return Admission::reject();
                }
            }
        }

        let rate = effective_rate(limits.node_speed_limit, user.speed_limit);
        if rate == 0 {
            return Admission::default();
        }
        let bucket = limits
            .buckets
            .entry(email.to_string())
            .or_insert_with(|| TokenBucket::new(rate))
            .clone();
        Admission {
            bucket: Some(bucket),
            speed_limited: true,
            reject: false,
        }
    }

    /// Return the accumulated online devices for a tag and reset the book.
    ///
    /// Buckets of users with no traffic this cycle are dropped so that a
    /// later admission rebuilds them at the current rate.
    pub fn drain_online(&self, inbound_tag: &str) -> Result<Vec<OnlineUser>, LimiterError> {
        let limits = self
            .inbounds
            .get(inbound_tag)
            .map(|l| l.clone())
            .ok_or_else(|| LimiterError::NoSuchInbound(inbound_tag.to_string()))?;

        limits
            .buckets
            .retain(|email, _| limits.online.contains_key(email));

        let mut online = Vec::new();
        let emails: Vec<String> = limits.online.iter().map(|e| e.key().clone()).collect();
        for email in emails {
            if let Some((_, ips)) = limits.online.remove(&email) {
                for (ip, uid) in ips.into_inner() {
                    online.push(OnlineUser { uid, ip });
                }
            }
        }
        Ok(online)
    }
}
