//! The engine surface the controller writes to: inbound/outbound handler
//! managers, per-inbound user registries, and the stats counters the report
//! task drains.
//!
//! The controller is the sole writer; the dispatcher and report task only
//! read. Counters are engine-native and keyed
//! `user>>>{user_tag}>>>traffic>>>{uplink,downlink}`.

mod config;

pub use config::*;

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("handler already exists: {0}")]
    HandlerExists(String),
    #[error("no such inbound tag: {0}")]
    NoSuchHandler(String),
    #[error("user already exists on {tag}: {email}")]
    UserExists { tag: String, email: String },
    #[error("no such user on {tag}: {email}")]
    NoSuchUser { tag: String, email: String },
}

/// A monotonically increasing traffic counter with explicit reset.
#[derive(Debug, Default)]
pub struct StatCounter {
    value: AtomicI64,
}

impl StatCounter {
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::Relaxed) + delta
    }

    pub fn set(&self, value: i64) -> i64 {
        self.value.swap(value, Ordering::Relaxed)
    }
}

/// Registry of named counters; counters are created on first use and live
/// until explicitly dropped.
#[derive(Debug, Default)]
pub struct StatsManager {
    counters: RwLock<HashMap<String, Arc<StatCounter>>>,
}

impl StatsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a counter.
    pub fn register_counter(&self, name: &str) -> Arc<StatCounter> {
        if let Some(counter) = self.counters.read().get(name) {
            return counter.clone();
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Look up an existing counter without creating it.
    pub fn counter(&self, name: &str) -> Option<Arc<StatCounter>> {
        self.counters.read().get(name).cloned()
    }

    pub fn remove_counter(&self, name: &str) {
        self.counters.write().remove(name);
    }
}

/// Counter name for a user's uplink bytes.
pub fn uplink_counter_name(user_tag: &str) -> String {
    format!("user>>>{user_tag}>>>traffic>>>uplink")
}

/// Counter name for a user's downlink bytes.
pub fn downlink_counter_name(user_tag: &str) -> String {
    format!("user>>>{user_tag}>>>traffic>>>downlink")
}

/// A live inbound listener with its user registry.
#[derive(Debug)]
pub struct InboundHandler {
    pub config: InboundConfig,
    users: DashMap<String, EngineUser>,
}

impl InboundHandler {
    fn new(config: InboundConfig) -> Self {
        Self {
            config,
            users: DashMap::new(),
        }
    }

    pub fn add_user(&self, user: EngineUser) -> Result<(), EngineError> {
        match self.users.entry(user.email.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::UserExists {
                tag: self.config.tag.clone(),
                email: user.email,
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(user);
                Ok(())
            }
        }
    }

    pub fn remove_user(&self, email: &str) -> Result<(), EngineError> {
        self.users
            .remove(email)
            .map(|_| ())
            .ok_or_else(|| EngineError::NoSuchUser {
                tag: self.config.tag.clone(),
                email: email.to_string(),
            })
    }

    pub fn has_user(&self, email: &str) -> bool {
        self.users.contains_key(email)
    }

    pub fn user(&self, email: &str) -> Option<EngineUser> {
        self.users.get(email).map(|u| u.clone())
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn user_emails(&self) -> Vec<String> {
        self.users.iter().map(|u| u.key().clone()).collect()
    }
}

/// The shared engine: one per process, written by every node controller.
#[derive(Debug, Default)]
pub struct Engine {
    inbounds: DashMap<String, Arc<InboundHandler>>,
    outbounds: DashMap<String, OutboundConfig>,
    stats: StatsManager,
    policy: nc_config::ConnectionConfig,
}

impl Engine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Engine with the process-wide connection policy (handshake/idle
    /// timeouts, buffer sizing) applied to every handler.
    pub fn with_policy(policy: nc_config::ConnectionConfig) -> Arc<Self> {
        Arc::new(Self {
            policy,
            ..Self::default()
        })
    }

    pub fn policy(&self) -> &nc_config::ConnectionConfig {
        &self.policy
    }

    pub fn stats(&self) -> &StatsManager {
        &self.stats
    }

    pub fn add_inbound(&self, config: InboundConfig) -> Result<(), EngineError> {
        match self.inbounds.entry(config.tag.clone()) {
            dashmap::mapref::entry::Entry::Occupied(slot) => {
                Err(EngineError::HandlerExists(slot.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(InboundHandler::new(config)));
                Ok(())
            }
        }
    }

    pub fn remove_inbound(&self, tag: &str) -> Result<(), EngineError> {
        self.inbounds
            .remove(tag)
            .map(|_| ())
            .ok_or_else(|| EngineError::NoSuchHandler(tag.to_string()))
    }

    pub fn inbound(&self, tag: &str) -> Option<Arc<InboundHandler>> {
        self.inbounds.get(tag).map(|h| h.clone())
    }

    pub fn add_outbound(&self, config: OutboundConfig) -> Result<(), EngineError> {
        match self.outbounds.entry(config.tag.clone()) {
            dashmap::mapref::entry::Entry::Occupied(slot) => {
                Err(EngineError::HandlerExists(slot.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(config);
                Ok(())
            }
        }
    }

    pub fn remove_outbound(&self, tag: &str) -> Result<(), EngineError> {
        self.outbounds
            .remove(tag)
            .map(|_| ())
            .ok_or_else(|| EngineError::NoSuchHandler(tag.to_string()))
    }

    pub fn outbound(&self, tag: &str) -> Option<OutboundConfig> {
        self.outbounds.get(tag).map(|o| o.clone())
    }

    /// Register users on an inbound. The whole batch fails on the first
    /// refused user, matching the engine contract.
    pub fn add_users(&self, tag: &str, users: Vec<EngineUser>) -> Result<(), EngineError> {
        let handler = self
            .inbound(tag)
            .ok_or_else(|| EngineError::NoSuchHandler(tag.to_string()))?;
        for user in users {
            handler.add_user(user)?;
        }
        Ok(())
    }

    pub fn remove_users(&self, tag: &str, emails: &[String]) -> Result<(), EngineError> {
        let handler = self
            .inbound(tag)
            .ok_or_else(|| EngineError::NoSuchHandler(tag.to_string()))?;
        for email in emails {
            handler.remove_user(email)?;
            // Counters of departed users would otherwise leak.
            self.stats.remove_counter(&uplink_counter_name(email));
            self.stats.remove_counter(&downlink_counter_name(email));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound_config(tag: &str, port: u32) -> InboundConfig {
        InboundConfig {
            tag: tag.into(),
            listen: "0.0.0.0".into(),
            port,
            settings: InboundSettings::Vmess,
            stream: StreamSettings::default(),
            sniffing: SniffingSettings::default(),
        }
    }

    fn user(email: &str) -> EngineUser {
        EngineUser {
            email: email.into(),
            level: 0,
            account: Account::Vmess {
                uuid: "u".into(),
                security: "auto",
            },
        }
    }

    #[test]
    fn counters_register_and_reset() {
        let stats = StatsManager::new();
        let counter = stats.register_counter("user>>>t|a|1>>>traffic>>>uplink");
        counter.add(1024);
        assert_eq!(counter.value(), 1024);
        assert_eq!(counter.set(0), 1024);
        assert_eq!(counter.value(), 0);
        // Same name resolves to the same counter.
        assert_eq!(
            stats
                .register_counter("user>>>t|a|1>>>traffic>>>uplink")
                .value(),
            0
        );
        assert!(stats.counter("user>>>other>>>traffic>>>uplink").is_none());
    }

    #[test]
    fn duplicate_handlers_are_refused() {
        let engine = Engine::new();
        engine.add_inbound(inbound_config("a", 1000)).unwrap();
        assert!(matches!(
            engine.add_inbound(inbound_config("a", 1001)),
            Err(EngineError::HandlerExists(_))
        ));
        engine.remove_inbound("a").unwrap();
        assert!(matches!(
            engine.remove_inbound("a"),
            Err(EngineError::NoSuchHandler(_))
        ));
    }

    #[test]
    fn user_lifecycle() {
        let engine = Engine::new();
        engine.add_inbound(inbound_config("a", 1000)).unwrap();
        engine
            .add_users("a", vec![user("a|x|1"), user("a|y|2")])
            .unwrap();
        let handler = engine.inbound("a").unwrap();
        assert_eq!(handler.user_count(), 2);
        assert!(matches!(
            engine.add_users("a", vec![user("a|x|1")]),
            Err(EngineError::UserExists { .. })
        ));
        engine.remove_users("a", &["a|x|1".into()]).unwrap();
        assert!(!handler.has_user("a|x|1"));
        assert!(matches!(
            engine.remove_users("a", &["a|x|1".into()]),
            Err(EngineError::NoSuchUser { .. })
        ));
    }

    #[test]
    fn removing_users_drops_their_counters() {
        let engine = Engine::new();
        engine.add_inbound(inbound_config("a", 1000)).unwrap();
        engine.add_users("a", vec![user("a|x|1")]).unwrap();
        engine
            .stats()
            .register_counter(&uplink_counter_name("a|x|1"))
            .add(10);
        engine.remove_users("a", &["a|x|1".into()]).unwrap();
        assert!(engine.stats().counter(&uplink_counter_name("a|x|1")).is_none());
    }
}
