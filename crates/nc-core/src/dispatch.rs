//! Dispatcher admission hook.
//!
//! The engine's dispatcher calls [`Dispatcher::admit_link`] for every
//! accepted connection before any byte is forwarded: the audit rules veto
//! the destination, the limiter gates devices and hands out the shared
//! token bucket, and the returned policy tells the dispatcher how to wrap
//! both directions' writers.

use crate::engine::{downlink_counter_name, uplink_counter_name, Engine, StatCounter};
use crate::limiter::{CountingWriter, Limiter, RateLimitedWriter, TokenBucket};
use crate::rule::RuleManager;
use std::sync::Arc;
use tokio::io::AsyncWrite;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The user's device budget is exhausted.
    DeviceLimit,
    /// The destination matched an audit rule.
    AuditRule,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::DeviceLimit => f.write_str("devices reach the limit"),
            RejectReason::AuditRule => f.write_str("destination is rejected by rule"),
        }
    }
}

/// How the dispatcher must treat an admitted link.
pub struct LinkPolicy {
    pub bucket: Option<Arc<TokenBucket>>,
    pub uplink_counter: Arc<StatCounter>,
    pub downlink_counter: Arc<StatCounter>,
}

impl LinkPolicy {
    /// Wrap one direction's writer with throttling and byte counting.
    pub fn wrap_uplink<W>(&self, writer: W) -> Box<dyn AsyncWrite + Send + Unpin>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        wrap(writer, self.bucket.clone(), self.uplink_counter.clone())
    }

    pub fn wrap_downlink<W>(&self, writer: W) -> Box<dyn AsyncWrite + Send + Unpin>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        wrap(writer, self.bucket.clone(), self.downlink_counter.clone())
    }
}

fn wrap<W>(
    writer: W,
    bucket: Option<Arc<TokenBucket>>,
    counter: Arc<StatCounter>,
) -> Box<dyn AsyncWrite + Send + Unpin>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let counted = CountingWriter::new(writer, counter);
    match bucket {
        Some(bucket) => Box::new(RateLimitedWriter::new(counted, bucket)),
        None => Box::new(counted),
    }
}

pub struct Dispatcher {
    engine: Arc<Engine>,
    limiter: Arc<Limiter>,
    rules: Arc<RuleManager>,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>, limiter: Arc<Limiter>, rules: Arc<RuleManager>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            limiter,
            rules,
        })
    }

    /// Admission decision for one link.
    ///
    /// `email` is the engine-level user tag; `destination` is
    /// `host[:port]` as sniffed or dialed.
    pub async fn admit_link(
        &self,
        inbound_tag: &str,
        email: &str,
        source_ip: &str,
        destination: &str,
    ) -> Result<LinkPolicy, RejectReason> {
        let admission = self.limiter.check(inbound_tag, email, source_ip).await;
        if admission.reject {
            tracing::warn!(email, source_ip, "devices reach the limit");
            return Err(RejectReason::DeviceLimit);
        }
        if self.rules.detect(inbound_tag, destination, email) {
            tracing::warn!(email, destination, "access rejected by rule");
            return Err(RejectReason::AuditRule);
        }
        Ok(LinkPolicy {
            bucket: admission.bucket,
            uplink_counter: self
                .engine
                .stats()
                .register_counter(&uplink_counter_name(email)),
            downlink_counter: self
                .engine
                .stats()
                .register_counter(&downlink_counter_name(email)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nc_panel::types::{DetectRule, UserInfo};
    use tokio::io::AsyncWriteExt;

    fn setup() -> (Arc<Engine>, Arc<Limiter>, Arc<RuleManager>, Arc<Dispatcher>) {
        let engine = Engine::new();
        let limiter = Limiter::new();
        let rules = RuleManager::new();
        let dispatcher = Dispatcher::new(engine.clone(), limiter.clone(), rules.clone());
        (engine, limiter, rules, dispatcher)
    }

    fn roster_user() -> UserInfo {
        UserInfo {
            uid: 4,
            email: "u@x".into(),
            device_limit: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn audit_rule_rejects_and_records() {
        let (_, limiter, rules, dispatcher) = setup();
        limiter.add("t", 0, &[roster_user()], None);
        rules.update("t", vec![DetectRule::new(7, r"^porn\.").unwrap()]);

        let verdict = dispatcher
            .admit_link("t", "t|u@x|4", "10.0.0.1", "porn.example.com:443")
            .await;
        assert!(matches!(verdict, Err(RejectReason::AuditRule)));
        assert_eq!(rules.drain("t").len(), 1);
    }

    #[tokio::test]
    async fn device_limit_rejects_before_rules() {
        let (_, limiter, rules, dispatcher) = setup();
        limiter.add("t", 0, &[roster_user()], None);
        rules.update("t", vec![DetectRule::new(7, r"^porn\.").unwrap()]);

        dispatcher
            .admit_link("t", "t|u@x|4", "10.0.0.1", "ok.example.com:443")
            .await
            .unwrap();
        let verdict = dispatcher
            .admit_link("t", "t|u@x|4", "10.0.0.2", "porn.example.com:443")
            .await;
        assert!(matches!(verdict, Err(RejectReason::DeviceLimit)));
        // The rule never saw the link, so no incident was recorded.
        assert!(rules.drain("t").is_empty());
    }

    #[tokio::test]
    async fn admitted_link_counts_bytes_into_engine_counters() {
        let (engine, limiter, _, dispatcher) = setup();
        limiter.add("t", 0, &[roster_user()], None);

        let policy = dispatcher
            .admit_link("t", "t|u@x|4", "10.0.0.1", "ok.example.com:443")
            .await
            .unwrap();
        let mut up = policy.wrap_uplink(Vec::new());
        up.write_all(b"0123456789").await.unwrap();

        let counter = engine
            .stats()
            .counter(&uplink_counter_name("t|u@x|4"))
            .unwrap();
        assert_eq!(counter.value(), 10);
    }
}
