//! Per-node controller: keeps the engine, limiter and rule manager in sync
//! with one upstream panel.
//!
//! `start` performs the initial materialization and launches the periodic
//! tasks; the sync task reconciles node/user/rule state, the report task
//! pushes traffic, online devices and incidents upstream, and the optional
//! cert task renews certificates. Tick failures are logged and the tick is
//! skipped; the loops only stop on `close`.

pub mod builder;
pub mod users;

use crate::cert::CertService;
use crate::engine::{downlink_counter_name, uplink_counter_name, Engine, StatCounter};
use crate::limiter::{GlobalLimiter, Limiter};
use crate::rule::RuleManager;
use crate::status::{ProcessUptime, SystemInfo};
use crate::tag;
use anyhow::{bail, Context};
use nc_config::ControllerConfig;
use nc_panel::types::{NodeInfo, NodeType, UserInfo, UserTraffic};
use nc_panel::{Panel, PanelType};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Mutable node-scoped state, replaced atomically at cycle boundaries.
struct NodeState {
    node: NodeInfo,
    tag: String,
    users: Vec<UserInfo>,
}

struct LimitInfo {
    end: Instant,
    origin_speed_limit: u64,
}

/// Auto-speed-limit bookkeeping, private to the report task.
#[derive(Default)]
struct AutoLimitState {
    limited: HashMap<UserInfo, LimitInfo>,
    warned: HashMap<UserInfo, u32>,
}

pub struct Controller {
    engine: Arc<Engine>,
    limiter: Arc<Limiter>,
    rules: Arc<RuleManager>,
    panel: Arc<dyn Panel>,
    panel_type: PanelType,
    config: ControllerConfig,
    sysinfo: Arc<dyn SystemInfo>,
    global: Mutex<Option<Arc<GlobalLimiter>>>,
    state: RwLock<Option<NodeState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

impl Controller {
    pub fn new(
        engine: Arc<Engine>,
        limiter: Arc<Limiter>,
        rules: Arc<RuleManager>,
        panel: Arc<dyn Panel>,
        panel_type: PanelType,
        config: ControllerConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            engine,
            limiter,
            rules,
            panel,
            panel_type,
            config,
            sysinfo: Arc::new(ProcessUptime::new()),
            global: Mutex::new(None),
            state: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown,
            started: AtomicBool::new(false),
        })
    }

    /// Replace the system status source (platform probes are injected by
    /// the application).
    pub fn with_system_info(self: Arc<Self>, sysinfo: Arc<dyn SystemInfo>) -> Arc<Self> {
        // Only meaningful before start; there is exactly one caller.
        let mut this = Arc::try_unwrap(self).ok().expect("controller not yet shared");
        this.sysinfo = sysinfo;
        Arc::new(this)
    }

    pub fn current_tag(&self) -> Option<String> {
        self.state.read().as_ref().map(|s| s.tag.clone())
    }

    /// Materialize the node on the engine and launch the periodic tasks.
    /// Must complete fully before returning; not re-entrant.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("controller already started");
        }
        let info = self.panel.describe();
        tracing::info!(
            host = %info.api_host,
            node_type = %info.node_type,
            node_id = info.node_id,
            "starting node controller"
        );

        let node = self.panel.get_node_info().await?;
        if node.port == 0 {
            bail!("server port must > 0");
        }
        let inbound_tag = tag::inbound_tag(node.node_type, &self.config.listen_ip, node.port);
        self.add_new_tag(&node, &inbound_tag)?;

        let users = self.panel.get_user_list().await?;
        self.register_users(&node, &users, &inbound_tag)?;

        if self.config.global_device_limit.enable {
            match GlobalLimiter::new(&self.config.global_device_limit) {
                Ok(global) => *self.global.lock() = Some(global),
                Err(err) => {
                    tracing::warn!(%err, "global device limit disabled: store unavailable");
                }
            }
        }
        self.limiter
            .add(&inbound_tag, node.speed_limit, &users, self.global.lock().clone());

        if !self.config.disable_get_rule {
            match self.panel.get_node_rule().await {
                Ok(rules) if !rules.is_empty() => self.rules.update(&inbound_tag, rules),
                Ok(_) => {}
                Err(err) => tracing::warn!(%err, "get rule list failed"),
            }
        }

        *self.state.write() = Some(NodeState {
            node: node.clone(),
            tag: inbound_tag,
            users,
        });
        self.spawn_tasks(node.enable_tls);
        Ok(())
    }

    /// Stop the periodic tasks. Engine handlers stay in place; the process
    /// owns engine teardown.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn spawn_tasks(self: &Arc<Self>, enable_tls: bool) {
        let period = Duration::from_secs(self.config.update_periodic.max(1));
        let mut tasks = self.tasks.lock();

        let this = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.run_sync_cycle().await,
                    _ = shutdown.changed() => return,
                }
            }
        }));

        let this = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut auto = AutoLimitState::default();
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.run_report_cycle(&mut auto).await,
                    _ = shutdown.changed() => return,
                }
            }
        }));

        if enable_tls
            && !self.config.enable_reality
            && matches!(
                self.config.cert_config.cert_mode.as_str(),
                "dns" | "http" | "tls"
            )
        {
            let this = self.clone();
            let mut shutdown = self.shutdown.subscribe();
            let cert_period = period * 60;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(
                    tokio::time::Instant::now() + cert_period,
                    cert_period,
                );
                loop {
                    tokio::select! {
                        _ = ticker.tick() => this.run_cert_cycle().await,
                        _ = shutdown.changed() => return,
                    }
                }
            }));
        }
    }

    // ───────────────────────── sync task ─────────────────────────

    async fn run_sync_cycle(&self) {
        if let Err(err) = self.sync_once().await {
            tracing::warn!(%err, "sync tick failed");
        }
    }

    async fn sync_once(&self) -> anyhow::Result<()> {
        let (old_node, old_tag, old_users) = {
            let state = self.state.read();
            let state = state.as_ref().context("controller not started")?;
            (state.node.clone(), state.tag.clone(), state.users.clone())
        };

        let mut node_fetched = true;
        let new_node = match self.panel.get_node_info().await {
            Ok(node) => node,
            Err(err) if err.is_not_modified() => {
                node_fetched = false;
                old_node.clone()
            }
            Err(err) => {
                tracing::warn!(%err, "fetch node info failed, tick skipped");
                return Ok(());
            }
        };
        if new_node.port == 0 {
            bail!("server port must > 0");
        }

        let mut users_fetched = true;
        let new_users = match self.panel.get_user_list().await {
            Ok(users) => users,
            Err(err) if err.is_not_modified() => {
                users_fetched = false;
                old_users.clone()
            }
            Err(err) => {
                tracing::warn!(%err, "fetch user list failed, tick skipped");
                return Ok(());
            }
        };

        let node_changed = node_fetched && new_node != old_node;
        let current_tag = if node_changed {
            self.full_swap(&old_node, &old_tag, &new_node, &new_users)?
        } else {
            if users_fetched {
                self.apply_user_diff(&new_node, &old_tag, &old_users, &new_users);
            }
            old_tag
        };

        if !self.config.disable_get_rule {
            match self.panel.get_node_rule().await {
                Ok(rules) if !rules.is_empty() => self.rules.update(&current_tag, rules),
                Ok(_) => {}
                Err(err) if err.is_not_modified() => {}
                Err(err) => tracing::warn!(%err, "get rule list failed"),
            }
        }

        *self.state.write() = Some(NodeState {
            node: new_node,
            tag: current_tag,
            users: new_users,
        });
        Ok(())
    }

    /// Teardown-then-reinstall of the inbound/outbound pair after the node
    /// descriptor changed by value.
    fn full_swap(
        &self,
        old_node: &NodeInfo,
        old_tag: &str,
        new_node: &NodeInfo,
        new_users: &[UserInfo],
    ) -> anyhow::Result<String> {
        tracing::info!(old_tag, "node descriptor changed, swapping handlers");
        self.remove_old_tag(old_tag, old_node.node_type);
        let new_tag = tag::inbound_tag(new_node.node_type, &self.config.listen_ip, new_node.port);

        if let Err(err) = self.add_new_tag(new_node, &new_tag) {
            // Roll partial registration back so the next tick retries the
            // whole swap instead of colliding with leftovers.
            self.remove_old_tag(&new_tag, new_node.node_type);
            return Err(err.context("register new handlers"));
        }
        self.limiter.delete(old_tag);

        if let Err(err) = self.register_users(new_node, new_users, &new_tag) {
            self.remove_old_tag(&new_tag, new_node.node_type);
            return Err(err.context("register users after swap"));
        }
        self.limiter
            .add(&new_tag, new_node.speed_limit, new_users, self.global.lock().clone());
        Ok(new_tag)
    }

    fn apply_user_diff(
        &self,
        node: &NodeInfo,
        inbound_tag: &str,
        old_users: &[UserInfo],
        new_users: &[UserInfo],
    ) {
        let (deleted, added) = diff_users(old_users, new_users);
        if !deleted.is_empty() {
            let emails: Vec<String> = deleted
                .iter()
                .map(|u| tag::user_tag(inbound_tag, &u.email, u.uid))
                .collect();
            if let Err(err) = self.engine.remove_users(inbound_tag, &emails) {
                tracing::error!(%err, "remove users failed");
            }
        }
        if !added.is_empty() {
            if let Err(err) = self.register_users(node, &added, inbound_tag) {
                tracing::error!(%err, "add users failed");
            }
            if let Err(err) = self.limiter.update(inbound_tag, &added) {
                tracing::error!(%err, "update limiter failed");
            }
        }
        if !deleted.is_empty() || !added.is_empty() {
            tracing::info!(
                removed = deleted.len(),
                added = added.len(),
                "user roster synced"
            );
        }
    }

    fn add_new_tag(&self, node: &NodeInfo, inbound_tag: &str) -> anyhow::Result<()> {
        if node.node_type != NodeType::ShadowsocksPlugin {
            let inbound = builder::build_inbound(&self.config, node, inbound_tag)?;
            self.engine.add_inbound(inbound)?;
            let outbound = builder::build_outbound(&self.config, node, inbound_tag);
            self.engine.add_outbound(outbound)?;
            return Ok(());
        }

        // Shadowsocks-Plugin: a plain shadowsocks inbound plus a
        // dokodemo-door companion one port above, carrying the stream
        // transport.
        let mut ss_node = node.clone();
        ss_node.transport = nc_panel::types::Transport::Tcp;
        ss_node.enable_tls = false;
        let inbound = builder::build_inbound(&self.config, &ss_node, inbound_tag)?;
        self.engine.add_inbound(inbound)?;
        self.engine
            .add_outbound(builder::build_outbound(&self.config, &ss_node, inbound_tag))?;

        let mut companion = node.clone();
        companion.port += 1;
        companion.node_type = NodeType::DokodemoDoor;
        let companion_tag = tag::dokodemo_tag(inbound_tag);
        let inbound = builder::build_inbound(&self.config, &companion, &companion_tag)?;
        self.engine.add_inbound(inbound)?;
        self.engine.add_outbound(builder::build_outbound(
            &self.config,
            &companion,
            &companion_tag,
        ))?;
        Ok(())
    }

    /// Best-effort handler teardown; a missing handler only logs, so a
    /// half-completed previous swap can be retried.
    fn remove_old_tag(&self, inbound_tag: &str, node_type: NodeType) {
        if let Err(err) = self.engine.remove_inbound(inbound_tag) {
            tracing::warn!(%err, "remove inbound failed");
        }
        if let Err(err) = self.engine.remove_outbound(inbound_tag) {
            tracing::warn!(%err, "remove outbound failed");
        }
        if node_type == NodeType::ShadowsocksPlugin {
            let companion_tag = tag::dokodemo_tag(inbound_tag);
            if let Err(err) = self.engine.remove_inbound(&companion_tag) {
                tracing::warn!(%err, "remove companion inbound failed");
            }
            if let Err(err) = self.engine.remove_outbound(&companion_tag) {
                tracing::warn!(%err, "remove companion outbound failed");
            }
        }
    }

    fn register_users(
        &self,
        node: &NodeInfo,
        roster: &[UserInfo],
        inbound_tag: &str,
    ) -> anyhow::Result<()> {
        let engine_users = users::build_users(self.panel_type, node, roster, inbound_tag)?;
        let count = engine_users.len();
        self.engine.add_users(inbound_tag, engine_users)?;
        tracing::info!(count, "added new users");
        Ok(())
    }

    // ───────────────────────── report task ─────────────────────────

    async fn run_report_cycle(&self, auto: &mut AutoLimitState) {
        let (tag_snapshot, users_snapshot) = {
            let state = self.state.read();
            let Some(state) = state.as_ref() else { return };
            (state.tag.clone(), state.users.clone())
        };

        let status = self.sysinfo.snapshot();
        if let Err(err) = self.panel.report_node_status(&status).await {
            tracing::warn!(%err, "report node status failed");
        }

        let auto_cfg = self.config.auto_speed_limit;
        self.release_limited_users(auto, &tag_snapshot);

        let threshold =
            (auto_cfg.limit * 1_000_000 * self.config.update_periodic / 8) as i64;
        let mut traffic: Vec<UserTraffic> = Vec::new();
        let mut reset_counters: Vec<Arc<StatCounter>> = Vec::new();
        let mut newly_limited: Vec<UserInfo> = Vec::new();

        for user in &users_snapshot {
            let user_tag = tag::user_tag(&tag_snapshot, &user.email, user.uid);
            let up_counter = self.engine.stats().counter(&uplink_counter_name(&user_tag));
            let down_counter = self
                .engine
                .stats()
                .counter(&downlink_counter_name(&user_tag));
            let up = up_counter.as_ref().map(|c| c.value()).unwrap_or(0);
            let down = down_counter.as_ref().map(|c| c.value()).unwrap_or(0);
            if up <= 0 && down <= 0 {
                auto.warned.remove(user);
                continue;
            }

            if auto_cfg.limit > 0 && !auto.limited.contains_key(user) {
                if up > threshold || down > threshold {
                    if auto_cfg.warn_times == 0 {
                        self.limit_user(auto, user, &mut newly_limited);
                    } else {
                        let warned = auto.warned.entry(user.clone()).or_insert(0);
                        *warned += 1;
                        if *warned > auto_cfg.warn_times {
                            self.limit_user(auto, user, &mut newly_limited);
                            auto.warned.remove(user);
                        }
                    }
                } else {
                    auto.warned.remove(user);
                }
            }

            traffic.push(UserTraffic {
                uid: user.uid,
                email: user.email.clone(),
                upload: up,
                download: down,
            });
            reset_counters.extend(up_counter);
            reset_counters.extend(down_counter);
        }

        if !newly_limited.is_empty() {
            if let Err(err) = self.limiter.update(&tag_snapshot, &newly_limited) {
                tracing::error!(%err, "apply auto speed limit failed");
            }
        }

        if !traffic.is_empty() {
            let mut reported = true;
            if !self.config.disable_upload_traffic {
                match self.panel.report_user_traffic(&traffic).await {
                    Ok(()) => {
                        tracing::info!(count = traffic.len(), "reported user traffic")
                    }
                    Err(err) => {
                        tracing::warn!(%err, "report user traffic failed");
                        reported = false;
                    }
                }
            }
            // At-least-once: counters survive a failed report and are only
            // zeroed once the panel acknowledged the data.
            if reported {
                for counter in reset_counters {
                    counter.set(0);
                }
            }
        }

        match self.limiter.drain_online(&tag_snapshot) {
            Ok(online) if !online.is_empty() => {
                match self.panel.report_node_online_users(&online).await {
                    Ok(()) => tracing::info!(count = online.len(), "reported online users"),
                    Err(err) => tracing::warn!(%err, "report online users failed"),
                }
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(%err, "drain online devices failed"),
        }

        let detected = self.rules.drain(&tag_snapshot);
        if !detected.is_empty() {
            match self.panel.report_illegal(&detected).await {
                Ok(()) => tracing::info!(count = detected.len(), "reported illegal behaviors"),
                Err(err) => tracing::warn!(%err, "report illegal failed"),
            }
        }
    }

    fn release_limited_users(&self, auto: &mut AutoLimitState, inbound_tag: &str) {
        if self.config.auto_speed_limit.limit == 0 || auto.limited.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut to_release: Vec<UserInfo> = Vec::new();
        auto.limited.retain(|user, info| {
            if now >= info.end {
                let mut restored = user.clone();
                restored.speed_limit = info.origin_speed_limit;
                tracing::info!(uid = user.uid, "auto speed limit released");
                to_release.push(restored);
                false
            } else {
                true
            }
        });
        if !to_release.is_empty() {
            if let Err(err) = self.limiter.update(inbound_tag, &to_release) {
                tracing::error!(%err, "release auto speed limit failed");
            }
        }
    }

    fn limit_user(
        &self,
        auto: &mut AutoLimitState,
        user: &UserInfo,
        newly_limited: &mut Vec<UserInfo>,
    ) {
        let cfg = self.config.auto_speed_limit;
        let end = Instant::now() + Duration::from_secs(cfg.limit_duration * 60);
        auto.limited.insert(
            user.clone(),
            LimitInfo {
                end,
                origin_speed_limit: user.speed_limit,
            },
        );
        let mut demoted = user.clone();
        demoted.speed_limit = cfg.limit_speed * 1_000_000 / 8;
        tracing::info!(
            uid = user.uid,
            speed_mbps = cfg.limit_speed,
            duration_min = cfg.limit_duration,
            "user exceeded traffic threshold, speed limited"
        );
        newly_limited.push(demoted);
    }

    // ───────────────────────── cert task ─────────────────────────

    async fn run_cert_cycle(&self) {
        let service = CertService::new(&self.config.cert_config);
        match service.renew() {
            Ok(true) => tracing::info!("certificate material verified"),
            Ok(false) => {}
            Err(err) => tracing::warn!(%err, "certificate renew failed"),
        }
    }
}

/// Set difference over value-equal user records.
fn diff_users(old: &[UserInfo], new: &[UserInfo]) -> (Vec<UserInfo>, Vec<UserInfo>) {
    let old_set: HashSet<&UserInfo> = old.iter().collect();
    let new_set: HashSet<&UserInfo> = new.iter().collect();
    let deleted = old
        .iter()
        .filter(|u| !new_set.contains(*u))
        .cloned()
        .collect();
    let added = new
        .iter()
        .filter(|u| !old_set.contains(*u))
        .cloned()
        .collect();
    (deleted, added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InboundSettings;
    use async_trait::async_trait;
    use nc_panel::error::{PanelError, PanelResult};
    use nc_panel::types::*;
    use std::collections::VecDeque;

    /// Scripted panel: queued node/user responses, recorded reports. Empty
    /// queues answer 304 so ticks reuse cached state, like a quiet panel.
    #[derive(Default)]
    struct MockPanel {
        nodes: Mutex<VecDeque<NodeInfo>>,
        users: Mutex<VecDeque<Vec<UserInfo>>>,
        rules: Mutex<Vec<DetectRule>>,
        fail_traffic: AtomicBool,
        traffic_reports: Mutex<Vec<Vec<UserTraffic>>>,
        online_reports: Mutex<Vec<Vec<OnlineUser>>>,
        illegal_reports: Mutex<Vec<Vec<DetectResult>>>,
    }

    use std::sync::atomic::AtomicBool;

    impl MockPanel {
        fn push_node(&self, node: NodeInfo) {
            self.nodes.lock().push_back(node);
        }

        fn push_users(&self, users: Vec<UserInfo>) {
            self.users.lock().push_back(users);
        }
    }

    #[async_trait]
    impl Panel for MockPanel {
        async fn get_node_info(&self) -> PanelResult<NodeInfo> {
            self.nodes
                .lock()
                .pop_front()
                .ok_or(PanelError::not_modified("node"))
        }

        async fn get_user_list(&self) -> PanelResult<Vec<UserInfo>> {
            self.users
                .lock()
                .pop_front()
                .ok_or(PanelError::not_modified("users"))
        }

        async fn report_node_status(&self, _status: &NodeStatus) -> PanelResult<()> {
            Ok(())
        }

        async fn report_node_online_users(&self, online: &[OnlineUser]) -> PanelResult<()> {
            self.online_reports.lock().push(online.to_vec());
            Ok(())
        }

        async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> PanelResult<()> {
            if self.fail_traffic.load(Ordering::Relaxed) {
                return Err(PanelError::invalid("panel down"));
            }
            self.traffic_reports.lock().push(traffic.to_vec());
            Ok(())
        }

        async fn get_node_rule(&self) -> PanelResult<Vec<DetectRule>> {
            Ok(self.rules.lock().clone())
        }

        async fn report_illegal(&self, results: &[DetectResult]) -> PanelResult<()> {
            self.illegal_reports.lock().push(results.to_vec());
            Ok(())
        }

        fn describe(&self) -> ClientInfo {
            ClientInfo {
                api_host: "http://panel.example".into(),
                node_id: 1,
                key: "k".into(),
                node_type: NodeType::V2ray,
            }
        }

        fn set_debug(&self, _enable: bool) {}
    }

    fn vmess_node(port: u32) -> NodeInfo {
        NodeInfo {
            node_type: NodeType::V2ray,
            node_id: 1,
            port,
            transport: Transport::Ws,
            host: "a.example".into(),
            path: "/x".into(),
            ..Default::default()
        }
    }

    fn roster_user(uid: i64) -> UserInfo {
        UserInfo {
            uid,
            email: format!("u{uid}@panel.user"),
            uuid: format!("uuid-{uid}"),
            ..Default::default()
        }
    }

    struct Fixture {
        engine: Arc<Engine>,
        limiter: Arc<Limiter>,
        rules: Arc<RuleManager>,
        panel: Arc<MockPanel>,
        controller: Arc<Controller>,
    }

    fn fixture(config: ControllerConfig) -> Fixture {
        let engine = Engine::new();
        let limiter = Limiter::new();
        let rules = RuleManager::new();
        let panel = Arc::new(MockPanel::default());
        let controller = Controller::new(
            engine.clone(),
            limiter.clone(),
            rules.clone(),
            panel.clone(),
            PanelType::Sspanel,
            config,
        );
        Fixture {
            engine,
            limiter,
            rules,
            panel,
            controller,
        }
    }

    async fn started_fixture(config: ControllerConfig) -> Fixture {
        let f = fixture(config);
        f.panel.push_node(vmess_node(10086));
        f.panel.push_users(vec![roster_user(1)]);
        f.controller.start().await.unwrap();
        f
    }

    #[tokio::test]
    async fn startup_materializes_node_and_users() {
        let f = started_fixture(ControllerConfig::default()).await;
        let tag = f.controller.current_tag().unwrap();
        assert_eq!(tag, "V2ray_0.0.0.0_10086");

        let handler = f.engine.inbound(&tag).unwrap();
        assert_eq!(handler.config.port, 10086);
        assert_eq!(handler.config.stream.network, Transport::Ws);
        assert_eq!(handler.config.stream.host, "a.example");
        assert_eq!(handler.config.stream.path, "/x");
        assert!(handler.has_user("V2ray_0.0.0.0_10086|u1@panel.user|1"));
        assert!(f.engine.outbound(&tag).is_some());
        assert!(f.limiter.has_inbound(&tag));
        f.controller.close().await;
    }

    #[tokio::test]
    async fn start_rejects_port_zero() {
        let f = fixture(ControllerConfig::default());
        f.panel.push_node(vmess_node(0));
        f.panel.push_users(vec![]);
        let err = f.controller.start().await.unwrap_err();
        assert!(err.to_string().contains("server port must > 0"));
    }

    #[tokio::test]
    async fn sync_applies_minimal_diff() {
        let f = started_fixture(ControllerConfig::default()).await;
        let tag = f.controller.current_tag().unwrap();
        let handler = f.engine.inbound(&tag).unwrap();

        // Cycle 1: node unchanged (304), one user added.
        f.panel.push_users(vec![roster_user(1), roster_user(2)]);
        f.controller.sync_once().await.unwrap();
        assert_eq!(handler.user_count(), 2);
        assert!(handler.has_user("V2ray_0.0.0.0_10086|u2@panel.user|2"));

        // Cycle 2: user 1 replaced by user 3.
        f.panel.push_users(vec![roster_user(2), roster_user(3)]);
        f.controller.sync_once().await.unwrap();
        assert_eq!(handler.user_count(), 2);
        assert!(!handler.has_user("V2ray_0.0.0.0_10086|u1@panel.user|1"));
        assert!(handler.has_user("V2ray_0.0.0.0_10086|u3@panel.user|3"));

        // Cycle 3: everything 304 — no change.
        f.controller.sync_once().await.unwrap();
        assert_eq!(handler.user_count(), 2);
        f.controller.close().await;
    }

    #[tokio::test]
    async fn changed_field_reregisters_user() {
        let f = started_fixture(ControllerConfig::default()).await;
        let tag = f.controller.current_tag().unwrap();

        let mut updated = roster_user(1);
        updated.speed_limit = 1_000_000;
        f.panel.push_users(vec![updated]);
        f.controller.sync_once().await.unwrap();

        // Same user tag, re-registered with the new record; the limiter saw
        // the update too.
        let handler = f.engine.inbound(&tag).unwrap();
        assert_eq!(handler.user_count(), 1);
        let admission = f
            .limiter
            .check(&tag, "V2ray_0.0.0.0_10086|u1@panel.user|1", "10.0.0.1")
            .await;
        assert_eq!(admission.bucket.unwrap().rate(), 1_000_000);
        f.controller.close().await;
    }

    #[tokio::test]
    async fn port_change_performs_full_swap() {
        let f = started_fixture(ControllerConfig::default()).await;
        let old_tag = f.controller.current_tag().unwrap();

        f.panel.push_node(vmess_node(10087));
        f.panel.push_users(vec![roster_user(1)]);
        f.controller.sync_once().await.unwrap();

        let new_tag = f.controller.current_tag().unwrap();
        assert_eq!(new_tag, "V2ray_0.0.0.0_10087");
        assert!(f.engine.inbound(&old_tag).is_none());
        assert!(f.engine.outbound(&old_tag).is_none());
        assert!(!f.limiter.has_inbound(&old_tag));

        let handler = f.engine.inbound(&new_tag).unwrap();
        assert_eq!(handler.config.port, 10087);
        assert!(handler.has_user("V2ray_0.0.0.0_10087|u1@panel.user|1"));
        assert!(f.limiter.has_inbound(&new_tag));
        f.controller.close().await;
    }

    #[tokio::test]
    async fn ss_plugin_swaps_companion_too() {
        let f = fixture(ControllerConfig::default());
        let mut node = vmess_node(10240);
        node.node_type = NodeType::ShadowsocksPlugin;
        node.cipher = "aes-128-gcm".into();
        f.panel.push_node(node.clone());
        let mut user = roster_user(1);
        user.method = "aes-128-gcm".into();
        f.panel.push_users(vec![user.clone()]);
        f.controller.start().await.unwrap();

        let tag = f.controller.current_tag().unwrap();
        let companion = tag::dokodemo_tag(&tag);
        assert!(f.engine.inbound(&tag).is_some());
        let companion_handler = f.engine.inbound(&companion).unwrap();
        assert_eq!(companion_handler.config.port, 10241);
        assert!(matches!(
            companion_handler.config.settings,
            InboundSettings::DokodemoDoor { .. }
        ));
        assert_eq!(
            f.engine.outbound(&companion).unwrap().redirect.as_deref(),
            Some("127.0.0.1:10240")
        );

        // Port change must also tear down the companion pair.
        let mut changed = node.clone();
        changed.port = 10300;
        f.panel.push_node(changed);
        f.panel.push_users(vec![user]);
        f.controller.sync_once().await.unwrap();
        assert!(f.engine.inbound(&companion).is_none());
        assert!(f.engine.outbound(&companion).is_none());
        let new_tag = f.controller.current_tag().unwrap();
        assert!(f.engine.inbound(&tag::dokodemo_tag(&new_tag)).is_some());
        f.controller.close().await;
    }

    #[tokio::test]
    async fn traffic_reported_and_reset_only_on_success() {
        let f = started_fixture(ControllerConfig::default()).await;
        let tag = f.controller.current_tag().unwrap();
        let user_tag = tag::user_tag(&tag, "u1@panel.user", 1);
        let up = f
            .engine
            .stats()
            .register_counter(&uplink_counter_name(&user_tag));
        up.add(5000);

        // Failed report: counters keep their value.
        f.panel.fail_traffic.store(true, Ordering::Relaxed);
        let mut auto = AutoLimitState::default();
        f.controller.run_report_cycle(&mut auto).await;
        assert!(f.panel.traffic_reports.lock().is_empty());
        assert_eq!(up.value(), 5000);

        // Successful report: the same 5000 goes up (plus nothing new) and
        // the counter zeroes.
        f.panel.fail_traffic.store(false, Ordering::Relaxed);
        f.controller.run_report_cycle(&mut auto).await;
        let reports = f.panel.traffic_reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0][0].upload, 5000);
        assert_eq!(up.value(), 0);
        f.controller.close().await;
    }

    #[tokio::test]
    async fn online_devices_and_incidents_flow_upstream() {
        let f = started_fixture(ControllerConfig::default()).await;
        let tag = f.controller.current_tag().unwrap();
        let user_tag = tag::user_tag(&tag, "u1@panel.user", 1);

        f.limiter.check(&tag, &user_tag, "10.1.1.1").await;
        f.rules
            .update(&tag, vec![DetectRule::new(7, r"^porn\.").unwrap()]);
        assert!(f.rules.detect(&tag, "porn.example.com:443", &user_tag));
        assert!(f.rules.detect(&tag, "porn.example.com:443", &user_tag));

        let mut auto = AutoLimitState::default();
        f.controller.run_report_cycle(&mut auto).await;

        let online = f.panel.online_reports.lock();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0], vec![OnlineUser { uid: 1, ip: "10.1.1.1".into() }]);
        let illegal = f.panel.illegal_reports.lock();
        assert_eq!(illegal.len(), 1);
        // Two matches of one (uid, rule) pair produce a single incident.
        assert_eq!(illegal[0], vec![DetectResult { uid: 1, rule_id: 7 }]);
        f.controller.close().await;
    }

    #[tokio::test]
    async fn auto_limit_applies_after_warnings_and_releases() {
        let mut config = ControllerConfig::default();
        config.update_periodic = 60;
        config.auto_speed_limit = nc_config::AutoSpeedLimitConfig {
            limit: 100,
            warn_times: 2,
            limit_speed: 10,
            limit_duration: 0, // released on the next tick
        };
        let f = started_fixture(config).await;
        let tag = f.controller.current_tag().unwrap();
        let user_tag = tag::user_tag(&tag, "u1@panel.user", 1);
        let down = f
            .engine
            .stats()
            .register_counter(&downlink_counter_name(&user_tag));
        // 100 Mbit/s over 60 s is 750 MB; push well past it.
        let over_threshold = 2_000_000_000;

        let mut auto = AutoLimitState::default();
        // Two warnings tolerated...
        for _ in 0..2 {
            down.set(over_threshold);
            f.controller.run_report_cycle(&mut auto).await;
            assert!(auto.limited.is_empty());
        }
        // ...the third consecutive breach limits the user.
        down.set(over_threshold);
        f.controller.run_report_cycle(&mut auto).await;
        assert_eq!(auto.limited.len(), 1);
        let admission = f.limiter.check(&tag, &user_tag, "10.0.0.1").await;
        assert_eq!(admission.bucket.unwrap().rate(), 1_250_000);

        // Deadline already passed: the next tick releases and restores the
        // original (unlimited) speed.
        f.controller.run_report_cycle(&mut auto).await;
        assert!(auto.limited.is_empty());
        let admission = f.limiter.check(&tag, &user_tag, "10.0.0.2").await;
        assert!(admission.bucket.is_none());
        f.controller.close().await;
    }

    #[tokio::test]
    async fn under_threshold_resets_warnings() {
        let mut config = ControllerConfig::default();
        config.auto_speed_limit = nc_config::AutoSpeedLimitConfig {
            limit: 100,
            warn_times: 1,
            limit_speed: 10,
            limit_duration: 10,
        };
        let f = started_fixture(config).await;
        let tag = f.controller.current_tag().unwrap();
        let user_tag = tag::user_tag(&tag, "u1@panel.user", 1);
        let up = f
            .engine
            .stats()
            .register_counter(&uplink_counter_name(&user_tag));

        let mut auto = AutoLimitState::default();
        up.set(2_000_000_000);
        f.controller.run_report_cycle(&mut auto).await;
        assert_eq!(auto.warned.len(), 1);

        // A calm period clears the streak.
        up.set(10);
        f.controller.run_report_cycle(&mut auto).await;
        assert!(auto.warned.is_empty());
        assert!(auto.limited.is_empty());
        f.controller.close().await;
    }

    #[tokio::test]
    async fn rules_installed_and_refreshed() {
        let f = fixture(ControllerConfig::default());
        f.panel.push_node(vmess_node(10086));
        f.panel.push_users(vec![roster_user(4)]);
        *f.panel.rules.lock() = vec![DetectRule::new(7, r"^porn\.").unwrap()];
        f.controller.start().await.unwrap();

        let tag = f.controller.current_tag().unwrap();
        let user_tag = tag::user_tag(&tag, "u4@panel.user", 4);
        assert!(f.rules.detect(&tag, "porn.example.com:443", &user_tag));
        let drained = f.rules.drain(&tag);
        assert_eq!(drained, vec![DetectResult { uid: 4, rule_id: 7 }]);
        f.controller.close().await;
    }

    #[test]
    fn diff_users_is_set_based() {
        let old = vec![roster_user(1), roster_user(2)];
        let new = vec![roster_user(2), roster_user(3)];
        let (deleted, added) = diff_users(&old, &new);
        assert_eq!(deleted, vec![roster_user(1)]);
        assert_eq!(added, vec![roster_user(3)]);

        // A changed field re-registers the user: it shows up on both sides.
        let mut changed = roster_user(2);
        changed.speed_limit = 9;
        let (deleted, added) = diff_users(&old, &[roster_user(1), changed.clone()]);
        assert_eq!(deleted, vec![roster_user(2)]);
        assert_eq!(added, vec![changed]);
    }
}
