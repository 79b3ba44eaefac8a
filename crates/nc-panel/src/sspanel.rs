//! SSPanel adapter.
//!
//! The oldest dialect in the fleet. Before 2021.11 the node descriptor is a
//! semicolon/pipe/`key=value` encoded `server` string; newer panels ship a
//! `custom_config` JSON blob that takes precedence unless disabled. Status
//! reporting is version-gated away from 2023.2 on.

use crate::client::{PanelClient, RawResponse};
use crate::error::{PanelError, PanelResult};
use crate::types::*;
use crate::Panel;
use async_trait::async_trait;
use nc_config::ApiConfig;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

static FIRST_PORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)port=(?P<outport>\d+)#?").unwrap());
static SECOND_PORT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)port=\d+#(\d+)").unwrap());
static HOST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)host=([\w.]+)\|?").unwrap());

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    ret: u64,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct NodeInfoResponse {
    #[serde(rename = "node_speedlimit")]
    speed_limit: f64,
    #[serde(rename = "server")]
    raw_server: String,
    custom_config: serde_json::Value,
    version: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct CustomConfig {
    offset_port_node: String,
    host: String,
    enable_vless: String,
    network: String,
    security: String,
    path: String,
    header: Option<serde_json::Value>,
    servicename: String,
    flow: String,
    method: String,
    enable_reality: bool,
    reality_opts: Option<RealityWire>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RealityWire {
    dest: String,
    proxy_protocol_ver: u64,
    server_names: Vec<String>,
    private_key: String,
    min_client_ver: String,
    max_client_ver: String,
    max_time_diff: u64,
    short_ids: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct UserResponse {
    id: i64,
    email: String,
    passwd: String,
    port: u32,
    method: String,
    #[serde(rename = "node_speedlimit")]
    speed_limit: f64,
    #[serde(rename = "node_connector")]
    device_limit: i32,
    uuid: String,
    alive_ip: i32,
}

#[derive(Debug, Serialize)]
struct SystemLoad {
    uptime: String,
    load: String,
}

#[derive(Debug, Serialize)]
struct OnlineWire {
    user_id: i64,
    ip: String,
}

#[derive(Debug, Serialize)]
struct TrafficWire {
    user_id: i64,
    u: i64,
    d: i64,
}

#[derive(Debug, Deserialize)]
struct RuleItem {
    id: i64,
    #[serde(rename = "regex")]
    content: String,
}

#[derive(Debug, Serialize)]
struct IllegalItem {
    list_id: i64,
    user_id: i64,
}

#[derive(Debug, Serialize)]
struct PostData<T> {
    data: T,
}

pub struct Sspanel {
    client: PanelClient,
    api_host: String,
    node_id: u32,
    key: String,
    node_type: NodeType,
    enable_vless: bool,
    vless_flow: String,
    speed_limit: f64,
    device_limit: i32,
    disable_custom_config: bool,
    local_rules: Vec<DetectRule>,
    last_report_online: Mutex<HashMap<i64, i32>>,
    version: Mutex<String>,
}

impl Sspanel {
    pub fn new(config: &ApiConfig) -> PanelResult<Self> {
        let node_type: NodeType = config
            .node_type
            .parse()
            .map_err(PanelError::invalid)?;
        let client = PanelClient::new(&config.api_host, config.timeout)?
            .bind_query("key", &config.api_key)
            // Mu-style deployments authenticate with muKey instead.
            .bind_query("muKey", &config.api_key);
        Ok(Self {
            client,
            api_host: config.api_host.clone(),
            node_id: config.node_id,
            key: config.api_key.clone(),
            node_type,
            enable_vless: config.enable_vless,
            vless_flow: config.vless_flow.clone(),
            speed_limit: config.speed_limit,
            device_limit: config.device_limit,
            disable_custom_config: config.disable_custom_config,
            local_rules: read_local_rules(config.rule_list_path.as_deref()),
            last_report_online: Mutex::new(HashMap::new()),
            version: Mutex::new(String::new()),
        })
    }

    fn unwrap_envelope(&self, raw: &RawResponse) -> PanelResult<serde_json::Value> {
        let envelope: Envelope = raw.json()?;
        if envelope.ret != 1 {
            return Err(PanelError::decode(
                &raw.url,
                format!("ret {} invalid: {}", envelope.ret, raw.body),
            ));
        }
        Ok(envelope.data)
    }

    fn base_node(&self, speed_limit: u64) -> NodeInfo {
        NodeInfo {
            node_type: self.node_type,
            node_id: self.node_id,
            speed_limit,
            ..Default::default()
        }
    }

    fn node_speed_limit(&self, resp: &NodeInfoResponse) -> u64 {
        pick_speed_limit(self.speed_limit, resp.speed_limit)
    }

    fn parse_v2ray_node(&self, resp: &NodeInfoResponse) -> PanelResult<NodeInfo> {
        if resp.raw_server.is_empty() {
            return Err(PanelError::invalid("no server info in response"));
        }
        let parts: Vec<&str> = resp.raw_server.split(';').collect();
        if parts.len() < 6 {
            return Err(PanelError::invalid(format!(
                "malformed server string: {}",
                resp.raw_server
            )));
        }
        let port: u32 = parts[1]
            .parse()
            .map_err(|_| PanelError::invalid(format!("bad port in server string: {}", parts[1])))?;
        let alter_id: u16 = parts[2]
            .parse()
            .map_err(|_| PanelError::invalid(format!("bad alter id: {}", parts[2])))?;

        let mut node = self.base_node(self.node_speed_limit(resp));
        node.port = port;
        node.alter_id = alter_id;
        node.enable_vless = self.enable_vless;
        node.vless_flow = self.vless_flow.clone();
        for flag in &parts[3..5] {
            match *flag {
                "tls" => node.enable_tls = true,
                "" => {}
                other => node.transport = Transport::parse_lossy(other),
            }
        }
        let mut header_type = String::new();
        for item in parts[5].split('|') {
            let mut kv = item.splitn(2, '=');
            let key = kv.next().unwrap_or_default();
            let value = kv.next().unwrap_or_default();
            match key {
                "" => {}
                "path" => node.path = value.to_string(),
                "host" => node.host = value.to_string(),
                "servicename" => node.service_name = value.to_string(),
                "headerType" => header_type = value.to_string(),
                _ => {}
            }
        }
        if !header_type.is_empty() {
            node.header = Some(serde_json::json!({ "type": header_type }));
        }
        Ok(node)
    }

    fn parse_trojan_node(&self, resp: &NodeInfoResponse) -> PanelResult<NodeInfo> {
        // gz.example.com;port=443#12345|host=hk.example.com
        if resp.raw_server.is_empty() {
            return Err(PanelError::invalid("no server info in response"));
        }
        let raw = resp.raw_server.as_str();
        let outside = FIRST_PORT_RE
            .captures(raw)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        let inside = SECOND_PORT_RE
            .captures(raw)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        let host = HOST_RE
            .captures(raw)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        // The inside (offset) port wins when present.
        let port_str = inside.or(outside).ok_or_else(|| {
            PanelError::invalid(format!("no port in trojan server string: {raw}"))
        })?;
        let port: u32 = port_str
            .parse()
            .map_err(|_| PanelError::invalid(format!("bad port: {port_str}")))?;

        let mut node = self.base_node(self.node_speed_limit(resp));
        node.port = port;
        node.host = host;
        node.enable_tls = true;
        if let Some(extra) = raw.split(';').nth(1) {
            for item in extra.split('|') {
                let mut kv = item.splitn(2, '=');
                let key = kv.next().unwrap_or_default();
                let value = kv.next().unwrap_or_default();
                match key {
                    "grpc" => node.transport = Transport::Grpc,
                    "servicename" => node.service_name = value.to_string(),
                    _ => {}
                }
            }
        }
        Ok(node)
    }

    async fn parse_ss_node(&self, resp: &NodeInfoResponse) -> PanelResult<NodeInfo> {
        // The shared listen port only appears on the user roster. Plain GET:
        // a 304 here would starve the node fetch of its port.
        let users = self.fetch_users(false).await?;
        let mut node = self.base_node(self.node_speed_limit(resp));
        node.port = users.first().map(|u| u.port).unwrap_or(0);
        Ok(node)
    }

    fn parse_ss_plugin_node(&self, resp: &NodeInfoResponse) -> PanelResult<NodeInfo> {
        let parts: Vec<&str> = resp.raw_server.split(';').collect();
        if parts.len() < 6 {
            return Err(PanelError::invalid(format!(
                "malformed server string: {}",
                resp.raw_server
            )));
        }
        let port: u32 = parts[1]
            .parse()
            .map_err(|_| PanelError::invalid(format!("bad port: {}", parts[1])))?;
        // Shadowsocks-Plugin needs two ports: shadowsocks itself sits one
        // below the advertised streaming port.
        if port <= 1 {
            return Err(PanelError::invalid(
                "Shadowsocks-Plugin listen port must be bigger than 1",
            ));
        }
        let mut node = self.base_node(self.node_speed_limit(resp));
        node.port = port - 1;
        for flag in &parts[3..5] {
            match *flag {
                "tls" => node.enable_tls = true,
                "ws" => node.transport = Transport::Ws,
                "obfs" => node.transport = Transport::Tcp,
                _ => {}
            }
        }
        for item in parts[5].split('|') {
            let mut kv = item.splitn(2, '=');
            let key = kv.next().unwrap_or_default();
            let value = kv.next().unwrap_or_default();
            match key {
                "path" => node.path = value.to_string(),
                "host" => node.host = value.to_string(),
                _ => {}
            }
        }
        Ok(node)
    }

    fn parse_custom_config(&self, resp: &NodeInfoResponse) -> PanelResult<NodeInfo> {
        if resp.custom_config.is_null() {
            return Err(PanelError::invalid(
                "custom_config is empty, disable custom config",
            ));
        }
        let cc: CustomConfig = serde_json::from_value(resp.custom_config.clone())
            .map_err(|err| PanelError::invalid(format!("custom_config format error: {err}")))?;
        let port: u32 = cc.offset_port_node.parse().map_err(|_| {
            PanelError::invalid(format!("bad offset_port_node: {}", cc.offset_port_node))
        })?;

        let mut node = self.base_node(self.node_speed_limit(resp));
        node.port = port;
        node.host = cc.host;
        node.path = cc.path;
        node.cipher = cc.method;
        node.service_name = cc.servicename;
        node.header = cc.header;
        node.vless_flow = cc.flow;
        match self.node_type {
            NodeType::Shadowsocks | NodeType::ShadowsocksPlugin => {
                node.transport = Transport::Tcp;
            }
            NodeType::Trojan => {
                node.enable_tls = true;
                node.transport = if cc.network.is_empty() {
                    Transport::Tcp
                } else {
                    Transport::parse_lossy(&cc.network)
                };
            }
            _ => {
                node.transport = Transport::parse_lossy(&cc.network);
                if cc.security == "tls" || cc.security == "xtls" {
                    node.enable_tls = true;
                }
                if cc.enable_vless == "1" {
                    node.enable_vless = true;
                }
            }
        }
        node.enable_reality = cc.enable_reality;
        if let Some(r) = cc.reality_opts {
            node.reality = Some(RealityOptions {
                dest: r.dest,
                proxy_protocol_ver: r.proxy_protocol_ver,
                server_names: r.server_names,
                private_key: r.private_key,
                min_client_ver: r.min_client_ver,
                max_client_ver: r.max_client_ver,
                max_time_diff: r.max_time_diff,
                short_ids: r.short_ids,
                show: false,
            });
        }
        Ok(node)
    }

    async fn fetch_users(&self, conditional: bool) -> PanelResult<Vec<UserResponse>> {
        let slot = conditional.then_some("users");
        let raw = self
            .client
            .get(
                "/mod_mu/users",
                slot,
                &[("node_id", self.node_id.to_string())],
            )
            .await?;
        let data = self.unwrap_envelope(&raw)?;
        serde_json::from_value(data).map_err(|err| PanelError::decode(&raw.url, err))
    }

    fn translate_users(&self, users: Vec<UserResponse>) -> Vec<UserInfo> {
        let last_online = self.last_report_online.lock();
        let mut out = Vec::with_capacity(users.len());
        for user in users {
            let limit = if self.device_limit > 0 {
                self.device_limit
            } else {
                user.device_limit
            };
            let last = last_online.get(&user.id).copied().unwrap_or(0);
            let Some(device_limit) = reconcile_device_limit(limit, user.alive_ip, last) else {
                continue;
            };
            out.push(UserInfo {
                uid: user.id,
                email: user.email,
                uuid: user.uuid,
                passwd: user.passwd,
                speed_limit: pick_speed_limit(self.speed_limit, user.speed_limit),
                device_limit,
                port: user.port,
                alter_id: 0,
                method: user.method,
            });
        }
        out
    }
}

#[async_trait]
impl Panel for Sspanel {
    async fn get_node_info(&self) -> PanelResult<NodeInfo> {
        let path = format!("/mod_mu/nodes/{}/info", self.node_id);
        let raw = self.client.get(&path, Some("node"), &[]).await?;
        let data = self.unwrap_envelope(&raw)?;
        let resp: NodeInfoResponse =
            serde_json::from_value(data).map_err(|err| PanelError::decode(&raw.url, err))?;

        *self.version.lock() = resp.version.clone();
        let expired = compare_version(&resp.version, "2021.11") == Ordering::Less;
        if self.disable_custom_config || expired {
            if expired {
                tracing::warn!(
                    version = %resp.version,
                    "panel version is expired, update is recommended"
                );
            }
            match self.node_type {
                NodeType::V2ray | NodeType::Vmess | NodeType::Vless => self.parse_v2ray_node(&resp),
                NodeType::Trojan => self.parse_trojan_node(&resp),
                NodeType::Shadowsocks => self.parse_ss_node(&resp).await,
                NodeType::ShadowsocksPlugin => self.parse_ss_plugin_node(&resp),
                NodeType::DokodemoDoor => {
                    Err(PanelError::invalid("unsupported node type: dokodemo-door"))
                }
            }
        } else {
            self.parse_custom_config(&resp)
        }
    }

    async fn get_user_list(&self) -> PanelResult<Vec<UserInfo>> {
        let users = self.fetch_users(true).await?;
        Ok(self.translate_users(users))
    }

    async fn report_node_status(&self, status: &NodeStatus) -> PanelResult<()> {
        // From 2023.2 on the panel refuses status posts.
        if compare_version(&self.version.lock().clone(), "2023.2") != Ordering::Less {
            return Ok(());
        }
        let path = format!("/mod_mu/nodes/{}/info", self.node_id);
        let load = SystemLoad {
            uptime: status.uptime.to_string(),
            load: format!(
                "{:.2} {:.2} {:.2}",
                status.cpu / 100.0,
                status.mem / 100.0,
                status.disk / 100.0
            ),
        };
        let raw = self.client.post_json(&path, &[], &load).await?;
        self.unwrap_envelope(&raw)?;
        Ok(())
    }

    async fn report_node_online_users(&self, online: &[OnlineUser]) -> PanelResult<()> {
        let data: Vec<OnlineWire> = online
            .iter()
            .map(|u| OnlineWire {
                user_id: u.uid,
                ip: u.ip.clone(),
            })
            .collect();
        let raw = self
            .client
            .post_json(
                "/mod_mu/users/aliveip",
                &[("node_id", self.node_id.to_string())],
                &PostData { data },
            )
            .await?;
        self.unwrap_envelope(&raw)?;

        // Only a successful submission may advance the reconciliation state.
        let mut counts: HashMap<i64, i32> = HashMap::new();
        for user in online {
            *counts.entry(user.uid).or_insert(0) += 1;
        }
        *self.last_report_online.lock() = counts;
        Ok(())
    }

    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> PanelResult<()> {
        let data: Vec<TrafficWire> = traffic
            .iter()
            .map(|t| TrafficWire {
                user_id: t.uid,
                u: t.upload,
                d: t.download,
            })
            .collect();
        let raw = self
            .client
            .post_json(
                "/mod_mu/users/traffic",
                &[("node_id", self.node_id.to_string())],
                &PostData { data },
            )
            .await?;
        self.unwrap_envelope(&raw)?;
        Ok(())
    }

    async fn get_node_rule(&self) -> PanelResult<Vec<DetectRule>> {
        let raw = self
            .client
            .get("/mod_mu/func/detect_rules", Some("rules"), &[])
            .await?;
        let data = self.unwrap_envelope(&raw)?;
        let items: Vec<RuleItem> =
            serde_json::from_value(data).map_err(|err| PanelError::decode(&raw.url, err))?;
        let mut rules = self.local_rules.clone();
        for item in items {
            match DetectRule::new(item.id, &item.content) {
                Ok(rule) => rules.push(rule),
                Err(err) => {
                    tracing::warn!(rule_id = item.id, pattern = %item.content, %err,
                        "invalid panel rule dropped");
                }
            }
        }
        Ok(rules)
    }

    async fn report_illegal(&self, results: &[DetectResult]) -> PanelResult<()> {
        let data: Vec<IllegalItem> = results
            .iter()
            .map(|r| IllegalItem {
                list_id: r.rule_id,
                user_id: r.uid,
            })
            .collect();
        let raw = self
            .client
            .post_json(
                "/mod_mu/users/detectlog",
                &[("node_id", self.node_id.to_string())],
                &PostData { data },
            )
            .await?;
        self.unwrap_envelope(&raw)?;
        Ok(())
    }

    fn describe(&self) -> ClientInfo {
        ClientInfo {
            api_host: self.api_host.clone(),
            node_id: self.node_id,
            key: self.key.clone(),
            node_type: self.node_type,
        }
    }

    fn set_debug(&self, enable: bool) {
        self.client.set_debug(enable);
    }
}

/// Numeric dot-segment version comparison, tolerant of differing lengths.
fn compare_version(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.').map(|s| s.parse::<u64>().unwrap_or(0));
    let mut right = b.split('.').map(|s| s.parse::<u64>().unwrap_or(0));
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (x, y) => match x.unwrap_or(0).cmp(&y.unwrap_or(0)) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(node_type: &str) -> Sspanel {
        Sspanel::new(&ApiConfig {
            api_host: "http://panel.example".into(),
            node_id: 4,
            api_key: "key".into(),
            node_type: node_type.into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn version_compare() {
        assert_eq!(compare_version("2021.10", "2021.11"), Ordering::Less);
        assert_eq!(compare_version("2021.11", "2021.11"), Ordering::Equal);
        assert_eq!(compare_version("2023.2", "2021.11"), Ordering::Greater);
        assert_eq!(compare_version("2021.11.1", "2021.11"), Ordering::Greater);
        assert_eq!(compare_version("", "2021.11"), Ordering::Less);
    }

    #[test]
    fn v2ray_server_string() {
        let c = adapter("V2ray");
        let resp = NodeInfoResponse {
            raw_server: "node.example;10086;2;tls;ws;path=/ws|host=a.example|headerType=none"
                .into(),
            speed_limit: 80.0,
            ..Default::default()
        };
        let node = c.parse_v2ray_node(&resp).unwrap();
        assert_eq!(node.port, 10086);
        assert_eq!(node.alter_id, 2);
        assert!(node.enable_tls);
        assert_eq!(node.transport, Transport::Ws);
        assert_eq!(node.path, "/ws");
        assert_eq!(node.host, "a.example");
        assert_eq!(node.header, Some(serde_json::json!({"type": "none"})));
        assert_eq!(node.speed_limit, 10_000_000);
    }

    #[test]
    fn v2ray_server_string_path_with_equals() {
        let c = adapter("V2ray");
        let resp = NodeInfoResponse {
            raw_server: "node.example;8080;0;;ws;path=/ws?token=x=1|host=h".into(),
            ..Default::default()
        };
        let node = c.parse_v2ray_node(&resp).unwrap();
        assert_eq!(node.path, "/ws?token=x=1");
    }

    #[test]
    fn trojan_server_string_prefers_inside_port() {
        let c = adapter("Trojan");
        let resp = NodeInfoResponse {
            raw_server: "gz.example.com;port=443#12345|host=hk.example.com".into(),
            ..Default::default()
        };
        let node = c.parse_trojan_node(&resp).unwrap();
        assert_eq!(node.port, 12345);
        assert_eq!(node.host, "hk.example.com");
        assert!(node.enable_tls);
        assert_eq!(node.transport, Transport::Tcp);

        let resp = NodeInfoResponse {
            raw_server: "gz.example.com;port=443|grpc=1|servicename=grpcs".into(),
            ..Default::default()
        };
        let node = c.parse_trojan_node(&resp).unwrap();
        assert_eq!(node.port, 443);
        assert_eq!(node.transport, Transport::Grpc);
        assert_eq!(node.service_name, "grpcs");
    }

    #[test]
    fn ss_plugin_listens_one_port_below() {
        let c = adapter("Shadowsocks-Plugin");
        let resp = NodeInfoResponse {
            raw_server: "node.example;10240;0;tls;ws;path=/obfs|host=o.example".into(),
            ..Default::default()
        };
        let node = c.parse_ss_plugin_node(&resp).unwrap();
        assert_eq!(node.port, 10239);
        assert!(node.enable_tls);
        assert_eq!(node.transport, Transport::Ws);
        assert_eq!(node.path, "/obfs");
    }

    #[test]
    fn custom_config_takes_precedence_fields() {
        let c = adapter("V2ray");
        let resp = NodeInfoResponse {
            custom_config: serde_json::json!({
                "offset_port_node": "20086",
                "network": "grpc",
                "security": "tls",
                "enable_vless": "1",
                "servicename": "svc",
                "host": "b.example",
            }),
            speed_limit: 8.0,
            ..Default::default()
        };
        let node = c.parse_custom_config(&resp).unwrap();
        assert_eq!(node.port, 20086);
        assert_eq!(node.transport, Transport::Grpc);
        assert!(node.enable_tls);
        assert!(node.enable_vless);
        assert_eq!(node.service_name, "svc");
        assert_eq!(node.speed_limit, 1_000_000);
    }

    #[test]
    fn custom_config_reality() {
        let c = adapter("V2ray");
        let resp = NodeInfoResponse {
            custom_config: serde_json::json!({
                "offset_port_node": "443",
                "network": "tcp",
                "enable_reality": true,
                "reality_opts": {
                    "dest": "www.example.com:443",
                    "server_names": ["www.example.com"],
                    "private_key": "pk",
                    "short_ids": ["01ab"],
                },
            }),
            ..Default::default()
        };
        let node = c.parse_custom_config(&resp).unwrap();
        assert!(node.enable_reality);
        let reality = node.reality.unwrap();
        assert_eq!(reality.dest, "www.example.com:443");
        assert_eq!(reality.server_names, vec!["www.example.com"]);
    }

    #[test]
    fn custom_config_requires_blob() {
        let c = adapter("V2ray");
        let resp = NodeInfoResponse::default();
        assert!(c.parse_custom_config(&resp).is_err());
    }

    #[test]
    fn user_translation_reconciles_devices() {
        let c = adapter("V2ray");
        c.last_report_online.lock().insert(2, 1);
        let users = vec![
            UserResponse {
                id: 1,
                uuid: "u1".into(),
                device_limit: 2,
                alive_ip: 4,
                ..Default::default()
            },
            UserResponse {
                id: 2,
                uuid: "u2".into(),
                device_limit: 2,
                alive_ip: 4,
                speed_limit: 16.0,
                ..Default::default()
            },
        ];
        let out = c.translate_users(users);
        // uid 1 has no budget anywhere; uid 2 reported one device last cycle.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].uid, 2);
        assert_eq!(out[0].device_limit, 1);
        assert_eq!(out[0].speed_limit, 2_000_000);
    }
}
