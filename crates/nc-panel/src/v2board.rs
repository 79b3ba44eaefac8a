//! V2board (UniProxy) adapter, serving both the `NewV2board` and legacy
//! `V2board` panel type names.
//!
//! Node, user and push traffic live under `/api/v1/server/UniProxy/`; audit
//! rules are derived from the `routes` section of the cached node config
//! (entries with `action == "block"`).

use crate::client::PanelClient;
use crate::error::{PanelError, PanelResult};
use crate::types::*;
use crate::Panel;
use async_trait::async_trait;
use nc_config::ApiConfig;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct Route {
    #[serde(rename = "match")]
    matches: Vec<String>,
    action: String,
    #[serde(rename = "action_value")]
    _action_value: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct UniProxyConfig {
    server_port: u32,
    network: String,
    #[serde(rename = "networkSettings")]
    network_settings: Option<serde_json::Value>,
    tls: i64,
    host: String,
    server_name: String,
    cipher: String,
    obfs: String,
    obfs_settings: ObfsSettings,
    server_key: String,
    routes: Vec<Route>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct ObfsSettings {
    path: String,
}

#[derive(Debug, Deserialize)]
struct UserPage {
    #[serde(default)]
    users: Vec<UserWire>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct UserWire {
    id: i64,
    uuid: String,
    speed_limit: Option<f64>,
}

pub struct V2board {
    client: PanelClient,
    api_host: String,
    node_id: u32,
    key: String,
    node_type: NodeType,
    enable_vless: bool,
    vless_flow: String,
    speed_limit: f64,
    device_limit: i32,
    local_rules: Vec<DetectRule>,
    config_cache: Mutex<Option<UniProxyConfig>>,
}

impl V2board {
    pub fn new(config: &ApiConfig) -> PanelResult<Self> {
        let node_type: NodeType = config.node_type.parse().map_err(PanelError::invalid)?;
        match node_type {
            NodeType::V2ray | NodeType::Vmess | NodeType::Vless
            | NodeType::Trojan | NodeType::Shadowsocks => {}
            other => {
                return Err(PanelError::invalid(format!(
                    "unsupported node type for v2board: {other}"
                )))
            }
        }
        let client = PanelClient::new(&config.api_host, config.timeout)?
            .bind_query("node_id", config.node_id)
            .bind_query("node_type", config.node_type.to_lowercase())
            .bind_query("token", &config.api_key);
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
            local_rules: read_local_rules(config.rule_list_path.as_deref()),
            config_cache: Mutex::new(None),
        })
    }

    fn base_node(&self, port: u32) -> PanelResult<NodeInfo> {
        if port == 0 {
            return Err(PanelError::invalid("server port must > 0"));
        }
        Ok(NodeInfo {
            node_type: self.node_type,
            node_id: self.node_id,
            port,
            ..Default::default()
        })
    }

    fn parse_v2ray_node(&self, cc: &UniProxyConfig) -> PanelResult<NodeInfo> {
        let mut node = self.base_node(cc.server_port)?;
        node.transport = Transport::parse_lossy(&cc.network);
        node.enable_tls = cc.tls == 1;
        node.enable_vless = self.enable_vless;
        node.vless_flow = self.vless_flow.clone();
        if let Some(settings) = &cc.network_settings {
            match node.transport {
                Transport::Ws => {
                    node.path = settings
                        .get("path")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    node.host = settings
                        .pointer("/headers/Host")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                }
                Transport::Grpc => {
                    node.service_name = settings
                        .get("serviceName")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                }
                Transport::Tcp => {
                    node.header = settings.get("headers").cloned();
                }
                _ => {}
            }
        }
        Ok(node)
    }

    fn parse_trojan_node(&self, cc: &UniProxyConfig) -> PanelResult<NodeInfo> {
        let mut node = self.base_node(cc.server_port)?;
        node.enable_tls = true;
        node.host = cc.host.clone();
        node.service_name = cc.server_name.clone();
        Ok(node)
    }

    fn parse_ss_node(&self, cc: &UniProxyConfig) -> PanelResult<NodeInfo> {
        let mut node = self.base_node(cc.server_port)?;
        node.cipher = cc.cipher.clone();
        node.server_key = cc.server_key.clone();
        if cc.obfs == "http" {
            let path = if cc.obfs_settings.path.is_empty() {
                "/"
            } else {
                cc.obfs_settings.path.as_str()
            };
            node.header = Some(serde_json::json!({
                "type": "http",
                "request": { "path": path },
            }));
        }
        Ok(node)
    }
}

#[async_trait]
impl Panel for V2board {
    async fn get_node_info(&self) -> PanelResult<NodeInfo> {
        let raw = self
            .client
            .get("/api/v1/server/UniProxy/config", Some("node"), &[])
            .await?;
        let cc: UniProxyConfig = raw.json()?;
        let node = match self.node_type {
            NodeType::Trojan => self.parse_trojan_node(&cc),
            NodeType::Shadowsocks => self.parse_ss_node(&cc),
            _ => self.parse_v2ray_node(&cc),
        }?;
        *self.config_cache.lock() = Some(cc);
        Ok(node)
    }

    async fn get_user_list(&self) -> PanelResult<Vec<UserInfo>> {
        let raw = self
            .client
            .get("/api/v1/server/UniProxy/user", Some("users"), &[])
            .await?;
        let page: UserPage = raw.json()?;
        let mut out = Vec::with_capacity(page.users.len());
        for user in page.users {
            let speed_limit = if self.speed_limit > 0.0 {
                mbps_to_bps(self.speed_limit)
            } else {
                mbps_to_bps(user.speed_limit.unwrap_or(0.0))
            };
            let passwd = if self.node_type == NodeType::Shadowsocks {
                user.uuid.clone()
            } else {
                String::new()
            };
            out.push(UserInfo {
                uid: user.id,
                email: format!("{}@v2board.user", user.uuid),
                uuid: user.uuid,
                passwd,
                speed_limit,
                // The panel does not ship a per-user device budget yet.
                device_limit: self.device_limit,
                ..Default::default()
            });
        }
        Ok(out)
    }

    async fn report_node_status(&self, _status: &NodeStatus) -> PanelResult<()> {
        Ok(())
    }

    async fn report_node_online_users(&self, _online: &[OnlineUser]) -> PanelResult<()> {
        Ok(())
    }

    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> PanelResult<()> {
        // {uid: [upload, download]}
        let mut data: HashMap<i64, [i64; 2]> = HashMap::with_capacity(traffic.len());
        for t in traffic {
            data.insert(t.uid, [t.upload, t.download]);
        }
        self.client
            .post_json("/api/v1/server/UniProxy/push", &[], &data)
            .await?;
        Ok(())
    }

    async fn get_node_rule(&self) -> PanelResult<Vec<DetectRule>> {
        let mut rules = self.local_rules.clone();
        let cache = self.config_cache.lock();
        let Some(cc) = cache.as_ref() else {
            return Ok(rules);
        };
        for (i, route) in cc.routes.iter().enumerate() {
            if route.action != "block" {
                continue;
            }
            let pattern = route.matches.join("|");
            match DetectRule::new(i as i64, &pattern) {
                Ok(rule) => rules.push(rule),
                Err(err) => {
                    tracing::warn!(index = i, %pattern, %err, "invalid panel rule dropped");
                }
            }
        }
        Ok(rules)
    }

    async fn report_illegal(&self, _results: &[DetectResult]) -> PanelResult<()> {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(node_type: &str) -> V2board {
        V2board::new(&ApiConfig {
            api_host: "http://panel.example".into(),
            node_id: 9,
            api_key: "token".into(),
            node_type: node_type.into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn rejects_plugin_nodes() {
        assert!(V2board::new(&ApiConfig {
            api_host: "http://x".into(),
            node_type: "Shadowsocks-Plugin".into(),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn parses_ws_v2ray_config() {
        let c = adapter("V2ray");
        let cc: UniProxyConfig = serde_json::from_value(serde_json::json!({
            "server_port": 10086,
            "network": "ws",
            "tls": 1,
            "networkSettings": {"path": "/x", "headers": {"Host": "a.example"}},
        }))
        .unwrap();
        let node = c.parse_v2ray_node(&cc).unwrap();
        assert_eq!(node.port, 10086);
        assert_eq!(node.transport, Transport::Ws);
        assert!(node.enable_tls);
        assert_eq!(node.path, "/x");
        assert_eq!(node.host, "a.example");
    }

    #[test]
    fn parses_ss_obfs_header() {
        let c = adapter("Shadowsocks");
        let cc: UniProxyConfig = serde_json::from_value(serde_json::json!({
            "server_port": 8388,
            "cipher": "2022-blake3-aes-128-gcm",
            "server_key": "sk",
            "obfs": "http",
            "obfs_settings": {"path": ""},
        }))
        .unwrap();
        let node = c.parse_ss_node(&cc).unwrap();
        assert_eq!(node.cipher, "2022-blake3-aes-128-gcm");
        assert_eq!(node.server_key, "sk");
        assert_eq!(
            node.header,
            Some(serde_json::json!({"type": "http", "request": {"path": "/"}}))
        );
    }

    #[test]
    fn zero_port_is_rejected() {
        let c = adapter("Trojan");
        let cc = UniProxyConfig::default();
        let err = c.parse_trojan_node(&cc).unwrap_err();
        assert!(err.to_string().contains("server port must > 0"));
    }

    #[test]
    fn rules_come_from_cached_block_routes() {
        let c = adapter("V2ray");
        *c.config_cache.lock() = Some(
            serde_json::from_value(serde_json::json!({
                "server_port": 1,
                "routes": [
                    {"match": ["google.com", "youtube.com"], "action": "block"},
                    {"match": ["1.1.1.1"], "action": "dns", "action_value": "8.8.8.8"},
                ],
            }))
            .unwrap(),
        );
        let rules = futures_block_on(c.get_node_rule()).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, 0);
        assert!(rules[0].pattern.is_match("youtube.com"));
    }

    // Small helper: these trait methods are async only because of the
    // transport; rule derivation itself never awaits.
    fn futures_block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
