//! Aikopanel adapter.
//!
//! A v2board descendant under `/api/v1/server/Aiko/`. Extra fields hint the
//! device limit (`device_limit` + fleet-wide `alive_ip`), so the roster goes
//! through the same reconciliation as sspanel. `tls == 2` selects REALITY
//! with parameters flattened into `tls_settings`.

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
struct ServerConfig {
    server_port: u32,
    #[serde(rename = "speedlimit")]
    speed_limit: f64,
    cipher: String,
    obfs: String,
    obfs_settings: ObfsSettings,
    server_key: String,
    network: String,
    #[serde(rename = "networkSettings")]
    network_settings: NetworkSettings,
    #[serde(rename = "flow")]
    vless_flow: String,
    tls_settings: TlsSettings,
    tls: i64,
    host: String,
    routes: Vec<Route>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct ObfsSettings {
    path: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct NetworkSettings {
    path: String,
    headers: Option<serde_json::Value>,
    #[serde(rename = "serviceName")]
    service_name: String,
    header: Option<serde_json::Value>,
    host: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct TlsSettings {
    server_port: String,
    dest: String,
    xver: serde_json::Value,
    #[serde(rename = "server_name")]
    sni: String,
    private_key: String,
    short_id: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct Route {
    #[serde(rename = "match")]
    matches: Vec<String>,
    action: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct UserWire {
    id: i64,
    uuid: String,
    speed_limit: f64,
    device_limit: i32,
    alive_ip: i32,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct UserPage {
    users: Vec<UserWire>,
}

pub struct Aikopanel {
    client: PanelClient,
    api_host: String,
    node_id: u32,
    key: String,
    node_type: NodeType,
    enable_vless: bool,
    speed_limit: f64,
    device_limit: i32,
    local_rules: Vec<DetectRule>,
    last_report_online: Mutex<HashMap<i64, i32>>,
    config_cache: Mutex<Option<ServerConfig>>,
}

impl Aikopanel {
    pub fn new(config: &ApiConfig) -> PanelResult<Self> {
        let node_type: NodeType = config.node_type.parse().map_err(PanelError::invalid)?;
        // A vless-enabled v2ray node registers as "vless" upstream.
        let wire_type = if node_type == NodeType::V2ray && config.enable_vless {
            "vless".to_string()
        } else {
            config.node_type.to_lowercase()
        };
        let client = PanelClient::new(&config.api_host, config.timeout)?
            .bind_query("node_id", config.node_id)
            .bind_query("node_type", wire_type)
            .bind_query("token", &config.api_key);
        Ok(Self {
            client,
            api_host: config.api_host.clone(),
            node_id: config.node_id,
            key: config.api_key.clone(),
            node_type,
            enable_vless: config.enable_vless,
            speed_limit: config.speed_limit,
            device_limit: config.device_limit,
            local_rules: read_local_rules(config.rule_list_path.as_deref()),
            last_report_online: Mutex::new(HashMap::new()),
            config_cache: Mutex::new(None),
        })
    }

    fn node_speed(&self, cc: &ServerConfig) -> u64 {
        pick_speed_limit(self.speed_limit, cc.speed_limit)
    }

    fn parse_ss_node(&self, cc: &ServerConfig) -> PanelResult<NodeInfo> {
        let mut node = NodeInfo {
            node_type: self.node_type,
            node_id: self.node_id,
            port: cc.server_port,
            cipher: cc.cipher.clone(),
            server_key: cc.server_key.clone(),
            speed_limit: self.node_speed(cc),
            ..Default::default()
        };
        if cc.obfs == "http" {
            let path = if cc.obfs_settings.path.is_empty() {
                "/".to_string()
            } else if cc.obfs_settings.path.starts_with('/') {
                cc.obfs_settings.path.clone()
            } else {
                format!("/{}", cc.obfs_settings.path)
            };
            node.header = Some(serde_json::json!({
                "type": "http",
                "request": { "path": path },
            }));
        }
        Ok(node)
    }

    fn parse_trojan_node(&self, cc: &ServerConfig) -> PanelResult<NodeInfo> {
        Ok(NodeInfo {
            node_type: self.node_type,
            node_id: self.node_id,
            port: cc.server_port,
            transport: if cc.network.is_empty() {
                Transport::Tcp
            } else {
                Transport::parse_lossy(&cc.network)
            },
            path: cc.network_settings.path.clone(),
            enable_tls: true,
            host: cc.host.clone(),
            service_name: cc.network_settings.service_name.clone(),
            speed_limit: self.node_speed(cc),
            ..Default::default()
        })
    }

    fn parse_v2ray_node(&self, cc: &ServerConfig) -> PanelResult<NodeInfo> {
        let mut node = NodeInfo {
            node_type: self.node_type,
            node_id: self.node_id,
            port: cc.server_port,
            transport: Transport::parse_lossy(&cc.network),
            path: cc.network_settings.path.clone(),
            service_name: cc.network_settings.service_name.clone(),
            enable_vless: self.enable_vless,
            vless_flow: cc.vless_flow.clone(),
            speed_limit: self.node_speed(cc),
            ..Default::default()
        };
        match node.transport {
            Transport::Ws => {
                if let Some(headers) = &cc.network_settings.headers {
                    node.host = headers["Host"].as_str().unwrap_or_default().to_string();
                }
            }
            Transport::Tcp => {
                node.header = cc.network_settings.header.clone();
            }
            Transport::H2 => {
                node.header = cc.network_settings.header.clone();
                node.host = if cc.network_settings.host.is_empty() {
                    "aikopanel.com".to_string()
                } else {
                    cc.network_settings.host.clone()
                };
            }
            _ => {}
        }
        if cc.tls != 0 {
            node.enable_tls = true;
            if cc.tls == 2 {
                node.enable_reality = true;
                let dest_host = if cc.tls_settings.dest.is_empty() {
                    &cc.tls_settings.sni
                } else {
                    &cc.tls_settings.dest
                };
                let xver = match &cc.tls_settings.xver {
                    serde_json::Value::String(s) => s.parse().unwrap_or(0),
                    serde_json::Value::Number(n) => n.as_u64().unwrap_or(0),
                    _ => 0,
                };
                node.reality = Some(RealityOptions {
                    dest: format!("{}:{}", dest_host, cc.tls_settings.server_port),
                    proxy_protocol_ver: xver,
                    server_names: vec![cc.tls_settings.sni.clone()],
                    private_key: cc.tls_settings.private_key.clone(),
                    short_ids: vec![cc.tls_settings.short_id.clone()],
                    ..Default::default()
                });
            }
        }
        Ok(node)
    }

    fn translate_users(&self, wires: Vec<UserWire>) -> Vec<UserInfo> {
        let last_online = self.last_report_online.lock();
        let mut out = Vec::with_capacity(wires.len());
        for wire in wires {
            let limit = if self.device_limit > 0 {
                self.device_limit
            } else {
                wire.device_limit
            };
            let last = last_online.get(&wire.id).copied().unwrap_or(0);
            let Some(device_limit) = reconcile_device_limit(limit, wire.alive_ip, last) else {
                continue;
            };
            let passwd = if self.node_type == NodeType::Shadowsocks {
                wire.uuid.clone()
            } else {
                String::new()
            };
            out.push(UserInfo {
                uid: wire.id,
                email: format!("{}@aikopanel.user", wire.uuid),
                uuid: wire.uuid,
                passwd,
                speed_limit: pick_speed_limit(self.speed_limit, wire.speed_limit),
                device_limit,
                ..Default::default()
            });
        }
        out
    }
}

#[async_trait]
impl Panel for Aikopanel {
    async fn get_node_info(&self) -> PanelResult<NodeInfo> {
        let raw = self
            .client
            .get("/api/v1/server/Aiko/config", Some("node"), &[])
            .await?;
        let cc: ServerConfig = raw.json()?;
        let node = match self.node_type {
            NodeType::Shadowsocks => self.parse_ss_node(&cc),
            NodeType::Trojan => self.parse_trojan_node(&cc),
            _ => self.parse_v2ray_node(&cc),
        }?;
        if node.port == 0 {
            return Err(PanelError::invalid("server port must > 0"));
        }
        *self.config_cache.lock() = Some(cc);
        Ok(node)
    }

    async fn get_user_list(&self) -> PanelResult<Vec<UserInfo>> {
        let raw = self
            .client
            .get("/api/v1/server/Aiko/user", Some("users"), &[])
            .await?;
        let page: UserPage = raw.json()?;
        if page.users.is_empty() {
            return Err(PanelError::decode(&raw.url, "users is null"));
        }
        Ok(self.translate_users(page.users))
    }

    async fn report_node_status(&self, _status: &NodeStatus) -> PanelResult<()> {
        Ok(())
    }

    async fn report_node_online_users(&self, online: &[OnlineUser]) -> PanelResult<()> {
        // {uid: [ip, ...]}
        let mut data: HashMap<i64, Vec<String>> = HashMap::new();
        for user in online {
            data.entry(user.uid).or_default().push(user.ip.clone());
        }
        self.client
            .post_json("/api/v1/server/Aiko/alive", &[], &data)
            .await?;

        let mut counts: HashMap<i64, i32> = HashMap::new();
        for user in online {
            *counts.entry(user.uid).or_insert(0) += 1;
        }
        *self.last_report_online.lock() = counts;
        Ok(())
    }

    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> PanelResult<()> {
        let mut data: HashMap<i64, [i64; 2]> = HashMap::with_capacity(traffic.len());
        for t in traffic {
            data.insert(t.uid, [t.upload, t.download]);
        }
        self.client
            .post_json("/api/v1/server/Aiko/push", &[], &data)
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
