//! GoV2Panel adapter.
//!
//! Requests carry `token` and `node_id` alongside the payload; responses are
//! wrapped in `{code, message, data}` where a non-zero code is a panel-side
//! failure even on HTTP 200.

use crate::client::{PanelClient, RawResponse};
use crate::error::{PanelError, PanelResult};
use crate::types::*;
use crate::Panel;
use async_trait::async_trait;
use nc_config::ApiConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct ServerConfig {
    port: serde_json::Value,
    net: String,
    host: String,
    path: String,
    tls: String,
    encryption: String,
    server_key: String,
    routes: Vec<Route>,
    header: Option<serde_json::Value>,
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
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct UserData {
    users: Vec<UserWire>,
}

#[derive(Debug, Serialize)]
struct TrafficWire {
    #[serde(rename = "UID")]
    uid: i64,
    #[serde(rename = "Email")]
    email: String,
    #[serde(rename = "Upload")]
    upload: i64,
    #[serde(rename = "Download")]
    download: i64,
}

pub struct Gov2panel {
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
}

impl Gov2panel {
    pub fn new(config: &ApiConfig) -> PanelResult<Self> {
        let node_type: NodeType = config.node_type.parse().map_err(PanelError::invalid)?;
        let client = PanelClient::new(&config.api_host, config.timeout)?;
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
        })
    }

    fn auth_query(&self) -> [(&'static str, String); 2] {
        [
            ("token", self.key.clone()),
            ("node_id", self.node_id.to_string()),
        ]
    }

    fn unwrap_envelope(&self, raw: &RawResponse) -> PanelResult<serde_json::Value> {
        let envelope: Envelope = raw.json()?;
        if envelope.code != 0 {
            return Err(PanelError::decode(
                &raw.url,
                format!("code {}: {}", envelope.code, envelope.message),
            ));
        }
        Ok(envelope.data)
    }

    async fn fetch_config(&self) -> PanelResult<ServerConfig> {
        let body = serde_json::json!({
            "token": self.key,
            "node_id": self.node_id,
        });
        let raw = self
            .client
            .post_json("/api/server/config", &[], &body)
            .await?;
        let data = self.unwrap_envelope(&raw)?;
        if data.is_null() {
            return Err(PanelError::invalid("gov2panel node config data is null"));
        }
        serde_json::from_value(data).map_err(|err| PanelError::decode(&raw.url, err))
    }

    fn port_of(cc: &ServerConfig) -> PanelResult<u32> {
        let port = match &cc.port {
            serde_json::Value::String(s) => s.parse::<u32>().unwrap_or(0),
            serde_json::Value::Number(n) => n.as_u64().unwrap_or(0) as u32,
            _ => 0,
        };
        if port == 0 {
            return Err(PanelError::invalid("server port must > 0"));
        }
        Ok(port)
    }
}

#[async_trait]
impl Panel for Gov2panel {
    async fn get_node_info(&self) -> PanelResult<NodeInfo> {
        let cc = self.fetch_config().await?;
        let mut node = NodeInfo {
            node_type: self.node_type,
            node_id: self.node_id,
            port: Self::port_of(&cc)?,
            transport: Transport::parse_lossy(&cc.net),
            host: cc.host.clone(),
            path: cc.path.clone(),
            enable_tls: cc.tls == "tls" || cc.tls == "1",
            enable_vless: self.enable_vless,
            vless_flow: self.vless_flow.clone(),
            cipher: cc.encryption.clone(),
            server_key: cc.server_key.clone(),
            header: cc.header.clone(),
            ..Default::default()
        };
        if self.node_type == NodeType::Shadowsocks {
            node.transport = Transport::Tcp;
        }
        Ok(node)
    }

    async fn get_user_list(&self) -> PanelResult<Vec<UserInfo>> {
        let query = self.auth_query();
        let raw = self.client.get("/api/server/user", None, &query).await?;
        let data = self.unwrap_envelope(&raw)?;
        let users: UserData =
            serde_json::from_value(data).map_err(|err| PanelError::decode(&raw.url, err))?;
        let mut out = Vec::with_capacity(users.users.len());
        for user in users.users {
            let speed_limit = if self.speed_limit > 0.0 {
                mbps_to_bps(self.speed_limit)
            } else {
                mbps_to_bps(user.speed_limit)
            };
            let passwd = if self.node_type == NodeType::Shadowsocks {
                user.uuid.clone()
            } else {
                String::new()
            };
            out.push(UserInfo {
                uid: user.id,
                email: format!("{}@gov2panel.user", user.uuid),
                uuid: user.uuid,
                passwd,
                speed_limit,
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
        let data: Vec<TrafficWire> = traffic
            .iter()
            .map(|t| TrafficWire {
                uid: t.uid,
                email: t.email.clone(),
                upload: t.upload,
                download: t.download,
            })
            .collect();
        let body = serde_json::json!({
            "token": self.key,
            "node_id": self.node_id,
            "data": data,
        });
        let raw = self.client.post_json("/api/server/push", &[], &body).await?;
        self.unwrap_envelope(&raw)?;
        Ok(())
    }

    async fn get_node_rule(&self) -> PanelResult<Vec<DetectRule>> {
        let cc = self.fetch_config().await?;
        let mut rules = self.local_rules.clone();
        for (i, route) in cc.routes.iter().enumerate() {
            if route.action != "block" {
                continue;
            }
            for pattern in &route.matches {
                match DetectRule::new(i as i64, pattern) {
                    Ok(rule) => rules.push(rule),
                    Err(err) => {
                        tracing::warn!(index = i, %pattern, %err, "invalid panel rule dropped");
                    }
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
