//! PMpanel adapter.
//!
//! Auth rides in a `key` header; the protocol family is lowercased into the
//! `type` query parameter (`ss`/`v2ray`/`trojan`). The envelope is
//! `{ret, data}` with `ret == 200` on success.

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
    ret: i64,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct NodeWire {
    #[serde(rename = "speedlimit")]
    speed_limit: f64,
    #[serde(rename = "outPort")]
    port: u32,
    #[serde(rename = "alterId")]
    alter_id: u16,
    network: String,
    host: String,
    path: String,
    sni: String,
    security: String,
    method: String,
    grpc: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct UserWire {
    id: i64,
    passwd: String,
    #[serde(rename = "nodeSpeedlimit")]
    speed_limit: f64,
    #[serde(rename = "nodeConnector")]
    device_limit: i32,
}

#[derive(Debug, Deserialize)]
struct RuleItem {
    id: i64,
    #[serde(rename = "regex")]
    content: String,
}

#[derive(Debug, Serialize)]
struct OnlineWire {
    #[serde(rename = "user_id")]
    uid: i64,
    ip: String,
}

#[derive(Debug, Serialize)]
struct TrafficWire {
    #[serde(rename = "id")]
    uid: i64,
    #[serde(rename = "up")]
    upload: i64,
    #[serde(rename = "down")]
    download: i64,
}

#[derive(Debug, Serialize)]
struct PostData<T> {
    #[serde(rename = "type")]
    node_type: &'static str,
    #[serde(rename = "nodeId")]
    node_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    onlines: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    users: Option<T>,
}

pub struct Pmpanel {
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

impl Pmpanel {
    pub fn new(config: &ApiConfig) -> PanelResult<Self> {
        let node_type: NodeType = config.node_type.parse().map_err(PanelError::invalid)?;
        let client =
            PanelClient::new(&config.api_host, config.timeout)?.bind_header("key", &config.api_key);
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

    fn wire_type(&self) -> PanelResult<&'static str> {
        match self.node_type {
            NodeType::Shadowsocks => Ok("ss"),
            NodeType::V2ray | NodeType::Vmess | NodeType::Vless => Ok("v2ray"),
            NodeType::Trojan => Ok("trojan"),
            other => Err(PanelError::invalid(format!(
                "unsupported node type: {other}"
            ))),
        }
    }

    fn unwrap_envelope(&self, raw: &RawResponse) -> PanelResult<serde_json::Value> {
        let envelope: Envelope = raw.json()?;
        if envelope.ret != 200 {
            return Err(PanelError::decode(
                &raw.url,
                format!("ret {} invalid: {}", envelope.ret, raw.body),
            ));
        }
        Ok(envelope.data)
    }

    fn speed(&self, panel_mbps: f64) -> u64 {
        pick_speed_limit(self.speed_limit, panel_mbps)
    }

    fn translate_node(&self, wire: &NodeWire) -> NodeInfo {
        let mut node = NodeInfo {
            node_type: self.node_type,
            node_id: self.node_id,
            port: wire.port,
            speed_limit: self.speed(wire.speed_limit),
            ..Default::default()
        };
        match self.node_type {
            NodeType::Shadowsocks => {
                node.cipher = wire.method.clone();
            }
            NodeType::Trojan => {
                node.enable_tls = true;
                node.host = wire.host.clone();
                node.service_name = wire.sni.clone();
                if wire.grpc {
                    node.transport = Transport::Grpc;
                }
            }
            _ => {
                node.alter_id = wire.alter_id;
                node.transport = Transport::parse_lossy(&wire.network);
                node.enable_tls = matches!(wire.security.as_str(), "tls" | "xtls");
                node.enable_vless = self.enable_vless;
                node.vless_flow = self.vless_flow.clone();
                match node.transport {
                    Transport::Ws => {
                        node.host = wire.host.clone();
                        node.path = wire.path.clone();
                    }
                    Transport::Grpc => node.service_name = wire.sni.clone(),
                    _ => {}
                }
            }
        }
        node
    }
}

#[async_trait]
impl Panel for Pmpanel {
    async fn get_node_info(&self) -> PanelResult<NodeInfo> {
        let wire_type = self.wire_type()?;
        let raw = self
            .client
            .get(
                "/api/node",
                Some("node"),
                &[
                    ("type", wire_type.to_string()),
                    ("nodeId", self.node_id.to_string()),
                ],
            )
            .await?;
        let data = self.unwrap_envelope(&raw)?;
        let wire: NodeWire =
            serde_json::from_value(data).map_err(|err| PanelError::decode(&raw.url, err))?;
        Ok(self.translate_node(&wire))
    }

    async fn get_user_list(&self) -> PanelResult<Vec<UserInfo>> {
        let wire_type = self.wire_type()?;
        let raw = self
            .client
            .get(
                "/api/users",
                Some("users"),
                &[
                    ("type", wire_type.to_string()),
                    ("nodeId", self.node_id.to_string()),
                    ("all", "true".to_string()),
                ],
            )
            .await?;
        let data = self.unwrap_envelope(&raw)?;
        let users: Vec<UserWire> =
            serde_json::from_value(data).map_err(|err| PanelError::decode(&raw.url, err))?;
        Ok(users
            .into_iter()
            .map(|user| UserInfo {
                uid: user.id,
                uuid: user.passwd.clone(),
                passwd: user.passwd,
                speed_limit: self.speed(user.speed_limit),
                device_limit: if self.device_limit > 0 {
                    self.device_limit
                } else {
                    user.device_limit
                },
                ..Default::default()
            })
            .collect())
    }

    async fn report_node_status(&self, _status: &NodeStatus) -> PanelResult<()> {
        Ok(())
    }

    async fn report_node_online_users(&self, online: &[OnlineUser]) -> PanelResult<()> {
        let wire_type = self.wire_type()?;
        let onlines: Vec<OnlineWire> = online
            .iter()
            .map(|u| OnlineWire {
                uid: u.uid,
                ip: u.ip.clone(),
            })
            .collect();
        let body = PostData {
            node_type: wire_type,
            node_id: self.node_id,
            onlines: Some(onlines),
            users: None,
        };
        let raw = self.client.post_json("/api/online", &[], &body).await?;
        self.unwrap_envelope(&raw)?;
        Ok(())
    }

    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> PanelResult<()> {
        let wire_type = self.wire_type()?;
        let users: Vec<TrafficWire> = traffic
            .iter()
            .map(|t| TrafficWire {
                uid: t.uid,
                upload: t.upload,
                download: t.download,
            })
            .collect();
        let body = PostData {
            node_type: wire_type,
            node_id: self.node_id,
            onlines: None,
            users: Some(users),
        };
        let raw = self.client.post_json("/api/traffic", &[], &body).await?;
        self.unwrap_envelope(&raw)?;
        Ok(())
    }

    async fn get_node_rule(&self) -> PanelResult<Vec<DetectRule>> {
        let wire_type = self.wire_type()?;
        let raw = self
            .client
            .get(
                "/api/rules",
                Some("rules"),
                &[
                    ("type", wire_type.to_string()),
                    ("nodeId", self.node_id.to_string()),
                ],
            )
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

    fn adapter(node_type: &str) -> Pmpanel {
        Pmpanel::new(&ApiConfig {
            api_host: "http://panel.example".into(),
            node_id: 3,
            api_key: "k".into(),
            node_type: node_type.into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn wire_type_is_lowercased_family() {
        assert_eq!(adapter("Shadowsocks").wire_type().unwrap(), "ss");
        assert_eq!(adapter("V2ray").wire_type().unwrap(), "v2ray");
        assert_eq!(adapter("Trojan").wire_type().unwrap(), "trojan");
        assert!(adapter("Shadowsocks-Plugin").wire_type().is_err());
    }

    #[test]
    fn translates_ws_node() {
        let c = adapter("V2ray");
        let wire: NodeWire = serde_json::from_value(serde_json::json!({
            "outPort": 443,
            "alterId": 0,
            "network": "ws",
            "security": "tls",
            "host": "cdn.example",
            "path": "/entry",
            "speedlimit": 40.0,
        }))
        .unwrap();
        let node = c.translate_node(&wire);
        assert_eq!(node.port, 443);
        assert!(node.enable_tls);
        assert_eq!(node.transport, Transport::Ws);
        assert_eq!(node.host, "cdn.example");
        assert_eq!(node.path, "/entry");
        assert_eq!(node.speed_limit, 5_000_000);
    }

    #[test]
    fn translates_trojan_grpc_node() {
        let c = adapter("Trojan");
        let wire: NodeWire = serde_json::from_value(serde_json::json!({
            "outPort": 443,
            "grpc": true,
            "sni": "trojan.example",
        }))
        .unwrap();
        let node = c.translate_node(&wire);
        assert!(node.enable_tls);
        assert_eq!(node.transport, Transport::Grpc);
        assert_eq!(node.service_name, "trojan.example");
    }
}
