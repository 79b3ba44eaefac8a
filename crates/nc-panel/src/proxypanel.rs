//! Proxypanel adapter.
//!
//! Every call lives under a per-family URL tree
//! (`/api/{v2ray|trojan|ss}/v1/...`), authenticated with `key` and
//! `timestamp` headers. The envelope is `{status, code, data, message}` with
//! `status == "success"` on success. Node responses may carry a
//! `client_limit` that seeds the device limit when none is configured.

use crate::client::{PanelClient, RawResponse};
use crate::error::{PanelError, PanelResult};
use crate::types::*;
use crate::Panel;
use async_trait::async_trait;
use nc_config::ApiConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct V2rayNodeWire {
    speed_limit: f64,
    client_limit: i32,
    v2_alter_id: u16,
    v2_port: u32,
    v2_net: String,
    v2_host: String,
    v2_path: String,
    v2_tls: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct SsNodeWire {
    speed_limit: f64,
    client_limit: i32,
    method: String,
    port: u32,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TrojanNodeWire {
    speed_limit: f64,
    client_limit: i32,
    trojan_port: u32,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct V2rayUserWire {
    uid: i64,
    vmess_uid: String,
    speed_limit: f64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TrojanUserWire {
    uid: i64,
    password: String,
    speed_limit: f64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct SsUserWire {
    uid: i64,
    passwd: String,
    speed_limit: f64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct NodeRuleWire {
    mode: String,
    rules: Vec<NodeRuleItem>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct NodeRuleItem {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
    pattern: String,
}

#[derive(Debug, Serialize)]
struct StatusWire {
    cpu: String,
    mem: String,
    net: String,
    disk: String,
    uptime: u64,
}

#[derive(Debug, Serialize)]
struct OnlineWire {
    uid: i64,
    ip: String,
}

#[derive(Debug, Serialize)]
struct TrafficWire {
    uid: i64,
    upload: i64,
    download: i64,
}

#[derive(Debug, Serialize)]
struct IllegalWire {
    uid: i64,
    rule_id: i64,
    reason: &'static str,
}

pub struct Proxypanel {
    client: PanelClient,
    api_host: String,
    node_id: u32,
    key: String,
    node_type: NodeType,
    enable_vless: bool,
    vless_flow: String,
    speed_limit: f64,
    /// Configured override; a panel-side `client_limit` fills it in when 0.
    device_limit: Mutex<i32>,
    local_rules: Vec<DetectRule>,
}

impl Proxypanel {
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
            device_limit: Mutex::new(config.device_limit),
            local_rules: read_local_rules(config.rule_list_path.as_deref()),
        })
    }

    fn family(&self) -> PanelResult<&'static str> {
        match self.node_type {
            NodeType::V2ray | NodeType::Vmess | NodeType::Vless => Ok("v2ray"),
            NodeType::Trojan => Ok("trojan"),
            NodeType::Shadowsocks => Ok("ss"),
            other => Err(PanelError::invalid(format!(
                "unsupported node type: {other}"
            ))),
        }
    }

    fn path(&self, op: &str) -> PanelResult<String> {
        Ok(format!("/api/{}/v1/{}/{}", self.family()?, op, self.node_id))
    }

    fn timestamp_header(&self) -> [(&'static str, String); 1] {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        [("timestamp", now.to_string())]
    }

    fn unwrap_envelope(&self, raw: &RawResponse) -> PanelResult<serde_json::Value> {
        let envelope: Envelope = raw.json()?;
        if envelope.status != "success" {
            return Err(PanelError::decode(
                &raw.url,
                format!("status invalid: {}", raw.body),
            ));
        }
        Ok(envelope.data)
    }

    fn adopt_client_limit(&self, client_limit: i32) {
        let mut limit = self.device_limit.lock();
        if *limit == 0 && client_limit > 0 {
            *limit = client_limit;
        }
    }

    fn speed(&self, panel_mbps: f64) -> u64 {
        pick_speed_limit(self.speed_limit, panel_mbps)
    }
}

#[async_trait]
impl Panel for Proxypanel {
    async fn get_node_info(&self) -> PanelResult<NodeInfo> {
        let path = self.path("node")?;
        let raw = self
            .client
            .get_with_headers(&path, Some("node"), &[], &self.timestamp_header())
            .await?;
        let data = self.unwrap_envelope(&raw)?;
        let mut node = NodeInfo {
            node_type: self.node_type,
            node_id: self.node_id,
            ..Default::default()
        };
        match self.node_type {
            NodeType::Trojan => {
                let wire: TrojanNodeWire =
                    serde_json::from_value(data).map_err(|err| PanelError::decode(&raw.url, err))?;
                self.adopt_client_limit(wire.client_limit);
                node.port = wire.trojan_port;
                node.speed_limit = self.speed(wire.speed_limit);
                node.enable_tls = true;
            }
            NodeType::Shadowsocks => {
                let wire: SsNodeWire =
                    serde_json::from_value(data).map_err(|err| PanelError::decode(&raw.url, err))?;
                self.adopt_client_limit(wire.client_limit);
                node.port = wire.port;
                node.speed_limit = self.speed(wire.speed_limit);
                node.cipher = wire.method;
            }
            _ => {
                let wire: V2rayNodeWire =
                    serde_json::from_value(data).map_err(|err| PanelError::decode(&raw.url, err))?;
                self.adopt_client_limit(wire.client_limit);
                node.port = wire.v2_port;
                node.speed_limit = self.speed(wire.speed_limit);
                node.alter_id = wire.v2_alter_id;
                node.transport = Transport::parse_lossy(&wire.v2_net);
                node.host = wire.v2_host;
                node.path = wire.v2_path;
                node.enable_tls = wire.v2_tls;
                node.enable_vless = self.enable_vless;
                node.vless_flow = self.vless_flow.clone();
            }
        }
        Ok(node)
    }

    async fn get_user_list(&self) -> PanelResult<Vec<UserInfo>> {
        let path = self.path("userList")?;
        let raw = self
            .client
            .get_with_headers(&path, Some("users"), &[], &self.timestamp_header())
            .await?;
        let data = self.unwrap_envelope(&raw)?;
        let device_limit = *self.device_limit.lock();
        let users = match self.node_type {
            NodeType::Trojan => {
                let wires: Vec<TrojanUserWire> =
                    serde_json::from_value(data).map_err(|err| PanelError::decode(&raw.url, err))?;
                wires
                    .into_iter()
                    .map(|u| UserInfo {
                        uid: u.uid,
                        uuid: u.password,
                        speed_limit: self.speed(u.speed_limit),
                        device_limit,
                        ..Default::default()
                    })
                    .collect()
            }
            NodeType::Shadowsocks => {
                let wires: Vec<SsUserWire> =
                    serde_json::from_value(data).map_err(|err| PanelError::decode(&raw.url, err))?;
                wires
                    .into_iter()
                    .map(|u| UserInfo {
                        uid: u.uid,
                        passwd: u.passwd,
                        speed_limit: self.speed(u.speed_limit),
                        device_limit,
                        ..Default::default()
                    })
                    .collect()
            }
            _ => {
                let wires: Vec<V2rayUserWire> =
                    serde_json::from_value(data).map_err(|err| PanelError::decode(&raw.url, err))?;
                wires
                    .into_iter()
                    .map(|u| UserInfo {
                        uid: u.uid,
                        uuid: u.vmess_uid,
                        speed_limit: self.speed(u.speed_limit),
                        device_limit,
                        ..Default::default()
                    })
                    .collect()
            }
        };
        Ok(users)
    }

    async fn report_node_status(&self, status: &NodeStatus) -> PanelResult<()> {
        let path = self.path("nodeStatus")?;
        let wire = StatusWire {
            cpu: format!("{}%", status.cpu as i64),
            mem: format!("{}%", status.mem as i64),
            net: String::new(),
            disk: format!("{}%", status.disk as i64),
            uptime: status.uptime,
        };
        let raw = self
            .client
            .post_json_with_headers(&path, &[], &self.timestamp_header(), &wire)
            .await?;
        self.unwrap_envelope(&raw)?;
        Ok(())
    }

    async fn report_node_online_users(&self, online: &[OnlineUser]) -> PanelResult<()> {
        let path = self.path("nodeOnline")?;
        let data: Vec<OnlineWire> = online
            .iter()
            .map(|u| OnlineWire {
                uid: u.uid,
                ip: u.ip.clone(),
            })
            .collect();
        let raw = self
            .client
            .post_json_with_headers(&path, &[], &self.timestamp_header(), &data)
            .await?;
        self.unwrap_envelope(&raw)?;
        Ok(())
    }

    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> PanelResult<()> {
        let path = self.path("userTraffic")?;
        let data: Vec<TrafficWire> = traffic
            .iter()
            .map(|t| TrafficWire {
                uid: t.uid,
                upload: t.upload,
                download: t.download,
            })
            .collect();
        let raw = self
            .client
            .post_json_with_headers(&path, &[], &self.timestamp_header(), &data)
            .await?;
        self.unwrap_envelope(&raw)?;
        Ok(())
    }

    async fn get_node_rule(&self) -> PanelResult<Vec<DetectRule>> {
        let path = self.path("nodeRule")?;
        let raw = self
            .client
            .get_with_headers(&path, Some("rules"), &[], &self.timestamp_header())
            .await?;
        let data = self.unwrap_envelope(&raw)?;
        let wire: NodeRuleWire =
            serde_json::from_value(data).map_err(|err| PanelError::decode(&raw.url, err))?;
        let mut rules = self.local_rules.clone();
        // Only reject-mode regex rules are enforceable here.
        if wire.mode != "reject" {
            return Ok(rules);
        }
        for item in wire.rules {
            if item.kind != "reg" {
                continue;
            }
            match DetectRule::new(item.id, &item.pattern) {
                Ok(rule) => rules.push(rule),
                Err(err) => {
                    tracing::warn!(rule_id = item.id, pattern = %item.pattern, %err,
                        "invalid panel rule dropped");
                }
            }
        }
        Ok(rules)
    }

    async fn report_illegal(&self, results: &[DetectResult]) -> PanelResult<()> {
        let path = self.path("trigger")?;
        // One trigger call per incident on this panel.
        for result in results {
            let wire = IllegalWire {
                uid: result.uid,
                rule_id: result.rule_id,
                reason: "detected by node audit rule",
            };
            let raw = self
                .client
                .post_json_with_headers(&path, &[], &self.timestamp_header(), &wire)
                .await?;
            self.unwrap_envelope(&raw)?;
        }
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

    fn adapter(node_type: &str) -> Proxypanel {
        Proxypanel::new(&ApiConfig {
            api_host: "http://panel.example".into(),
            node_id: 11,
            api_key: "k".into(),
            node_type: node_type.into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn url_tree_is_per_family() {
        assert_eq!(adapter("V2ray").path("node").unwrap(), "/api/v2ray/v1/node/11");
        assert_eq!(
            adapter("Trojan").path("userTraffic").unwrap(),
            "/api/trojan/v1/userTraffic/11"
        );
        assert_eq!(adapter("Shadowsocks").path("nodeRule").unwrap(), "/api/ss/v1/nodeRule/11");
    }

    #[test]
    fn client_limit_fills_unset_device_limit() {
        let c = adapter("V2ray");
        c.adopt_client_limit(5);
        assert_eq!(*c.device_limit.lock(), 5);
        // A configured override is never displaced.
        let c2 = Proxypanel::new(&ApiConfig {
            api_host: "http://panel.example".into(),
            node_id: 1,
            api_key: "k".into(),
            node_type: "V2ray".into(),
            device_limit: 3,
            ..Default::default()
        })
        .unwrap();
        c2.adopt_client_limit(5);
        assert_eq!(*c2.device_limit.lock(), 3);
    }

    #[test]
    fn envelope_requires_success_status() {
        let c = adapter("V2ray");
        let raw = crate::client::RawResponse {
            url: "http://panel.example/api/v2ray/v1/node/11".into(),
            status: 200,
            body: r#"{"status": "fail", "code": 500, "message": "boom"}"#.into(),
        };
        assert!(c.unwrap_envelope(&raw).is_err());
    }
}
