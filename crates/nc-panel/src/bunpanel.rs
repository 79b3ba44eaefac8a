//! BunPanel adapter.
//!
//! Responses arrive in a custom `{statusCode, datas}` envelope whose payload
//! must be unwrapped before shape translation. Online-user and data-usage
//! reports are `create` posts keyed by `serverId`.

use crate::client::{PanelClient, RawResponse};
use crate::error::{PanelError, PanelResult};
use crate::types::*;
use crate::Panel;
use async_trait::async_trait;
use nc_config::ApiConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "statusCode", default)]
    status_code: i64,
    #[serde(default)]
    datas: serde_json::Value,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ServerWire {
    #[serde(rename = "serverPort")]
    port: u32,
    network: String,
    method: String,
    security: String,
    flow: String,
    #[serde(rename = "wsSettings")]
    ws_settings: Option<serde_json::Value>,
    #[serde(rename = "realitySettings")]
    reality_settings: Option<RealityWire>,
    #[serde(rename = "grpcSettings")]
    grpc_settings: Option<serde_json::Value>,
    #[serde(rename = "tcpSettings")]
    tcp_settings: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RealityWire {
    show: bool,
    dest: String,
    xver: u64,
    #[serde(rename = "serverNames")]
    server_names: Vec<String>,
    #[serde(rename = "privateKey")]
    private_key: String,
    #[serde(rename = "minClientVer")]
    min_client_ver: String,
    #[serde(rename = "maxClientVer")]
    max_client_ver: String,
    #[serde(rename = "maxTimeDiff")]
    max_time_diff: u64,
    #[serde(rename = "proxyProtocolVer")]
    proxy_protocol_ver: u64,
    #[serde(rename = "shortIds")]
    short_ids: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct UserWire {
    id: i64,
    uuid: String,
    #[serde(rename = "speedLimit")]
    speed_limit: f64,
    #[serde(rename = "ipLimit")]
    device_limit: i32,
    #[serde(rename = "onlineIp")]
    alive_ip: i32,
}

#[derive(Debug, Serialize)]
struct OnlineWire {
    #[serde(rename = "userId")]
    uid: i64,
    ip: String,
}

#[derive(Debug, Serialize)]
struct TrafficWire {
    #[serde(rename = "userId")]
    uid: i64,
    u: i64,
    d: i64,
}

#[derive(Debug, Serialize)]
struct PostData<T> {
    data: T,
}

pub struct Bunpanel {
    client: PanelClient,
    api_host: String,
    node_id: u32,
    key: String,
    node_type: NodeType,
    speed_limit: f64,
    device_limit: i32,
    local_rules: Vec<DetectRule>,
    last_report_online: Mutex<HashMap<i64, i32>>,
}

impl Bunpanel {
    pub fn new(config: &ApiConfig) -> PanelResult<Self> {
        let node_type: NodeType = config.node_type.parse().map_err(PanelError::invalid)?;
        let client = PanelClient::new(&config.api_host, config.timeout)?
            .bind_query("serverId", config.node_id)
            .bind_query("nodeType", config.node_type.to_lowercase())
            .bind_query("token", &config.api_key);
        Ok(Self {
            client,
            api_host: config.api_host.clone(),
            node_id: config.node_id,
            key: config.api_key.clone(),
            node_type,
            speed_limit: config.speed_limit,
            device_limit: config.device_limit,
            local_rules: read_local_rules(config.rule_list_path.as_deref()),
            last_report_online: Mutex::new(HashMap::new()),
        })
    }

    fn unwrap_envelope(&self, raw: &RawResponse) -> PanelResult<serde_json::Value> {
        let envelope: Envelope = raw.json()?;
        if envelope.status_code != 200 {
            return Err(PanelError::decode(
                &raw.url,
                format!("statusCode {} invalid: {}", envelope.status_code, raw.body),
            ));
        }
        Ok(envelope.datas)
    }

    fn translate_node(&self, wire: ServerWire) -> PanelResult<NodeInfo> {
        if wire.port == 0 {
            return Err(PanelError::invalid("server port must > 0"));
        }
        let mut node = NodeInfo {
            node_type: self.node_type,
            node_id: self.node_id,
            port: wire.port,
            cipher: wire.method.clone(),
            vless_flow: wire.flow.clone(),
            ..Default::default()
        };
        match self.node_type {
            NodeType::Shadowsocks => {}
            NodeType::Trojan => {
                node.enable_tls = true;
            }
            _ => {
                node.transport = Transport::parse_lossy(&wire.network);
                match wire.security.as_str() {
                    "tls" | "xtls" => node.enable_tls = true,
                    "reality" => {
                        node.enable_reality = true;
                        node.enable_vless = true;
                    }
                    _ => {}
                }
            }
        }
        if let Some(ws) = &wire.ws_settings {
            node.path = ws["path"].as_str().unwrap_or_default().into();
            node.host = ws["headers"]["Host"].as_str().unwrap_or_default().into();
        }
        if let Some(grpc) = &wire.grpc_settings {
            node.service_name = grpc["serviceName"].as_str().unwrap_or_default().into();
        }
        if let Some(tcp) = &wire.tcp_settings {
            if let Some(header) = tcp.get("header") {
                node.header = Some(header.clone());
            }
        }
        if let Some(r) = wire.reality_settings {
            node.reality = Some(RealityOptions {
                dest: r.dest,
                proxy_protocol_ver: r.proxy_protocol_ver.max(r.xver),
                server_names: r.server_names,
                private_key: r.private_key,
                min_client_ver: r.min_client_ver,
                max_client_ver: r.max_client_ver,
                max_time_diff: r.max_time_diff,
                short_ids: r.short_ids,
                show: r.show,
            });
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
            out.push(UserInfo {
                uid: wire.id,
                email: format!("{}@bunpanel.user", wire.uuid),
                passwd: wire.uuid.clone(),
                uuid: wire.uuid,
                speed_limit: pick_speed_limit(self.speed_limit, wire.speed_limit),
                device_limit,
                ..Default::default()
            });
        }
        out
    }
}

#[async_trait]
impl Panel for Bunpanel {
    async fn get_node_info(&self) -> PanelResult<NodeInfo> {
        let path = format!("/v2/server/{}/get", self.node_id);
        let raw = self.client.get(&path, Some("node"), &[]).await?;
        let datas = self.unwrap_envelope(&raw)?;
        let wire: ServerWire =
            serde_json::from_value(datas).map_err(|err| PanelError::decode(&raw.url, err))?;
        self.translate_node(wire)
    }

    async fn get_user_list(&self) -> PanelResult<Vec<UserInfo>> {
        let raw = self.client.get("/v2/user/get", Some("users"), &[]).await?;
        let datas = self.unwrap_envelope(&raw)?;
        let wires: Vec<UserWire> =
            serde_json::from_value(datas).map_err(|err| PanelError::decode(&raw.url, err))?;
        Ok(self.translate_users(wires))
    }

    async fn report_node_status(&self, _status: &NodeStatus) -> PanelResult<()> {
        Ok(())
    }

    async fn report_node_online_users(&self, online: &[OnlineUser]) -> PanelResult<()> {
        let data: Vec<OnlineWire> = online
            .iter()
            .map(|u| OnlineWire {
                uid: u.uid,
                ip: u.ip.clone(),
            })
            .collect();
        let raw = self
            .client
            .post_json("/v2/user/online/create", &[], &PostData { data })
            .await?;
        self.unwrap_envelope(&raw)?;

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
                uid: t.uid,
                u: t.upload,
                d: t.download,
            })
            .collect();
        let raw = self
            .client
            .post_json("/v2/user/data-usage/create", &[], &PostData { data })
            .await?;
        self.unwrap_envelope(&raw)?;
        Ok(())
    }

    async fn get_node_rule(&self) -> PanelResult<Vec<DetectRule>> {
        Ok(self.local_rules.clone())
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

    fn adapter(node_type: &str) -> Bunpanel {
        Bunpanel::new(&ApiConfig {
            api_host: "http://panel.example".into(),
            node_id: 6,
            api_key: "t".into(),
            node_type: node_type.into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn envelope_unwraps_datas() {
        let c = adapter("V2ray");
        let raw = crate::client::RawResponse {
            url: "http://panel.example/v2/server/6/get".into(),
            status: 200,
            body: r#"{"statusCode": 200, "datas": {"serverPort": 443}}"#.into(),
        };
        let datas = c.unwrap_envelope(&raw).unwrap();
        assert_eq!(datas["serverPort"], 443);

        let raw = crate::client::RawResponse {
            url: "http://panel.example/v2/server/6/get".into(),
            status: 200,
            body: r#"{"statusCode": 403, "datas": null}"#.into(),
        };
        assert!(c.unwrap_envelope(&raw).is_err());
    }

    #[test]
    fn reality_node_enables_vless() {
        let c = adapter("V2ray");
        let wire: ServerWire = serde_json::from_value(serde_json::json!({
            "serverPort": 443,
            "network": "tcp",
            "security": "reality",
            "flow": "xtls-rprx-vision",
            "realitySettings": {
                "dest": "cdn.example:443",
                "serverNames": ["cdn.example"],
                "privateKey": "pk",
                "shortIds": [""],
            },
        }))
        .unwrap();
        let node = c.translate_node(wire).unwrap();
        assert!(node.enable_reality);
        assert!(node.enable_vless);
        assert_eq!(node.vless_flow, "xtls-rprx-vision");
        assert_eq!(node.reality.unwrap().dest, "cdn.example:443");
    }

    #[test]
    fn users_are_reconciled_and_synthesized() {
        let c = adapter("V2ray");
        let users = c.translate_users(vec![
            serde_json::from_value(serde_json::json!({
                "id": 1, "uuid": "u1", "ipLimit": 2, "onlineIp": 3,
            }))
            .unwrap(),
            serde_json::from_value(serde_json::json!({
                "id": 2, "uuid": "u2", "ipLimit": 2, "onlineIp": 1, "speedLimit": 8.0,
            }))
            .unwrap(),
        ]);
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].uid, 2);
        assert_eq!(users[0].email, "u2@bunpanel.user");
        assert_eq!(users[0].device_limit, 1);
        assert_eq!(users[0].speed_limit, 1_000_000);
    }
}
