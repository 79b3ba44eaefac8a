//! AirGo adapter.
//!
//! Flat JSON bodies under `/api/airgo/`; the node descriptor carries its own
//! protocol name and REALITY parameters inline (`security == "reality"`).

use crate::client::PanelClient;
use crate::error::{PanelError, PanelResult};
use crate::types::*;
use crate::Panel;
use async_trait::async_trait;
use nc_config::ApiConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct NodeWire {
    #[serde(rename = "node_speedlimit")]
    speed_limit: f64,
    node_type: String,
    port: u32,
    scy: String,
    server_key: String,
    #[serde(rename = "flow")]
    vless_flow: String,
    network: String,
    host: String,
    path: String,
    service_name: String,
    security: String,
    sni: String,
    dest: String,
    private_key: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct UserWire {
    id: i64,
    uuid: String,
    passwd: String,
    user_name: String,
}

#[derive(Debug, Serialize)]
struct StatusWire {
    id: u32,
    cpu: f64,
    mem: f64,
    disk: f64,
    uptime: u64,
}

#[derive(Debug, Serialize)]
struct TrafficItem {
    #[serde(rename = "UID")]
    uid: i64,
    #[serde(rename = "Email")]
    email: String,
    #[serde(rename = "Upload")]
    upload: i64,
    #[serde(rename = "Download")]
    download: i64,
}

#[derive(Debug, Serialize)]
struct TrafficWire {
    id: u32,
    user_traffic: Vec<TrafficItem>,
}

pub struct Airgo {
    client: PanelClient,
    api_host: String,
    node_id: u32,
    key: String,
    node_type: NodeType,
    speed_limit: f64,
    device_limit: i32,
    local_rules: Vec<DetectRule>,
}

impl Airgo {
    pub fn new(config: &ApiConfig) -> PanelResult<Self> {
        let node_type: NodeType = config.node_type.parse().map_err(PanelError::invalid)?;
        let client =
            PanelClient::new(&config.api_host, config.timeout)?.bind_query("key", &config.api_key);
        Ok(Self {
            client,
            api_host: config.api_host.clone(),
            node_id: config.node_id,
            key: config.api_key.clone(),
            node_type,
            speed_limit: config.speed_limit,
            device_limit: config.device_limit,
            local_rules: read_local_rules(config.rule_list_path.as_deref()),
        })
    }

    fn translate_node(&self, wire: NodeWire) -> PanelResult<NodeInfo> {
        if wire.port == 0 {
            return Err(PanelError::invalid("server port must > 0"));
        }
        let enable_tls = !(wire.security.is_empty() || wire.security == "none");
        let enable_reality = wire.security == "reality";
        let reality = enable_reality.then(|| RealityOptions {
            dest: wire.dest.clone(),
            server_names: vec![wire.sni.clone()],
            private_key: wire.private_key.clone(),
            short_ids: vec![String::new(), "0123456789abcdef".into()],
            ..Default::default()
        });

        let mut node = NodeInfo {
            node_type: self.node_type,
            node_id: self.node_id,
            port: wire.port,
            speed_limit: pick_speed_limit(self.speed_limit, wire.speed_limit),
            enable_reality,
            reality,
            ..Default::default()
        };
        match wire.node_type.to_lowercase().as_str() {
            "vless" => {
                node.enable_vless = true;
                node.vless_flow = wire.vless_flow;
                node.transport = Transport::parse_lossy(&wire.network);
                node.enable_tls = enable_tls;
                node.path = wire.path;
                node.host = wire.host;
                node.service_name = wire.service_name;
            }
            "vmess" => {
                node.transport = Transport::parse_lossy(&wire.network);
                node.enable_tls = enable_tls;
                node.path = wire.path;
                node.host = wire.host;
                node.service_name = wire.service_name;
            }
            "shadowsocks" => {
                node.cipher = wire.scy;
                node.server_key = wire.server_key;
            }
            "trojan" => {
                node.enable_tls = true;
                node.host = wire.host;
                node.service_name = wire.service_name;
            }
            other => {
                return Err(PanelError::invalid(format!(
                    "unsupported node type: {other}"
                )))
            }
        }
        Ok(node)
    }
}

#[async_trait]
impl Panel for Airgo {
    async fn get_node_info(&self) -> PanelResult<NodeInfo> {
        let raw = self
            .client
            .get(
                "/api/airgo/node/getNodeInfo",
                Some("node"),
                &[("id", self.node_id.to_string())],
            )
            .await?;
        let wire: NodeWire = raw.json()?;
        self.translate_node(wire)
    }

    async fn get_user_list(&self) -> PanelResult<Vec<UserInfo>> {
        let raw = self
            .client
            .get(
                "/api/airgo/user/getUserlist",
                Some("users"),
                &[("id", self.node_id.to_string())],
            )
            .await?;
        let wires: Vec<UserWire> = raw.json()?;
        Ok(wires
            .into_iter()
            .map(|u| UserInfo {
                uid: u.id,
                email: u.user_name,
                uuid: u.uuid,
                passwd: u.passwd,
                speed_limit: mbps_to_bps(self.speed_limit),
                device_limit: self.device_limit,
                ..Default::default()
            })
            .collect())
    }

    async fn report_node_status(&self, status: &NodeStatus) -> PanelResult<()> {
        let wire = StatusWire {
            id: self.node_id,
            cpu: status.cpu,
            mem: status.mem,
            disk: status.disk,
            uptime: status.uptime,
        };
        self.client
            .post_json("/api/airgo/node/reportNodeStatus", &[], &wire)
            .await?;
        Ok(())
    }

    async fn report_node_online_users(&self, _online: &[OnlineUser]) -> PanelResult<()> {
        Ok(())
    }

    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> PanelResult<()> {
        let wire = TrafficWire {
            id: self.node_id,
            user_traffic: traffic
                .iter()
                .map(|t| TrafficItem {
                    uid: t.uid,
                    email: t.email.clone(),
                    upload: t.upload,
                    download: t.download,
                })
                .collect(),
        };
        self.client
            .post_json("/api/airgo/user/reportUserTraffic", &[], &wire)
            .await?;
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
