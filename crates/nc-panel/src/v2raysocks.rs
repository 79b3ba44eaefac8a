//! V2RaySocks adapter.
//!
//! A single endpoint (the API host itself) discriminated by the `act` query
//! parameter. Node configs arrive as engine-native inbound objects, so the
//! translation digs through `streamSettings`; REALITY parameters live under
//! `streamSettings.realitySettings`.

use crate::client::PanelClient;
use crate::error::{PanelError, PanelResult};
use crate::types::*;
use crate::Panel;
use async_trait::async_trait;
use nc_config::ApiConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
struct StatusWire {
    uptime: u64,
    cpu: String,
    mem: String,
    disk: String,
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
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct UserWire {
    id: i64,
    uuid: String,
    secret: String,
    password: String,
    cipher: String,
    /// Speed limit in Mbit/s.
    st: f64,
    /// Device limit.
    dt: i32,
}

pub struct V2raysocks {
    client: PanelClient,
    api_host: String,
    node_id: u32,
    key: String,
    node_type: NodeType,
    vless_flow: String,
    speed_limit: f64,
    device_limit: i32,
    local_rules: Vec<DetectRule>,
    config_cache: Mutex<Option<Value>>,
}

impl V2raysocks {
    pub fn new(config: &ApiConfig) -> PanelResult<Self> {
        let node_type: NodeType = config.node_type.parse().map_err(PanelError::invalid)?;
        if node_type == NodeType::ShadowsocksPlugin {
            return Err(PanelError::invalid(
                "unsupported node type: Shadowsocks-Plugin",
            ));
        }
        let client = PanelClient::new(&config.api_host, config.timeout)?
            .bind_query("node_id", config.node_id)
            .bind_query("token", &config.api_key);
        Ok(Self {
            client,
            api_host: config.api_host.clone(),
            node_id: config.node_id,
            key: config.api_key.clone(),
            node_type,
            vless_flow: config.vless_flow.clone(),
            speed_limit: config.speed_limit,
            device_limit: config.device_limit,
            local_rules: read_local_rules(config.rule_list_path.as_deref()),
            config_cache: Mutex::new(None),
        })
    }

    fn act_query(&self, act: &str) -> [(&'static str, String); 2] {
        [
            ("act", act.to_string()),
            ("node_type", self.node_type.as_str().to_lowercase()),
        ]
    }

    fn first_inbound<'v>(&self, config: &'v Value) -> PanelResult<&'v Value> {
        config
            .get("inbounds")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .ok_or_else(|| PanelError::invalid("no inbounds in node config"))
    }

    fn parse_v2ray_node(&self, config: &Value) -> PanelResult<NodeInfo> {
        let inbound = self.first_inbound(config)?;
        let stream = &inbound["streamSettings"];
        let transport = Transport::parse_lossy(stream["network"].as_str().unwrap_or_default());
        let security = stream["security"].as_str().unwrap_or_default();
        let enable_vless = inbound["protocol"].as_str() == Some("vless");
        let enable_reality = security == "reality";

        let mut node = NodeInfo {
            node_type: self.node_type,
            node_id: self.node_id,
            port: stream_port(inbound),
            transport,
            enable_tls: security == "tls",
            enable_vless,
            enable_reality,
            ..Default::default()
        };
        match transport {
            Transport::Ws => {
                node.path = stream["wsSettings"]["path"].as_str().unwrap_or_default().into();
                node.host = stream["wsSettings"]["headers"]["Host"]
                    .as_str()
                    .unwrap_or_default()
                    .into();
            }
            Transport::HttpUpgrade => {
                node.host = stream["httpupgradeSettings"]["Host"]
                    .as_str()
                    .unwrap_or_default()
                    .into();
                node.path = stream["httpupgradeSettings"]["path"]
                    .as_str()
                    .unwrap_or_default()
                    .into();
            }
            Transport::SplitHttp => {
                node.host = stream["splithttpSettings"]["Host"]
                    .as_str()
                    .unwrap_or_default()
                    .into();
                node.path = stream["splithttpSettings"]["path"]
                    .as_str()
                    .unwrap_or_default()
                    .into();
            }
            Transport::Grpc => {
                node.service_name = stream["grpcSettings"]["serviceName"]
                    .as_str()
                    .unwrap_or_default()
                    .into();
            }
            Transport::Tcp => {
                if let Some(header) = stream["tcpSettings"].get("header") {
                    node.header = Some(header.clone());
                }
            }
            _ => {}
        }
        if enable_vless {
            let r = &stream["realitySettings"];
            node.reality = Some(RealityOptions {
                dest: r["dest"].as_str().unwrap_or_default().into(),
                proxy_protocol_ver: r["xver"].as_u64().unwrap_or(0),
                server_names: string_array(&r["serverNames"]),
                private_key: r["privateKey"].as_str().unwrap_or_default().into(),
                min_client_ver: r["minClientVer"].as_str().unwrap_or_default().into(),
                max_client_ver: r["maxClientVer"].as_str().unwrap_or_default().into(),
                max_time_diff: r["maxTimeDiff"].as_u64().unwrap_or(0),
                short_ids: string_array(&r["shortIds"]),
                show: false,
            });
        }
        // Vision only works on raw tcp; reality on multiplexed transports
        // must not carry a flow.
        node.vless_flow = if enable_reality {
            match transport {
                Transport::Tcp => "xtls-rprx-vision".to_string(),
                Transport::Grpc | Transport::H2 => String::new(),
                _ => self.vless_flow.clone(),
            }
        } else {
            self.vless_flow.clone()
        };
        Ok(node)
    }

    fn parse_trojan_node(&self, config: &Value) -> PanelResult<NodeInfo> {
        let inbound = self.first_inbound(config)?;
        Ok(NodeInfo {
            node_type: self.node_type,
            node_id: self.node_id,
            port: stream_port(inbound),
            enable_tls: true,
            host: inbound["streamSettings"]["tlsSettings"]["serverName"]
                .as_str()
                .unwrap_or_default()
                .into(),
            ..Default::default()
        })
    }

    fn parse_ss_node(&self, config: &Value) -> PanelResult<NodeInfo> {
        let inbound = self.first_inbound(config)?;
        let method = inbound["settings"]["method"].as_str().unwrap_or_default();
        let server_key = if is_2022_cipher(method) {
            inbound["settings"]["password"].as_str().unwrap_or_default()
        } else {
            ""
        };
        Ok(NodeInfo {
            node_type: self.node_type,
            node_id: self.node_id,
            port: stream_port(inbound),
            cipher: method.to_string(),
            server_key: server_key.to_string(),
            ..Default::default()
        })
    }
}

fn stream_port(inbound: &Value) -> u32 {
    inbound["port"].as_u64().unwrap_or(0) as u32
}

fn string_array(v: &Value) -> Vec<String> {
    v.as_array()
        .map(|a| {
            a.iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn is_2022_cipher(method: &str) -> bool {
    method.starts_with("2022-blake3-")
}

#[async_trait]
impl Panel for V2raysocks {
    async fn get_node_info(&self) -> PanelResult<NodeInfo> {
        let raw = self
            .client
            .get("", Some("config"), &self.act_query("config"))
            .await?;
        let config: Value = raw.json()?;
        let node = match self.node_type {
            NodeType::Trojan => self.parse_trojan_node(&config),
            NodeType::Shadowsocks => self.parse_ss_node(&config),
            _ => self.parse_v2ray_node(&config),
        }?;
        *self.config_cache.lock() = Some(config);
        Ok(node)
    }

    async fn get_user_list(&self) -> PanelResult<Vec<UserInfo>> {
        let raw = self
            .client
            .get("", Some("user"), &self.act_query("user"))
            .await?;
        let page: Value = raw.json()?;
        let wires: Vec<UserWire> = serde_json::from_value(page["data"].clone())
            .map_err(|err| PanelError::decode(&raw.url, err))?;
        let mut out = Vec::with_capacity(wires.len());
        for wire in wires {
            let mut user = UserInfo {
                uid: wire.id,
                speed_limit: if self.speed_limit > 0.0 {
                    mbps_to_bps(self.speed_limit)
                } else {
                    mbps_to_bps(wire.st)
                },
                device_limit: if self.device_limit > 0 {
                    self.device_limit
                } else {
                    wire.dt
                },
                ..Default::default()
            };
            match self.node_type {
                NodeType::Shadowsocks => {
                    user.email = wire.secret.clone();
                    user.passwd = wire.secret;
                    user.method = wire.cipher;
                }
                NodeType::Trojan => {
                    user.email = wire.password.clone();
                    user.uuid = wire.password;
                }
                _ => {
                    user.email = format!("{}@x.com", wire.uuid);
                    user.uuid = wire.uuid;
                }
            }
            out.push(user);
        }
        Ok(out)
    }

    async fn report_node_status(&self, status: &NodeStatus) -> PanelResult<()> {
        let wire = StatusWire {
            uptime: status.uptime,
            cpu: format!("{}%", status.cpu as i64),
            mem: format!("{}%", status.mem as i64),
            disk: format!("{}%", status.disk as i64),
        };
        self.client
            .post_json("", &self.act_query("nodestatus"), &wire)
            .await?;
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
        self.client
            .post_json("", &self.act_query("onlineusers"), &data)
            .await?;
        Ok(())
    }

    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> PanelResult<()> {
        let data: Vec<TrafficWire> = traffic
            .iter()
            .map(|t| TrafficWire {
                uid: t.uid,
                upload: t.upload,
                download: t.download,
            })
            .collect();
        self.client
            .post_json("", &self.act_query("submit"), &data)
            .await?;
        Ok(())
    }

    async fn get_node_rule(&self) -> PanelResult<Vec<DetectRule>> {
        let mut rules = self.local_rules.clone();
        let cache = self.config_cache.lock();
        let Some(config) = cache.as_ref() else {
            return Ok(rules);
        };
        // The audit list is the domain set of the second routing rule.
        let domains = string_array(&config["routing"]["rules"][1]["domain"]);
        for (i, domain) in domains.iter().enumerate() {
            let pattern = domain.strip_prefix("regexp:").unwrap_or(domain);
            match DetectRule::new(i as i64, pattern) {
                Ok(rule) => rules.push(rule),
                Err(err) => {
                    tracing::warn!(index = i, %pattern, %err, "invalid panel rule dropped");
                }
            }
        }
        Ok(rules)
    }

    async fn report_illegal(&self, results: &[DetectResult]) -> PanelResult<()> {
        // This panel records the offender only, not the rule.
        let data: Vec<IllegalWire> = results.iter().map(|r| IllegalWire { uid: r.uid }).collect();
        self.client
            .post_json("", &self.act_query("illegal"), &data)
            .await?;
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

    fn adapter(node_type: &str) -> V2raysocks {
        V2raysocks::new(&ApiConfig {
            api_host: "http://panel.example".into(),
            node_id: 5,
            api_key: "t".into(),
            node_type: node_type.into(),
            ..Default::default()
        })
        .unwrap()
    }

    fn vless_reality_config() -> Value {
        serde_json::json!({
            "inbounds": [{
                "port": 443,
                "protocol": "vless",
                "streamSettings": {
                    "network": "tcp",
                    "security": "reality",
                    "realitySettings": {
                        "dest": "www.example.com:443",
                        "xver": 1,
                        "serverNames": ["www.example.com"],
                        "privateKey": "pk",
                        "shortIds": ["01ab"],
                    },
                },
            }],
        })
    }

    #[test]
    fn vless_reality_gets_vision_on_tcp() {
        let c = adapter("V2ray");
        let node = c.parse_v2ray_node(&vless_reality_config()).unwrap();
        assert!(node.enable_vless);
        assert!(node.enable_reality);
        assert_eq!(node.vless_flow, "xtls-rprx-vision");
        let reality = node.reality.unwrap();
        assert_eq!(reality.dest, "www.example.com:443");
        assert_eq!(reality.proxy_protocol_ver, 1);
        assert_eq!(reality.short_ids, vec!["01ab"]);
    }

    #[test]
    fn reality_on_grpc_clears_flow() {
        let c = adapter("V2ray");
        let mut config = vless_reality_config();
        config["inbounds"][0]["streamSettings"]["network"] = "grpc".into();
        let node = c.parse_v2ray_node(&config).unwrap();
        assert_eq!(node.vless_flow, "");
    }

    #[test]
    fn ss_2022_node_carries_server_key() {
        let c = adapter("Shadowsocks");
        let config = serde_json::json!({
            "inbounds": [{
                "port": 8388,
                "settings": {"method": "2022-blake3-aes-256-gcm", "password": "psk"},
            }],
        });
        let node = c.parse_ss_node(&config).unwrap();
        assert_eq!(node.cipher, "2022-blake3-aes-256-gcm");
        assert_eq!(node.server_key, "psk");

        let classic = serde_json::json!({
            "inbounds": [{
                "port": 8388,
                "settings": {"method": "aes-256-gcm", "password": "pw"},
            }],
        });
        let node = c.parse_ss_node(&classic).unwrap();
        assert_eq!(node.server_key, "");
    }

    #[test]
    fn rules_strip_regexp_prefix() {
        let c = adapter("V2ray");
        *c.config_cache.lock() = Some(serde_json::json!({
            "routing": {"rules": [
                {"outboundTag": "direct"},
                {"domain": ["regexp:^porn\\.", "bad.example"]},
            ]},
        }));
        let rules = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(c.get_node_rule())
            .unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules[0].pattern.is_match("porn.example.com"));
        assert_eq!(rules[1].pattern.as_str(), "bad.example");
    }
}
