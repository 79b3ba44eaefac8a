//! Common model shared by every panel adapter and the controller.

use regex::Regex;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Protocol family served by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodeType {
    #[default]
    V2ray,
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    ShadowsocksPlugin,
    /// Companion inbound used by Shadowsocks-Plugin; never configured
    /// directly.
    DokodemoDoor,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::V2ray => "V2ray",
            NodeType::Vmess => "Vmess",
            NodeType::Vless => "Vless",
            NodeType::Trojan => "Trojan",
            NodeType::Shadowsocks => "Shadowsocks",
            NodeType::ShadowsocksPlugin => "Shadowsocks-Plugin",
            NodeType::DokodemoDoor => "dokodemo-door",
        }
    }

    /// The vmess-family types share user and inbound construction.
    pub fn is_vmess_family(&self) -> bool {
        matches!(self, NodeType::V2ray | NodeType::Vmess | NodeType::Vless)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "V2ray" => Ok(NodeType::V2ray),
            "Vmess" => Ok(NodeType::Vmess),
            "Vless" => Ok(NodeType::Vless),
            "Trojan" => Ok(NodeType::Trojan),
            "Shadowsocks" => Ok(NodeType::Shadowsocks),
            "Shadowsocks-Plugin" => Ok(NodeType::ShadowsocksPlugin),
            other => Err(format!("unsupported node type: {other}")),
        }
    }
}

/// Stream transport carried in the node descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transport {
    #[default]
    Tcp,
    Ws,
    Grpc,
    H2,
    HttpUpgrade,
    SplitHttp,
    Kcp,
    Quic,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Ws => "ws",
            Transport::Grpc => "grpc",
            Transport::H2 => "h2",
            Transport::HttpUpgrade => "httpupgrade",
            Transport::SplitHttp => "splithttp",
            Transport::Kcp => "kcp",
            Transport::Quic => "quic",
        }
    }

    /// Parse a panel-reported network name; unknown or empty falls back to
    /// tcp, which is what every panel means by omission.
    pub fn parse_lossy(s: &str) -> Transport {
        match s {
            "ws" | "websocket" => Transport::Ws,
            "grpc" | "gun" => Transport::Grpc,
            "h2" | "http" => Transport::H2,
            "httpupgrade" => Transport::HttpUpgrade,
            "splithttp" | "xhttp" => Transport::SplitHttp,
            "kcp" | "mkcp" => Transport::Kcp,
            "quic" => Transport::Quic,
            _ => Transport::Tcp,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// REALITY parameters carried in the node descriptor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RealityOptions {
    pub dest: String,
    pub proxy_protocol_ver: u64,
    pub server_names: Vec<String>,
    pub private_key: String,
    pub min_client_ver: String,
    pub max_client_ver: String,
    pub max_time_diff: u64,
    pub short_ids: Vec<String>,
    pub show: bool,
}

/// Node descriptor produced by an adapter.
///
/// Immutable inside one sync cycle; the controller replaces it atomically at
/// cycle boundaries and compares by value to decide on a full tag swap.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeInfo {
    pub node_type: NodeType,
    pub node_id: u32,
    pub port: u32,
    /// Bytes per second; 0 = unlimited.
    pub speed_limit: u64,
    pub alter_id: u16,
    pub transport: Transport,
    pub host: String,
    pub path: String,
    pub service_name: String,
    pub authority: String,
    /// Raw header blob forwarded to the stream settings (tcp/kcp header
    /// obfuscation), panel-shaped.
    pub header: Option<serde_json::Value>,
    pub enable_tls: bool,
    pub enable_vless: bool,
    pub vless_flow: String,
    /// Shadowsocks cipher.
    pub cipher: String,
    /// Shadowsocks 2022 node PSK reported by the panel.
    pub server_key: String,
    pub enable_reality: bool,
    pub reality: Option<RealityOptions>,
    pub accept_proxy_protocol: bool,
}

/// One roster entry. Field changes re-register the user, so equality (and
/// hashing, for the auto-limit bookkeeping) is value-based over all fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct UserInfo {
    pub uid: i64,
    pub email: String,
    pub uuid: String,
    pub passwd: String,
    /// Bytes per second; 0 = unlimited.
    pub speed_limit: u64,
    /// 0 = unlimited.
    pub device_limit: i32,
    pub port: u32,
    pub alter_id: u16,
    /// Per-user shadowsocks cipher, for panels that issue one.
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineUser {
    pub uid: i64,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserTraffic {
    pub uid: i64,
    pub email: String,
    pub upload: i64,
    pub download: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NodeStatus {
    pub cpu: f64,
    pub mem: f64,
    pub disk: f64,
    pub uptime: u64,
}

/// Identity of an adapter, for log fields.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub api_host: String,
    pub node_id: u32,
    pub key: String,
    pub node_type: NodeType,
}

/// Compiled audit rule. Panel rules carry the panel id; local rules carry
/// id = -1 and never generate incident reports.
#[derive(Debug, Clone)]
pub struct DetectRule {
    pub id: i64,
    pub pattern: Regex,
}

impl DetectRule {
    pub fn new(id: i64, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            id,
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn is_local(&self) -> bool {
        self.id < 0
    }
}

impl PartialEq for DetectRule {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.pattern.as_str() == other.pattern.as_str()
    }
}

impl Eq for DetectRule {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DetectResult {
    pub uid: i64,
    pub rule_id: i64,
}

/// Mbit/s as reported by panels to bytes/s as consumed by the limiter.
pub fn mbps_to_bps(mbps: f64) -> u64 {
    if mbps <= 0.0 {
        return 0;
    }
    ((mbps * 1_000_000.0) / 8.0) as u64
}

/// Controller override wins over the panel value when positive.
pub fn pick_speed_limit(override_mbps: f64, panel_mbps: f64) -> u64 {
    if override_mbps > 0.0 {
        mbps_to_bps(override_mbps)
    } else {
        mbps_to_bps(panel_mbps)
    }
}

/// Device-limit reconciliation against the fleet-wide `alive_ip` count.
///
/// `None` means the user has no device budget left on this node and must be
/// omitted from the roster for this cycle.
pub fn reconcile_device_limit(limit: i32, alive_ip: i32, last_online: i32) -> Option<i32> {
    if limit <= 0 || alive_ip <= 0 {
        return Some(limit);
    }
    let local = limit - alive_ip + last_online;
    if local > 0 {
        Some(local)
    } else if last_online > 0 {
        Some(last_online)
    } else {
        None
    }
}

/// Read a line-delimited regex file into local rules (id = -1).
///
/// A missing file is logged and yields an empty list; malformed lines are
/// dropped with a log.
pub fn read_local_rules(path: Option<&str>) -> Vec<DetectRule> {
    let mut rules = Vec::new();
    let Some(path) = path.filter(|p| !p.is_empty()) else {
        return rules;
    };
    let raw = match std::fs::read_to_string(Path::new(path)) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!(path, %err, "open local rule list failed");
            return rules;
        }
    };
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match DetectRule::new(-1, line) {
            Ok(rule) => rules.push(rule),
            Err(err) => tracing::warn!(path, line, %err, "invalid local rule dropped"),
        }
    }
    rules
}
