//! Handler configuration values produced by the builders and consumed by the
//! engine's handler managers.

use nc_panel::types::Transport;

/// TLS/REALITY choice on an inbound stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Security {
    #[default]
    None,
    Tls(TlsSettings),
    Reality(RealitySettings),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TlsSettings {
    pub cert_file: String,
    pub key_file: String,
    pub reject_unknown_sni: bool,
    /// OCSP stapling refresh interval in seconds.
    pub ocsp_stapling: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RealitySettings {
    pub show: bool,
    pub dest: String,
    pub xver: u64,
    pub server_names: Vec<String>,
    pub private_key: String,
    pub min_client_ver: String,
    pub max_client_ver: String,
    pub max_time_diff: u64,
    pub short_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SniffingSettings {
    pub enabled: bool,
    pub dest_override: Vec<&'static str>,
}

impl Default for SniffingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dest_override: vec!["http", "tls", "quic", "fakedns"],
        }
    }
}

/// Per-transport stream options.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamSettings {
    pub network: Transport,
    pub security: Security,
    /// tcp/kcp header obfuscation blob, panel-shaped.
    pub header: Option<serde_json::Value>,
    pub host: String,
    pub path: String,
    pub service_name: String,
    pub authority: String,
    /// Accept proxy-protocol on the transport itself (tcp/ws).
    pub accept_proxy_protocol: bool,
    /// Accept proxy-protocol at the socket for other transports.
    pub sockopt_proxy_protocol: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fallback {
    pub sni: String,
    pub alpn: String,
    pub path: String,
    pub dest: String,
    pub xver: u64,
}

/// Protocol-specific inbound settings.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundSettings {
    Vmess,
    Vless {
        decryption: &'static str,
        fallbacks: Vec<Fallback>,
    },
    Trojan {
        fallbacks: Vec<Fallback>,
    },
    Shadowsocks {
        cipher: String,
        /// 2022 family: the node PSK; classic: a random password.
        password: String,
        /// 2022 family only: generated seed user PSKs (base64).
        extra_psks: Vec<String>,
        iv_check: bool,
        networks: Vec<&'static str>,
    },
    DokodemoDoor {
        address: String,
        networks: Vec<&'static str>,
    },
}

impl InboundSettings {
    pub fn protocol(&self) -> &'static str {
        match self {
            InboundSettings::Vmess => "vmess",
            InboundSettings::Vless { .. } => "vless",
            InboundSettings::Trojan { .. } => "trojan",
            InboundSettings::Shadowsocks { .. } => "shadowsocks",
            InboundSettings::DokodemoDoor { .. } => "dokodemo-door",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundConfig {
    pub tag: String,
    pub listen: String,
    pub port: u32,
    pub settings: InboundSettings,
    pub stream: StreamSettings,
    pub sniffing: SniffingSettings,
}

impl InboundConfig {
    pub fn protocol(&self) -> &'static str {
        self.settings.protocol()
    }
}

/// Outbounds are always freedom, tagged like their inbound.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundConfig {
    pub tag: String,
    pub send_through: String,
    pub domain_strategy: String,
    /// Shadowsocks-Plugin companion: forward to the shadowsocks inbound.
    pub redirect: Option<String>,
}

/// Per-protocol account material attached to an engine user.
#[derive(Debug, Clone, PartialEq)]
pub enum Account {
    Vmess { uuid: String, security: &'static str },
    Vless { uuid: String, flow: String },
    Trojan { password: String },
    Shadowsocks { password: String, cipher: String },
    Shadowsocks2022 { key: String },
}

/// A user as registered on an inbound handler. The email is the full user
/// tag, so stats counters and the limiter address the same identity.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineUser {
    pub email: String,
    pub level: u32,
    pub account: Account,
}
