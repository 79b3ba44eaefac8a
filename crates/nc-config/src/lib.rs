//! Process configuration for nodectl.
//!
//! One YAML file configures the whole process: a global section (logging,
//! engine policy, optional JSON side-configs) and a list of nodes, each
//! binding one upstream panel to one controller.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub dns_config_path: Option<String>,
    #[serde(default)]
    pub inbound_config_path: Option<String>,
    #[serde(default)]
    pub outbound_config_path: Option<String>,
    #[serde(default)]
    pub route_config_path: Option<String>,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl Config {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Invalid("no nodes configured".into()));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if node.api.api_host.is_empty() {
                return Err(ConfigError::Invalid(format!("nodes[{i}]: api_host is empty")));
            }
            if node.api.node_id == 0 {
                return Err(ConfigError::Invalid(format!("nodes[{i}]: node_id must be > 0")));
            }
            if node.controller.update_periodic == 0 {
                return Err(ConfigError::Invalid(format!(
                    "nodes[{i}]: update_periodic must be > 0"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub level: String,
    pub access_path: Option<String>,
    pub error_path: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            access_path: None,
            error_path: None,
        }
    }
}

/// Engine connection policy knobs, forwarded verbatim to the engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    pub handshake: u32,
    pub conn_idle: u32,
    pub uplink_only: u32,
    pub downlink_only: u32,
    pub buffer_size: i32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake: 4,
            conn_idle: 30,
            uplink_only: 2,
            downlink_only: 4,
            buffer_size: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub panel_type: String,
    pub api: ApiConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub api_host: String,
    pub node_id: u32,
    pub api_key: String,
    /// One of `V2ray`, `Vmess`, `Vless`, `Trojan`, `Shadowsocks`,
    /// `Shadowsocks-Plugin`.
    pub node_type: String,
    pub enable_vless: bool,
    pub vless_flow: String,
    /// Request timeout in seconds; 0 means the 5 s default.
    pub timeout: u64,
    /// Mbit/s; a positive value overrides whatever the panel reports.
    pub speed_limit: f64,
    /// A positive value overrides the panel's per-user device limit.
    pub device_limit: i32,
    pub rule_list_path: Option<String>,
    pub disable_custom_config: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_host: String::new(),
            node_id: 0,
            api_key: String::new(),
            node_type: "V2ray".into(),
            enable_vless: false,
            vless_flow: String::new(),
            timeout: 0,
            speed_limit: 0.0,
            device_limit: 0,
            rule_list_path: None,
            disable_custom_config: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    pub listen_ip: String,
    pub send_ip: String,
    /// Poll interval for the sync and report tasks, in seconds.
    pub update_periodic: u64,
    pub cert_config: CertConfig,
    pub enable_dns: bool,
    pub dns_type: String,
    pub disable_upload_traffic: bool,
    pub disable_get_rule: bool,
    pub enable_proxy_protocol: bool,
    pub enable_fallback: bool,
    pub disable_iv_check: bool,
    pub disable_sniffing: bool,
    pub auto_speed_limit: AutoSpeedLimitConfig,
    pub global_device_limit: GlobalDeviceLimitConfig,
    pub fallbacks: Vec<FallbackConfig>,
    pub enable_reality: bool,
    pub reality: RealityConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".into(),
            send_ip: "0.0.0.0".into(),
            update_periodic: 60,
            cert_config: CertConfig::default(),
            enable_dns: false,
            dns_type: String::new(),
            disable_upload_traffic: false,
            disable_get_rule: false,
            enable_proxy_protocol: false,
            enable_fallback: false,
            disable_iv_check: false,
            disable_sniffing: false,
            auto_speed_limit: AutoSpeedLimitConfig::default(),
            global_device_limit: GlobalDeviceLimitConfig::default(),
            fallbacks: Vec::new(),
            enable_reality: false,
            reality: RealityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CertConfig {
    /// `none`, `file`, `http`, `dns` or `tls`.
    pub cert_mode: String,
    pub cert_domain: String,
    pub cert_file: String,
    pub key_file: String,
    pub provider: String,
    pub email: String,
    pub dns_env: std::collections::HashMap<String, String>,
    pub reject_unknown_sni: bool,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            cert_mode: "none".into(),
            cert_domain: String::new(),
            cert_file: String::new(),
            key_file: String::new(),
            provider: String::new(),
            email: String::new(),
            dns_env: Default::default(),
            reject_unknown_sni: false,
        }
    }
}

/// Temporary speed-limit demotion of users that exceed a traffic threshold.
#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct AutoSpeedLimitConfig {
    /// Threshold in Mbit/s averaged over one report period; 0 disables.
    pub limit: u64,
    /// Consecutive over-threshold periods tolerated before limiting.
    pub warn_times: u32,
    /// Demoted speed in Mbit/s.
    pub limit_speed: u64,
    /// Demotion duration in minutes.
    pub limit_duration: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GlobalDeviceLimitConfig {
    pub enable: bool,
    /// host:port
    pub redis_addr: String,
    pub redis_password: String,
    pub redis_db: i64,
    /// Per-call timeout in seconds.
    pub timeout: u64,
    /// Online-set TTL in seconds.
    pub expiry: u64,
}

impl Default for GlobalDeviceLimitConfig {
    fn default() -> Self {
        Self {
            enable: false,
            redis_addr: String::new(),
            redis_password: String::new(),
            redis_db: 0,
            timeout: 5,
            expiry: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FallbackConfig {
    pub sni: String,
    pub alpn: String,
    pub path: String,
    pub dest: String,
    pub proxy_protocol_ver: u64,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RealityConfig {
    pub show: bool,
    pub dest: String,
    pub proxy_protocol_ver: u64,
    pub server_names: Vec<String>,
    pub private_key: String,
    pub min_client_ver: String,
    pub max_client_ver: String,
    pub max_time_diff: u64,
    pub short_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
log:
  level: debug
connection:
  conn_idle: 60
nodes:
  - panel_type: SSpanel
    api:
      api_host: "http://panel.example"
      node_id: 7
      api_key: "k"
      node_type: V2ray
      timeout: 10
    controller:
      listen_ip: "0.0.0.0"
      update_periodic: 30
      cert_config:
        cert_mode: file
        cert_file: /etc/ssl/a.crt
        key_file: /etc/ssl/a.key
      auto_speed_limit:
        limit: 100
        warn_times: 2
        limit_speed: 10
        limit_duration: 10
"#;

    #[test]
    fn parses_sample() {
        let config = Config::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.connection.conn_idle, 60);
        assert_eq!(config.connection.handshake, 4);
        let node = &config.nodes[0];
        assert_eq!(node.panel_type, "SSpanel");
        assert_eq!(node.api.node_id, 7);
        assert_eq!(node.api.timeout, 10);
        assert_eq!(node.controller.update_periodic, 30);
        assert_eq!(node.controller.cert_config.cert_mode, "file");
        assert_eq!(node.controller.auto_speed_limit.warn_times, 2);
        assert!(!node.controller.global_device_limit.enable);
    }

    #[test]
    fn defaults_fill_in() {
        let config = Config::from_yaml_str(
            r#"
nodes:
  - panel_type: NewV2board
    api:
      api_host: "http://x"
      node_id: 1
      api_key: "k"
"#,
        )
        .unwrap();
        let node = &config.nodes[0];
        assert_eq!(node.controller.listen_ip, "0.0.0.0");
        assert_eq!(node.controller.update_periodic, 60);
        assert_eq!(node.controller.cert_config.cert_mode, "none");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn rejects_empty_nodes() {
        assert!(matches!(
            Config::from_yaml_str("log:\n  level: info\n"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_zero_node_id() {
        let err = Config::from_yaml_str(
            r#"
nodes:
  - panel_type: SSpanel
    api:
      api_host: "http://x"
      node_id: 0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("node_id"));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(Config::from_yaml_str("bogus: 1\nnodes: []\n").is_err());
    }
}
