//! Panel adapters: one uniform contract over the upstream management panels
//! a node can be attached to.
//!
//! Each adapter owns its URL tree and request/response shapes and translates
//! panel-native payloads into the common model in [`types`]. Shared HTTP
//! plumbing (timeouts, retries, ETag slots) lives in [`client`].

pub mod client;
pub mod error;
pub mod types;

mod aikopanel;
mod airgo;
mod bunpanel;
mod gov2panel;
mod pmpanel;
mod proxypanel;
mod sspanel;
mod v2board;
mod v2raysocks;

pub use aikopanel::Aikopanel;
pub use airgo::Airgo;
pub use bunpanel::Bunpanel;
pub use error::{PanelError, PanelResult};
pub use gov2panel::Gov2panel;
pub use pmpanel::Pmpanel;
pub use proxypanel::Proxypanel;
pub use sspanel::Sspanel;
pub use v2board::V2board;
pub use v2raysocks::V2raysocks;

use async_trait::async_trait;
use nc_config::ApiConfig;
use std::str::FromStr;
use std::sync::Arc;
use types::{
    ClientInfo, DetectResult, DetectRule, NodeInfo, NodeStatus, OnlineUser, UserInfo, UserTraffic,
};

/// Uniform panel contract consumed by the controller.
#[async_trait]
pub trait Panel: Send + Sync {
    async fn get_node_info(&self) -> PanelResult<NodeInfo>;
    async fn get_user_list(&self) -> PanelResult<Vec<UserInfo>>;
    async fn report_node_status(&self, status: &NodeStatus) -> PanelResult<()>;
    async fn report_node_online_users(&self, online: &[OnlineUser]) -> PanelResult<()>;
    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> PanelResult<()>;
    async fn get_node_rule(&self) -> PanelResult<Vec<DetectRule>>;
    async fn report_illegal(&self, results: &[DetectResult]) -> PanelResult<()>;
    fn describe(&self) -> ClientInfo;
    /// Enable verbose HTTP tracing on the underlying client.
    fn set_debug(&self, enable: bool);
}

/// Recognized panel dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelType {
    Sspanel,
    NewV2board,
    Pmpanel,
    Proxypanel,
    V2raysocks,
    Gov2panel,
    Bunpanel,
    Aikopanel,
    Airgo,
}

impl PanelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PanelType::Sspanel => "SSpanel",
            PanelType::NewV2board => "NewV2board",
            PanelType::Pmpanel => "PMpanel",
            PanelType::Proxypanel => "Proxypanel",
            PanelType::V2raysocks => "V2RaySocks",
            PanelType::Gov2panel => "GoV2Panel",
            PanelType::Bunpanel => "BunPanel",
            PanelType::Aikopanel => "Aikopanel",
            PanelType::Airgo => "Airgo",
        }
    }

    /// The v2board family shares the shadowsocks-2022 key truncation rule.
    pub fn is_v2board_family(&self) -> bool {
        matches!(self, PanelType::NewV2board)
    }
}

impl FromStr for PanelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SSpanel" => Ok(PanelType::Sspanel),
            // V2board is the historical name of the same dialect.
            "NewV2board" | "V2board" => Ok(PanelType::NewV2board),
            "PMpanel" => Ok(PanelType::Pmpanel),
            "Proxypanel" => Ok(PanelType::Proxypanel),
            "V2RaySocks" => Ok(PanelType::V2raysocks),
            "GoV2Panel" => Ok(PanelType::Gov2panel),
            "BunPanel" => Ok(PanelType::Bunpanel),
            "Aikopanel" => Ok(PanelType::Aikopanel),
            "Airgo" => Ok(PanelType::Airgo),
            other => Err(format!("unsupported panel type: {other}")),
        }
    }
}

impl std::fmt::Display for PanelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instantiate the adapter for a configured node.
pub fn new_panel(panel_type: PanelType, config: &ApiConfig) -> PanelResult<Arc<dyn Panel>> {
    Ok(match panel_type {
        PanelType::Sspanel => Arc::new(Sspanel::new(config)?),
        PanelType::NewV2board => Arc::new(V2board::new(config)?),
        PanelType::Pmpanel => Arc::new(Pmpanel::new(config)?),
        PanelType::Proxypanel => Arc::new(Proxypanel::new(config)?),
        PanelType::V2raysocks => Arc::new(V2raysocks::new(config)?),
        PanelType::Gov2panel => Arc::new(Gov2panel::new(config)?),
        PanelType::Bunpanel => Arc::new(Bunpanel::new(config)?),
        PanelType::Aikopanel => Arc::new(Aikopanel::new(config)?),
        PanelType::Airgo => Arc::new(Airgo::new(config)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panel_type_aliases() {
        assert_eq!("V2board".parse::<PanelType>().unwrap(), PanelType::NewV2board);
        assert_eq!("NewV2board".parse::<PanelType>().unwrap(), PanelType::NewV2board);
        assert!("sspanel".parse::<PanelType>().is_err());
    }

    #[test]
    fn factory_builds_every_dialect() {
        let config = ApiConfig {
            api_host: "http://panel.example".into(),
            node_id: 1,
            api_key: "key".into(),
            node_type: "V2ray".into(),
            ..Default::default()
        };
        for name in [
            "SSpanel",
            "NewV2board",
            "PMpanel",
            "Proxypanel",
            "V2RaySocks",
            "GoV2Panel",
            "BunPanel",
            "Aikopanel",
            "Airgo",
        ] {
            let panel_type: PanelType = name.parse().unwrap();
            let panel = new_panel(panel_type, &config).unwrap();
            assert_eq!(panel.describe().node_id, 1);
        }
    }
}
