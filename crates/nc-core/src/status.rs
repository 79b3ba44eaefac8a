//! System status source for the report task.
//!
//! OS probing is an external collaborator; the default source reports real
//! process uptime and zeroed gauges, and deployments wire a platform probe
//! in through the trait.

use nc_panel::types::NodeStatus;
use std::time::Instant;

pub trait SystemInfo: Send + Sync {
    fn snapshot(&self) -> NodeStatus;
}

/// Uptime-only source used when no platform probe is installed.
pub struct ProcessUptime {
    started: Instant,
}

impl ProcessUptime {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for ProcessUptime {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemInfo for ProcessUptime {
    fn snapshot(&self) -> NodeStatus {
        NodeStatus {
            cpu: 0.0,
            mem: 0.0,
            disk: 0.0,
            uptime: self.started.elapsed().as_secs(),
        }
    }
}
