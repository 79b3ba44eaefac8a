//! Node controller core: the in-memory engine surface, the inline limiter,
//! the audit rule manager, the dispatcher admission hook, and the per-node
//! reconciliation controller that keeps all of them in sync with an upstream
//! panel.

pub mod cert;
pub mod controller;
pub mod dispatch;
pub mod engine;
pub mod limiter;
pub mod rule;
pub mod status;
pub mod tag;
