//! Process wiring: one shared engine, one controller per configured node.

use anyhow::Context;
use nc_config::Config;
use nc_core::controller::Controller;
use nc_core::dispatch::Dispatcher;
use nc_core::engine::Engine;
use nc_core::limiter::Limiter;
use nc_core::rule::RuleManager;
use nc_panel::PanelType;
use std::sync::Arc;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let engine = Engine::with_policy(config.connection.clone());
    let limiter = Limiter::new();
    let rules = RuleManager::new();
    // The dispatcher side of the engine consumes the limiter and rule
    // manager through this hook.
    let _dispatcher = Dispatcher::new(engine.clone(), limiter.clone(), rules.clone());

    let mut controllers: Vec<Arc<Controller>> = Vec::new();
    for node in &config.nodes {
        let panel_type: PanelType = node
            .panel_type
            .parse()
            .map_err(|err: String| anyhow::anyhow!(err))?;
        let panel = nc_panel::new_panel(panel_type, &node.api)
            .with_context(|| format!("build {panel_type} adapter"))?;
        let controller = Controller::new(
            engine.clone(),
            limiter.clone(),
            rules.clone(),
            panel,
            panel_type,
            node.controller.clone(),
        );
        controller
            .start()
            .await
            .with_context(|| format!("start controller for node {}", node.api.node_id))?;
        controllers.push(controller);
    }
    tracing::info!(nodes = controllers.len(), "nodectl started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    for controller in &controllers {
        controller.close().await;
    }
    Ok(())
}
