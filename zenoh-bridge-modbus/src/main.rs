//! Zenoh bridge for Modbus request/response traffic.
//!
//! Subscribes to request frames, correlates them by transaction id, hands
//! them to the configured transport and publishes one response per request.

use std::sync::Arc;

use anyhow::Result;
use modgate_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};

use zenoh_bridge_modbus::bridge::Bridge;
use zenoh_bridge_modbus::bus::{BusChannel, BusOutbound};
use zenoh_bridge_modbus::config::ModbusBridgeConfig;
use zenoh_bridge_modbus::poll::PollScheduler;
use zenoh_bridge_modbus::stats::HealthReporter;
use zenoh_bridge_modbus::transport;

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("modbus.json5");

    let config = ModbusBridgeConfig::load(&args.config).map_err(|e| anyhow::anyhow!("{}", e))?;

    let mut runner = BridgeRunner::new_with_args("modbus", config, Some(&args))
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?
        .with_status_publishing();

    let settings = runner.config().bridge.clone();
    let poll_settings = runner.config().polls.clone();
    let session = runner.session().clone();

    let transport = transport::from_config(runner.config(), &session)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to set up transport: {}", e))?;

    let poll_results = Arc::new(BusOutbound::new(session.clone(), &poll_settings.endpoint));

    let channel = BusChannel::open(
        session,
        &settings.inbound_endpoint,
        &settings.outbound_endpoint,
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to open bus channel: {}", e))?;

    let bridge = Arc::new(Bridge::new(transport, settings.options()));

    tracing::info!(
        inbound = %settings.inbound_endpoint,
        outbound = %settings.outbound_endpoint,
        timeout_ms = settings.request_timeout_ms,
        transport = runner.config().transport.kind(),
        "Modbus bridge ready"
    );

    let polls = Arc::new(PollScheduler::new(
        bridge.clone(),
        poll_results,
        poll_settings.history_size,
    ));
    polls
        .import(poll_settings.tasks.clone())
        .map_err(|e| anyhow::anyhow!("Failed to create polls: {}", e))?;

    let (inbound, outbound) = channel.split();
    runner.spawn(bridge.clone().serve(inbound, outbound, runner.shutdown_signal()));
    runner.spawn(polls.clone().run(runner.shutdown_signal()));

    if let Some(interval) = settings.health_interval() {
        let reporter = HealthReporter::new("modbus", bridge, runner.publisher(), interval);
        runner.spawn(reporter.run(runner.shutdown_signal()));
    }

    let metadata = serde_json::json!({
        "inbound_endpoint": settings.inbound_endpoint,
        "outbound_endpoint": settings.outbound_endpoint,
        "request_timeout_ms": settings.request_timeout_ms,
        "mode_policy": settings.mode_policy,
        "transport": runner.config().transport.kind(),
        "routes": runner.config().routes.keys().collect::<Vec<_>>(),
        "poll_endpoint": poll_settings.endpoint,
        "polls": polls.list().into_iter().map(|task| task.name).collect::<Vec<_>>(),
    });

    runner
        .run_with_metadata(Some(metadata))
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))
}
