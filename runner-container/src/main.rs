use anyhow::{Context, Result};
use route_core::{
    ConventionBuilder, DispatchError, KafkaBuilder, Key, MessageContext, OffsetReset,
    RouterOptions, Value, init_tracing,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    id: String,
    amount: u64,
}

/// Entry point for running the topic router as a long-lived process on
/// container hosting services like AWS EKS, ECS, etc.
///
/// What it does at a high-level:
///     Declare handlers and configuration.
///     Run every topic loop until a shutdown signal is received.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let bootstrap =
        std::env::var("KAFKA_BOOTSTRAP").unwrap_or_else(|_| "localhost:9092".to_string());

    let mut builder = KafkaBuilder::new()
        .with_bootstrap_servers(bootstrap)
        .with_group_id("order-router")
        .with_offset_reset(OffsetReset::Earliest);
    if std::env::var("ROUTER_CONFIG").is_ok() {
        let options = RouterOptions::from_env().context("loading ROUTER_CONFIG")?;
        builder = builder.with_options(options);
    }

    builder
        .map_topic::<String, Order, _, _>("orders", handle_order)?
        .with_report_interval(Duration::from_secs(30));
    builder
        .map_topic::<String, Order, _, _>("orders", audit_order)?
        .with_group_id("order-audit")
        .with_tag("team", "billing");

    let router = builder.build().context("building the router")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal.cancel();
        }
    });

    let summaries = router.start(shutdown).await.context("router run failed")?;
    for summary in summaries {
        info!(
            "{}: {} dispatched, {} failed",
            summary.topic, summary.metrics.dispatched, summary.metrics.failed
        );
    }
    Ok(())
}

async fn handle_order(
    Key(id): Key<String>,
    Value(order): Value<Order>,
    ctx: MessageContext<String, Order>,
) -> Result<(), DispatchError> {
    info!("order {id} received for amount {}", order.amount);
    ctx.send("order-confirmations", &id, &order).await?;
    Ok(())
}

async fn audit_order(Value(order): Value<Order>) {
    info!("order {} recorded for audit", order.id);
}
