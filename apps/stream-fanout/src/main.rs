//! Stream Fanout Demo Binary
//!
//! Runs a registry with a handful of tenant-filtered subscribers, backfills
//! each one, then publishes live events until interrupted.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin stream-fanout
//! ```
//!
//! # Environment Variables
//!
//! - `STREAM_FANOUT_SWEEP_INTERVAL_MS`: Health sweep period (default: 10000)
//! - `STREAM_FANOUT_PING_ENABLED`: Enable keep-alive pings (default: false)
//! - `STREAM_FANOUT_PING_INTERVAL_MS`: Ping period (default: 30000)
//! - `STREAM_FANOUT_REMOVAL_TIMEOUT_SECS`: Shutdown hook timeout (default: 60)
//! - `STREAM_FANOUT_QUEUE_CAPACITY`: Dispatch queue capacity (default: 128)
//! - `STREAM_FANOUT_STALE_POLICY`: older | not-after (default: older)
//! - `STREAM_FANOUT_METRICS_PORT`: Prometheus metrics port, 0 disables (default: 9090)
//! - `STREAM_FANOUT_DEMO_SUBSCRIBERS`: Subscribers to register (default: 3)
//! - `STREAM_FANOUT_DEMO_TICK_MS`: Live publish period (default: 250)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log filter (default: stream_fanout=info)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use stream_fanout::infrastructure::telemetry;
use stream_fanout::{
    HookError, ItemBatch, RegistryConfig, ServiceConfig, StreamBatch, StreamHooks, StreamInfo,
    StreamItem, StreamRegistry, SubscriberSession, channel_sink, init_metrics,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout for consumer tasks.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Tenants the demo events are spread across.
const TENANTS: [&str; 3] = ["acme", "globex", "initech"];

/// Events written before any subscriber connects.
const HISTORY_LEN: u64 = 30;

/// Per-subscriber channel depth.
const CHANNEL_CAPACITY: usize = 256;

/// A tenant-scoped event.
#[derive(Debug, Clone, Serialize)]
struct TenantEvent {
    sequence: u64,
    tenant: &'static str,
    emitted_at: chrono::DateTime<chrono::Utc>,
}

impl TenantEvent {
    fn new(sequence: u64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let tenant = TENANTS[(sequence % TENANTS.len() as u64) as usize];
        Self {
            sequence,
            tenant,
            emitted_at: chrono::Utc::now(),
        }
    }
}

impl StreamItem for TenantEvent {
    type Id = u64;

    fn stream_item_id(&self) -> &u64 {
        &self.sequence
    }
}

type EventBatch = ItemBatch<TenantEvent>;

/// Hooks that require a tenant key and log finished subscribers.
struct DemoHooks;

#[async_trait]
impl StreamHooks<EventBatch> for DemoHooks {
    async fn before_registered(&self, info: &StreamInfo<EventBatch>) -> Result<(), HookError> {
        if info.keys().is_empty() {
            return Err(HookError::Rejected(format!(
                "{} has no tenant key",
                info.peer()
            )));
        }
        Ok(())
    }

    async fn after_removed(
        &self,
        session: &SubscriberSession<EventBatch>,
    ) -> Result<(), HookError> {
        tracing::info!(
            session_id = %session.id(),
            peer = session.peer(),
            writes = session.writes(),
            cursor = ?session.cursor(),
            "Demo subscriber finished"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let _telemetry_guard = telemetry::init()?;

    tracing::info!("Starting stream fan-out demo");

    let config = ServiceConfig::from_env()?;
    log_config(&config);

    if config.server.metrics_port != 0
        && let Err(e) = init_metrics(config.server.metrics_port)
    {
        tracing::warn!(error = %e, "Metrics exporter unavailable, continuing without it");
    }

    let shutdown_token = CancellationToken::new();
    let registry = Arc::new(StreamRegistry::new(
        RegistryConfig::from(config.stream.clone()),
        Arc::new(DemoHooks),
    ));

    let history: Vec<TenantEvent> = (1..=HISTORY_LEN).map(TenantEvent::new).collect();

    let mut consumers = Vec::with_capacity(config.demo.subscribers);
    for index in 0..config.demo.subscribers {
        let tenant = TENANTS[index % TENANTS.len()];
        let (sink, rx) = channel_sink::<EventBatch>(CHANNEL_CAPACITY);
        let info = StreamInfo::new(Arc::new(sink))
            .with_peer(format!("demo-{index}"))
            .with_keys([tenant])
            .with_cancellation(shutdown_token.child_token());

        let session = registry
            .subscribe(info, move |event: &TenantEvent| event.tenant == tenant)
            .await?;

        let backfill: Vec<TenantEvent> = history
            .iter()
            .filter(|event| event.tenant == tenant)
            .cloned()
            .collect();
        registry
            .send_historical(&session, ItemBatch::new(backfill))
            .await;
        registry.activate(&session);

        consumers.push(tokio::spawn(consume(format!("demo-{index}"), rx)));
    }

    let producer = tokio::spawn(run_producer(
        Arc::clone(&registry),
        config.demo.tick_interval,
        shutdown_token.clone(),
    ));

    await_shutdown(shutdown_token).await;

    if let Err(e) = producer.await {
        tracing::warn!(error = %e, "Producer task failed");
    }

    registry.stop().await;
    drop(registry);

    let drained =
        tokio::time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(consumers)).await;
    if drained.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Consumers did not drain before timeout"
        );
    }

    tracing::info!("Stream fan-out demo stopped");
    Ok(())
}

/// Publish one live event per tick until cancelled.
///
/// Every tenth tick also republishes an older event, which the subscribers'
/// cursors skip.
async fn run_producer(
    registry: Arc<StreamRegistry<EventBatch>>,
    tick: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut sequence = HISTORY_LEN;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!(last_sequence = sequence, "Producer cancelled");
                break;
            }
            _ = interval.tick() => {
                sequence += 1;
                publish(&registry, TenantEvent::new(sequence));

                if sequence % 10 == 0 {
                    publish(&registry, TenantEvent::new(sequence - TENANTS.len() as u64 * 2));
                }
            }
        }
    }
}

fn publish(registry: &StreamRegistry<EventBatch>, event: TenantEvent) {
    let sequence = event.sequence;
    match registry.publish_live(ItemBatch::single(event)) {
        Ok(routed) => tracing::trace!(sequence, routed, "Published live event"),
        Err(e) => tracing::warn!(sequence, error = %e, "Live publish rejected"),
    }
}

/// Drain one subscriber's channel, logging what arrives.
async fn consume(peer: String, mut rx: mpsc::Receiver<EventBatch>) {
    let mut received = 0usize;
    while let Some(batch) = rx.recv().await {
        received += batch.len();
        if batch.is_ping() {
            tracing::debug!(peer = %peer, "Ping received");
            continue;
        }
        match serde_json::to_string(batch.items()) {
            Ok(json) => {
                tracing::info!(peer = %peer, items = batch.len(), events = %json, "Batch received");
            }
            Err(e) => tracing::warn!(peer = %peer, error = %e, "Failed to encode batch"),
        }
    }
    tracing::info!(peer = %peer, received, "Consumer finished");
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ServiceConfig) {
    tracing::info!(
        sweep_interval = ?config.stream.sweep_interval,
        ping_enabled = config.stream.ping_enabled,
        ping_interval = ?config.stream.ping_interval,
        stale_policy = config.stream.stale_policy.as_str(),
        metrics_port = config.server.metrics_port,
        subscribers = config.demo.subscribers,
        "Configuration loaded"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
