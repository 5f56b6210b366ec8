//! Vigil Agent Host - samples host metrics and ships them to the collector
//!
//! - Polls a `sysinfo` snapshot every poll interval
//! - Reports every gauge plus the poll count every report interval
//! - Delivers each sample as a signed/encrypted/gzipped envelope through a
//!   fixed pool of workers
//! - On SIGINT/SIGTERM, flushes one last report and drains the queue before exiting

mod config;
mod delivery;
mod metrics;
mod transport;

use crate::config::AgentConfig;
use crate::delivery::{DeliveryOutcome, WorkerPool};
use crate::metrics::{run_scheduler, Sampler, SystemStats};
use crate::transport::HttpTransport;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use vigil_protocol::EnvelopeCodec;

/// Delivery totals for one agent run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct DeliveryStats {
    delivered: u64,
    failed: u64,
}

impl DeliveryStats {
    fn record(&mut self, outcome: &DeliveryOutcome) {
        match &outcome.result {
            Ok(()) => {
                self.delivered += 1;
                debug!("Delivered {}", outcome.metric);
            }
            Err(e) => {
                self.failed += 1;
                error!("Failed to deliver {}: {}", outcome.metric, e);
            }
        }
    }
}

/// Main agent state
struct Agent {
    config: AgentConfig,
    codec: Arc<EnvelopeCodec>,
    transport: Arc<HttpTransport>,
}

impl Agent {
    fn new(config: AgentConfig) -> Result<Self> {
        info!("Initializing Vigil Agent Host v{}", env!("CARGO_PKG_VERSION"));

        let keys = config.envelope_keys().context("Failed to load envelope keys")?;
        let codec = EnvelopeCodec::new(keys);
        if !codec.signs() {
            warn!("No signing key configured, samples are sent unsigned");
        }
        let transport = HttpTransport::new(&config.address, config.request_timeout())
            .context("Failed to build HTTP client")?;
        info!("Reporting to {}", transport.endpoint());

        Ok(Agent { config, codec: Arc::new(codec), transport: Arc::new(transport) })
    }

    /// Runs until `shutdown` fires, then drains and returns the totals.
    async fn run(self, shutdown: CancellationToken) -> Result<DeliveryStats> {
        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity);
        let (results_tx, mut results_rx) = mpsc::unbounded_channel::<DeliveryOutcome>();

        let mut pool = WorkerPool::spawn(
            self.config.rate_limit,
            queue_rx,
            self.codec.clone(),
            self.transport.clone(),
            results_tx,
        );

        let reporter = tokio::spawn(async move {
            let mut stats = DeliveryStats::default();
            while let Some(outcome) = results_rx.recv().await {
                stats.record(&outcome);
            }
            stats
        });

        info!(
            "Polling every {:?}, reporting every {:?} with {} workers",
            self.config.poll_interval(),
            self.config.report_interval(),
            self.config.rate_limit
        );
        let scheduler = tokio::spawn(run_scheduler(
            Sampler::new(SystemStats::new()),
            self.config.poll_interval(),
            self.config.report_interval(),
            queue_tx,
            shutdown,
        ));

        let pushed = scheduler.await.context("Scheduler task panicked")?;
        info!("Scheduler stopped after queueing {} samples, draining", pushed);

        if !pool.drain(self.config.drain_timeout()).await {
            warn!("Some queued samples were dropped");
        }
        // Workers own the last result senders; the reporter ends once they are gone.
        drop(pool);
        reporter.await.context("Reporter task panicked")
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Cancels `token` on SIGINT or SIGTERM.
async fn watch_signals(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::load().await.context("Failed to load agent configuration")?;
    init_tracing(&config.log_level);
    info!("Vigil Agent Host starting...");

    let agent = Agent::new(config).context("Failed to create agent")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let stats = agent.run(shutdown).await.context("Agent execution failed")?;
    info!("Agent stopped: {} delivered, {} failed", stats.delivered, stats.failed);
    Ok(())
}
