// =============================================================================
// Polling Service Skeleton — generic poll → audit → persist loop
// =============================================================================
//
// Concrete sensor readers supply the five operations; the loop supplies
// fixed-cadence pacing, error containment and graceful shutdown:
//
//   - Cycles start on a fixed cadence: the inter-cycle sleep is
//     `frequency - elapsed`, so per-cycle jitter does not drift the clock.
//     A cycle that overruns the cadence is followed immediately by the
//     next one.
//   - Any error raised inside a cycle is routed to `on_poll_error` and the
//     loop continues.
//   - The shutdown flag is checked at the top of each cycle and interrupts
//     the inter-cycle sleep; the in-flight cycle finishes and `cleanup()`
//     always runs.
// =============================================================================

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::shutdown::Shutdown;

/// Operations a concrete polling service supplies.
#[async_trait]
pub trait PollingService: Send {
    type Reading: Send;

    fn name(&self) -> &str;

    /// Open hardware, start workers. Called once before the first cycle.
    async fn initialize(&mut self) -> Result<()>;

    /// One poll attempt. `None` signals a transient failure to be skipped
    /// silently.
    async fn poll(&mut self) -> Result<Option<Self::Reading>>;

    /// Bounds check + alert-tracker feed. Returns whether to persist.
    async fn audit(&mut self, reading: &mut Self::Reading) -> Result<bool>;

    /// Durable write (and publish).
    async fn persist(&mut self, reading: &Self::Reading) -> Result<()>;

    /// Release hardware, close resources. Always runs on loop exit.
    async fn cleanup(&mut self);

    /// Per-cycle error hook. Default: log at debug (sensor hiccups are
    /// routine).
    fn on_poll_error(&self, error: &anyhow::Error) {
        debug!(service = self.name(), error = %error, "poll cycle error");
    }
}

async fn poll_cycle<S: PollingService>(service: &mut S) -> Result<()> {
    if let Some(mut reading) = service.poll().await? {
        if service.audit(&mut reading).await? {
            service.persist(&reading).await?;
        }
    }
    Ok(())
}

/// Run the polling loop until shutdown is requested.
pub async fn run<S: PollingService>(
    service: &mut S,
    frequency: Duration,
    shutdown: &Shutdown,
) -> Result<()> {
    service.initialize().await?;
    info!(service = service.name(), frequency_sec = frequency.as_secs_f64(), "polling service started");

    while !shutdown.is_requested() {
        let cycle_start = Instant::now();

        if let Err(e) = poll_cycle(service).await {
            service.on_poll_error(&e);
        }

        let remaining = frequency.saturating_sub(cycle_start.elapsed());
        if !remaining.is_zero() {
            shutdown.sleep_interruptible(remaining).await;
        }
    }

    info!(service = service.name(), "cleaning up resources");
    service.cleanup().await;
    info!(service = service.name(), "shutdown complete");
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
