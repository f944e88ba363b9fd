use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::Registry;
use crate::config::Config;
use crate::counter::PulseCounters;
use crate::gpio::EdgeEvent;
use crate::schedule::FlushSchedule;
use crate::upload::{Completed, Dispatcher, Report};

/// How often the loop wakes to reap upload outcomes while deliveries are
/// in flight and nothing else is happening.
const REAP_TICK: Duration = Duration::from_millis(250);

/// The event loop: multiplexes edge events, the flush deadline and upload
/// completions, and owns all per-channel state.
///
/// Nothing propagates past the engine; per-channel and per-upload failures
/// are logged and the loop continues.
pub struct Engine {
    registry: Registry,
    counters: Arc<PulseCounters>,
    dispatcher: Dispatcher,
    schedule: FlushSchedule,
    edges: mpsc::Receiver<EdgeEvent>,
    cancel: CancellationToken,
}

impl Engine {
    /// Build the engine from configuration and the edge event stream.
    pub fn new(
        cfg: &Config,
        registry: Registry,
        edges: mpsc::Receiver<EdgeEvent>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let counters = Arc::new(PulseCounters::new(registry.len()));
        let dispatcher = Dispatcher::new(&cfg.server)?;
        let schedule = FlushSchedule::new(cfg.aggregate_interval);

        Ok(Self {
            registry,
            counters,
            dispatcher,
            schedule,
            edges,
            cancel,
        })
    }

    /// Shared handle to the per-channel counters.
    pub fn counters(&self) -> Arc<PulseCounters> {
        Arc::clone(&self.counters)
    }

    /// Run until the cancellation token fires or the edge source closes.
    /// In-flight uploads are abandoned on exit, not awaited.
    pub async fn run(self) -> Result<()> {
        let Engine {
            registry,
            counters,
            mut dispatcher,
            mut schedule,
            mut edges,
            cancel,
        } = self;

        if schedule.is_immediate() {
            info!("reporting every pulse immediately (legacy format)");
        } else {
            info!(interval = ?schedule.interval(), "aggregating pulses per window");
        }

        loop {
            // Reap finished deliveries; never blocks.
            while let Some(done) = dispatcher.try_completed() {
                log_completion(&done);
            }

            let deadline = schedule.next_deadline();
            let uploads_pending = dispatcher.in_flight() > 0;

            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }

                maybe_edge = edges.recv() => {
                    let Some(event) = maybe_edge else {
                        if !cancel.is_cancelled() {
                            warn!("edge source closed, stopping");
                        }
                        break;
                    };

                    // Drain every edge coalesced into this wake before
                    // going back to sleep.
                    handle_edge(&registry, &counters, &mut dispatcher, &schedule, event);
                    while let Ok(event) = edges.try_recv() {
                        handle_edge(&registry, &counters, &mut dispatcher, &schedule, event);
                    }
                }

                _ = flush_due(deadline) => {
                    flush(&registry, &counters, &mut dispatcher);
                    schedule.advance();
                }

                _ = tokio::time::sleep(REAP_TICK), if uploads_pending => {}
            }
        }

        dispatcher.abandon();
        info!("engine stopped");

        Ok(())
    }
}

/// Resolve the flush deadline into a future; pends forever in immediate
/// mode, where no deadline exists.
async fn flush_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Route one edge: immediate mode submits a one-pulse legacy report right
/// away, aggregated mode only bumps the counter (no network I/O here).
fn handle_edge(
    registry: &Registry,
    counters: &PulseCounters,
    dispatcher: &mut Dispatcher,
    schedule: &FlushSchedule,
    event: EdgeEvent,
) {
    if schedule.is_immediate() {
        match registry.uuid(event.index) {
            Some(uuid) => dispatcher.submit(Report::immediate(uuid)),
            None => debug!(channel = event.index, "pulse on unmapped channel"),
        }
        return;
    }

    counters.record(event.index);
}

/// Snapshot all non-zero counters and submit one report per mapped channel.
fn flush(registry: &Registry, counters: &PulseCounters, dispatcher: &mut Dispatcher) {
    let snapshot = counters.snapshot_and_reset();

    if snapshot.is_empty() {
        debug!("flush: no pulses this window");
        return;
    }

    for (index, count) in snapshot {
        match registry.uuid(index) {
            Some(uuid) => {
                debug!(channel = index, count, "flushing channel");
                dispatcher.submit(Report::aggregated(uuid, count));
            }
            None => {
                debug!(channel = index, count, "channel has no uuid, count discarded");
            }
        }
    }
}

/// Log one finished delivery. Failures are discarded, never retried.
fn log_completion(done: &Completed) {
    match &done.outcome {
        Ok(()) => debug!(uuid = %done.uuid, "upload complete"),
        Err(e) => warn!(uuid = %done.uuid, error = %e, "upload failed, report discarded"),
    }
}
