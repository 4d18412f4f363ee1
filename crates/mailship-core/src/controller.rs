//! Batch controller.
//!
//! The [`Shipper`] owns the in-flight event queue and the working document
//! set and drives one flush cycle at a time:
//!
//! ```text
//! Idle -> Resolving -> Assembling -> Persisting -> Settling -> Idle
//!             ^                           |
//!             +-------- Retrying <--------+   (any failure)
//! ```
//!
//! A failed cycle is re-run from orphan resolution after a fixed delay with
//! the same queue and the same working set, until it succeeds. The reader is
//! acknowledged only after a successful write plus a settle delay, so the
//! store's refresh has made the new documents searchable before the next
//! batch resolves orphans against them.

use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::assembler::{AssemblyReport, assemble};
use crate::config::Config;
use crate::document::WorkingSet;
use crate::error::{CycleError, Result};
use crate::event::{CanonicalEvent, Normalizer, Rejection};
use crate::parser::LogParser;
use crate::persist::{PersistReport, persist};
use crate::reader::LineSource;
use crate::resolver::{ResolveReport, resolve_orphans};
use crate::retry::RetryPolicy;
use crate::store::DocumentStore;

/// Where the controller is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Resolving,
    Assembling,
    Persisting,
    Settling,
    Retrying,
}

/// Tunables for a [`Shipper`].
#[derive(Debug, Clone)]
pub struct ShipperOptions {
    /// Program-name prefix accepted by the normalizer
    pub family: String,
    /// Maximum stored documents loaded per cycle
    pub page_size: usize,
    pub retry_delay: Duration,
    pub settle_delay: Duration,
}

impl Default for ShipperOptions {
    fn default() -> Self {
        Self {
            family: "postfix".to_string(),
            page_size: 3072,
            retry_delay: Duration::from_secs(15),
            settle_delay: Duration::from_secs(15),
        }
    }
}

impl ShipperOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            family: config.parser.family.clone(),
            page_size: config.page_size(),
            retry_delay: config.shipper.retry_delay(),
            settle_delay: config.shipper.settle_delay(),
        }
    }

    /// No waiting at all; for replays and tests.
    #[must_use]
    pub fn immediate(self) -> Self {
        Self {
            retry_delay: Duration::ZERO,
            settle_delay: Duration::ZERO,
            ..self
        }
    }
}

/// Summary of one successful cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    /// Attempts it took, including the successful one
    pub attempts: u32,
    pub documents: usize,
    pub resolve: ResolveReport,
    pub assembly: AssemblyReport,
    pub persist: PersistReport,
}

/// Result of a flush trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued; acknowledge immediately.
    Empty,
    Flushed(CycleReport),
    /// A cycle is already running; the trigger was ignored.
    AlreadyActive,
}

/// Running totals since start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShipperStats {
    pub lines_read: u64,
    pub events_queued: u64,
    pub lines_foreign: u64,
    pub lines_rejected: u64,
    pub cycles_completed: u64,
    pub cycle_failures: u64,
    pub documents_written: u64,
}

/// Batch controller over a store `S` and a line parser `P`.
pub struct Shipper<S, P> {
    store: S,
    normalizer: Normalizer<P>,
    options: ShipperOptions,
    retry: RetryPolicy,
    queue: Vec<CanonicalEvent>,
    working: WorkingSet,
    state: CycleState,
    cycles: u64,
    stats: ShipperStats,
}

impl<S: DocumentStore, P: LogParser> Shipper<S, P> {
    pub fn new(store: S, parser: P, options: ShipperOptions) -> Self {
        Self {
            store,
            normalizer: Normalizer::new(parser, options.family.clone()),
            retry: RetryPolicy::fixed(options.retry_delay),
            options,
            queue: Vec::new(),
            working: WorkingSet::new(),
            state: CycleState::Idle,
            cycles: 0,
            stats: ShipperStats::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> CycleState {
        self.state
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn stats(&self) -> &ShipperStats {
        &self.stats
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Normalize one raw line and queue the resulting event. Returns whether
    /// an event was queued.
    pub fn ingest_line(&mut self, line: &str) -> bool {
        self.stats.lines_read += 1;
        match self.normalizer.normalize(line) {
            Ok(event) => self.enqueue(event),
            Err(Rejection::ForeignProgram { prog }) => {
                debug!(prog = %prog, "Line from foreign program skipped");
                self.stats.lines_foreign += 1;
                false
            }
            Err(Rejection::Decode(err)) => {
                warn!(error = %err, "Parse error; line dropped");
                self.stats.lines_rejected += 1;
                false
            }
            Err(Rejection::MissingQid { prog }) => {
                debug!(prog = %prog, "Line carries no queue id; dropped");
                self.stats.lines_rejected += 1;
                false
            }
            Err(Rejection::Timestamp { raw }) => {
                warn!(timestamp = %raw, "Invalid syslog timestamp; line dropped");
                self.stats.lines_rejected += 1;
                false
            }
        }
    }

    /// Queue an already normalized event.
    pub fn enqueue(&mut self, event: CanonicalEvent) -> bool {
        self.queue.push(event);
        self.stats.events_queued += 1;
        true
    }

    /// Run one flush cycle over everything queued, retrying until it
    /// succeeds. Returns once the settle delay has passed and the queue and
    /// working set are cleared.
    pub async fn flush(&mut self) -> FlushOutcome {
        if self.state != CycleState::Idle {
            info!(state = ?self.state, "Flush already active; trigger ignored");
            return FlushOutcome::AlreadyActive;
        }
        if self.queue.is_empty() {
            debug!("Flush with empty queue; acknowledging immediately");
            return FlushOutcome::Empty;
        }

        self.cycles += 1;
        let cycle = self.cycles;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.run_cycle(cycle, attempt).await {
                Ok(report) => {
                    self.stats.cycles_completed += 1;
                    self.stats.documents_written += report.documents as u64;
                    info!(
                        cycle,
                        attempt,
                        events = self.queue.len(),
                        docs = report.documents,
                        created = report.persist.created,
                        updated = report.persist.updated,
                        "Flush cycle complete"
                    );

                    self.state = CycleState::Settling;
                    if !self.options.settle_delay.is_zero() {
                        sleep(self.options.settle_delay).await;
                    }
                    self.queue.clear();
                    self.working.clear();
                    self.state = CycleState::Idle;
                    return FlushOutcome::Flushed(report);
                }
                Err(err) => {
                    self.state = CycleState::Retrying;
                    self.stats.cycle_failures += 1;
                    let delay = self.retry.delay_for_attempt(attempt - 1);
                    warn!(
                        cycle,
                        attempt,
                        error = %err,
                        retry_in_secs = delay.as_secs(),
                        "Flush cycle failed; retrying with the same batch"
                    );
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn run_cycle(
        &mut self,
        cycle: u64,
        attempt: u32,
    ) -> std::result::Result<CycleReport, CycleError> {
        debug!(cycle, attempt, events = self.queue.len(), "Flush cycle starting");

        self.state = CycleState::Resolving;
        let resolve = resolve_orphans(
            &self.store,
            &self.queue,
            self.options.page_size,
            &mut self.working,
        )
        .await
        .map_err(CycleError::Resolve)?;

        self.state = CycleState::Assembling;
        let assembly = assemble(&self.queue, &mut self.working);

        self.state = CycleState::Persisting;
        let persist = persist(&self.store, &mut self.working).await?;

        Ok(CycleReport {
            cycle,
            attempts: attempt,
            documents: self.working.len(),
            resolve,
            assembly,
            persist,
        })
    }

    /// Pull batches from `reader` until it is exhausted, flushing each one
    /// and acknowledging it once flushed.
    pub async fn run<R: LineSource>(&mut self, reader: &mut R) -> Result<ShipperStats> {
        while let Some(batch) = reader.next_batch().await? {
            for line in &batch.lines {
                self.ingest_line(line);
            }
            match self.flush().await {
                FlushOutcome::Empty | FlushOutcome::Flushed(_) => {
                    reader.advance(&batch.position).await?;
                }
                FlushOutcome::AlreadyActive => {}
            }
        }
        info!(
            lines = self.stats.lines_read,
            cycles = self.stats.cycles_completed,
            docs = self.stats.documents_written,
            "Reader exhausted"
        );
        Ok(self.stats.clone())
    }
}
