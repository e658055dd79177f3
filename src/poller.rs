//! Discovery Poller: periodic fetch + snapshot diff + publish (spec §4.C).

use crate::backoff::Backoff;
use crate::clock::{Clock, MonotonicClock};
use crate::error::ClientError;
use crate::instance::{Instance, InstanceSnapshot, ServiceTarget};
use crate::registry_client::RegistryClient;
use crate::sleeper::{Sleeper, TokioSleeper};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use tokio_util::sync::CancellationToken as PollerToken;

/// Base poll interval between ticks (spec §4.C).
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Per-attempt HTTP timeout.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
/// Intra-poll retry budget.
pub const RETRY_ATTEMPTS: usize = 3;
/// Consecutive-failure threshold before extended backoff kicks in.
pub const FAILURE_THRESHOLD: usize = 3;
/// Extended backoff step per excess failure above the threshold.
pub const EXTENDED_BACKOFF_STEP: Duration = Duration::from_secs(10);
/// Extended backoff ceiling.
pub const EXTENDED_BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Capacity of the publish channel from poller to resolver updater.
pub const PUBLISH_CHANNEL_CAPACITY: usize = 10;

/// Periodically queries the registry for one service, diffs against the last
/// published snapshot, and feeds valid endpoint lists onto a bounded channel.
pub struct DiscoveryPoller {
    target: ServiceTarget,
    registry: Arc<RegistryClient>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    consecutive_failures: AtomicUsize,
}

impl DiscoveryPoller {
    pub fn new(target: ServiceTarget, registry: Arc<RegistryClient>) -> Self {
        Self {
            target,
            registry,
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
            consecutive_failures: AtomicUsize::new(0),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Spawn the polling loop; returns the receiving end of the publish channel plus
    /// a token the caller can cancel to stop the loop and close the channel.
    pub fn start(self: Arc<Self>) -> (mpsc::Receiver<Vec<String>>, PollerToken) {
        let (tx, rx) = mpsc::channel(PUBLISH_CHANNEL_CAPACITY);
        let token = PollerToken::new();
        let loop_token = token.clone();

        tokio::spawn(async move {
            self.run(tx, loop_token).await;
        });

        (rx, token)
    }

    async fn run(self: Arc<Self>, tx: mpsc::Sender<Vec<String>>, token: PollerToken) {
        tracing::info!(service = %self.target.service_name, "discovery poller started");
        let mut last_snapshot = InstanceSnapshot::default();

        loop {
            let tick = AssertUnwindSafe(self.tick(&tx, &mut last_snapshot)).catch_unwind();
            tokio::select! {
                _ = token.cancelled() => break,
                outcome = tick => {
                    if let Err(panic) = outcome {
                        let n = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                        tracing::error!(
                            service = %self.target.service_name,
                            failures = n,
                            panic = %panic_message(&panic),
                            "poller tick panicked, recovered"
                        );
                    }
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.sleeper.sleep(POLL_INTERVAL) => {}
            }
        }

        tracing::info!(service = %self.target.service_name, "discovery poller stopped");
    }

    /// One tick of the state machine (spec §4.C algorithm). `run` wraps this call in
    /// `AssertUnwindSafe` + `catch_unwind`; a panic here is recovered and logged, and
    /// counted as a failure so backoff still applies.
    async fn tick(&self, tx: &mpsc::Sender<Vec<String>>, last_snapshot: &mut InstanceSnapshot) {
        let failures = self.consecutive_failures.load(Ordering::Acquire);
        if failures >= FAILURE_THRESHOLD {
            let extra = (failures - FAILURE_THRESHOLD + 1) as u32;
            let backoff = (EXTENDED_BACKOFF_STEP * extra).min(EXTENDED_BACKOFF_CAP);
            tracing::info!(
                service = %self.target.service_name,
                failures,
                ?backoff,
                "too many consecutive failures, backing off"
            );
            self.sleeper.sleep(backoff).await;
        }

        let instances = match self.fetch_with_retry().await {
            Ok(instances) => instances,
            Err(err) => {
                let n = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::error!(service = %self.target.service_name, failures = n, error = %err, "poll failed");
                return;
            }
        };

        let prior_failures = self.consecutive_failures.swap(0, Ordering::AcqRel);
        if prior_failures > 0 {
            tracing::info!(service = %self.target.service_name, after = prior_failures, "recovered");
        }

        let current_snapshot = InstanceSnapshot::from_instances(&instances);
        let valid: Vec<String> = instances.iter().filter(|i| i.is_valid()).map(|i| i.address.clone()).collect();

        if current_snapshot == *last_snapshot {
            tracing::debug!(service = %self.target.service_name, "no changes detected");
            return;
        }

        self.log_changes(&current_snapshot, last_snapshot, valid.len());
        *last_snapshot = current_snapshot;

        match tx.try_send(valid) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(service = %self.target.service_name, "publish channel full, dropping update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn log_changes(&self, current: &InstanceSnapshot, last: &InstanceSnapshot, valid_count: usize) {
        let added = current.added_since(last);
        let removed = current.removed_since(last);
        let changed = current.changed_since(last);
        tracing::info!(
            service = %self.target.service_name,
            from = last.len(),
            to = current.len(),
            valid = valid_count,
            added = added.len(),
            removed = removed.len(),
            changed = changed.len(),
            "instances changed"
        );
    }

    async fn fetch_with_retry(&self) -> Result<Vec<Instance>, ClientError> {
        let backoff = Backoff::linear(Duration::from_secs(2));
        let mut last_err = None;

        for attempt in 0..RETRY_ATTEMPTS {
            match self.registry.list_instances(&self.target, ATTEMPT_TIMEOUT).await {
                Ok(instances) => return Ok(instances),
                Err(err) => {
                    tracing::warn!(
                        service = %self.target.service_name,
                        attempt = attempt + 1,
                        error = %err,
                        "registry fetch attempt failed"
                    );
                    last_err = Some(err);
                    if attempt + 1 < RETRY_ATTEMPTS {
                        self.sleeper.sleep(backoff.delay(attempt + 1)).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ClientError::RegistryUnavailable("unknown error".into())))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
