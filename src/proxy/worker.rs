//! Background health worker
//!
//! One loop pulls due tasks from the scheduler and probes them in batches with
//! bounded concurrency, applying each result to the registry as it lands.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::models::{ProbeErrorKind, ProbeResult, Proxy};
use crate::proxy::health::Prober;
use crate::proxy::registry::Registry;
use crate::proxy::scheduler::{HealthTask, PriorityScheduler};
use crate::proxy::scoring::Transition;

/// Worker configuration
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub max_concurrent_tests: usize,
    pub batch_delay: Duration,
    pub error_backoff: Duration,
    /// How long `stop` waits for the current batch before aborting the loop
    pub stop_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_concurrent_tests: 5,
            batch_delay: Duration::from_secs(2),
            error_backoff: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(20),
        }
    }
}

/// Live worker counters
#[derive(Debug, Default)]
pub struct WorkerStats {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    probes_total: AtomicU64,
    probe_failures: AtomicU64,
    iterations: AtomicU64,
    loop_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub probes_total: u64,
    pub probe_failures: u64,
    pub iterations: u64,
    pub loop_errors: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            in_flight: self.in_flight.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            probes_total: self.probes_total.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            iterations: self.iterations.load(Ordering::Relaxed),
            loop_errors: self.loop_errors.load(Ordering::Relaxed),
        }
    }

    fn record(&self, result: &ProbeResult) {
        self.probes_total.fetch_add(1, Ordering::Relaxed);
        if !result.ok() {
            self.probe_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Counts a probe as in flight for as long as it lives
struct InFlightGuard {
    stats: Arc<WorkerStats>,
}

impl InFlightGuard {
    fn new(stats: Arc<WorkerStats>) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self { stats }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A proxy claimed for testing; handed back if the test never reports
struct TestClaim<'a> {
    registry: &'a Registry,
    key: &'a str,
    settled: bool,
}

impl<'a> TestClaim<'a> {
    fn new(registry: &'a Registry, key: &'a str) -> Self {
        Self {
            registry,
            key,
            settled: false,
        }
    }

    fn settle(mut self, result: &ProbeResult) -> Result<Transition> {
        self.settled = true;
        self.registry.apply_probe_result(self.key, result)
    }
}

impl Drop for TestClaim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.abandon_test(self.key);
        }
    }
}

/// Summary of one iteration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub dispatched: usize,
    pub healthy: usize,
    pub failed: usize,
    /// Tasks dropped because the proxy vanished, was already under test, or
    /// the worker was stopping
    pub skipped: usize,
}

enum TaskOutcome {
    Healthy,
    Failed,
    Skipped,
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Batch health worker
pub struct HealthWorker {
    registry: Arc<Registry>,
    scheduler: PriorityScheduler,
    prober: Arc<dyn Prober>,
    config: WorkerConfig,
    queue: Mutex<VecDeque<HealthTask>>,
    stats: Arc<WorkerStats>,
}

impl HealthWorker {
    pub fn new(
        registry: Arc<Registry>,
        scheduler: PriorityScheduler,
        prober: Arc<dyn Prober>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            registry,
            scheduler,
            prober,
            config: WorkerConfig {
                batch_size: config.batch_size.max(1),
                max_concurrent_tests: config.max_concurrent_tests.max(1),
                ..config
            },
            queue: Mutex::new(VecDeque::new()),
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    fn next_batch(&self) -> Vec<HealthTask> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            let candidates = self.registry.schedule_candidates();
            queue.extend(self.scheduler.due_tasks(Utc::now(), &candidates));
        }
        let n = self.config.batch_size.min(queue.len());
        queue.drain(..n).collect()
    }

    /// Run a probe on its own task so a panic cannot take the worker down
    async fn execute(&self, proxy: Proxy) -> ProbeResult {
        let guard = InFlightGuard::new(Arc::clone(&self.stats));
        let prober = Arc::clone(&self.prober);
        let key = proxy.key.clone();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            prober.probe(&proxy).await
        });

        let result = match handle.await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(key = %key, "Probe could not run: {}", e);
                ProbeResult::failed(ProbeErrorKind::ProxyError)
            }
            Err(e) if e.is_panic() => {
                error!(key = %key, "Probe panicked: {}", panic_message(e.into_panic().as_ref()));
                ProbeResult::failed(ProbeErrorKind::ProxyError)
            }
            Err(e) => {
                error!(key = %key, "Probe task failed: {}", e);
                ProbeResult::failed(ProbeErrorKind::ProxyError)
            }
        };

        self.stats.record(&result);
        result
    }

    async fn run_task(&self, task: HealthTask, shutdown: Option<&watch::Receiver<bool>>) -> TaskOutcome {
        if shutdown.is_some_and(|rx| *rx.borrow()) {
            return TaskOutcome::Skipped;
        }
        let Some(proxy) = self.registry.begin_test(&task.proxy_key) else {
            return TaskOutcome::Skipped;
        };
        let claim = TestClaim::new(&self.registry, &task.proxy_key);

        let result = self.execute(proxy).await;
        match claim.settle(&result) {
            Ok(_) if result.ok() => TaskOutcome::Healthy,
            Ok(_) => TaskOutcome::Failed,
            Err(e) => {
                debug!(key = %task.proxy_key, "Dropping probe result: {}", e);
                TaskOutcome::Skipped
            }
        }
    }

    /// Probe one batch of due proxies
    pub async fn run_iteration(&self) -> BatchReport {
        self.run_batch(None).await
    }

    /// Probe one batch; once `shutdown` flips, queued tasks are skipped and
    /// only tests already started run to completion
    async fn run_batch(&self, shutdown: Option<&watch::Receiver<bool>>) -> BatchReport {
        self.stats.iterations.fetch_add(1, Ordering::Relaxed);
        let batch = self.next_batch();
        let mut report = BatchReport {
            dispatched: batch.len(),
            ..BatchReport::default()
        };

        let outcomes: Vec<TaskOutcome> = futures::stream::iter(batch)
            .map(|task| self.run_task(task, shutdown))
            .buffer_unordered(self.config.max_concurrent_tests)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                TaskOutcome::Healthy => report.healthy += 1,
                TaskOutcome::Failed => report.failed += 1,
                TaskOutcome::Skipped => report.skipped += 1,
            }
        }
        report
    }

    /// Probe a single proxy immediately, outside the schedule
    pub async fn probe_now(&self, key: &str) -> Result<Proxy> {
        let proxy = self.registry.begin_manual_test(key)?;
        let claim = TestClaim::new(&self.registry, key);
        let result = self.execute(proxy).await;
        claim.settle(&result)?;
        self.scheduler.forget(key);
        self.registry
            .get(key)
            .ok_or_else(|| crate::error::WardenError::ProxyNotFound {
                key: key.to_string(),
            })
    }

    /// Run the worker loop until `shutdown` flips
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent_tests,
            "Starting health worker"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match AssertUnwindSafe(self.run_batch(Some(&shutdown))).catch_unwind().await {
                Ok(report) => {
                    if report.dispatched > 0 {
                        info!(
                            dispatched = report.dispatched,
                            healthy = report.healthy,
                            failed = report.failed,
                            skipped = report.skipped,
                            "Health batch complete"
                        );
                    }
                    self.config.batch_delay
                }
                Err(panic) => {
                    self.stats.loop_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Health worker iteration panicked: {}",
                        panic_message(panic.as_ref())
                    );
                    self.config.error_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Health worker stopped");
    }

    /// Spawn the loop and return a handle to stop it
    pub fn start(self: Arc<Self>) -> HealthWorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stop_timeout = self.config.stop_timeout;
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });

        HealthWorkerHandle {
            shutdown_tx,
            task,
            stop_timeout,
        }
    }
}

/// Handle for a running health worker
pub struct HealthWorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    stop_timeout: Duration,
}

impl HealthWorkerHandle {
    /// Stop starting tests, let those in flight finish, and wait for the loop.
    ///
    /// Past the stop timeout the loop is aborted; proxies whose tests were cut
    /// off get their pre-test status back.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);

        match tokio::time::timeout(self.stop_timeout, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Health worker task failed: {}", e),
            Err(_) => {
                warn!(
                    "Health worker did not stop within {}s, aborting",
                    self.stop_timeout.as_secs()
                );
                self.task.abort();
                // wait for the cancelled batch to be dropped
                let _ = (&mut self.task).await;
            }
        }
    }
}
