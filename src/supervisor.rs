//! Contains the [`Supervisor`], which keeps the event processing loop
//! running by restarting it, after a fixed delay, every time it terminates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::report::Reporter;
use crate::store::EventStore;
use crate::subscription::{StreamConfig, SubscriptionManager};

/// Delay between a terminated processing loop and its restart.
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A long-running processing loop supervised by a [`Supervisor`].
#[async_trait]
pub trait Worker: Send + Sync {
    /// Runs the processing loop until it terminates.
    ///
    /// A fresh loop is built on every call: nothing from a previous,
    /// terminated run is reused.
    async fn run(&self) -> anyhow::Result<()>;
}

/// The [`Worker`] subscribing to all the configured streams through a
/// [`SubscriptionManager`].
pub struct Pipeline<S> {
    manager: SubscriptionManager<S>,
    streams: Vec<StreamConfig>,
}

impl<S> Pipeline<S>
where
    S: EventStore,
{
    /// Creates a new [`Pipeline`] over the specified streams.
    pub fn new(manager: SubscriptionManager<S>, streams: Vec<StreamConfig>) -> Self {
        Self { manager, streams }
    }
}

#[async_trait]
impl<S> Worker for Pipeline<S>
where
    S: EventStore,
{
    async fn run(&self) -> anyhow::Result<()> {
        self.manager.run_all(&self.streams).await?;
        Ok(())
    }
}

/// Restarts a [`Worker`] every time it terminates.
///
/// Every termination, including the worker returning `Ok`, is reported and
/// followed by a warning and a fixed delay before the next restart. There is
/// no backoff and, unless [`with_max_runs`] is used, no limit on the number
/// of restarts.
///
/// [`with_max_runs`]: Supervisor::with_max_runs
pub struct Supervisor<W> {
    worker: W,
    reporter: Arc<dyn Reporter>,
    reconnect_timeout: Duration,
    max_runs: Option<usize>,
}

impl<W> Supervisor<W>
where
    W: Worker,
{
    /// Creates a new [`Supervisor`] using [`DEFAULT_RECONNECT_TIMEOUT`].
    pub fn new(worker: W, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            worker,
            reporter,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            max_runs: None,
        }
    }

    /// Sets the delay before each restart.
    #[must_use]
    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }

    /// Stops supervising after the worker terminated `runs` times.
    #[must_use]
    pub fn with_max_runs(mut self, runs: usize) -> Self {
        self.max_runs = Some(runs);
        self
    }

    /// Runs the worker, restarting it whenever it terminates.
    ///
    /// Only returns when the maximum number of runs is reached, right after
    /// the last run terminated, with the number of runs performed.
    pub async fn run(&self) -> usize {
        let mut runs = 0;

        loop {
            let error = match self.worker.run().await {
                Ok(()) => anyhow::anyhow!("event processing loop terminated"),
                Err(e) => e,
            };

            runs += 1;
            self.reporter.report(&error);

            if matches!(self.max_runs, Some(max) if runs >= max) {
                return runs;
            }

            tracing::warn!(
                runs,
                timeout_secs = self.reconnect_timeout.as_secs(),
                "Lost connection with EventStore - reconnecting in {}s",
                self.reconnect_timeout.as_secs()
            );

            tokio::time::sleep(self.reconnect_timeout).await;
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::Instant;

    use super::*;
    use crate::report::test::RecordingReporter;

    #[derive(Default)]
    struct FailingWorker {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Worker for FailingWorker {
        async fn run(&self) -> anyhow::Result<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            anyhow::bail!("connection refused (run {})", run)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn it_restarts_a_failing_worker_after_the_timeout() {
        let reporter = Arc::new(RecordingReporter::default());
        let supervisor = Supervisor::new(FailingWorker::default(), reporter.clone()).with_max_runs(3);

        let started = Instant::now();
        let runs = supervisor.run().await;

        assert_eq!(3, runs);
        assert_eq!(3, supervisor.worker.runs.load(Ordering::SeqCst));
        assert_eq!(
            vec![
                "connection refused (run 1)".to_owned(),
                "connection refused (run 2)".to_owned(),
                "connection refused (run 3)".to_owned(),
            ],
            reporter.reports()
        );
        assert!(started.elapsed() >= DEFAULT_RECONNECT_TIMEOUT * 2);
        assert!(started.elapsed() < DEFAULT_RECONNECT_TIMEOUT * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn it_waits_before_restarting() {
        let reporter = Arc::new(RecordingReporter::default());
        let supervisor = Supervisor::new(FailingWorker::default(), reporter.clone())
            .with_reconnect_timeout(Duration::from_secs(2))
            .with_max_runs(2);

        let handle = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            supervisor.worker.runs.load(Ordering::SeqCst)
        };

        let (runs, runs_after_one_second) = tokio::join!(supervisor.run(), handle);

        assert_eq!(2, runs);
        assert_eq!(1, runs_after_one_second);
    }

    struct EndingWorker;

    #[async_trait]
    impl Worker for EndingWorker {
        async fn run(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_worker_ending_successfully_is_restarted_as_well() {
        let reporter = Arc::new(RecordingReporter::default());
        let supervisor = Supervisor::new(EndingWorker, reporter.clone()).with_max_runs(2);

        assert_eq!(2, supervisor.run().await);
        assert_eq!(
            vec![
                "event processing loop terminated".to_owned(),
                "event processing loop terminated".to_owned(),
            ],
            reporter.reports()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn it_stops_without_waiting_after_the_last_run() {
        let reporter = Arc::new(RecordingReporter::default());
        let supervisor = Supervisor::new(FailingWorker::default(), reporter.clone()).with_max_runs(1);

        let started = Instant::now();

        assert_eq!(1, supervisor.run().await);
        assert_eq!(1, reporter.reports().len());
        assert!(started.elapsed() < DEFAULT_RECONNECT_TIMEOUT);
    }
}
