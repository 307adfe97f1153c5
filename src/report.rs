//! Error-reporting collaborator used by the worker for errors that must
//! reach an operator without stopping the process.

use std::sync::Arc;

/// Receives every error the worker recovers from: failed dispatches,
/// broken subscriptions and terminated processing loops.
pub trait Reporter: Send + Sync {
    /// Reports the specified error.
    fn report(&self, error: &anyhow::Error);
}

impl<R> Reporter for Arc<R>
where
    R: Reporter + ?Sized,
{
    fn report(&self, error: &anyhow::Error) {
        (**self).report(error)
    }
}

/// [`Reporter`] implementation emitting an `ERROR` level event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, error: &anyhow::Error) {
        tracing::error!(error = ?error, "{:#}", error);
    }
}

#[cfg(test)]
pub(crate) mod test {
    use parking_lot::Mutex;

    use super::*;

    /// Keeps the rendered message of every reported error.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingReporter {
        reports: Mutex<Vec<String>>,
    }

    impl RecordingReporter {
        pub(crate) fn reports(&self) -> Vec<String> {
            self.reports.lock().clone()
        }
    }

    impl Reporter for RecordingReporter {
        fn report(&self, error: &anyhow::Error) {
            self.reports.lock().push(format!("{:#}", error));
        }
    }

    #[test]
    fn arc_reporter_forwards_to_inner_reporter() {
        let inner = Arc::new(RecordingReporter::default());
        let reporter: Arc<dyn Reporter> = inner.clone();

        reporter.report(&anyhow::anyhow!("connection reset"));

        assert_eq!(vec!["connection reset".to_owned()], inner.reports());
    }
}
