//! Completion listener dispatch and the process-wide error sink.

use std::fmt;
use std::panic::AssertUnwindSafe;

use crate::request::{Listener, Outcome};

/// Failure raised by listener code.
#[derive(Debug)]
pub enum ListenerError {
    /// Listener returned an error
    Failed(anyhow::Error),
    /// Listener panicked
    Panicked(String),
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerError::Failed(e) => write!(f, "listener failed: {:#}", e),
            ListenerError::Panicked(msg) => write!(f, "listener panicked: {}", msg),
        }
    }
}

/// Where listener failures are reported.
///
/// Reporting never influences the owning transaction.
pub trait ErrorSink: Send + Sync {
    /// Reports a failure raised while dispatching `request` of `txn`.
    fn report(&self, txn: u64, request: u64, error: &ListenerError);
}

/// Default sink: logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, txn: u64, request: u64, error: &ListenerError) {
        tracing::error!("Request {} of transaction {}: {}", request, txn, error);
    }
}

/// Runs `listeners` in order, routing failures to `sink`.
pub(crate) fn dispatch(
    sink: &dyn ErrorSink,
    txn: u64,
    request: u64,
    outcome: &Outcome,
    listeners: Vec<Listener>,
) {
    for listener in listeners {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener(outcome)));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => sink.report(txn, request, &ListenerError::Failed(e)),
            Err(panic) => {
                let msg = if let Some(msg) = panic.downcast_ref::<&str>() {
                    msg.to_string()
                } else if let Some(msg) = panic.downcast_ref::<String>() {
                    msg.clone()
                } else {
                    "unknown panic".to_string()
                };
                sink.report(txn, request, &ListenerError::Panicked(msg));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestResult;
    use ntest::timeout;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl ErrorSink for Collect {
        fn report(&self, txn: u64, request: u64, error: &ListenerError) {
            self.0.lock().push(format!("{}/{}: {}", txn, request, error));
        }
    }

    #[timeout(1000)]
    #[test]
    fn test_failures_reach_sink_and_later_listeners_still_run() {
        let sink = Collect::default();
        let ran = Arc::new(Mutex::new(Vec::new()));
        let (r1, r2, r3) = (ran.clone(), ran.clone(), ran.clone());
        let listeners: Vec<Listener> = vec![
            Box::new(move |_| {
                r1.lock().push(1);
                anyhow::bail!("boom")
            }),
            Box::new(move |_| {
                r2.lock().push(2);
                panic!("kaboom")
            }),
            Box::new(move |_| {
                r3.lock().push(3);
                Ok(())
            }),
        ];

        dispatch(&sink, 7, 9, &Ok(RequestResult::Done), listeners);

        assert_eq!(*ran.lock(), vec![1, 2, 3]);
        let reports = sink.0.lock();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0], "7/9: listener failed: boom");
        assert_eq!(reports[1], "7/9: listener panicked: kaboom");
    }
}
