//! Shared helpers for the end-to-end scenarios in `tests/`

use flowbus_engine::{Callbacks, Message, MessageCallback};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Install a compact tracing subscriber for test output; safe to call
/// from every test
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowbus_engine=debug".into()),
        )
        .with_test_writer()
        .compact()
        .try_init();
}

/// Counts success/failure callback invocations across messages
#[derive(Debug, Default)]
pub struct OutcomeCounter {
    successes: AtomicUsize,
    failures: AtomicUsize,
}

impl OutcomeCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn callbacks(self: &Arc<Self>) -> Callbacks {
        let on_success = self.clone();
        let on_failure = self.clone();
        let success: MessageCallback = Arc::new(move |_: &Message| {
            on_success.successes.fetch_add(1, Ordering::SeqCst);
        });
        let failure: MessageCallback = Arc::new(move |_: &Message| {
            on_failure.failures.fetch_add(1, Ordering::SeqCst);
        });
        Callbacks::new(success, failure)
    }

    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}
