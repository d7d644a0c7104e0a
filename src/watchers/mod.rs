//! Background watchers
//!
//! Polling loops that keep local state in step with the mint while the wallet
//! is running. Each loop is a tokio task owned by its watcher; `start` and
//! `stop` are idempotent and a failed cycle is logged and retried on the next
//! tick.

pub mod mint_quote_processor;
pub mod mint_quote_watcher;
pub mod proof_state_watcher;

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

pub use mint_quote_processor::MintQuoteProcessor;
pub use mint_quote_watcher::MintQuoteWatcher;
pub use proof_state_watcher::ProofStateWatcher;

/// Slot holding the task of one polling loop
#[derive(Default)]
pub(crate) struct PollTask {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PollTask {
    /// Spawn `tick` every `interval` unless a loop is already running
    ///
    /// Returns false when the loop was already running.
    pub(crate) fn start<F, Fut>(&self, name: &'static str, interval: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut handle = self.slot();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }
        log::info!("Starting {} (every {:?})", name, interval);
        *handle = Some(tokio::spawn(async move {
            loop {
                tick().await;
                tokio::time::sleep(interval).await;
            }
        }));
        true
    }

    /// Abort the loop; returns false when nothing was running
    pub(crate) fn stop(&self, name: &'static str) -> bool {
        match self.slot().take() {
            Some(handle) => {
                handle.abort();
                log::info!("Stopped {}", name);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.slot().as_ref().is_some_and(|h| !h.is_finished())
    }

    fn slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PollTask {
    fn drop(&mut self) {
        if let Some(handle) = self.slot().take() {
            handle.abort();
        }
    }
}
