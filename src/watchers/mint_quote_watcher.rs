//! Mint quote watcher
//!
//! Polls unpaid mint quotes until the mint reports them paid. New quotes are
//! picked up from `MintQuoteCreated`; quotes left by an earlier session are
//! re-armed on start when configured.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::MintQuoteWatcherConfig;
use crate::errors::WalletResult;
use crate::events::{EventBus, EventKind, SubscriptionId, WalletEvent};
use crate::services::QuoteService;
use crate::types::MintQuoteState;

use super::PollTask;

const NAME: &str = "mint quote watcher";

type Watched = Arc<Mutex<BTreeSet<String>>>;

pub struct MintQuoteWatcher {
    quotes: Arc<QuoteService>,
    events: Arc<EventBus>,
    config: MintQuoteWatcherConfig,
    watched: Watched,
    subscription: Mutex<Option<SubscriptionId>>,
    task: PollTask,
}

impl MintQuoteWatcher {
    pub fn new(quotes: Arc<QuoteService>, events: Arc<EventBus>, config: MintQuoteWatcherConfig) -> Self {
        Self {
            quotes,
            events,
            config,
            watched: Arc::new(Mutex::new(BTreeSet::new())),
            subscription: Mutex::new(None),
            task: PollTask::default(),
        }
    }

    pub async fn start(&self) -> WalletResult<()> {
        if self.config.disabled || self.is_running() {
            return Ok(());
        }
        if self.config.watch_existing_pending_on_start {
            for quote in self.quotes.get_pending_mint_quotes().await? {
                if quote.state == MintQuoteState::Unpaid {
                    self.watch(&quote.quote_id);
                }
            }
        }

        {
            let mut subscription = self.subscription.lock().unwrap_or_else(PoisonError::into_inner);
            if subscription.is_none() {
                let watched = self.watched.clone();
                *subscription = Some(self.events.on(Some(EventKind::MintQuoteCreated), move |event| {
                    if let WalletEvent::MintQuoteCreated { quote, .. } = event {
                        if quote.state == MintQuoteState::Unpaid {
                            lock(&watched).insert(quote.quote_id.clone());
                        }
                    }
                }));
            }
        }

        let quotes = self.quotes.clone();
        let watched = self.watched.clone();
        self.task.start(
            NAME,
            Duration::from_millis(self.config.interval_ms),
            move || {
                let quotes = quotes.clone();
                let watched = watched.clone();
                async move {
                    poll(&quotes, &watched).await;
                }
            },
        );
        Ok(())
    }

    pub fn stop(&self) {
        self.task.stop(NAME);
        if let Some(id) = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.events.off(id);
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Add a quote to the polling set
    pub fn watch(&self, quote_id: &str) {
        lock(&self.watched).insert(quote_id.to_string());
    }

    pub fn watched_quotes(&self) -> Vec<String> {
        lock(&self.watched).iter().cloned().collect()
    }

    /// Run one polling cycle now
    pub async fn check_once(&self) {
        poll(&self.quotes, &self.watched).await;
    }
}

impl Drop for MintQuoteWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(watched: &Watched) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
    watched.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn poll(quotes: &QuoteService, watched: &Watched) {
    let ids: Vec<String> = lock(watched).iter().cloned().collect();
    for quote_id in ids {
        match quotes.check_mint_quote(&quote_id).await {
            Ok(quote) if quote.state != MintQuoteState::Unpaid => {
                log::debug!("Mint quote {} is {:?}, no longer watched", quote_id, quote.state);
                lock(watched).remove(&quote_id);
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                lock(watched).remove(&quote_id);
            }
            Err(e) => log::warn!("Checking mint quote {} failed: {}", quote_id, e),
        }
    }
}
