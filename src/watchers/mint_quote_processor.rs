//! Mint quote processor
//!
//! Redeems paid mint quotes in the background. Quotes are queued when the
//! watcher (or an explicit check) reports them paid and retried up to
//! `max_retries` times.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::MintQuoteProcessorConfig;
use crate::errors::WalletResult;
use crate::events::{EventBus, EventKind, SubscriptionId, WalletEvent};
use crate::services::QuoteService;
use crate::types::MintQuoteState;

use super::PollTask;

const NAME: &str = "mint quote processor";

/// quote id -> failed attempts
type Queue = Arc<Mutex<BTreeMap<String, u32>>>;

pub struct MintQuoteProcessor {
    quotes: Arc<QuoteService>,
    events: Arc<EventBus>,
    config: MintQuoteProcessorConfig,
    queue: Queue,
    subscription: Mutex<Option<SubscriptionId>>,
    task: PollTask,
}

impl MintQuoteProcessor {
    pub fn new(
        quotes: Arc<QuoteService>,
        events: Arc<EventBus>,
        config: MintQuoteProcessorConfig,
    ) -> Self {
        Self {
            quotes,
            events,
            config,
            queue: Arc::new(Mutex::new(BTreeMap::new())),
            subscription: Mutex::new(None),
            task: PollTask::default(),
        }
    }

    pub async fn start(&self) -> WalletResult<()> {
        if self.config.disabled || self.is_running() {
            return Ok(());
        }
        for quote in self.quotes.get_pending_mint_quotes().await? {
            if quote.state == MintQuoteState::Paid {
                self.enqueue(&quote.quote_id);
            }
        }

        {
            let mut subscription = self
                .subscription
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if subscription.is_none() {
                let queue = self.queue.clone();
                *subscription = Some(self.events.on(
                    Some(EventKind::MintQuoteStateChanged),
                    move |event| {
                        if let WalletEvent::MintQuoteStateChanged {
                            quote_id,
                            state: MintQuoteState::Paid,
                            ..
                        } = event
                        {
                            lock(&queue).entry(quote_id.clone()).or_insert(0);
                        }
                    },
                ));
            }
        }

        let quotes = self.quotes.clone();
        let queue = self.queue.clone();
        let max_retries = self.config.max_retries;
        self.task.start(
            NAME,
            Duration::from_millis(self.config.process_interval_ms),
            move || {
                let quotes = quotes.clone();
                let queue = queue.clone();
                async move {
                    process(&quotes, &queue, max_retries).await;
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

    pub fn enqueue(&self, quote_id: &str) {
        lock(&self.queue).entry(quote_id.to_string()).or_insert(0);
    }

    pub fn queued_quotes(&self) -> Vec<String> {
        lock(&self.queue).keys().cloned().collect()
    }

    /// Redeem everything queued now; returns the number of quotes redeemed
    pub async fn process_once(&self) -> usize {
        process(&self.quotes, &self.queue, self.config.max_retries).await
    }
}

impl Drop for MintQuoteProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(queue: &Queue) -> MutexGuard<'_, BTreeMap<String, u32>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn process(quotes: &QuoteService, queue: &Queue, max_retries: u32) -> usize {
    let ids: Vec<String> = lock(queue).keys().cloned().collect();
    let mut redeemed = 0;
    for quote_id in ids {
        match quotes.redeem_mint_quote(&quote_id).await {
            Ok(proofs) => {
                log::info!("Redeemed mint quote {} into {} proofs", quote_id, proofs.len());
                lock(queue).remove(&quote_id);
                redeemed += 1;
            }
            // Someone else is redeeming it right now
            Err(e) if e.is_conflict() => {}
            Err(e) => {
                let mut queue = lock(queue);
                let attempts = queue.entry(quote_id.clone()).or_insert(0);
                *attempts += 1;
                // A coded mint rejection that is not transient will not change on retry
                let rejected = e.nut_error_code().is_some() && !e.is_recoverable();
                if *attempts >= max_retries || e.is_not_found() || rejected {
                    log::warn!(
                        "Giving up on mint quote {} after {} attempt(s): {}",
                        quote_id,
                        attempts,
                        e
                    );
                    queue.remove(&quote_id);
                } else {
                    log::warn!("Redeeming mint quote {} failed: {}", quote_id, e);
                }
            }
        }
    }
    redeemed
}
