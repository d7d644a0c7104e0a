//! History Service
//!
//! Narrative record of mints, melts, sends and receives. Entry ids are derived
//! from the quote or operation they describe, so recording the same step twice
//! updates one entry instead of adding another.

use std::sync::Arc;

use crate::errors::WalletResult;
use crate::events::{EventBus, WalletEvent};
use crate::stores::{finish, RepositoryProvider, TxContext};
use crate::types::{HistoryEntry, HistoryKind};
use crate::utils::now_secs;

/// Default page size for `get_history`
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

pub fn mint_entry_id(quote_id: &str) -> String {
    format!("mint:{}", quote_id)
}

pub fn melt_entry_id(quote_id: &str) -> String {
    format!("melt:{}", quote_id)
}

pub fn send_entry_id(operation_id: &str) -> String {
    format!("send:{}", operation_id)
}

pub fn receive_entry_id() -> String {
    format!("receive:{}", uuid::Uuid::new_v4())
}

/// Build a new history entry stamped with the current time
pub fn entry(
    id: String,
    kind: HistoryKind,
    mint_url: &str,
    amount: u64,
    unit: &str,
    state: &str,
) -> HistoryEntry {
    HistoryEntry {
        id,
        kind,
        mint_url: mint_url.to_string(),
        amount,
        unit: unit.to_string(),
        state: state.to_string(),
        quote_id: None,
        operation_id: None,
        token: None,
        created_at: now_secs(),
    }
}

pub struct HistoryService {
    repos: Arc<dyn RepositoryProvider>,
    events: Arc<EventBus>,
}

impl HistoryService {
    pub fn new(repos: Arc<dyn RepositoryProvider>, events: Arc<EventBus>) -> Self {
        Self { repos, events }
    }

    /// Insert or replace an entry
    ///
    /// An existing entry keeps its original timestamp so the list order is
    /// stable while a flow progresses, and keeps its token unless a new one is given.
    pub async fn record(
        &self,
        mut entry: HistoryEntry,
        parent: Option<&TxContext>,
    ) -> WalletResult<HistoryEntry> {
        let tx = self.repos.begin(parent).await?;
        let outermost = !tx.context().is_nested();
        let history = tx.repositories().history.clone();
        let result = match history.get_history_entry(&entry.id).await {
            Ok(existing) => {
                if let Some(existing) = existing {
                    entry.created_at = existing.created_at;
                    if entry.token.is_none() {
                        entry.token = existing.token;
                    }
                }
                history.save_history_entry(entry.clone()).await
            }
            Err(e) => Err(e),
        };
        finish(tx, result).await?;

        log::debug!("History {} -> {}", entry.id, entry.state);
        if outermost {
            self.notify(&entry);
        }
        Ok(entry)
    }

    /// Change the state of an existing entry; unknown ids are ignored
    pub async fn update_state(
        &self,
        entry_id: &str,
        state: &str,
        parent: Option<&TxContext>,
    ) -> WalletResult<Option<HistoryEntry>> {
        let existing = self.get_history_entry(entry_id).await?;
        let Some(mut entry) = existing else {
            return Ok(None);
        };
        if entry.state == state {
            return Ok(Some(entry));
        }
        entry.state = state.to_string();
        self.record(entry, parent).await.map(Some)
    }

    pub async fn get_history_entry(&self, entry_id: &str) -> WalletResult<Option<HistoryEntry>> {
        self.repos
            .repositories()
            .history
            .get_history_entry(entry_id)
            .await
    }

    /// Page of entries, newest first
    pub async fn get_history(&self, offset: usize, limit: usize) -> WalletResult<Vec<HistoryEntry>> {
        let limit = if limit == 0 { DEFAULT_HISTORY_LIMIT } else { limit };
        self.repos
            .repositories()
            .history
            .get_history(offset, limit)
            .await
    }

    /// Announce an entry written inside a caller's transaction
    pub fn notify(&self, entry: &HistoryEntry) {
        self.events.emit(WalletEvent::HistoryUpdated {
            entry: entry.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::stores::MemoryRepositoryProvider;
    use std::sync::Mutex;

    const MINT: &str = "https://mint.example.com";

    fn service() -> (HistoryService, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        (
            HistoryService::new(Arc::new(MemoryRepositoryProvider::new()), events.clone()),
            events,
        )
    }

    #[tokio::test]
    async fn test_record_is_idempotent_per_id() {
        let (history, events) = service();
        let updates = Arc::new(Mutex::new(0));
        let u = updates.clone();
        events.on(Some(EventKind::HistoryUpdated), move |_| *u.lock().unwrap() += 1);

        let mut first = entry(mint_entry_id("q1"), HistoryKind::Mint, MINT, 100, "sat", "unpaid");
        first.created_at = 10;
        history.record(first, None).await.unwrap();
        let updated = history.update_state("mint:q1", "issued", None).await.unwrap().unwrap();

        assert_eq!(updated.state, "issued");
        assert_eq!(updated.created_at, 10);
        assert_eq!(history.get_history(0, 0).await.unwrap().len(), 1);
        assert_eq!(*updates.lock().unwrap(), 2);

        assert!(history.update_state("mint:missing", "paid", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_pages_newest_first() {
        let (history, _) = service();
        for i in 0..5u64 {
            let mut e = entry(send_entry_id(&i.to_string()), HistoryKind::Send, MINT, i, "sat", "pending");
            e.created_at = 100 + i;
            history.record(e, None).await.unwrap();
        }
        let page = history.get_history(1, 2).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["send:3", "send:2"]);
    }
}
