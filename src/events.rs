//! Wallet Event Bus
//!
//! Closed set of wallet events and a synchronous dispatcher. Handlers run in
//! registration order on the emitting task; services emit only after the state
//! change they describe has been committed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::types::{
    HistoryEntry, MeltQuote, MeltQuoteState, Mint, MintQuote, MintQuoteState, ProofState,
    SendOperation,
};

// =============================================================================
// Event Types
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum WalletEvent {
    MintAdded {
        mint: Mint,
    },
    MintUpdated {
        mint: Mint,
    },
    MintQuoteCreated {
        mint_url: String,
        quote: MintQuote,
    },
    MintQuoteStateChanged {
        mint_url: String,
        quote_id: String,
        state: MintQuoteState,
    },
    MintQuoteRedeemed {
        mint_url: String,
        quote_id: String,
        amount: u64,
    },
    MeltQuoteCreated {
        mint_url: String,
        quote: MeltQuote,
    },
    MeltQuotePaid {
        mint_url: String,
        quote_id: String,
        amount: u64,
        payment_preimage: Option<String>,
    },
    MeltQuoteStateChanged {
        mint_url: String,
        quote_id: String,
        state: MeltQuoteState,
    },
    SendPrepared {
        mint_url: String,
        operation: SendOperation,
    },
    SendPending {
        mint_url: String,
        operation_id: String,
        token: String,
    },
    SendFinalized {
        mint_url: String,
        operation_id: String,
    },
    SendRolledBack {
        mint_url: String,
        operation_id: String,
    },
    ProofsSaved {
        mint_url: String,
        secrets: Vec<String>,
        state: ProofState,
    },
    ProofsStateChanged {
        mint_url: String,
        secrets: Vec<String>,
        state: ProofState,
    },
    CounterUpdated {
        mint_url: String,
        keyset_id: String,
        counter: u32,
    },
    HistoryUpdated {
        entry: HistoryEntry,
    },
}

/// Discriminant used to filter subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MintAdded,
    MintUpdated,
    MintQuoteCreated,
    MintQuoteStateChanged,
    MintQuoteRedeemed,
    MeltQuoteCreated,
    MeltQuotePaid,
    MeltQuoteStateChanged,
    SendPrepared,
    SendPending,
    SendFinalized,
    SendRolledBack,
    ProofsSaved,
    ProofsStateChanged,
    CounterUpdated,
    HistoryUpdated,
}

impl WalletEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::MintAdded { .. } => EventKind::MintAdded,
            Self::MintUpdated { .. } => EventKind::MintUpdated,
            Self::MintQuoteCreated { .. } => EventKind::MintQuoteCreated,
            Self::MintQuoteStateChanged { .. } => EventKind::MintQuoteStateChanged,
            Self::MintQuoteRedeemed { .. } => EventKind::MintQuoteRedeemed,
            Self::MeltQuoteCreated { .. } => EventKind::MeltQuoteCreated,
            Self::MeltQuotePaid { .. } => EventKind::MeltQuotePaid,
            Self::MeltQuoteStateChanged { .. } => EventKind::MeltQuoteStateChanged,
            Self::SendPrepared { .. } => EventKind::SendPrepared,
            Self::SendPending { .. } => EventKind::SendPending,
            Self::SendFinalized { .. } => EventKind::SendFinalized,
            Self::SendRolledBack { .. } => EventKind::SendRolledBack,
            Self::ProofsSaved { .. } => EventKind::ProofsSaved,
            Self::ProofsStateChanged { .. } => EventKind::ProofsStateChanged,
            Self::CounterUpdated { .. } => EventKind::CounterUpdated,
            Self::HistoryUpdated { .. } => EventKind::HistoryUpdated,
        }
    }

    /// Send operation this event belongs to, if any
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            Self::SendPrepared { operation, .. } => Some(&operation.id),
            Self::SendPending { operation_id, .. }
            | Self::SendFinalized { operation_id, .. }
            | Self::SendRolledBack { operation_id, .. } => Some(operation_id),
            _ => None,
        }
    }
}

// =============================================================================
// Event Bus
// =============================================================================

pub type EventHandler = Arc<dyn Fn(&WalletEvent) + Send + Sync>;

/// Handle returned by `on`/`once`, passed to `off`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    filter: Option<EventKind>,
    once: bool,
    handler: EventHandler,
}

#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind, or every event when `filter` is `None`
    pub fn on<F>(&self, filter: Option<EventKind>, handler: F) -> SubscriptionId
    where
        F: Fn(&WalletEvent) + Send + Sync + 'static,
    {
        self.subscribe(filter, false, Arc::new(handler))
    }

    /// Subscribe for a single delivery
    pub fn once<F>(&self, filter: Option<EventKind>, handler: F) -> SubscriptionId
    where
        F: Fn(&WalletEvent) + Send + Sync + 'static,
    {
        self.subscribe(filter, true, Arc::new(handler))
    }

    /// Remove a subscription; returns false if it was already gone
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subs = self.lock();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Dispatch an event to every matching handler, in registration order
    pub fn emit(&self, event: WalletEvent) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = {
            let mut subs = self.lock();
            let matching: Vec<EventHandler> = subs
                .iter()
                .filter(|s| s.filter.map_or(true, |f| f == kind))
                .map(|s| s.handler.clone())
                .collect();
            subs.retain(|s| !(s.once && s.filter.map_or(true, |f| f == kind)));
            matching
        };

        log::trace!("Emitting {:?} to {} handler(s)", kind, handlers.len());
        for handler in handlers {
            handler(&event);
        }
    }

    fn subscribe(&self, filter: Option<EventKind>, once: bool, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Subscription {
            id,
            filter,
            once,
            handler,
        });
        id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rolled_back(op: &str) -> WalletEvent {
        WalletEvent::SendRolledBack {
            mint_url: "https://mint.example.com".into(),
            operation_id: op.into(),
        }
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.on(None, move |_| seen.lock().unwrap().push(tag));
        }
        bus.emit(rolled_back("op-1"));

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_filter_once_and_off() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));

        let c = count.clone();
        bus.once(Some(EventKind::SendRolledBack), move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let c = count.clone();
        let id = bus.on(Some(EventKind::ProofsSaved), move |_| {
            c.fetch_add(100, Ordering::SeqCst);
        });

        bus.emit(rolled_back("op-1"));
        bus.emit(rolled_back("op-2"));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_handler_may_subscribe_during_emit() {
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.on(None, move |_| {
            inner.on(None, |_| {});
        });
        bus.emit(rolled_back("op-1"));
        assert_eq!(bus.subscriber_count(), 2);
    }
}
