//! Cashu wallet core
//!
//! Transactional heart of an ecash wallet: proofs move through reservation and
//! inflight states under repository transactions, sends and melts run as
//! persisted state machines that survive restarts, and a P2PK keyring signs
//! locked proofs. Hosts plug in storage, mint transport and seed material and
//! drive everything through [`WalletManager`].

pub mod config;
pub mod errors;
pub mod events;
pub mod manager;
pub mod mint_client;
pub mod operations;
pub mod plugins;
pub mod services;
pub mod stores;
pub mod token;
pub mod types;
pub mod utils;
pub mod watchers;

#[cfg(test)]
mod test_utils;

pub use config::WalletConfig;
pub use errors::{MintClientError, NutErrorCode, WalletError, WalletResult};
pub use events::{EventBus, EventKind, SubscriptionId, WalletEvent};
pub use manager::{InitReport, WalletManager, WalletManagerBuilder};
pub use mint_client::{MintConnector, SeedProvider};
pub use operations::{MeltMethodHandler, MeltResult, RecoveryReport};
pub use plugins::{PluginContext, WalletPlugin};
pub use stores::{MemoryRepositoryProvider, RepositoryProvider, TransactionScope, TxContext};
pub use token::Token;
pub use types::{
    HistoryEntry, MeltOperation, MeltQuote, MeltState, Mint, MintBalance, MintQuote,
    PaymentMethod, ProofData, ProofState, SendOperation, SendState,
};
