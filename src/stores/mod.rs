//! Wallet repositories
//!
//! Typed persistence contracts for every wallet entity plus the transaction
//! scope used to group multi-entity writes into one atomic unit.
//!
//! A scope is identified by a `TxContext`. Passing the context of an open scope
//! to `RepositoryProvider::begin` rolls the new scope up into the open one
//! instead of queueing behind it, so service methods that open their own
//! transaction compose when called from inside a caller's transaction.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::WalletResult;
use crate::types::{
    HistoryEntry, Keypair, Keyset, MeltOperation, MeltQuote, MeltQuoteState, MeltState, Mint,
    MintQuote, MintQuoteState, ProofData, ProofState, SendOperation, SendState,
};

pub use memory::MemoryRepositoryProvider;

// =============================================================================
// Repository Contracts
// =============================================================================

#[async_trait]
pub trait MintRepository: Send + Sync {
    async fn get_mint(&self, mint_url: &str) -> WalletResult<Option<Mint>>;
    async fn get_mints(&self) -> WalletResult<Vec<Mint>>;
    async fn save_mint(&self, mint: Mint) -> WalletResult<()>;
    async fn remove_mint(&self, mint_url: &str) -> WalletResult<()>;
}

#[async_trait]
pub trait KeysetRepository: Send + Sync {
    async fn get_keyset(&self, keyset_id: &str) -> WalletResult<Option<Keyset>>;
    async fn get_keysets_by_mint(&self, mint_url: &str) -> WalletResult<Vec<Keyset>>;
    /// Insert or update; an existing counter is never lowered
    async fn save_keyset(&self, keyset: Keyset) -> WalletResult<()>;
    async fn remove_keyset(&self, keyset_id: &str) -> WalletResult<()>;
    /// Advance the output counter by `count`, returning the value before the increment
    async fn increment_counter(&self, keyset_id: &str, count: u32) -> WalletResult<u32>;
}

#[async_trait]
pub trait KeyRingRepository: Send + Sync {
    async fn get_key_pair(&self, public_key: &str) -> WalletResult<Option<Keypair>>;
    async fn get_all_key_pairs(&self) -> WalletResult<Vec<Keypair>>;
    /// Keypair with the highest derivation index
    async fn get_latest_key_pair(&self) -> WalletResult<Option<Keypair>>;
    async fn save_key_pair(&self, keypair: Keypair) -> WalletResult<()>;
    async fn remove_key_pair(&self, public_key: &str) -> WalletResult<()>;
}

#[async_trait]
pub trait ProofRepository: Send + Sync {
    /// Insert a batch; any secret already stored for the mint fails the whole batch
    async fn save_proofs(&self, proofs: Vec<ProofData>) -> WalletResult<()>;
    async fn get_proofs(&self, mint_url: &str) -> WalletResult<Vec<ProofData>>;
    async fn get_proofs_by_secrets(
        &self,
        mint_url: &str,
        secrets: &[String],
    ) -> WalletResult<Vec<ProofData>>;
    /// Proofs in `state`, across all mints when `mint_url` is `None`
    async fn get_proofs_by_state(
        &self,
        mint_url: Option<&str>,
        state: ProofState,
    ) -> WalletResult<Vec<ProofData>>;
    async fn get_proofs_by_operation(&self, operation_id: &str) -> WalletResult<Vec<ProofData>>;
    async fn set_proof_state(
        &self,
        mint_url: &str,
        secrets: &[String],
        state: ProofState,
    ) -> WalletResult<()>;
    async fn set_reservation(
        &self,
        mint_url: &str,
        secrets: &[String],
        operation_id: Option<&str>,
    ) -> WalletResult<()>;
    async fn delete_proofs(&self, mint_url: &str, secrets: &[String]) -> WalletResult<()>;
    /// Returns the number of proofs removed
    async fn delete_proofs_by_keyset(&self, keyset_id: &str) -> WalletResult<usize>;
}

#[async_trait]
pub trait MintQuoteRepository: Send + Sync {
    async fn get_mint_quote(&self, quote_id: &str) -> WalletResult<Option<MintQuote>>;
    async fn get_mint_quotes_by_state(&self, states: &[MintQuoteState]) -> WalletResult<Vec<MintQuote>>;
    async fn save_mint_quote(&self, quote: MintQuote) -> WalletResult<()>;
}

#[async_trait]
pub trait MeltQuoteRepository: Send + Sync {
    async fn get_melt_quote(&self, quote_id: &str) -> WalletResult<Option<MeltQuote>>;
    async fn get_melt_quotes_by_state(&self, states: &[MeltQuoteState]) -> WalletResult<Vec<MeltQuote>>;
    async fn save_melt_quote(&self, quote: MeltQuote) -> WalletResult<()>;
}

#[async_trait]
pub trait SendOperationRepository: Send + Sync {
    async fn get_send_operation(&self, operation_id: &str) -> WalletResult<Option<SendOperation>>;
    async fn get_send_operations_by_state(&self, states: &[SendState]) -> WalletResult<Vec<SendOperation>>;
    async fn save_send_operation(&self, operation: SendOperation) -> WalletResult<()>;
}

#[async_trait]
pub trait MeltOperationRepository: Send + Sync {
    async fn get_melt_operation(&self, operation_id: &str) -> WalletResult<Option<MeltOperation>>;
    /// Most recent operation for a quote
    async fn get_melt_operation_by_quote(&self, quote_id: &str) -> WalletResult<Option<MeltOperation>>;
    async fn get_melt_operations_by_state(&self, states: &[MeltState]) -> WalletResult<Vec<MeltOperation>>;
    async fn save_melt_operation(&self, operation: MeltOperation) -> WalletResult<()>;
}

#[async_trait]
pub trait HistoryRepository: Send + Sync {
    /// Insert or replace by entry id
    async fn save_history_entry(&self, entry: HistoryEntry) -> WalletResult<()>;
    async fn get_history_entry(&self, entry_id: &str) -> WalletResult<Option<HistoryEntry>>;
    /// Newest first
    async fn get_history(&self, offset: usize, limit: usize) -> WalletResult<Vec<HistoryEntry>>;
}

/// Bundle of repositories sharing one storage handle or one transaction scope
#[derive(Clone)]
pub struct Repositories {
    pub mints: Arc<dyn MintRepository>,
    pub keysets: Arc<dyn KeysetRepository>,
    pub keyring: Arc<dyn KeyRingRepository>,
    pub proofs: Arc<dyn ProofRepository>,
    pub mint_quotes: Arc<dyn MintQuoteRepository>,
    pub melt_quotes: Arc<dyn MeltQuoteRepository>,
    pub send_operations: Arc<dyn SendOperationRepository>,
    pub melt_operations: Arc<dyn MeltOperationRepository>,
    pub history: Arc<dyn HistoryRepository>,
}

// =============================================================================
// Transaction Scopes
// =============================================================================

/// Identity of an open transaction scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxContext {
    pub id: u64,
    /// 0 for the outermost scope, +1 per rolled-up scope
    pub depth: u32,
}

impl TxContext {
    pub fn is_nested(&self) -> bool {
        self.depth > 0
    }
}

#[async_trait]
pub trait TransactionScope: Send + Sync {
    fn context(&self) -> &TxContext;

    /// Repositories whose reads and writes participate in this scope
    fn repositories(&self) -> &Repositories;

    /// Commit the unit; a rolled-up scope commits with its outermost scope
    async fn commit(self: Box<Self>) -> WalletResult<()>;

    /// Discard the unit; a rolled-up scope marks the whole unit rollback-only
    async fn rollback(self: Box<Self>) -> WalletResult<()>;
}

#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    /// Repositories outside any scope; each write is its own unit
    fn repositories(&self) -> Repositories;

    /// Open a scope, rolling up into `parent` when it is the open scope
    async fn begin(&self, parent: Option<&TxContext>) -> WalletResult<Box<dyn TransactionScope>>;
}

/// Commit on `Ok`, roll back on `Err`, and hand the result through
pub async fn finish<T>(
    tx: Box<dyn TransactionScope>,
    result: WalletResult<T>,
) -> WalletResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            let ctx = tx.context().clone();
            if let Err(rollback_err) = tx.rollback().await {
                log::error!("Rollback of transaction {} failed: {}", ctx.id, rollback_err);
            }
            Err(e)
        }
    }
}
