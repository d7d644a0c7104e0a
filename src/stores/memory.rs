//! In-memory wallet database
//!
//! Holds all wallet data in memory without persistence. Used by tests and by
//! hosts that persist elsewhere and only need the wallet for the duration of a
//! session.
//!
//! Transactions work on a snapshot of the committed state. Outermost scopes are
//! serialised through a FIFO queue and swap their snapshot in on commit; scopes
//! rolled up into an open one share its snapshot.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    HistoryRepository, KeyRingRepository, KeysetRepository, MeltOperationRepository,
    MeltQuoteRepository, MintQuoteRepository, MintRepository, ProofRepository, Repositories,
    RepositoryProvider, SendOperationRepository, TransactionScope, TxContext,
};
use crate::errors::{WalletError, WalletResult};
use crate::types::{
    HistoryEntry, Keypair, Keyset, MeltOperation, MeltQuote, MeltQuoteState, MeltState, Mint,
    MintQuote, MintQuoteState, ProofData, ProofState, SendOperation, SendState,
};

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Default)]
struct MemoryState {
    mints: HashMap<String, Mint>,
    keysets: HashMap<String, Keyset>,
    keypairs: HashMap<String, Keypair>,
    /// Keyed by (mint_url, secret)
    proofs: BTreeMap<(String, String), ProofData>,
    mint_quotes: HashMap<String, MintQuote>,
    melt_quotes: HashMap<String, MeltQuote>,
    send_operations: HashMap<String, SendOperation>,
    melt_operations: HashMap<String, MeltOperation>,
    history: Vec<HistoryEntry>,
}

fn proof_key(mint_url: &str, secret: &str) -> (String, String) {
    (mint_url.to_string(), secret.to_string())
}

impl MemoryState {
    fn save_proofs(&mut self, proofs: Vec<ProofData>) -> WalletResult<()> {
        let mut batch = HashSet::new();
        for proof in &proofs {
            let key = proof_key(&proof.mint_url, &proof.secret);
            if self.proofs.contains_key(&key) || !batch.insert(key) {
                return Err(WalletError::DuplicateProof {
                    mint_url: proof.mint_url.clone(),
                    secret: proof.secret.clone(),
                });
            }
        }
        for proof in proofs {
            self.proofs
                .insert(proof_key(&proof.mint_url, &proof.secret), proof);
        }
        Ok(())
    }

    fn proofs_by_secrets(&self, mint_url: &str, secrets: &[String]) -> Vec<ProofData> {
        secrets
            .iter()
            .filter_map(|s| self.proofs.get(&proof_key(mint_url, s)).cloned())
            .collect()
    }

    fn update_proofs<F>(&mut self, mint_url: &str, secrets: &[String], mut update: F)
    where
        F: FnMut(&mut ProofData),
    {
        for secret in secrets {
            if let Some(proof) = self.proofs.get_mut(&proof_key(mint_url, secret)) {
                update(proof);
            }
        }
    }

    fn save_keyset(&mut self, mut keyset: Keyset) {
        if let Some(existing) = self.keysets.get(&keyset.id) {
            keyset.counter = keyset.counter.max(existing.counter);
        }
        self.keysets.insert(keyset.id.clone(), keyset);
    }

    fn increment_counter(&mut self, keyset_id: &str, count: u32) -> WalletResult<u32> {
        let keyset = self
            .keysets
            .get_mut(keyset_id)
            .ok_or_else(|| WalletError::Storage(format!("Unknown keyset: {}", keyset_id)))?;
        let start = keyset.counter;
        keyset.counter = start
            .checked_add(count)
            .ok_or_else(|| WalletError::Storage(format!("Counter overflow for keyset {}", keyset_id)))?;
        Ok(start)
    }

    fn latest_key_pair(&self) -> Option<Keypair> {
        self.keypairs
            .values()
            .filter(|k| k.derivation_index.is_some())
            .max_by_key(|k| k.derivation_index)
            .or_else(|| self.keypairs.values().max_by_key(|k| k.created_at))
            .cloned()
    }

    fn melt_operation_by_quote(&self, quote_id: &str) -> Option<MeltOperation> {
        self.melt_operations
            .values()
            .filter(|op| op.quote_id == quote_id)
            .max_by_key(|op| (!op.state.is_terminal(), op.updated_at, op.created_at))
            .cloned()
    }

    fn save_history_entry(&mut self, entry: HistoryEntry) {
        match self.history.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.history.push(entry),
        }
    }

    fn history_page(&self, offset: usize, limit: usize) -> Vec<HistoryEntry> {
        let mut entries: Vec<&HistoryEntry> = self.history.iter().rev().collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.into_iter().skip(offset).take(limit).cloned().collect()
    }
}

// =============================================================================
// Provider
// =============================================================================

#[derive(Clone)]
struct OpenUnit {
    id: u64,
    working: Arc<Mutex<MemoryState>>,
    rollback_only: Arc<AtomicBool>,
}

struct Inner {
    committed: Mutex<MemoryState>,
    /// FIFO queue of outermost scopes and standalone writes
    queue: Arc<Mutex<()>>,
    open: std::sync::Mutex<Option<OpenUnit>>,
    next_tx_id: AtomicU64,
}

impl Inner {
    fn open_unit(&self) -> Option<OpenUnit> {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_open_unit(&self, unit: Option<OpenUnit>) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = unit;
    }

    fn clear_open_unit(&self, id: u64) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if open.as_ref().map(|u| u.id) == Some(id) {
            *open = None;
        }
    }
}

/// In-memory `RepositoryProvider`
#[derive(Clone)]
pub struct MemoryRepositoryProvider {
    inner: Arc<Inner>,
}

impl Default for MemoryRepositoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepositoryProvider {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                committed: Mutex::new(MemoryState::default()),
                queue: Arc::new(Mutex::new(())),
                open: std::sync::Mutex::new(None),
                next_tx_id: AtomicU64::new(1),
            }),
        }
    }

    fn bundle(target: Target) -> Repositories {
        let repos = Arc::new(MemoryRepos { target });
        Repositories {
            mints: repos.clone(),
            keysets: repos.clone(),
            keyring: repos.clone(),
            proofs: repos.clone(),
            mint_quotes: repos.clone(),
            melt_quotes: repos.clone(),
            send_operations: repos.clone(),
            melt_operations: repos.clone(),
            history: repos,
        }
    }
}

#[async_trait]
impl RepositoryProvider for MemoryRepositoryProvider {
    fn repositories(&self) -> Repositories {
        Self::bundle(Target::Direct(self.inner.clone()))
    }

    async fn begin(&self, parent: Option<&TxContext>) -> WalletResult<Box<dyn TransactionScope>> {
        if let Some(parent) = parent {
            match self.inner.open_unit() {
                Some(unit) if unit.id == parent.id => {
                    let ctx = TxContext {
                        id: unit.id,
                        depth: parent.depth + 1,
                    };
                    log::trace!("Rolling up into transaction {} at depth {}", ctx.id, ctx.depth);
                    return Ok(Box::new(MemoryScope {
                        inner: self.inner.clone(),
                        repos: Self::bundle(Target::Unit(unit.working.clone())),
                        ctx,
                        unit,
                        guard: None,
                        finished: false,
                    }));
                }
                _ => {
                    log::warn!(
                        "Parent transaction {} is not open, starting a new transaction",
                        parent.id
                    );
                }
            }
        }

        let guard = self.inner.queue.clone().lock_owned().await;
        let snapshot = self.inner.committed.lock().await.clone();
        let id = self.inner.next_tx_id.fetch_add(1, Ordering::Relaxed);
        let unit = OpenUnit {
            id,
            working: Arc::new(Mutex::new(snapshot)),
            rollback_only: Arc::new(AtomicBool::new(false)),
        };
        self.inner.set_open_unit(Some(unit.clone()));
        log::trace!("Began transaction {}", id);

        Ok(Box::new(MemoryScope {
            inner: self.inner.clone(),
            repos: Self::bundle(Target::Unit(unit.working.clone())),
            ctx: TxContext { id, depth: 0 },
            unit,
            guard: Some(guard),
            finished: false,
        }))
    }
}

// =============================================================================
// Scope
// =============================================================================

struct MemoryScope {
    inner: Arc<Inner>,
    ctx: TxContext,
    repos: Repositories,
    unit: OpenUnit,
    /// Held by the outermost scope only
    guard: Option<OwnedMutexGuard<()>>,
    finished: bool,
}

impl MemoryScope {
    fn is_outermost(&self) -> bool {
        self.guard.is_some()
    }

    fn close(&mut self) {
        self.finished = true;
        self.inner.clear_open_unit(self.unit.id);
        self.guard = None;
    }
}

#[async_trait]
impl TransactionScope for MemoryScope {
    fn context(&self) -> &TxContext {
        &self.ctx
    }

    fn repositories(&self) -> &Repositories {
        &self.repos
    }

    async fn commit(self: Box<Self>) -> WalletResult<()> {
        let mut scope = self;
        if !scope.is_outermost() {
            scope.finished = true;
            return Ok(());
        }

        if scope.unit.rollback_only.load(Ordering::SeqCst) {
            scope.close();
            return Err(WalletError::Storage(format!(
                "Transaction {} was rolled back by a nested scope",
                scope.ctx.id
            )));
        }

        let state = std::mem::take(&mut *scope.unit.working.lock().await);
        *scope.inner.committed.lock().await = state;
        log::trace!("Committed transaction {}", scope.ctx.id);
        scope.close();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> WalletResult<()> {
        let mut scope = self;
        if !scope.is_outermost() {
            scope.finished = true;
            scope.unit.rollback_only.store(true, Ordering::SeqCst);
            return Ok(());
        }
        log::trace!("Rolled back transaction {}", scope.ctx.id);
        scope.close();
        Ok(())
    }
}

impl Drop for MemoryScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.is_outermost() {
            log::warn!("Transaction {} dropped without commit, rolling back", self.ctx.id);
            self.close();
        } else {
            self.unit.rollback_only.store(true, Ordering::SeqCst);
        }
    }
}

// =============================================================================
// Repositories
// =============================================================================

#[derive(Clone)]
enum Target {
    /// Committed state; each write is its own queued unit
    Direct(Arc<Inner>),
    /// Working copy of an open transaction
    Unit(Arc<Mutex<MemoryState>>),
}

struct MemoryRepos {
    target: Target,
}

impl MemoryRepos {
    async fn read<R, F>(&self, f: F) -> WalletResult<R>
    where
        F: FnOnce(&MemoryState) -> R + Send,
        R: Send,
    {
        match &self.target {
            Target::Direct(inner) => Ok(f(&*inner.committed.lock().await)),
            Target::Unit(working) => Ok(f(&*working.lock().await)),
        }
    }

    async fn write<R, F>(&self, f: F) -> WalletResult<R>
    where
        F: FnOnce(&mut MemoryState) -> WalletResult<R> + Send,
        R: Send,
    {
        match &self.target {
            Target::Direct(inner) => {
                let _queued = inner.queue.lock().await;
                let mut state = inner.committed.lock().await;
                f(&mut state)
            }
            Target::Unit(working) => f(&mut *working.lock().await),
        }
    }
}

#[async_trait]
impl MintRepository for MemoryRepos {
    async fn get_mint(&self, mint_url: &str) -> WalletResult<Option<Mint>> {
        self.read(|s| s.mints.get(mint_url).cloned()).await
    }

    async fn get_mints(&self) -> WalletResult<Vec<Mint>> {
        self.read(|s| {
            let mut mints: Vec<Mint> = s.mints.values().cloned().collect();
            mints.sort_by(|a, b| a.mint_url.cmp(&b.mint_url));
            mints
        })
        .await
    }

    async fn save_mint(&self, mint: Mint) -> WalletResult<()> {
        self.write(move |s| {
            s.mints.insert(mint.mint_url.clone(), mint);
            Ok(())
        })
        .await
    }

    async fn remove_mint(&self, mint_url: &str) -> WalletResult<()> {
        self.write(|s| {
            s.mints.remove(mint_url);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl KeysetRepository for MemoryRepos {
    async fn get_keyset(&self, keyset_id: &str) -> WalletResult<Option<Keyset>> {
        self.read(|s| s.keysets.get(keyset_id).cloned()).await
    }

    async fn get_keysets_by_mint(&self, mint_url: &str) -> WalletResult<Vec<Keyset>> {
        self.read(|s| {
            let mut keysets: Vec<Keyset> = s
                .keysets
                .values()
                .filter(|k| k.mint_url == mint_url)
                .cloned()
                .collect();
            keysets.sort_by(|a, b| a.id.cmp(&b.id));
            keysets
        })
        .await
    }

    async fn save_keyset(&self, keyset: Keyset) -> WalletResult<()> {
        self.write(move |s| {
            s.save_keyset(keyset);
            Ok(())
        })
        .await
    }

    async fn remove_keyset(&self, keyset_id: &str) -> WalletResult<()> {
        self.write(|s| {
            s.keysets.remove(keyset_id);
            Ok(())
        })
        .await
    }

    async fn increment_counter(&self, keyset_id: &str, count: u32) -> WalletResult<u32> {
        self.write(|s| s.increment_counter(keyset_id, count)).await
    }
}

#[async_trait]
impl KeyRingRepository for MemoryRepos {
    async fn get_key_pair(&self, public_key: &str) -> WalletResult<Option<Keypair>> {
        self.read(|s| s.keypairs.get(public_key).cloned()).await
    }

    async fn get_all_key_pairs(&self) -> WalletResult<Vec<Keypair>> {
        self.read(|s| {
            let mut keypairs: Vec<Keypair> = s.keypairs.values().cloned().collect();
            keypairs.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then(a.derivation_index.cmp(&b.derivation_index))
            });
            keypairs
        })
        .await
    }

    async fn get_latest_key_pair(&self) -> WalletResult<Option<Keypair>> {
        self.read(|s| s.latest_key_pair()).await
    }

    async fn save_key_pair(&self, keypair: Keypair) -> WalletResult<()> {
        self.write(move |s| {
            s.keypairs.insert(keypair.public_key.clone(), keypair);
            Ok(())
        })
        .await
    }

    async fn remove_key_pair(&self, public_key: &str) -> WalletResult<()> {
        self.write(|s| {
            s.keypairs.remove(public_key);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ProofRepository for MemoryRepos {
    async fn save_proofs(&self, proofs: Vec<ProofData>) -> WalletResult<()> {
        self.write(move |s| s.save_proofs(proofs)).await
    }

    async fn get_proofs(&self, mint_url: &str) -> WalletResult<Vec<ProofData>> {
        self.read(|s| {
            s.proofs
                .values()
                .filter(|p| p.mint_url == mint_url)
                .cloned()
                .collect()
        })
        .await
    }

    async fn get_proofs_by_secrets(
        &self,
        mint_url: &str,
        secrets: &[String],
    ) -> WalletResult<Vec<ProofData>> {
        self.read(|s| s.proofs_by_secrets(mint_url, secrets)).await
    }

    async fn get_proofs_by_state(
        &self,
        mint_url: Option<&str>,
        state: ProofState,
    ) -> WalletResult<Vec<ProofData>> {
        self.read(|s| {
            s.proofs
                .values()
                .filter(|p| p.state == state)
                .filter(|p| mint_url.map_or(true, |m| p.mint_url == m))
                .cloned()
                .collect()
        })
        .await
    }

    async fn get_proofs_by_operation(&self, operation_id: &str) -> WalletResult<Vec<ProofData>> {
        self.read(|s| {
            s.proofs
                .values()
                .filter(|p| {
                    p.used_by_operation_id.as_deref() == Some(operation_id)
                        || p.created_by_operation_id.as_deref() == Some(operation_id)
                })
                .cloned()
                .collect()
        })
        .await
    }

    async fn set_proof_state(
        &self,
        mint_url: &str,
        secrets: &[String],
        state: ProofState,
    ) -> WalletResult<()> {
        self.write(|s| {
            s.update_proofs(mint_url, secrets, |p| p.state = state);
            Ok(())
        })
        .await
    }

    async fn set_reservation(
        &self,
        mint_url: &str,
        secrets: &[String],
        operation_id: Option<&str>,
    ) -> WalletResult<()> {
        self.write(|s| {
            s.update_proofs(mint_url, secrets, |p| {
                p.used_by_operation_id = operation_id.map(str::to_string)
            });
            Ok(())
        })
        .await
    }

    async fn delete_proofs(&self, mint_url: &str, secrets: &[String]) -> WalletResult<()> {
        self.write(|s| {
            for secret in secrets {
                s.proofs.remove(&proof_key(mint_url, secret));
            }
            Ok(())
        })
        .await
    }

    async fn delete_proofs_by_keyset(&self, keyset_id: &str) -> WalletResult<usize> {
        self.write(|s| {
            let before = s.proofs.len();
            s.proofs.retain(|_, p| p.id != keyset_id);
            Ok(before - s.proofs.len())
        })
        .await
    }
}

#[async_trait]
impl MintQuoteRepository for MemoryRepos {
    async fn get_mint_quote(&self, quote_id: &str) -> WalletResult<Option<MintQuote>> {
        self.read(|s| s.mint_quotes.get(quote_id).cloned()).await
    }

    async fn get_mint_quotes_by_state(&self, states: &[MintQuoteState]) -> WalletResult<Vec<MintQuote>> {
        self.read(|s| {
            let mut quotes: Vec<MintQuote> = s
                .mint_quotes
                .values()
                .filter(|q| states.contains(&q.state))
                .cloned()
                .collect();
            quotes.sort_by_key(|q| q.created_at);
            quotes
        })
        .await
    }

    async fn save_mint_quote(&self, quote: MintQuote) -> WalletResult<()> {
        self.write(move |s| {
            s.mint_quotes.insert(quote.quote_id.clone(), quote);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl MeltQuoteRepository for MemoryRepos {
    async fn get_melt_quote(&self, quote_id: &str) -> WalletResult<Option<MeltQuote>> {
        self.read(|s| s.melt_quotes.get(quote_id).cloned()).await
    }

    async fn get_melt_quotes_by_state(&self, states: &[MeltQuoteState]) -> WalletResult<Vec<MeltQuote>> {
        self.read(|s| {
            let mut quotes: Vec<MeltQuote> = s
                .melt_quotes
                .values()
                .filter(|q| states.contains(&q.state))
                .cloned()
                .collect();
            quotes.sort_by_key(|q| q.created_at);
            quotes
        })
        .await
    }

    async fn save_melt_quote(&self, quote: MeltQuote) -> WalletResult<()> {
        self.write(move |s| {
            s.melt_quotes.insert(quote.quote_id.clone(), quote);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SendOperationRepository for MemoryRepos {
    async fn get_send_operation(&self, operation_id: &str) -> WalletResult<Option<SendOperation>> {
        self.read(|s| s.send_operations.get(operation_id).cloned()).await
    }

    async fn get_send_operations_by_state(&self, states: &[SendState]) -> WalletResult<Vec<SendOperation>> {
        self.read(|s| {
            let mut ops: Vec<SendOperation> = s
                .send_operations
                .values()
                .filter(|op| states.contains(&op.state))
                .cloned()
                .collect();
            ops.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            ops
        })
        .await
    }

    async fn save_send_operation(&self, operation: SendOperation) -> WalletResult<()> {
        self.write(move |s| {
            s.send_operations.insert(operation.id.clone(), operation);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl MeltOperationRepository for MemoryRepos {
    async fn get_melt_operation(&self, operation_id: &str) -> WalletResult<Option<MeltOperation>> {
        self.read(|s| s.melt_operations.get(operation_id).cloned()).await
    }

    async fn get_melt_operation_by_quote(&self, quote_id: &str) -> WalletResult<Option<MeltOperation>> {
        self.read(|s| s.melt_operation_by_quote(quote_id)).await
    }

    async fn get_melt_operations_by_state(&self, states: &[MeltState]) -> WalletResult<Vec<MeltOperation>> {
        self.read(|s| {
            let mut ops: Vec<MeltOperation> = s
                .melt_operations
                .values()
                .filter(|op| states.contains(&op.state))
                .cloned()
                .collect();
            ops.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            ops
        })
        .await
    }

    async fn save_melt_operation(&self, operation: MeltOperation) -> WalletResult<()> {
        self.write(move |s| {
            s.melt_operations.insert(operation.id.clone(), operation);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl HistoryRepository for MemoryRepos {
    async fn save_history_entry(&self, entry: HistoryEntry) -> WalletResult<()> {
        self.write(move |s| {
            s.save_history_entry(entry);
            Ok(())
        })
        .await
    }

    async fn get_history_entry(&self, entry_id: &str) -> WalletResult<Option<HistoryEntry>> {
        self.read(|s| s.history.iter().find(|e| e.id == entry_id).cloned())
            .await
    }

    async fn get_history(&self, offset: usize, limit: usize) -> WalletResult<Vec<HistoryEntry>> {
        self.read(|s| s.history_page(offset, limit)).await
    }
}
