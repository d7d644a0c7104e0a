//! Wallet Manager
//!
//! Single entry point for host applications. The builder wires the services,
//! the operation engines and the watchers around one repository provider, one
//! mint connector and one seed source; the manager then exposes the wallet API
//! and owns the background lifecycle.
//!
//! ```ignore
//! let manager = WalletManagerBuilder::new(provider, connector, seed)
//!     .config(WalletConfig::from_json_str(&json)?)
//!     .build()?;
//! manager.init().await?;
//! manager.add_mint("https://mint.example.com", true).await?;
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::WalletConfig;
use crate::errors::WalletResult;
use crate::events::{EventBus, EventKind, SubscriptionId, WalletEvent};
use crate::mint_client::{MintConnector, SeedProvider};
use crate::operations::{
    Bolt11Handler, MeltEngine, MeltHandlerRegistry, MeltMethodHandler, MeltPendingDecision,
    MeltResult, RecoveryReport, SendEngine,
};
use crate::plugins::{PluginContext, WalletPlugin};
use crate::services::{
    GenerateKeyOptions, GeneratedKeyPair, HistoryService, KeyRingService, MintService,
    ProofService, QuoteService, ReceiveResult, WalletService,
};
use crate::stores::RepositoryProvider;
use crate::types::{
    CashuProof, HistoryEntry, Keypair, MeltOperation, MeltQuote, Mint, MintBalance, MintQuote,
    PaymentMethod, ProofData, SendOperation,
};
use crate::watchers::{MintQuoteProcessor, MintQuoteWatcher, ProofStateWatcher};

// =============================================================================
// Builder
// =============================================================================

pub struct WalletManagerBuilder {
    provider: Arc<dyn RepositoryProvider>,
    connector: Arc<dyn MintConnector>,
    seed: Arc<dyn SeedProvider>,
    config: WalletConfig,
    logger: Option<Box<dyn log::Log>>,
    plugins: Vec<Arc<dyn WalletPlugin>>,
    melt_handlers: Vec<Arc<dyn MeltMethodHandler>>,
}

impl WalletManagerBuilder {
    pub fn new(
        provider: Arc<dyn RepositoryProvider>,
        connector: Arc<dyn MintConnector>,
        seed: Arc<dyn SeedProvider>,
    ) -> Self {
        Self {
            provider,
            connector,
            seed,
            config: WalletConfig::default(),
            logger: None,
            plugins: Vec::new(),
            melt_handlers: Vec::new(),
        }
    }

    pub fn config(mut self, config: WalletConfig) -> Self {
        self.config = config;
        self
    }

    /// Install a logger for the `log` facade when the manager is built
    pub fn logger(mut self, logger: Box<dyn log::Log>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn plugin(mut self, plugin: Arc<dyn WalletPlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Register a payment rail; replaces the built-in BOLT11 handler when it
    /// handles the same method
    pub fn melt_handler(mut self, handler: Arc<dyn MeltMethodHandler>) -> Self {
        self.melt_handlers.push(handler);
        self
    }

    pub fn build(self) -> WalletResult<WalletManager> {
        self.config.validate()?;

        if let Some(logger) = self.logger {
            if log::set_boxed_logger(logger).is_err() {
                log::warn!("A logger is already installed, keeping it");
            }
        }
        if let Some(level) = self.config.level_filter()? {
            log::set_max_level(level);
        }

        let mut handlers = self.melt_handlers;
        if !handlers.iter().any(|h| h.method() == PaymentMethod::Bolt11) {
            handlers.push(Arc::new(Bolt11Handler::new(self.connector.clone())));
        }
        let registry = Arc::new(MeltHandlerRegistry::new(handlers, &self.config.melt_methods)?);

        let config = Arc::new(self.config);
        let repos = self.provider;
        let connector = self.connector;
        let events = Arc::new(EventBus::new());

        let proofs = Arc::new(ProofService::new(
            repos.clone(),
            connector.clone(),
            events.clone(),
            config.clone(),
        ));
        let mints = Arc::new(MintService::new(
            repos.clone(),
            connector.clone(),
            events.clone(),
            proofs.clone(),
            config.clone(),
        ));
        let history = Arc::new(HistoryService::new(repos.clone(), events.clone()));
        let keyring = Arc::new(KeyRingService::new(repos.clone(), self.seed));
        let quotes = Arc::new(QuoteService::new(
            repos.clone(),
            connector.clone(),
            events.clone(),
            mints.clone(),
            proofs.clone(),
            history.clone(),
            config.clone(),
        ));
        let wallet = Arc::new(WalletService::new(
            repos.clone(),
            connector.clone(),
            mints.clone(),
            proofs.clone(),
            keyring.clone(),
            history.clone(),
            config.clone(),
        ));
        let send = Arc::new(SendEngine::new(
            repos.clone(),
            connector.clone(),
            events.clone(),
            mints.clone(),
            proofs.clone(),
            history.clone(),
            config.clone(),
        ));
        let melt = Arc::new(MeltEngine::new(
            repos,
            connector,
            events.clone(),
            mints.clone(),
            proofs.clone(),
            history.clone(),
            registry,
            config.clone(),
        ));

        let mint_quote_watcher = MintQuoteWatcher::new(
            quotes.clone(),
            events.clone(),
            config.mint_quote_watcher.clone(),
        );
        let mint_quote_processor = MintQuoteProcessor::new(
            quotes.clone(),
            events.clone(),
            config.mint_quote_processor.clone(),
        );
        let proof_state_watcher = ProofStateWatcher::new(
            proofs.clone(),
            send.clone(),
            melt.clone(),
            config.proof_state_watcher.clone(),
        );

        Ok(WalletManager {
            config,
            events,
            mints,
            proofs,
            quotes,
            wallet,
            keyring,
            history,
            send,
            melt,
            mint_quote_watcher,
            mint_quote_processor,
            proof_state_watcher,
            plugins: self.plugins,
            initialized: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        })
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Recovery outcome of `init`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitReport {
    pub sends: Option<RecoveryReport>,
    pub melts: Option<RecoveryReport>,
}

pub struct WalletManager {
    config: Arc<WalletConfig>,
    events: Arc<EventBus>,
    mints: Arc<MintService>,
    proofs: Arc<ProofService>,
    quotes: Arc<QuoteService>,
    wallet: Arc<WalletService>,
    keyring: Arc<KeyRingService>,
    history: Arc<HistoryService>,
    send: Arc<SendEngine>,
    melt: Arc<MeltEngine>,
    mint_quote_watcher: MintQuoteWatcher,
    mint_quote_processor: MintQuoteProcessor,
    proof_state_watcher: ProofStateWatcher,
    plugins: Vec<Arc<dyn WalletPlugin>>,
    initialized: AtomicBool,
    paused: AtomicBool,
}

impl WalletManager {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Recover interrupted operations, run plugins and start the watchers
    ///
    /// Calling it again is a no-op.
    pub async fn init(&self) -> WalletResult<InitReport> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(InitReport::default());
        }
        let result = self.run_init().await;
        if result.is_err() {
            self.initialized.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn run_init(&self) -> WalletResult<InitReport> {
        let mut report = InitReport::default();
        if self.config.recover_on_init {
            match self.send.recover_pending_operations().await {
                Ok(r) => report.sends = Some(r),
                Err(e) => log::warn!("Send recovery failed: {}", e),
            }
            match self.melt.recover_pending_melts().await {
                Ok(r) => report.melts = Some(r),
                Err(e) => log::warn!("Melt recovery failed: {}", e),
            }
        }

        for plugin in &self.plugins {
            log::info!("Initializing plugin {}", plugin.name());
            plugin.on_init(self.plugin_context()).await.map_err(|e| {
                log::error!("Plugin {} failed to initialize: {}", plugin.name(), e);
                e
            })?;
        }

        if !self.paused.load(Ordering::SeqCst) {
            self.start_watchers().await?;
        }
        log::info!("Wallet manager initialized");
        Ok(report)
    }

    /// Stop the watchers and drop every event subscription
    pub fn dispose(&self) {
        self.stop_watchers();
        self.events.clear();
        self.initialized.store(false, Ordering::SeqCst);
        log::info!("Wallet manager disposed");
    }

    /// Stop background polling until `resume_subscriptions`
    pub fn pause_subscriptions(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            self.stop_watchers();
            log::info!("Wallet subscriptions paused");
        }
    }

    pub async fn resume_subscriptions(&self) -> WalletResult<()> {
        if !self.paused.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("Wallet subscriptions resumed");
        if self.initialized.load(Ordering::SeqCst) {
            self.start_watchers().await?;
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn start_watchers(&self) -> WalletResult<()> {
        self.mint_quote_processor.start().await?;
        self.mint_quote_watcher.start().await?;
        self.proof_state_watcher.start().await?;
        Ok(())
    }

    fn stop_watchers(&self) {
        self.mint_quote_watcher.stop();
        self.mint_quote_processor.stop();
        self.proof_state_watcher.stop();
    }

    fn plugin_context(&self) -> PluginContext {
        PluginContext {
            events: self.events.clone(),
            mints: self.mints.clone(),
            proofs: self.proofs.clone(),
            quotes: self.quotes.clone(),
            wallet: self.wallet.clone(),
            keyring: self.keyring.clone(),
            history: self.history.clone(),
            send: self.send.clone(),
            melt: self.melt.clone(),
        }
    }

    // =========================================================================
    // Service access
    // =========================================================================

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn mint_service(&self) -> &Arc<MintService> {
        &self.mints
    }

    pub fn proof_service(&self) -> &Arc<ProofService> {
        &self.proofs
    }

    pub fn keyring(&self) -> &Arc<KeyRingService> {
        &self.keyring
    }

    pub fn send_engine(&self) -> &Arc<SendEngine> {
        &self.send
    }

    pub fn melt_engine(&self) -> &Arc<MeltEngine> {
        &self.melt
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn on<F>(&self, kind: Option<EventKind>, handler: F) -> SubscriptionId
    where
        F: Fn(&WalletEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn once<F>(&self, kind: Option<EventKind>, handler: F) -> SubscriptionId
    where
        F: Fn(&WalletEvent) + Send + Sync + 'static,
    {
        self.events.once(kind, handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.events.off(id)
    }

    // =========================================================================
    // Mints
    // =========================================================================

    pub async fn add_mint(&self, mint_url: &str, trusted: bool) -> WalletResult<Mint> {
        self.mints.add_mint(mint_url, trusted).await
    }

    pub async fn trust_mint(&self, mint_url: &str) -> WalletResult<Mint> {
        self.mints.trust_mint(mint_url).await
    }

    pub async fn untrust_mint(&self, mint_url: &str) -> WalletResult<Mint> {
        self.mints.untrust_mint(mint_url).await
    }

    pub async fn remove_mint(&self, mint_url: &str) -> WalletResult<()> {
        self.mints.remove_mint(mint_url).await
    }

    pub async fn get_mints(&self) -> WalletResult<Vec<Mint>> {
        self.mints.get_mints().await
    }

    pub async fn get_mint_by_url(&self, mint_url: &str) -> WalletResult<Mint> {
        self.mints.get_mint_by_url(mint_url).await
    }

    pub async fn refresh_mint(&self, mint_url: &str) -> WalletResult<Mint> {
        self.mints.refresh_mint(mint_url).await
    }

    // =========================================================================
    // Quotes
    // =========================================================================

    pub async fn create_mint_quote(&self, mint_url: &str, amount: u64) -> WalletResult<MintQuote> {
        self.quotes.create_mint_quote(mint_url, amount).await
    }

    pub async fn check_mint_quote(&self, quote_id: &str) -> WalletResult<MintQuote> {
        self.quotes.check_mint_quote(quote_id).await
    }

    pub async fn redeem_mint_quote(&self, quote_id: &str) -> WalletResult<Vec<ProofData>> {
        self.quotes.redeem_mint_quote(quote_id).await
    }

    pub async fn get_pending_mint_quotes(&self) -> WalletResult<Vec<MintQuote>> {
        self.quotes.get_pending_mint_quotes().await
    }

    pub async fn create_melt_quote(
        &self,
        mint_url: &str,
        method: PaymentMethod,
        request: &str,
    ) -> WalletResult<MeltQuote> {
        self.melt.create_melt_quote(mint_url, method, request).await
    }

    pub async fn pay_melt_quote(&self, mint_url: &str, quote_id: &str) -> WalletResult<MeltResult> {
        self.melt.pay_melt_quote(mint_url, quote_id).await
    }

    pub async fn prepare_melt(&self, mint_url: &str, quote_id: &str) -> WalletResult<MeltOperation> {
        self.melt.prepare_melt(mint_url, quote_id).await
    }

    pub async fn execute_melt_by_quote(&self, quote_id: &str) -> WalletResult<Option<MeltResult>> {
        self.melt.execute_melt_by_quote(quote_id).await
    }

    pub async fn check_pending_melt_by_quote(
        &self,
        quote_id: &str,
    ) -> WalletResult<Option<MeltPendingDecision>> {
        self.melt.check_pending_melt_by_quote(quote_id).await
    }

    pub async fn rollback_melt(&self, operation_id: &str) -> WalletResult<MeltOperation> {
        self.melt.rollback_melt(operation_id).await
    }

    pub async fn get_melt_operation(&self, operation_id: &str) -> WalletResult<Option<MeltOperation>> {
        self.melt.get_melt_operation(operation_id).await
    }

    // =========================================================================
    // Wallet
    // =========================================================================

    pub async fn get_balance(&self, mint_url: &str) -> WalletResult<MintBalance> {
        self.wallet.get_balance(mint_url).await
    }

    pub async fn get_balances(&self) -> WalletResult<BTreeMap<String, MintBalance>> {
        self.wallet.get_balances().await
    }

    /// Send `amount` and return the encoded token
    pub async fn send(&self, mint_url: &str, amount: u64) -> WalletResult<(SendOperation, String)> {
        self.send.send(mint_url, amount).await
    }

    pub async fn receive(&self, token: &str) -> WalletResult<ReceiveResult> {
        self.wallet.receive(token).await
    }

    pub async fn sweep(&self, mint_url: &str, seed: &[u8]) -> WalletResult<Option<ReceiveResult>> {
        self.wallet.sweep(mint_url, seed).await
    }

    // =========================================================================
    // Send operations
    // =========================================================================

    pub async fn prepare_send(&self, mint_url: &str, amount: u64) -> WalletResult<SendOperation> {
        self.send.prepare_send(mint_url, amount).await
    }

    pub async fn execute_prepared_send(
        &self,
        operation_id: &str,
    ) -> WalletResult<(SendOperation, String)> {
        self.send.execute_prepared_send(operation_id).await
    }

    pub async fn rollback_send(&self, operation_id: &str) -> WalletResult<SendOperation> {
        self.send.rollback(operation_id).await
    }

    pub async fn finalize_send(&self, operation_id: &str) -> WalletResult<SendOperation> {
        self.send.finalize(operation_id).await
    }

    pub async fn get_send_operation(&self, operation_id: &str) -> WalletResult<Option<SendOperation>> {
        self.send.get_operation(operation_id).await
    }

    pub async fn get_pending_operations(&self) -> WalletResult<Vec<SendOperation>> {
        self.send.get_pending_operations().await
    }

    /// Resolve interrupted sends and melts
    pub async fn recover_pending_operations(&self) -> WalletResult<InitReport> {
        Ok(InitReport {
            sends: Some(self.send.recover_pending_operations().await?),
            melts: Some(self.melt.recover_pending_melts().await?),
        })
    }

    // =========================================================================
    // Keyring
    // =========================================================================

    pub async fn generate_key_pair(&self, dump_secret_key: bool) -> WalletResult<GeneratedKeyPair> {
        self.keyring
            .generate_new_key_pair(GenerateKeyOptions { dump_secret_key })
            .await
    }

    pub async fn add_key_pair(&self, secret_key: &[u8]) -> WalletResult<String> {
        self.keyring.add_key_pair(secret_key).await
    }

    /// `None` when the keyring holds no key for `public_key`
    pub async fn get_key_pair(&self, public_key: &str) -> WalletResult<Option<Keypair>> {
        self.keyring.get_key_pair(public_key).await
    }

    pub async fn get_latest_key_pair(&self) -> WalletResult<Option<Keypair>> {
        self.keyring.get_latest_key_pair().await
    }

    pub async fn get_all_key_pairs(&self) -> WalletResult<Vec<Keypair>> {
        self.keyring.get_all_key_pairs().await
    }

    pub async fn remove_key_pair(&self, public_key: &str) -> WalletResult<()> {
        self.keyring.remove_key_pair(public_key).await
    }

    /// Attach a P2PK witness signed by a held key
    pub async fn sign_proof(&self, proof: &CashuProof, public_key: &str) -> WalletResult<CashuProof> {
        self.keyring.sign_proof(proof, public_key).await
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Page of history entries, newest first; `limit` 0 uses the default page size
    pub async fn get_history(&self, offset: usize, limit: usize) -> WalletResult<Vec<HistoryEntry>> {
        self.history.get_history(offset, limit).await
    }
}

impl Drop for WalletManager {
    fn drop(&mut self) {
        self.stop_watchers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::WalletError;
    use crate::stores::MemoryRepositoryProvider;
    use crate::test_utils::{FakeMint, FixedSeed, MeltOutcome, TEST_MINT};
    use crate::types::{HistoryKind, MeltQuoteState, MeltState, SendState};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn manager(mint: &Arc<FakeMint>, seed: &[u8], config: WalletConfig) -> WalletManager {
        manager_on(Arc::new(MemoryRepositoryProvider::new()), mint, seed, config)
    }

    fn manager_on(
        provider: Arc<dyn RepositoryProvider>,
        mint: &Arc<FakeMint>,
        seed: &[u8],
        config: WalletConfig,
    ) -> WalletManager {
        WalletManagerBuilder::new(
            provider,
            mint.client(seed),
            Arc::new(FixedSeed::new(seed)),
        )
        .config(config)
        .build()
        .unwrap()
    }

    async fn spendable(manager: &WalletManager) -> u64 {
        manager.get_balance(TEST_MINT).await.unwrap().spendable
    }

    #[tokio::test]
    async fn test_wallet_lifecycle_end_to_end() {
        let mint = FakeMint::new(0);
        let alice = manager(&mint, b"alice seed bytes", WalletConfig::without_watchers());
        let bob_repos: Arc<dyn RepositoryProvider> = Arc::new(MemoryRepositoryProvider::new());
        let bob = manager_on(
            bob_repos.clone(),
            &mint,
            b"bob seed bytes!!",
            WalletConfig::without_watchers(),
        );
        alice.init().await.unwrap();
        bob.init().await.unwrap();
        alice.add_mint(TEST_MINT, true).await.unwrap();
        bob.add_mint(TEST_MINT, true).await.unwrap();

        // Fund through a mint quote
        let quote = alice.create_mint_quote(TEST_MINT, 200).await.unwrap();
        mint.pay_mint_quote(&quote.quote_id);
        alice.redeem_mint_quote(&quote.quote_id).await.unwrap();
        assert_eq!(spendable(&alice).await, 200);

        // A send that is taken back
        let (op, _token) = alice.send(TEST_MINT, 50).await.unwrap();
        let balance = alice.get_balance(TEST_MINT).await.unwrap();
        assert_eq!((balance.spendable, balance.pending), (150, 50));
        let op = alice.rollback_send(&op.id).await.unwrap();
        assert_eq!(op.state, SendState::RolledBack);
        assert_eq!(spendable(&alice).await, 200);

        // A send that is claimed
        let (op, token) = alice.send(TEST_MINT, 50).await.unwrap();
        let received = bob.receive(&token).await.unwrap();
        assert_eq!(received.amount, 50);
        assert_eq!(spendable(&bob).await, 50);
        let op = alice.finalize_send(&op.id).await.unwrap();
        assert_eq!(op.state, SendState::Finalized);
        assert_eq!(alice.get_balance(TEST_MINT).await.unwrap().total, 150);

        // Melt using the whole fee reserve
        mint.push_melt_outcome(MeltOutcome::Paid { fee_paid: 2 });
        let quote = alice
            .create_melt_quote(TEST_MINT, PaymentMethod::Bolt11, "lnbc100n1invoice")
            .await
            .unwrap();
        let result = alice.pay_melt_quote(TEST_MINT, &quote.quote_id).await.unwrap();
        assert_eq!(result.operation.state, MeltState::Finalized);
        assert_eq!(spendable(&alice).await, 48);

        // Bob stops trusting the mint
        bob.untrust_mint(TEST_MINT).await.unwrap();
        let err = bob
            .create_melt_quote(TEST_MINT, PaymentMethod::Bolt11, "lnbc10n1invoice")
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::UntrustedMint { .. }));
        let stored = bob_repos
            .repositories()
            .melt_quotes
            .get_melt_quotes_by_state(&[
                MeltQuoteState::Unpaid,
                MeltQuoteState::Pending,
                MeltQuoteState::Paid,
            ])
            .await
            .unwrap();
        assert!(stored.is_empty());

        let history = alice.get_history(0, 0).await.unwrap();
        let kinds: Vec<HistoryKind> = history.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&HistoryKind::Mint));
        assert!(kinds.contains(&HistoryKind::Send));
        assert!(kinds.contains(&HistoryKind::Melt));
        assert!(bob
            .get_history(0, 0)
            .await
            .unwrap()
            .iter()
            .any(|e| e.kind == HistoryKind::Receive));
    }

    struct RecordingPlugin {
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl WalletPlugin for RecordingPlugin {
        fn name(&self) -> &str {
            "recording"
        }

        async fn on_init(&self, ctx: PluginContext) -> WalletResult<()> {
            if self.fail {
                return Err(WalletError::Config("plugin refused".into()));
            }
            let seen = self.seen.clone();
            ctx.events.on(Some(EventKind::MintAdded), move |event| {
                if let WalletEvent::MintAdded { mint } = event {
                    seen.lock().unwrap().push(mint.mint_url.clone());
                }
            });
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_plugins_run_on_init() {
        let mint = FakeMint::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let manager = WalletManagerBuilder::new(
            Arc::new(MemoryRepositoryProvider::new()),
            mint.client(b"plugin wallet"),
            Arc::new(FixedSeed::new(b"plugin wallet")),
        )
        .config(WalletConfig::without_watchers())
        .plugin(Arc::new(RecordingPlugin {
            seen: seen.clone(),
            fail: false,
        }))
        .build()
        .unwrap();

        manager.init().await.unwrap();
        manager.init().await.unwrap();
        manager.add_mint(TEST_MINT, false).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![TEST_MINT.to_string()]);
    }

    #[tokio::test]
    async fn test_failing_plugin_aborts_init() {
        let mint = FakeMint::new(0);
        let manager = WalletManagerBuilder::new(
            Arc::new(MemoryRepositoryProvider::new()),
            mint.client(b"failing plugin"),
            Arc::new(FixedSeed::new(b"failing plugin")),
        )
        .config(WalletConfig::without_watchers())
        .plugin(Arc::new(RecordingPlugin {
            seen: Arc::new(Mutex::new(Vec::new())),
            fail: true,
        }))
        .build()
        .unwrap();

        assert!(manager.init().await.is_err());
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn test_key_pair_lookup() {
        let mint = FakeMint::new(0);
        let manager = manager(&mint, b"keyring wallet", WalletConfig::without_watchers());

        let generated = manager.generate_key_pair(false).await.unwrap();
        let found = manager.get_key_pair(&generated.public_key).await.unwrap();
        assert_eq!(found.unwrap().public_key, generated.public_key);

        let unknown = "02".to_string() + &"11".repeat(32);
        assert!(manager.get_key_pair(&unknown).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_melt_handler_is_a_build_error() {
        let mint = FakeMint::new(0);
        let mut config = WalletConfig::without_watchers();
        config.melt_methods = vec![PaymentMethod::Bolt11, PaymentMethod::Bolt12];
        let result = WalletManagerBuilder::new(
            Arc::new(MemoryRepositoryProvider::new()),
            mint.client(b"bolt12 wallet"),
            Arc::new(FixedSeed::new(b"bolt12 wallet")),
        )
        .config(config)
        .build();
        assert!(matches!(result.err(), Some(WalletError::Config(_))));
    }

    #[tokio::test]
    async fn test_pause_before_init_defers_watchers() {
        let mint = FakeMint::new(0);
        let manager = manager(&mint, b"early pause", WalletConfig::default());
        manager.pause_subscriptions();
        manager.pause_subscriptions();
        manager.init().await.unwrap();
        assert!(!manager.proof_state_watcher.is_running());

        manager.resume_subscriptions().await.unwrap();
        assert!(manager.proof_state_watcher.is_running());
        manager.dispose();
    }

    #[tokio::test]
    async fn test_pause_and_resume_watchers() {
        let mint = FakeMint::new(0);
        let manager = manager(&mint, b"pause wallet", WalletConfig::default());
        manager.init().await.unwrap();
        assert!(manager.proof_state_watcher.is_running());

        manager.pause_subscriptions();
        assert!(manager.is_paused());
        assert!(!manager.proof_state_watcher.is_running());
        assert!(!manager.mint_quote_watcher.is_running());

        manager.resume_subscriptions().await.unwrap();
        assert!(manager.proof_state_watcher.is_running());
        assert!(manager.mint_quote_processor.is_running());

        manager.dispose();
        assert!(!manager.proof_state_watcher.is_running());
        assert_eq!(manager.events().subscriber_count(), 0);
    }
}
