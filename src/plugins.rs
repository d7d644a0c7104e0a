//! Wallet plugins
//!
//! Host extensions that run once when the manager initializes, after recovery
//! and before the watchers start. A plugin error aborts `init`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::WalletResult;
use crate::events::EventBus;
use crate::operations::{MeltEngine, SendEngine};
use crate::services::{
    HistoryService, KeyRingService, MintService, ProofService, QuoteService, WalletService,
};

/// Handles given to plugins on init
#[derive(Clone)]
pub struct PluginContext {
    pub events: Arc<EventBus>,
    pub mints: Arc<MintService>,
    pub proofs: Arc<ProofService>,
    pub quotes: Arc<QuoteService>,
    pub wallet: Arc<WalletService>,
    pub keyring: Arc<KeyRingService>,
    pub history: Arc<HistoryService>,
    pub send: Arc<SendEngine>,
    pub melt: Arc<MeltEngine>,
}

#[async_trait]
pub trait WalletPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn on_init(&self, ctx: PluginContext) -> WalletResult<()>;
}
