//! Quote Service
//!
//! Mint quotes: request a Lightning invoice, follow its payment and redeem it
//! for proofs exactly once.

use std::sync::Arc;

use crate::config::WalletConfig;
use crate::errors::{WalletError, WalletResult};
use crate::events::{EventBus, WalletEvent};
use crate::mint_client::MintConnector;
use crate::operations::locks::OperationLocks;
use crate::services::history::{self, HistoryService};
use crate::services::mints::MintService;
use crate::services::proofs::ProofService;
use crate::stores::{finish, RepositoryProvider, TxContext};
use crate::types::{
    CashuProof, HistoryEntry, HistoryKind, MintQuote, MintQuoteState, PendingOutputs, ProofData,
    ProofState,
};
use crate::utils::{now_secs, split_amount};

fn quote_state_str(state: MintQuoteState) -> &'static str {
    match state {
        MintQuoteState::Unpaid => "unpaid",
        MintQuoteState::Paid => "paid",
        MintQuoteState::Issued => "issued",
    }
}

pub struct QuoteService {
    repos: Arc<dyn RepositoryProvider>,
    connector: Arc<dyn MintConnector>,
    events: Arc<EventBus>,
    mints: Arc<MintService>,
    proofs: Arc<ProofService>,
    history: Arc<HistoryService>,
    config: Arc<WalletConfig>,
    locks: OperationLocks,
}

impl QuoteService {
    pub fn new(
        repos: Arc<dyn RepositoryProvider>,
        connector: Arc<dyn MintConnector>,
        events: Arc<EventBus>,
        mints: Arc<MintService>,
        proofs: Arc<ProofService>,
        history: Arc<HistoryService>,
        config: Arc<WalletConfig>,
    ) -> Self {
        Self {
            repos,
            connector,
            events,
            mints,
            proofs,
            history,
            config,
            locks: OperationLocks::new(),
        }
    }

    /// Ask a known mint for an invoice of `amount`
    pub async fn create_mint_quote(&self, mint_url: &str, amount: u64) -> WalletResult<MintQuote> {
        if amount == 0 {
            return Err(WalletError::validation("Amount must be greater than zero"));
        }
        let mint = self.mints.get_mint_by_url(mint_url).await?;
        let response = self
            .connector
            .create_mint_quote(&mint.mint_url, amount, &self.config.unit)
            .await?;

        let quote = MintQuote {
            quote_id: response.quote,
            mint_url: mint.mint_url.clone(),
            amount: response.amount,
            unit: self.config.unit.clone(),
            request: response.request,
            state: response.state,
            expiry: response.expiry,
            created_at: now_secs(),
        };
        self.repos
            .repositories()
            .mint_quotes
            .save_mint_quote(quote.clone())
            .await?;

        let mut record = history::entry(
            history::mint_entry_id(&quote.quote_id),
            HistoryKind::Mint,
            &quote.mint_url,
            quote.amount,
            &quote.unit,
            quote_state_str(quote.state),
        );
        record.quote_id = Some(quote.quote_id.clone());
        self.history.record(record, None).await?;

        log::info!(
            "Created mint quote {} for {} {} on {}",
            quote.quote_id,
            quote.amount,
            quote.unit,
            quote.mint_url
        );
        self.events.emit(WalletEvent::MintQuoteCreated {
            mint_url: quote.mint_url.clone(),
            quote: quote.clone(),
        });
        Ok(quote)
    }

    pub async fn get_mint_quote(&self, quote_id: &str) -> WalletResult<Option<MintQuote>> {
        self.repos
            .repositories()
            .mint_quotes
            .get_mint_quote(quote_id)
            .await
    }

    async fn require_quote(&self, quote_id: &str) -> WalletResult<MintQuote> {
        self.get_mint_quote(quote_id)
            .await?
            .ok_or_else(|| WalletError::QuoteNotFound {
                quote_id: quote_id.to_string(),
            })
    }

    /// Quotes not yet redeemed, oldest first
    pub async fn get_pending_mint_quotes(&self) -> WalletResult<Vec<MintQuote>> {
        self.repos
            .repositories()
            .mint_quotes
            .get_mint_quotes_by_state(&[MintQuoteState::Unpaid, MintQuoteState::Paid])
            .await
    }

    /// Refresh a quote's state from the mint
    pub async fn check_mint_quote(&self, quote_id: &str) -> WalletResult<MintQuote> {
        let mut quote = self.require_quote(quote_id).await?;
        if quote.state == MintQuoteState::Issued {
            return Ok(quote);
        }
        let response = self
            .connector
            .check_mint_quote(&quote.mint_url, quote_id)
            .await?;
        if response.state != quote.state {
            self.set_quote_state(&mut quote, response.state).await?;
        }
        Ok(quote)
    }

    async fn set_quote_state(&self, quote: &mut MintQuote, state: MintQuoteState) -> WalletResult<()> {
        log::info!("Mint quote {}: {:?} -> {:?}", quote.quote_id, quote.state, state);
        quote.state = state;
        self.repos
            .repositories()
            .mint_quotes
            .save_mint_quote(quote.clone())
            .await?;
        self.history
            .update_state(
                &history::mint_entry_id(&quote.quote_id),
                quote_state_str(state),
                None,
            )
            .await?;
        self.events.emit(WalletEvent::MintQuoteStateChanged {
            mint_url: quote.mint_url.clone(),
            quote_id: quote.quote_id.clone(),
            state,
        });
        Ok(())
    }

    /// Redeem a paid quote for proofs
    ///
    /// Concurrent calls for the same quote fail with `AlreadyInProgress`; a quote
    /// already issued fails with `Validation`.
    pub async fn redeem_mint_quote(&self, quote_id: &str) -> WalletResult<Vec<ProofData>> {
        let _guard = self.locks.acquire(&history::mint_entry_id(quote_id))?;

        let mut quote = self.require_quote(quote_id).await?;
        match quote.state {
            MintQuoteState::Issued => {
                return Err(WalletError::validation(format!(
                    "Mint quote {} already issued",
                    quote_id
                )));
            }
            MintQuoteState::Unpaid => {
                quote = self.check_mint_quote(quote_id).await?;
                if quote.state == MintQuoteState::Unpaid {
                    return Err(WalletError::validation(format!(
                        "Mint quote {} is not paid",
                        quote_id
                    )));
                }
            }
            MintQuoteState::Paid => {}
        }

        let outputs = self
            .mints
            .prepare_outputs(&quote.mint_url, &split_amount(quote.amount), &[])
            .await?;
        let signed = self.mint_or_restore(&quote, &outputs).await?;

        let now = now_secs();
        let proofs: Vec<ProofData> = signed
            .into_iter()
            .map(|p| ProofData::from_cashu(&quote.mint_url, p, None, now))
            .collect();

        quote.state = MintQuoteState::Issued;
        let mut record = history::entry(
            history::mint_entry_id(quote_id),
            HistoryKind::Mint,
            &quote.mint_url,
            quote.amount,
            &quote.unit,
            quote_state_str(MintQuoteState::Issued),
        );
        record.quote_id = Some(quote_id.to_string());

        let tx = self.repos.begin(None).await?;
        let result = self
            .store_redeemed(tx.context(), &quote, proofs.clone(), record)
            .await;
        let record = finish(tx, result).await?;

        log::info!(
            "Redeemed mint quote {} for {} {}",
            quote_id,
            quote.amount,
            quote.unit
        );
        self.proofs.emit_saved(
            &quote.mint_url,
            proofs
                .iter()
                .map(|p| (p.secret.clone(), ProofState::Ready))
                .collect(),
        );
        self.events.emit(WalletEvent::MintQuoteStateChanged {
            mint_url: quote.mint_url.clone(),
            quote_id: quote_id.to_string(),
            state: MintQuoteState::Issued,
        });
        self.events.emit(WalletEvent::MintQuoteRedeemed {
            mint_url: quote.mint_url.clone(),
            quote_id: quote_id.to_string(),
            amount: quote.amount,
        });
        self.history.notify(&record);
        Ok(proofs)
    }

    async fn store_redeemed(
        &self,
        ctx: &TxContext,
        quote: &MintQuote,
        proofs: Vec<ProofData>,
        record: HistoryEntry,
    ) -> WalletResult<HistoryEntry> {
        self.proofs
            .save_proofs(&quote.mint_url, proofs, Some(ctx))
            .await?;
        let tx = self.repos.begin(Some(ctx)).await?;
        let saved = tx
            .repositories()
            .mint_quotes
            .save_mint_quote(quote.clone())
            .await;
        finish(tx, saved).await?;
        self.history.record(record, Some(ctx)).await
    }

    /// Mint the outputs; if the response is lost, recover the signatures
    async fn mint_or_restore(
        &self,
        quote: &MintQuote,
        outputs: &PendingOutputs,
    ) -> WalletResult<Vec<CashuProof>> {
        match self
            .connector
            .mint(&quote.mint_url, &quote.quote_id, &outputs.primary)
            .await
        {
            Ok(proofs) => Ok(proofs),
            Err(e) => {
                log::warn!("Mint of quote {} failed: {}, trying restore", quote.quote_id, e);
                let restored = self
                    .connector
                    .restore(&quote.mint_url, &outputs.primary)
                    .await?;
                if !restored.is_empty() && restored.iter().all(Option::is_some) {
                    Ok(restored.into_iter().flatten().collect())
                } else {
                    Err(e.into())
                }
            }
        }
    }
}
