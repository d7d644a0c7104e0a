//! Melt Operation Engine
//!
//! Pays out ecash through a payment rail, typically a Lightning invoice. The
//! state spine matches sends; what is specific to a rail lives behind
//! `MeltMethodHandler` implementations registered by the host.
//!
//! ```text
//! init -> prepared -> executing -> pending -> finalized
//!                         |   \------------> finalized
//!                         +--> failed
//! prepared | executing | pending | failed -> rolled_back
//! ```
//!
//! A failed payment releases its inputs. Inputs are only marked spent once the
//! mint reports the payment as paid.

mod bolt11;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

pub use bolt11::Bolt11Handler;

use crate::config::WalletConfig;
use crate::errors::{MintClientError, NutErrorCode, WalletError, WalletResult};
use crate::events::{EventBus, WalletEvent};
use crate::mint_client::{MeltQuoteResponse, MintConnector};
use crate::operations::locks::{OperationLocks, RecoveryLock};
use crate::operations::RecoveryReport;
use crate::services::history::{self, HistoryService};
use crate::services::mints::MintService;
use crate::services::proofs::ProofService;
use crate::stores::{finish, RepositoryProvider, TxContext};
use crate::types::{
    sum_amounts, BlindedOutput, CashuProof, HistoryEntry, HistoryKind, MeltOperation, MeltQuote,
    MeltQuoteState, MeltState, MintProofState, PaymentMethod, PendingOutputs, ProofData,
    ProofState,
};
use crate::utils::{calculate_input_fee, calculate_proof_fee, now_secs, split_amount};

// =============================================================================
// Method Handlers
// =============================================================================

/// Outcome of submitting or re-checking a melt
#[derive(Debug, Clone, PartialEq)]
pub enum MeltExecution {
    Paid {
        /// Signatures on the blank change outputs
        change: Vec<CashuProof>,
        preimage: Option<String>,
    },
    Pending,
    Failed {
        reason: String,
    },
}

/// Payment rail behind a melt
#[async_trait]
pub trait MeltMethodHandler: Send + Sync {
    fn method(&self) -> PaymentMethod;

    /// Reject quotes this rail cannot pay
    fn validate_quote(&self, quote: &MeltQuote) -> WalletResult<()>;

    /// Rail specific data stored on the operation when it is prepared
    fn method_data(&self, _quote: &MeltQuote) -> serde_json::Value {
        serde_json::Value::Null
    }

    async fn request_quote(&self, mint_url: &str, request: &str) -> WalletResult<MeltQuoteResponse>;

    async fn execute(
        &self,
        op: &MeltOperation,
        quote: &MeltQuote,
        inputs: &[CashuProof],
        change_outputs: &[BlindedOutput],
    ) -> WalletResult<MeltExecution>;

    async fn check_pending(&self, op: &MeltOperation, quote: &MeltQuote) -> WalletResult<MeltExecution>;
}

/// Handlers by payment method
pub struct MeltHandlerRegistry {
    handlers: HashMap<PaymentMethod, Arc<dyn MeltMethodHandler>>,
}

impl MeltHandlerRegistry {
    /// Every method in `required` must have a handler
    pub fn new(
        handlers: Vec<Arc<dyn MeltMethodHandler>>,
        required: &[PaymentMethod],
    ) -> WalletResult<Self> {
        let handlers: HashMap<PaymentMethod, Arc<dyn MeltMethodHandler>> =
            handlers.into_iter().map(|h| (h.method(), h)).collect();
        if let Some(missing) = required.iter().find(|m| !handlers.contains_key(m)) {
            return Err(WalletError::Config(format!(
                "No melt handler registered for {}",
                missing
            )));
        }
        Ok(Self { handlers })
    }

    pub fn get(&self, method: PaymentMethod) -> WalletResult<Arc<dyn MeltMethodHandler>> {
        self.handlers
            .get(&method)
            .cloned()
            .ok_or_else(|| WalletError::UnsupportedPaymentMethod(method.to_string()))
    }

    pub fn methods(&self) -> Vec<PaymentMethod> {
        let mut methods: Vec<PaymentMethod> = self.handlers.keys().copied().collect();
        methods.sort();
        methods
    }
}

// =============================================================================
// Results
// =============================================================================

/// What `check_pending_melt_by_quote` decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MeltPendingDecision {
    StayPending,
    Finalize,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeltResult {
    pub operation: MeltOperation,
    pub quote: MeltQuote,
    /// Change returned by the mint, stored as ready proofs
    pub change: Vec<ProofData>,
}

impl MeltResult {
    pub fn is_paid(&self) -> bool {
        self.operation.state == MeltState::Finalized
    }

    pub fn is_pending(&self) -> bool {
        self.operation.state == MeltState::Pending
    }
}

// =============================================================================
// Helpers
// =============================================================================

const NON_TERMINAL: [MeltState; 3] = [MeltState::Prepared, MeltState::Executing, MeltState::Pending];

fn transition(op: &mut MeltOperation, next: MeltState) -> WalletResult<()> {
    if !op.state.can_transition_to(next) {
        return Err(WalletError::InvalidState {
            operation_id: op.id.clone(),
            expected: format!("state that can move to {}", next),
            actual: op.state.to_string(),
        });
    }
    log::debug!("Melt {}: {} -> {}", op.id, op.state, next);
    op.state = next;
    op.updated_at = now_secs();
    Ok(())
}

fn quote_state_str(state: MeltQuoteState) -> &'static str {
    match state {
        MeltQuoteState::Unpaid => "unpaid",
        MeltQuoteState::Pending => "pending",
        MeltQuoteState::Paid => "paid",
    }
}

/// Blank outputs needed to receive up to `overpaid` as change (NUT-08)
pub fn blank_output_count(overpaid: u64) -> usize {
    if overpaid == 0 {
        return 0;
    }
    let ceil_log2 = 64 - (overpaid - 1).leading_zeros();
    ceil_log2.max(1) as usize
}

/// Amount whose power-of-two split also pays its own input fee
fn self_funding_target(base: u64, fee_ppk: u64) -> u64 {
    let mut target = base;
    for _ in 0..8 {
        let next = base.saturating_add(calculate_proof_fee(split_amount(target).len(), fee_ppk));
        if next == target {
            break;
        }
        target = next;
    }
    target
}

// =============================================================================
// Engine
// =============================================================================

pub struct MeltEngine {
    repos: Arc<dyn RepositoryProvider>,
    connector: Arc<dyn MintConnector>,
    events: Arc<EventBus>,
    mints: Arc<MintService>,
    proofs: Arc<ProofService>,
    history: Arc<HistoryService>,
    registry: Arc<MeltHandlerRegistry>,
    config: Arc<WalletConfig>,
    locks: OperationLocks,
    recovery: RecoveryLock,
}

impl MeltEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repos: Arc<dyn RepositoryProvider>,
        connector: Arc<dyn MintConnector>,
        events: Arc<EventBus>,
        mints: Arc<MintService>,
        proofs: Arc<ProofService>,
        history: Arc<HistoryService>,
        registry: Arc<MeltHandlerRegistry>,
        config: Arc<WalletConfig>,
    ) -> Self {
        Self {
            repos,
            connector,
            events,
            mints,
            proofs,
            history,
            registry,
            config,
            locks: OperationLocks::new(),
            recovery: RecoveryLock::new(),
        }
    }

    pub fn registry(&self) -> &MeltHandlerRegistry {
        &self.registry
    }

    // =========================================================================
    // Quotes
    // =========================================================================

    /// Ask a trusted mint to quote a payment request
    pub async fn create_melt_quote(
        &self,
        mint_url: &str,
        method: PaymentMethod,
        request: &str,
    ) -> WalletResult<MeltQuote> {
        let mint_url = self.mints.require_trusted(mint_url).await?;
        let handler = self.registry.get(method)?;
        let response = handler.request_quote(&mint_url, request).await?;

        let quote = MeltQuote {
            quote_id: response.quote,
            mint_url: mint_url.clone(),
            method,
            request: request.trim().to_string(),
            amount: response.amount,
            fee_reserve: response.fee_reserve,
            unit: self.config.unit.clone(),
            state: response.state,
            expiry: response.expiry,
            payment_preimage: response.payment_preimage,
            created_at: now_secs(),
        };
        handler.validate_quote(&quote)?;
        self.repos
            .repositories()
            .melt_quotes
            .save_melt_quote(quote.clone())
            .await?;

        let mut record = history::entry(
            history::melt_entry_id(&quote.quote_id),
            HistoryKind::Melt,
            &mint_url,
            quote.amount,
            &quote.unit,
            quote_state_str(quote.state),
        );
        record.quote_id = Some(quote.quote_id.clone());
        self.history.record(record, None).await?;

        log::info!(
            "Created {} melt quote {} for {} (+{} reserve) on {}",
            method,
            quote.quote_id,
            quote.amount,
            quote.fee_reserve,
            mint_url
        );
        self.events.emit(WalletEvent::MeltQuoteCreated {
            mint_url,
            quote: quote.clone(),
        });
        Ok(quote)
    }

    pub async fn get_melt_quote(&self, quote_id: &str) -> WalletResult<Option<MeltQuote>> {
        self.repos
            .repositories()
            .melt_quotes
            .get_melt_quote(quote_id)
            .await
    }

    async fn require_quote(&self, quote_id: &str) -> WalletResult<MeltQuote> {
        self.get_melt_quote(quote_id)
            .await?
            .ok_or_else(|| WalletError::QuoteNotFound {
                quote_id: quote_id.to_string(),
            })
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub async fn get_melt_operation(&self, operation_id: &str) -> WalletResult<Option<MeltOperation>> {
        self.repos
            .repositories()
            .melt_operations
            .get_melt_operation(operation_id)
            .await
    }

    async fn load(&self, operation_id: &str) -> WalletResult<MeltOperation> {
        self.get_melt_operation(operation_id)
            .await?
            .ok_or_else(|| WalletError::OperationNotFound {
                operation_id: operation_id.to_string(),
            })
    }

    pub async fn get_melt_operation_by_quote(
        &self,
        quote_id: &str,
    ) -> WalletResult<Option<MeltOperation>> {
        self.repos
            .repositories()
            .melt_operations
            .get_melt_operation_by_quote(quote_id)
            .await
    }

    pub async fn get_pending_melts(&self) -> WalletResult<Vec<MeltOperation>> {
        let mut ops = self
            .repos
            .repositories()
            .melt_operations
            .get_melt_operations_by_state(&NON_TERMINAL)
            .await?;
        ops.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(ops)
    }

    pub fn is_operation_locked(&self, operation_id: &str) -> bool {
        self.locks.is_locked(operation_id)
    }

    pub fn is_recovery_running(&self) -> bool {
        self.recovery.is_running()
    }

    async fn save_operation(&self, op: &MeltOperation) -> WalletResult<()> {
        self.repos
            .repositories()
            .melt_operations
            .save_melt_operation(op.clone())
            .await
    }

    async fn save_in(&self, ctx: &TxContext, op: &MeltOperation) -> WalletResult<()> {
        let tx = self.repos.begin(Some(ctx)).await?;
        let result = tx
            .repositories()
            .melt_operations
            .save_melt_operation(op.clone())
            .await;
        finish(tx, result).await
    }

    async fn save_quote_in(&self, ctx: &TxContext, quote: &MeltQuote) -> WalletResult<()> {
        let tx = self.repos.begin(Some(ctx)).await?;
        let result = tx
            .repositories()
            .melt_quotes
            .save_melt_quote(quote.clone())
            .await;
        finish(tx, result).await
    }

    // =========================================================================
    // Prepare
    // =========================================================================

    /// Select and reserve inputs for a quote and persist a prepared operation
    ///
    /// Only one non-terminal operation may exist per quote.
    pub async fn prepare_melt(&self, mint_url: &str, quote_id: &str) -> WalletResult<MeltOperation> {
        let mint_url = self.mints.require_trusted(mint_url).await?;
        let quote = self.require_quote(quote_id).await?;
        if quote.mint_url != mint_url {
            return Err(WalletError::validation(format!(
                "Melt quote {} belongs to {}",
                quote_id, quote.mint_url
            )));
        }
        if quote.state != MeltQuoteState::Unpaid {
            return Err(WalletError::validation(format!(
                "Melt quote {} is {}",
                quote_id,
                quote_state_str(quote.state)
            )));
        }
        if let Some(existing) = self.get_melt_operation_by_quote(quote_id).await? {
            if !existing.state.is_terminal() {
                return Err(WalletError::in_progress(quote_id));
            }
        }

        let handler = self.registry.get(quote.method)?;
        handler.validate_quote(&quote)?;

        let target = quote.amount.saturating_add(quote.fee_reserve);
        let selection = self
            .proofs
            .select_proofs_for_amount(&mint_url, target, true)
            .await?;

        let now = now_secs();
        let mut op = MeltOperation {
            id: uuid::Uuid::new_v4().to_string(),
            mint_url: mint_url.clone(),
            quote_id: quote_id.to_string(),
            method: quote.method,
            amount: quote.amount,
            fee_reserve: quote.fee_reserve,
            needs_swap: !selection.exact && selection.over_selected,
            input_amount: selection.total,
            input_secrets: selection.secrets(),
            change_secrets: Vec::new(),
            outputs: None,
            state: MeltState::Init,
            error: None,
            method_data: handler.method_data(&quote),
            created_at: now,
            updated_at: now,
        };

        let tx = self.repos.begin(None).await?;
        let result = self.persist_prepared(tx.context(), &mut op).await;
        finish(tx, result).await?;

        log::info!(
            "Prepared melt {} for quote {}: {} inputs worth {} (swap: {})",
            op.id,
            quote_id,
            op.input_secrets.len(),
            op.input_amount,
            op.needs_swap
        );
        Ok(op)
    }

    async fn persist_prepared(&self, ctx: &TxContext, op: &mut MeltOperation) -> WalletResult<()> {
        self.save_in(ctx, op).await?;
        self.proofs
            .reserve_proofs(&op.mint_url, &op.input_secrets, &op.id, Some(ctx))
            .await?;
        transition(op, MeltState::Prepared)?;
        self.save_in(ctx, op).await
    }

    // =========================================================================
    // Execute
    // =========================================================================

    /// Prepare and execute a melt for a quote
    ///
    /// A failed payment releases the inputs and returns `MeltFailed`.
    pub async fn pay_melt_quote(&self, mint_url: &str, quote_id: &str) -> WalletResult<MeltResult> {
        let op = self.prepare_melt(mint_url, quote_id).await?;
        match self.execute_melt(&op.id).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if let Ok(Some(current)) = self.get_melt_operation(&op.id).await {
                    if current.state == MeltState::Prepared {
                        if let Err(rollback_err) = self.rollback_melt(&op.id).await {
                            log::error!("Rollback of melt {} failed: {}", op.id, rollback_err);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Execute the prepared operation of a quote; `None` if there is none
    pub async fn execute_melt_by_quote(&self, quote_id: &str) -> WalletResult<Option<MeltResult>> {
        let Some(op) = self.get_melt_operation_by_quote(quote_id).await? else {
            return Ok(None);
        };
        self.execute_melt(&op.id).await.map(Some)
    }

    pub async fn execute_melt(&self, operation_id: &str) -> WalletResult<MeltResult> {
        let _guard = self.locks.acquire(operation_id)?;
        let mut op = self.load(operation_id).await?;
        if op.state != MeltState::Prepared {
            return Err(WalletError::InvalidState {
                operation_id: op.id.clone(),
                expected: MeltState::Prepared.to_string(),
                actual: op.state.to_string(),
            });
        }
        let quote = self.require_quote(&op.quote_id).await?;
        let handler = self.registry.get(op.method)?;

        let mut inputs = self.reserved_inputs(&op).await?;
        if op.needs_swap {
            inputs = self.pre_swap(&mut op, inputs).await?;
        }

        let fees = self.proofs.keyset_fees(&op.mint_url).await?;
        let input_fee = calculate_input_fee(&inputs, &fees);
        let overpaid = op
            .input_amount
            .saturating_sub(input_fee)
            .saturating_sub(op.amount);
        let blanks = blank_output_count(overpaid);
        let change_outputs = if blanks > 0 {
            self.mints
                .prepare_outputs(&op.mint_url, &vec![1; blanks], &[])
                .await?
        } else {
            PendingOutputs::default()
        };

        if op.state == MeltState::Prepared {
            transition(&mut op, MeltState::Executing)?;
        }
        op.outputs = (!change_outputs.is_empty()).then(|| change_outputs.clone());
        self.save_operation(&op).await?;

        log::info!(
            "Executing melt {} for quote {} ({} inputs, {} blank outputs)",
            op.id,
            quote.quote_id,
            inputs.len(),
            blanks
        );
        let cashu: Vec<CashuProof> = inputs.iter().map(ProofData::to_cashu).collect();
        let execution = match handler
            .execute(&op, &quote, &cashu, &change_outputs.primary)
            .await
        {
            Ok(execution) => execution,
            Err(e) => return Err(self.record_failure(&mut op, e).await),
        };

        match execution {
            MeltExecution::Paid { change, preimage } => {
                self.finalize_paid(op, quote, change, preimage).await
            }
            MeltExecution::Pending => self.mark_pending(op, quote).await,
            MeltExecution::Failed { reason } => {
                let quote_id = quote.quote_id.clone();
                self.mark_failed(op, quote, reason.clone()).await?;
                Err(WalletError::MeltFailed { quote_id, reason })
            }
        }
    }

    async fn reserved_inputs(&self, op: &MeltOperation) -> WalletResult<Vec<ProofData>> {
        let inputs = self
            .proofs
            .get_proofs_by_secrets(&op.mint_url, &op.input_secrets)
            .await?;
        if inputs.len() != op.input_secrets.len()
            || inputs
                .iter()
                .any(|p| p.used_by_operation_id.as_deref() != Some(op.id.as_str()))
        {
            return Err(WalletError::ReservationConflict {
                secret: op.id.clone(),
                reason: "melt inputs are no longer reserved by the operation".to_string(),
            });
        }
        Ok(inputs)
    }

    async fn record_failure(&self, op: &mut MeltOperation, error: WalletError) -> WalletError {
        log::warn!("Melt {} failed while {}: {}", op.id, op.state, error);
        op.error = Some(error.to_string());
        op.updated_at = now_secs();
        if let Err(save_err) = self.save_operation(op).await {
            log::error!("Could not record failure of melt {}: {}", op.id, save_err);
        }
        error
    }

    /// Swap over-selected inputs into the exact melt amount plus change
    ///
    /// Returns the new melt inputs, reserved by the operation. The operation is
    /// executing with the swap outputs persisted before the mint is contacted.
    async fn pre_swap(
        &self,
        op: &mut MeltOperation,
        inputs: Vec<ProofData>,
    ) -> WalletResult<Vec<ProofData>> {
        let keyset = self.mints.get_active_keyset(&op.mint_url).await?;
        let fees = self.proofs.keyset_fees(&op.mint_url).await?;
        let swap_fee = calculate_input_fee(&inputs, &fees);
        let melt_target = self_funding_target(
            op.amount.saturating_add(op.fee_reserve),
            keyset.input_fee_ppk,
        );
        let Some(keep) = op
            .input_amount
            .checked_sub(melt_target)
            .and_then(|v| v.checked_sub(swap_fee))
        else {
            log::info!("Melt {}: swap would not pay for itself, melting inputs as they are", op.id);
            return Ok(inputs);
        };

        let outputs = self
            .mints
            .prepare_outputs(&op.mint_url, &split_amount(melt_target), &split_amount(keep))
            .await?;
        transition(op, MeltState::Executing)?;
        op.outputs = Some(outputs.clone());
        self.save_operation(op).await?;

        let cashu: Vec<CashuProof> = inputs.iter().map(ProofData::to_cashu).collect();
        let all = outputs.all();
        let signed = match self.connector.swap(&op.mint_url, &cashu, &all).await {
            Ok(signed) if signed.len() == all.len() => signed,
            Ok(signed) => {
                let e = WalletError::Crypto(format!(
                    "Mint returned {} signatures for {} outputs",
                    signed.len(),
                    all.len()
                ));
                return Err(self.record_failure(op, e).await);
            }
            Err(e) => return Err(self.record_failure(op, e.into()).await),
        };

        let now = now_secs();
        let mut melt_inputs = Vec::with_capacity(outputs.primary.len());
        let mut kept = Vec::with_capacity(outputs.keep.len());
        for (i, proof) in signed.into_iter().enumerate() {
            let mut data = ProofData::from_cashu(&op.mint_url, proof, Some(op.id.clone()), now);
            if i < outputs.primary.len() {
                data.used_by_operation_id = Some(op.id.clone());
                melt_inputs.push(data);
            } else {
                kept.push(data);
            }
        }

        let old_inputs: Vec<String> = op.input_secrets.clone();
        op.input_secrets = melt_inputs.iter().map(|p| p.secret.clone()).collect();
        op.input_amount = melt_target;
        op.outputs = None;
        op.updated_at = now_secs();

        let tx = self.repos.begin(None).await?;
        let result = self
            .persist_swapped(tx.context(), op, &old_inputs, &melt_inputs, &kept)
            .await;
        finish(tx, result).await?;

        log::info!(
            "Melt {}: swapped {} inputs into {} for the melt and {} change",
            op.id,
            old_inputs.len(),
            melt_target,
            keep
        );
        self.proofs
            .emit_state_changed(&op.mint_url, old_inputs, ProofState::Spent);
        self.proofs.emit_saved(
            &op.mint_url,
            melt_inputs
                .iter()
                .chain(kept.iter())
                .map(|p| (p.secret.clone(), p.state))
                .collect(),
        );
        Ok(melt_inputs)
    }

    async fn persist_swapped(
        &self,
        ctx: &TxContext,
        op: &MeltOperation,
        old_inputs: &[String],
        melt_inputs: &[ProofData],
        kept: &[ProofData],
    ) -> WalletResult<()> {
        self.proofs
            .set_proof_state(&op.mint_url, old_inputs, ProofState::Spent, Some(ctx))
            .await?;
        let mut created = melt_inputs.to_vec();
        created.extend(kept.iter().cloned());
        self.proofs
            .save_proofs(&op.mint_url, created, Some(ctx))
            .await?;
        self.save_in(ctx, op).await
    }

    // =========================================================================
    // Outcomes
    // =========================================================================

    fn history_record(&self, op: &MeltOperation, state: &str) -> HistoryEntry {
        let mut record = history::entry(
            history::melt_entry_id(&op.quote_id),
            HistoryKind::Melt,
            &op.mint_url,
            op.amount,
            &self.config.unit,
            state,
        );
        record.quote_id = Some(op.quote_id.clone());
        record.operation_id = Some(op.id.clone());
        record
    }

    async fn finalize_paid(
        &self,
        mut op: MeltOperation,
        mut quote: MeltQuote,
        change: Vec<CashuProof>,
        preimage: Option<String>,
    ) -> WalletResult<MeltResult> {
        let change = if change.is_empty() {
            self.restore_change(&op).await?
        } else {
            change
        };
        let now = now_secs();
        let change: Vec<ProofData> = change
            .into_iter()
            .map(|p| ProofData::from_cashu(&op.mint_url, p, Some(op.id.clone()), now))
            .collect();

        transition(&mut op, MeltState::Finalized)?;
        op.change_secrets = change.iter().map(|p| p.secret.clone()).collect();
        op.outputs = None;
        op.error = None;
        quote.state = MeltQuoteState::Paid;
        if preimage.is_some() {
            quote.payment_preimage = preimage;
        }
        let record = self.history_record(&op, quote_state_str(MeltQuoteState::Paid));

        let tx = self.repos.begin(None).await?;
        let result = self
            .persist_paid(tx.context(), &op, &quote, change.clone(), record)
            .await;
        let record = finish(tx, result).await?;

        let change_total = sum_amounts(change.iter().map(|p| p.amount))?;
        log::info!(
            "Melt {} paid quote {}: spent {}, change {}",
            op.id,
            quote.quote_id,
            op.input_amount,
            change_total
        );
        self.proofs
            .emit_state_changed(&op.mint_url, op.input_secrets.clone(), ProofState::Spent);
        self.proofs.emit_saved(
            &op.mint_url,
            change.iter().map(|p| (p.secret.clone(), p.state)).collect(),
        );
        self.events.emit(WalletEvent::MeltQuoteStateChanged {
            mint_url: op.mint_url.clone(),
            quote_id: quote.quote_id.clone(),
            state: MeltQuoteState::Paid,
        });
        self.events.emit(WalletEvent::MeltQuotePaid {
            mint_url: op.mint_url.clone(),
            quote_id: quote.quote_id.clone(),
            amount: quote.amount,
            payment_preimage: quote.payment_preimage.clone(),
        });
        self.history.notify(&record);

        Ok(MeltResult {
            operation: op,
            quote,
            change,
        })
    }

    /// Change signatures for the persisted blank outputs
    async fn restore_change(&self, op: &MeltOperation) -> WalletResult<Vec<CashuProof>> {
        let Some(outputs) = &op.outputs else {
            return Ok(Vec::new());
        };
        let restored = self.connector.restore(&op.mint_url, &outputs.all()).await?;
        Ok(restored.into_iter().flatten().collect())
    }

    async fn persist_paid(
        &self,
        ctx: &TxContext,
        op: &MeltOperation,
        quote: &MeltQuote,
        change: Vec<ProofData>,
        record: HistoryEntry,
    ) -> WalletResult<HistoryEntry> {
        self.proofs
            .set_proof_state(&op.mint_url, &op.input_secrets, ProofState::Spent, Some(ctx))
            .await?;
        self.proofs
            .save_proofs(&op.mint_url, change, Some(ctx))
            .await?;
        self.save_quote_in(ctx, quote).await?;
        self.save_in(ctx, op).await?;
        self.history.record(record, Some(ctx)).await
    }

    async fn mark_pending(&self, mut op: MeltOperation, mut quote: MeltQuote) -> WalletResult<MeltResult> {
        transition(&mut op, MeltState::Pending)?;
        op.error = None;
        quote.state = MeltQuoteState::Pending;
        let record = self.history_record(&op, quote_state_str(MeltQuoteState::Pending));

        let tx = self.repos.begin(None).await?;
        let result = self.persist_pending(tx.context(), &op, &quote, record).await;
        let record = finish(tx, result).await?;

        log::info!("Melt {} pending for quote {}", op.id, quote.quote_id);
        self.proofs
            .emit_state_changed(&op.mint_url, op.input_secrets.clone(), ProofState::Inflight);
        self.events.emit(WalletEvent::MeltQuoteStateChanged {
            mint_url: op.mint_url.clone(),
            quote_id: quote.quote_id.clone(),
            state: MeltQuoteState::Pending,
        });
        self.history.notify(&record);

        Ok(MeltResult {
            operation: op,
            quote,
            change: Vec::new(),
        })
    }

    async fn persist_pending(
        &self,
        ctx: &TxContext,
        op: &MeltOperation,
        quote: &MeltQuote,
        record: HistoryEntry,
    ) -> WalletResult<HistoryEntry> {
        self.proofs
            .set_proof_state(&op.mint_url, &op.input_secrets, ProofState::Inflight, Some(ctx))
            .await?;
        self.save_quote_in(ctx, quote).await?;
        self.save_in(ctx, op).await?;
        self.history.record(record, Some(ctx)).await
    }

    /// Release the inputs of a payment that did not happen
    ///
    /// Executing operations end `Failed`; prepared and pending ones end `RolledBack`.
    async fn mark_failed(
        &self,
        mut op: MeltOperation,
        mut quote: MeltQuote,
        reason: String,
    ) -> WalletResult<MeltOperation> {
        let next = if op.state == MeltState::Executing {
            MeltState::Failed
        } else {
            MeltState::RolledBack
        };
        transition(&mut op, next)?;
        op.error = Some(reason.clone());
        op.outputs = None;
        quote.state = MeltQuoteState::Unpaid;
        let record = self.history_record(&op, next.as_str());

        let tx = self.repos.begin(None).await?;
        let result = self.persist_released(tx.context(), &op, &quote, record).await;
        let record = finish(tx, result).await?;

        log::warn!("Melt {} for quote {} {}: {}", op.id, quote.quote_id, next, reason);
        self.proofs
            .emit_state_changed(&op.mint_url, op.input_secrets.clone(), ProofState::Ready);
        self.events.emit(WalletEvent::MeltQuoteStateChanged {
            mint_url: op.mint_url.clone(),
            quote_id: quote.quote_id.clone(),
            state: MeltQuoteState::Unpaid,
        });
        self.history.notify(&record);
        Ok(op)
    }

    async fn persist_released(
        &self,
        ctx: &TxContext,
        op: &MeltOperation,
        quote: &MeltQuote,
        record: HistoryEntry,
    ) -> WalletResult<HistoryEntry> {
        self.proofs
            .release_proofs(&op.mint_url, &op.input_secrets, Some(ctx))
            .await?;
        self.proofs
            .set_proof_state(&op.mint_url, &op.input_secrets, ProofState::Ready, Some(ctx))
            .await?;
        self.save_quote_in(ctx, quote).await?;
        self.save_in(ctx, op).await?;
        self.history.record(record, Some(ctx)).await
    }

    /// The payment did not happen but the inputs are gone: an interrupted
    /// pre-swap. Keep whatever the swap produced.
    async fn recover_swap_outputs(
        &self,
        mut op: MeltOperation,
        mut quote: MeltQuote,
    ) -> WalletResult<MeltOperation> {
        let restored = match &op.outputs {
            Some(outputs) => self.connector.restore(&op.mint_url, &outputs.all()).await?,
            None => Vec::new(),
        };
        let now = now_secs();
        let recovered: Vec<ProofData> = restored
            .into_iter()
            .flatten()
            .map(|p| ProofData::from_cashu(&op.mint_url, p, Some(op.id.clone()), now))
            .collect();

        transition(&mut op, MeltState::RolledBack)?;
        op.outputs = None;
        op.change_secrets = recovered.iter().map(|p| p.secret.clone()).collect();
        quote.state = MeltQuoteState::Unpaid;
        let record = self.history_record(&op, MeltState::RolledBack.as_str());

        let tx = self.repos.begin(None).await?;
        let result = self
            .persist_recovered(tx.context(), &op, &quote, recovered.clone(), record)
            .await;
        let record = finish(tx, result).await?;

        log::info!(
            "Melt {} rolled back after swap, recovered {} proofs",
            op.id,
            recovered.len()
        );
        self.proofs
            .emit_state_changed(&op.mint_url, op.input_secrets.clone(), ProofState::Spent);
        self.proofs.emit_saved(
            &op.mint_url,
            recovered.iter().map(|p| (p.secret.clone(), p.state)).collect(),
        );
        self.history.notify(&record);
        Ok(op)
    }

    async fn persist_recovered(
        &self,
        ctx: &TxContext,
        op: &MeltOperation,
        quote: &MeltQuote,
        recovered: Vec<ProofData>,
        record: HistoryEntry,
    ) -> WalletResult<HistoryEntry> {
        self.proofs
            .set_proof_state(&op.mint_url, &op.input_secrets, ProofState::Spent, Some(ctx))
            .await?;
        self.proofs
            .save_proofs(&op.mint_url, recovered, Some(ctx))
            .await?;
        self.save_quote_in(ctx, quote).await?;
        self.save_in(ctx, op).await?;
        self.history.record(record, Some(ctx)).await
    }

    // =========================================================================
    // Pending / Rollback / Recovery
    // =========================================================================

    /// Ask the rail about an executing or pending operation and apply the answer
    async fn resolve(&self, op: MeltOperation) -> WalletResult<(MeltPendingDecision, MeltOperation)> {
        let quote = self.require_quote(&op.quote_id).await?;
        let handler = self.registry.get(op.method)?;
        match handler.check_pending(&op, &quote).await? {
            MeltExecution::Paid { change, preimage } => {
                let result = self.finalize_paid(op, quote, change, preimage).await?;
                Ok((MeltPendingDecision::Finalize, result.operation))
            }
            MeltExecution::Pending => {
                if op.state == MeltState::Executing {
                    let result = self.mark_pending(op, quote).await?;
                    return Ok((MeltPendingDecision::StayPending, result.operation));
                }
                Ok((MeltPendingDecision::StayPending, op))
            }
            MeltExecution::Failed { reason } => {
                let states = self
                    .connector
                    .check_proof_states(&op.mint_url, &op.input_secrets)
                    .await?;
                if states.iter().any(|s| *s == MintProofState::Pending) {
                    return Ok((MeltPendingDecision::StayPending, op));
                }
                let op = if states.iter().any(|s| *s == MintProofState::Spent) {
                    self.recover_swap_outputs(op, quote).await?
                } else {
                    self.release_unpaid(op, quote, reason).await?
                };
                Ok((MeltPendingDecision::Rollback, op))
            }
        }
    }

    async fn release_unpaid(
        &self,
        mut op: MeltOperation,
        mut quote: MeltQuote,
        reason: String,
    ) -> WalletResult<MeltOperation> {
        transition(&mut op, MeltState::RolledBack)?;
        op.error = Some(reason.clone());
        op.outputs = None;
        quote.state = MeltQuoteState::Unpaid;
        let record = self.history_record(&op, MeltState::RolledBack.as_str());

        let tx = self.repos.begin(None).await?;
        let result = self.persist_released(tx.context(), &op, &quote, record).await;
        let record = finish(tx, result).await?;

        log::info!("Melt {} rolled back: {}", op.id, reason);
        self.proofs
            .emit_state_changed(&op.mint_url, op.input_secrets.clone(), ProofState::Ready);
        self.events.emit(WalletEvent::MeltQuoteStateChanged {
            mint_url: op.mint_url.clone(),
            quote_id: quote.quote_id.clone(),
            state: MeltQuoteState::Unpaid,
        });
        self.history.notify(&record);
        Ok(op)
    }

    /// Re-check the outcome of a quote's melt and apply it
    ///
    /// `None` if the quote has no operation. Terminal operations are reported
    /// without contacting the mint.
    pub async fn check_pending_melt_by_quote(
        &self,
        quote_id: &str,
    ) -> WalletResult<Option<MeltPendingDecision>> {
        let Some(op) = self.get_melt_operation_by_quote(quote_id).await? else {
            return Ok(None);
        };
        let decision = match op.state {
            MeltState::Finalized => MeltPendingDecision::Finalize,
            MeltState::Failed | MeltState::RolledBack => MeltPendingDecision::Rollback,
            MeltState::Init | MeltState::Prepared => MeltPendingDecision::StayPending,
            MeltState::Executing | MeltState::Pending => {
                let _guard = self.locks.acquire(&op.id)?;
                let op = self.load(&op.id).await?;
                if op.state.is_terminal() {
                    return Ok(Some(if op.state == MeltState::Finalized {
                        MeltPendingDecision::Finalize
                    } else {
                        MeltPendingDecision::Rollback
                    }));
                }
                self.resolve(op).await?.0
            }
        };
        Ok(Some(decision))
    }

    /// Undo a melt that has not been paid
    ///
    /// A failed melt is moved to `RolledBack` without touching its proofs.
    /// A melt the mint reports as paid is finalized instead and the call fails
    /// with `InvalidState`; one still in flight fails with a pending mint error.
    pub async fn rollback_melt(&self, operation_id: &str) -> WalletResult<MeltOperation> {
        let _guard = self.locks.acquire(operation_id)?;
        let op = self.load(operation_id).await?;
        match op.state {
            MeltState::Prepared => {
                let quote = self.require_quote(&op.quote_id).await?;
                self.release_unpaid(op, quote, "rolled back before execution".to_string())
                    .await
            }
            MeltState::Executing | MeltState::Pending => {
                let id = op.id.clone();
                match self.resolve(op).await? {
                    (MeltPendingDecision::Rollback, op) => Ok(op),
                    (MeltPendingDecision::Finalize, op) => Err(WalletError::InvalidState {
                        operation_id: id,
                        expected: "unpaid melt".to_string(),
                        actual: op.state.to_string(),
                    }),
                    (MeltPendingDecision::StayPending, _) => {
                        Err(WalletError::Mint(MintClientError::with_code(
                            NutErrorCode::QuotePending,
                            format!("Melt {} is still pending at the mint", id),
                        )))
                    }
                }
            }
            MeltState::Failed => self.close_failed(op).await,
            other => Err(WalletError::InvalidState {
                operation_id: op.id.clone(),
                expected: "prepared, executing, pending or failed".to_string(),
                actual: other.to_string(),
            }),
        }
    }

    /// A failed melt already released its inputs; only the record moves
    async fn close_failed(&self, mut op: MeltOperation) -> WalletResult<MeltOperation> {
        transition(&mut op, MeltState::RolledBack)?;
        self.save_operation(&op).await?;
        log::info!("Failed melt {} closed as rolled back", op.id);
        Ok(op)
    }

    /// Resolve executing and pending melts left from a previous session
    pub async fn recover_pending_melts(&self) -> WalletResult<RecoveryReport> {
        let _guard = self.recovery.acquire("melt-recovery")?;
        let mut report = RecoveryReport::default();

        for op in self.get_pending_melts().await? {
            if op.state == MeltState::Prepared || self.locks.is_locked(&op.id) {
                report.skipped.push(op.id);
                continue;
            }
            let was = op.state;
            let id = op.id.clone();
            let outcome = match self.locks.acquire(&id) {
                Ok(_guard) => self.resolve(op).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok((MeltPendingDecision::Finalize, _)) => report.finalized.push(id),
                Ok((MeltPendingDecision::Rollback, _)) => report.rolled_back.push(id),
                Ok((MeltPendingDecision::StayPending, updated)) => {
                    if was == MeltState::Executing && updated.state == MeltState::Pending {
                        report.resumed.push(id);
                    } else {
                        report.still_pending.push(id);
                    }
                }
                Err(e) => {
                    log::warn!("Recovery of melt {} failed: {}", id, e);
                    report.errors.push((id, e.to_string()));
                }
            }
        }

        log::info!(
            "Melt recovery: {} finalized, {} rolled back, {} pending, {} errors",
            report.finalized.len(),
            report.rolled_back.len(),
            report.still_pending.len() + report.resumed.len(),
            report.errors.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::stores::MemoryRepositoryProvider;
    use crate::test_utils::{FakeMint, MeltOutcome, TEST_MINT};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Fixture {
        mint: Arc<FakeMint>,
        engine: MeltEngine,
        mints: Arc<MintService>,
        proofs: Arc<ProofService>,
        events: Arc<EventBus>,
    }

    async fn fixture(funds: &[u64]) -> Fixture {
        let mint = FakeMint::new(0);
        let connector = mint.client(b"melt engine seed");
        let repos: Arc<dyn RepositoryProvider> = Arc::new(MemoryRepositoryProvider::new());
        let events = Arc::new(EventBus::new());
        let config = Arc::new(WalletConfig::default());
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
        mints.add_mint(TEST_MINT, true).await.unwrap();
        let history = Arc::new(HistoryService::new(repos.clone(), events.clone()));

        let funded: Vec<ProofData> = funds
            .iter()
            .enumerate()
            .map(|(i, amount)| {
                let proof = mint.issue_proof(&format!("funding-{}", i), *amount);
                ProofData::from_cashu(TEST_MINT, proof, None, 1)
            })
            .collect();
        proofs.save_proofs(TEST_MINT, funded, None).await.unwrap();

        let bolt11: Arc<dyn MeltMethodHandler> = Arc::new(Bolt11Handler::new(connector.clone()));
        let registry =
            Arc::new(MeltHandlerRegistry::new(vec![bolt11], &config.melt_methods).unwrap());
        let engine = MeltEngine::new(
            repos,
            connector,
            events.clone(),
            mints.clone(),
            proofs.clone(),
            history,
            registry,
            config,
        );
        Fixture {
            mint,
            engine,
            mints,
            proofs,
            events,
        }
    }

    async fn totals(proofs: &ProofService) -> (u64, u64) {
        let all = proofs.get_proofs(TEST_MINT).await.unwrap();
        let spendable = all.iter().filter(|p| p.is_spendable()).map(|p| p.amount).sum();
        let held = all
            .iter()
            .filter(|p| p.state != ProofState::Spent && !p.is_spendable())
            .map(|p| p.amount)
            .sum();
        (spendable, held)
    }

    #[test]
    fn test_blank_output_count() {
        assert_eq!(blank_output_count(0), 0);
        assert_eq!(blank_output_count(1), 1);
        assert_eq!(blank_output_count(2), 1);
        assert_eq!(blank_output_count(3), 2);
        assert_eq!(blank_output_count(1000), 10);
    }

    #[test]
    fn test_self_funding_target() {
        assert_eq!(self_funding_target(102, 0), 102);
        // 102 splits into 4 proofs, 1 sat fee; 103 splits into 5, still 1 sat
        assert_eq!(self_funding_target(102, 100), 103);
    }

    #[test]
    fn test_registry_requires_configured_methods() {
        let connector = FakeMint::new(0).client(b"registry");
        let err = MeltHandlerRegistry::new(Vec::new(), &[PaymentMethod::Bolt11])
            .err()
            .unwrap();
        assert!(matches!(err, WalletError::Config(_)));

        let bolt11: Arc<dyn MeltMethodHandler> = Arc::new(Bolt11Handler::new(connector));
        let registry = MeltHandlerRegistry::new(vec![bolt11], &[PaymentMethod::Bolt11]).unwrap();
        assert!(matches!(
            registry.get(PaymentMethod::Bolt12).err().unwrap(),
            WalletError::UnsupportedPaymentMethod(_)
        ));
        assert_eq!(registry.methods(), vec![PaymentMethod::Bolt11]);
    }

    #[tokio::test]
    async fn test_melt_quote_requires_trusted_mint() {
        let f = fixture(&[128]).await;
        f.mints.untrust_mint(TEST_MINT).await.unwrap();
        let err = f
            .engine
            .create_melt_quote(TEST_MINT, PaymentMethod::Bolt11, "lnbc100n1invoice")
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::UntrustedMint { .. }));

        let err = f
            .engine
            .create_melt_quote("https://unknown.example.com", PaymentMethod::Bolt11, "lnbc1")
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::UntrustedMint { .. }));
    }

    #[tokio::test]
    async fn test_paid_melt_with_pre_swap_and_change() {
        let f = fixture(&[128]).await;
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let k = kinds.clone();
        f.events.on(None, move |e| k.lock().unwrap().push(e.kind()));

        let quote = f
            .engine
            .create_melt_quote(TEST_MINT, PaymentMethod::Bolt11, "lnbc100n1invoice")
            .await
            .unwrap();
        assert_eq!(quote.fee_reserve, 2);

        let result = f.engine.pay_melt_quote(TEST_MINT, &quote.quote_id).await.unwrap();
        assert!(result.is_paid());
        assert!(result.operation.needs_swap);
        assert_eq!(result.quote.state, MeltQuoteState::Paid);
        assert!(result.quote.payment_preimage.is_some());
        // Reserve unused: it comes back as change
        assert_eq!(result.change.iter().map(|p| p.amount).sum::<u64>(), 2);
        assert_eq!(totals(&f.proofs).await, (28, 0));

        let stored = f.engine.get_melt_quote(&quote.quote_id).await.unwrap().unwrap();
        assert_eq!(stored.state, MeltQuoteState::Paid);
        assert!(kinds.lock().unwrap().contains(&EventKind::MeltQuotePaid));

        // Idempotent check on a finalized melt
        assert_eq!(
            f.engine.check_pending_melt_by_quote(&quote.quote_id).await.unwrap(),
            Some(MeltPendingDecision::Finalize)
        );
    }

    #[tokio::test]
    async fn test_fee_reserve_fully_used() {
        let f = fixture(&[64, 32, 4, 2]).await;
        f.mint.push_melt_outcome(MeltOutcome::Paid { fee_paid: 2 });
        let quote = f
            .engine
            .create_melt_quote(TEST_MINT, PaymentMethod::Bolt11, "lnbc100n1invoice")
            .await
            .unwrap();
        let result = f.engine.pay_melt_quote(TEST_MINT, &quote.quote_id).await.unwrap();
        assert!(!result.operation.needs_swap);
        assert!(result.change.is_empty());
        assert_eq!(totals(&f.proofs).await, (0, 0));
    }

    #[tokio::test]
    async fn test_failed_melt_releases_inputs() {
        let f = fixture(&[64, 32, 4, 2]).await;
        f.mint.push_melt_outcome(MeltOutcome::Failed);
        let quote = f
            .engine
            .create_melt_quote(TEST_MINT, PaymentMethod::Bolt11, "lnbc100n1invoice")
            .await
            .unwrap();

        let err = f
            .engine
            .pay_melt_quote(TEST_MINT, &quote.quote_id)
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::MeltFailed { .. }));
        assert_eq!(totals(&f.proofs).await, (102, 0));

        let op = f
            .engine
            .get_melt_operation_by_quote(&quote.quote_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(op.state, MeltState::Failed);
        assert!(op.error.is_some());
        let stored = f.engine.get_melt_quote(&quote.quote_id).await.unwrap().unwrap();
        assert_eq!(stored.state, MeltQuoteState::Unpaid);

        // Closing the failed attempt leaves the proofs untouched
        let closed = f.engine.rollback_melt(&op.id).await.unwrap();
        assert_eq!(closed.state, MeltState::RolledBack);
        assert_eq!(totals(&f.proofs).await, (102, 0));

        // A failed quote can be paid again
        let result = f.engine.pay_melt_quote(TEST_MINT, &quote.quote_id).await.unwrap();
        assert!(result.is_paid());
    }

    #[tokio::test]
    async fn test_pending_melt_then_paid() {
        let f = fixture(&[64, 32, 4, 2]).await;
        f.mint.push_melt_outcome(MeltOutcome::Pending);
        let quote = f
            .engine
            .create_melt_quote(TEST_MINT, PaymentMethod::Bolt11, "lnbc100n1invoice")
            .await
            .unwrap();

        let result = f.engine.pay_melt_quote(TEST_MINT, &quote.quote_id).await.unwrap();
        assert!(result.is_pending());
        assert_eq!(totals(&f.proofs).await, (0, 102));
        assert_eq!(
            f.engine.check_pending_melt_by_quote(&quote.quote_id).await.unwrap(),
            Some(MeltPendingDecision::StayPending)
        );

        f.mint.settle_melt(&quote.quote_id, true);
        assert_eq!(
            f.engine.check_pending_melt_by_quote(&quote.quote_id).await.unwrap(),
            Some(MeltPendingDecision::Finalize)
        );
        // Reserve returned as change
        assert_eq!(totals(&f.proofs).await, (2, 0));
    }

    #[tokio::test]
    async fn test_pending_melt_then_failed_rolls_back() {
        let f = fixture(&[128]).await;
        f.mint.push_melt_outcome(MeltOutcome::Pending);
        let quote = f
            .engine
            .create_melt_quote(TEST_MINT, PaymentMethod::Bolt11, "lnbc100n1invoice")
            .await
            .unwrap();
        f.engine.pay_melt_quote(TEST_MINT, &quote.quote_id).await.unwrap();
        assert_eq!(totals(&f.proofs).await, (26, 102));

        f.mint.settle_melt(&quote.quote_id, false);
        let report = f.engine.recover_pending_melts().await.unwrap();
        assert_eq!(report.rolled_back.len(), 1);
        assert_eq!(totals(&f.proofs).await, (128, 0));
        assert_eq!(
            f.engine.check_pending_melt_by_quote(&quote.quote_id).await.unwrap(),
            Some(MeltPendingDecision::Rollback)
        );
    }

    #[tokio::test]
    async fn test_one_live_operation_per_quote() {
        let f = fixture(&[64, 32, 4, 2, 128]).await;
        let quote = f
            .engine
            .create_melt_quote(TEST_MINT, PaymentMethod::Bolt11, "lnbc100n1invoice")
            .await
            .unwrap();
        let op = f.engine.prepare_melt(TEST_MINT, &quote.quote_id).await.unwrap();
        let err = f
            .engine
            .prepare_melt(TEST_MINT, &quote.quote_id)
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::AlreadyInProgress { .. }));

        let op = f.engine.rollback_melt(&op.id).await.unwrap();
        assert_eq!(op.state, MeltState::RolledBack);
        assert_eq!(totals(&f.proofs).await, (230, 0));
        assert!(f.engine.prepare_melt(TEST_MINT, &quote.quote_id).await.is_ok());
    }

    /// A melt left pending at the mint, with every mint call slowed down
    async fn pending_melt(f: &Fixture) -> (MeltQuote, MeltOperation) {
        f.mint.push_melt_outcome(MeltOutcome::Pending);
        let quote = f
            .engine
            .create_melt_quote(TEST_MINT, PaymentMethod::Bolt11, "lnbc100n1invoice")
            .await
            .unwrap();
        let result = f.engine.pay_melt_quote(TEST_MINT, &quote.quote_id).await.unwrap();
        assert!(result.is_pending());
        f.mint.set_latency(Duration::from_millis(20));
        (quote, result.operation)
    }

    #[tokio::test]
    async fn test_concurrent_pending_checks_conflict() {
        let f = fixture(&[128]).await;
        let (quote, op) = pending_melt(&f).await;

        let (first, second) = tokio::join!(
            f.engine.check_pending_melt_by_quote(&quote.quote_id),
            f.engine.check_pending_melt_by_quote(&quote.quote_id)
        );
        assert_eq!(first.unwrap(), Some(MeltPendingDecision::StayPending));
        assert!(matches!(
            second.unwrap_err(),
            WalletError::AlreadyInProgress { .. }
        ));
        assert!(!f.engine.is_operation_locked(&op.id));
    }

    #[tokio::test]
    async fn test_concurrent_rollback_melt_conflicts() {
        let f = fixture(&[128]).await;
        let (quote, op) = pending_melt(&f).await;
        f.mint.settle_melt(&quote.quote_id, false);

        let (first, second) = tokio::join!(
            f.engine.rollback_melt(&op.id),
            f.engine.rollback_melt(&op.id)
        );
        assert_eq!(first.unwrap().state, MeltState::RolledBack);
        assert!(matches!(
            second.unwrap_err(),
            WalletError::AlreadyInProgress { .. }
        ));
        assert_eq!(totals(&f.proofs).await, (128, 0));
    }

    #[tokio::test]
    async fn test_concurrent_melt_recovery_conflicts() {
        let f = fixture(&[128]).await;
        let (_, op) = pending_melt(&f).await;

        let (first, second) = tokio::join!(
            f.engine.recover_pending_melts(),
            f.engine.recover_pending_melts()
        );
        assert_eq!(first.unwrap().still_pending, vec![op.id.clone()]);
        assert!(matches!(
            second.unwrap_err(),
            WalletError::AlreadyInProgress { .. }
        ));
        assert!(!f.engine.is_recovery_running());
    }

    #[tokio::test]
    async fn test_recovery_skips_melt_locked_by_check() {
        let f = fixture(&[128]).await;
        let (quote, op) = pending_melt(&f).await;

        let (checked, report) = tokio::join!(
            f.engine.check_pending_melt_by_quote(&quote.quote_id),
            f.engine.recover_pending_melts()
        );
        assert_eq!(checked.unwrap(), Some(MeltPendingDecision::StayPending));
        assert_eq!(report.unwrap().skipped, vec![op.id]);
    }

    #[tokio::test]
    async fn test_missing_quote_lookups_return_none() {
        let f = fixture(&[8]).await;
        assert!(f.engine.execute_melt_by_quote("missing").await.unwrap().is_none());
        assert!(f
            .engine
            .check_pending_melt_by_quote("missing")
            .await
            .unwrap()
            .is_none());
    }
}
