//! Send Operation Engine
//!
//! Sending ecash is a saga: select and reserve inputs, swap them at the mint
//! for exact send proofs plus change, then wait until the recipient claims the
//! send proofs. Every step is persisted so a crash between the swap request and
//! storing its result can be resolved from the operation record alone.
//!
//! ```text
//! init -> prepared -> executing -> pending -> finalized
//!            \            \           \
//!             +------------+-----------+--> rolled_back
//! ```
//!
//! `execute_prepared_send`, `rollback` and `finalize` take the per-operation
//! lock before doing anything else; a concurrent call on the same id fails with
//! `AlreadyInProgress`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::WalletConfig;
use crate::errors::{MintClientError, NutErrorCode, WalletError, WalletResult};
use crate::events::{EventBus, WalletEvent};
use crate::mint_client::MintConnector;
use crate::operations::locks::{OperationLocks, RecoveryLock};
use crate::operations::RecoveryReport;
use crate::services::history::{self, HistoryService};
use crate::services::mints::MintService;
use crate::services::proofs::ProofService;
use crate::stores::{finish, RepositoryProvider, TxContext};
use crate::token::Token;
use crate::types::{
    sum_amounts, CashuProof, HistoryEntry, HistoryKind, MintProofState, ProofData, ProofState,
    SendOperation, SendState,
};
use crate::utils::{calculate_input_fee, now_secs, split_amount};

const NON_TERMINAL: [SendState; 3] = [SendState::Prepared, SendState::Executing, SendState::Pending];

fn transition(op: &mut SendOperation, next: SendState) -> WalletResult<()> {
    if !op.state.can_transition_to(next) {
        return Err(WalletError::InvalidState {
            operation_id: op.id.clone(),
            expected: format!("state that can move to {}", next),
            actual: op.state.to_string(),
        });
    }
    log::debug!("Send {}: {} -> {}", op.id, op.state, next);
    op.state = next;
    op.updated_at = now_secs();
    Ok(())
}

fn require_state(op: &SendOperation, expected: SendState) -> WalletResult<()> {
    if op.state != expected {
        return Err(WalletError::InvalidState {
            operation_id: op.id.clone(),
            expected: expected.to_string(),
            actual: op.state.to_string(),
        });
    }
    Ok(())
}

fn secrets_of(proofs: &[ProofData]) -> Vec<String> {
    proofs.iter().map(|p| p.secret.clone()).collect()
}

/// Mint view of a set of proofs
struct MintView {
    any_spent: bool,
    all_spent: bool,
    any_pending: bool,
}

/// Proofs produced by a swap, ready to be stored
struct SwapOutcome {
    send: Vec<ProofData>,
    keep: Vec<ProofData>,
}

pub struct SendEngine {
    repos: Arc<dyn RepositoryProvider>,
    connector: Arc<dyn MintConnector>,
    events: Arc<EventBus>,
    mints: Arc<MintService>,
    proofs: Arc<ProofService>,
    history: Arc<HistoryService>,
    config: Arc<WalletConfig>,
    locks: OperationLocks,
    recovery: RecoveryLock,
}

impl SendEngine {
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
            recovery: RecoveryLock::new(),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub async fn get_operation(&self, operation_id: &str) -> WalletResult<Option<SendOperation>> {
        self.repos
            .repositories()
            .send_operations
            .get_send_operation(operation_id)
            .await
    }

    async fn load(&self, operation_id: &str) -> WalletResult<SendOperation> {
        self.get_operation(operation_id)
            .await?
            .ok_or_else(|| WalletError::OperationNotFound {
                operation_id: operation_id.to_string(),
            })
    }

    /// Prepared, executing and pending operations, oldest first
    pub async fn get_pending_operations(&self) -> WalletResult<Vec<SendOperation>> {
        let mut ops = self
            .repos
            .repositories()
            .send_operations
            .get_send_operations_by_state(&NON_TERMINAL)
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

    async fn save_operation(&self, op: &SendOperation) -> WalletResult<()> {
        self.repos
            .repositories()
            .send_operations
            .save_send_operation(op.clone())
            .await
    }

    // =========================================================================
    // Prepare
    // =========================================================================

    /// Select and reserve inputs for `amount` and persist a prepared operation
    pub async fn prepare_send(&self, mint_url: &str, amount: u64) -> WalletResult<SendOperation> {
        if amount == 0 {
            return Err(WalletError::validation("Send amount must be greater than zero"));
        }
        let mint = self.mints.get_mint_by_url(mint_url).await?;
        let selection = self
            .proofs
            .select_proofs_for_amount(&mint.mint_url, amount, false)
            .await?;

        let needs_swap = !selection.exact;
        let now = now_secs();
        let mut op = SendOperation {
            id: uuid::Uuid::new_v4().to_string(),
            mint_url: mint.mint_url.clone(),
            amount,
            needs_swap,
            fee: if needs_swap { selection.fee } else { 0 },
            input_amount: selection.total,
            input_secrets: selection.secrets(),
            send_secrets: Vec::new(),
            keep_secrets: Vec::new(),
            outputs: None,
            over_selected: selection.over_selected,
            state: SendState::Init,
            error: None,
            created_at: now,
            updated_at: now,
        };
        if selection.over_selected {
            log::info!(
                "Send {} over-selected {} for {}, the swap returns the excess as change",
                op.id,
                selection.total,
                amount
            );
        }

        let tx = self.repos.begin(None).await?;
        let result = self.persist_prepared(tx.context(), &mut op).await;
        finish(tx, result).await?;

        log::info!(
            "Prepared send {} of {} on {} ({} inputs, swap: {}, fee: {})",
            op.id,
            amount,
            op.mint_url,
            op.input_secrets.len(),
            op.needs_swap,
            op.fee
        );
        Ok(op)
    }

    async fn persist_prepared(&self, ctx: &TxContext, op: &mut SendOperation) -> WalletResult<()> {
        let tx = self.repos.begin(Some(ctx)).await?;
        let result = tx
            .repositories()
            .send_operations
            .save_send_operation(op.clone())
            .await;
        finish(tx, result).await?;

        self.proofs
            .reserve_proofs(&op.mint_url, &op.input_secrets, &op.id, Some(ctx))
            .await?;

        transition(op, SendState::Prepared)?;
        let tx = self.repos.begin(Some(ctx)).await?;
        let result = tx
            .repositories()
            .send_operations
            .save_send_operation(op.clone())
            .await;
        finish(tx, result).await
    }

    // =========================================================================
    // Execute
    // =========================================================================

    /// Produce the send proofs and move the operation to pending
    ///
    /// Returns the operation and the encoded token for the recipient.
    pub async fn execute_prepared_send(
        &self,
        operation_id: &str,
    ) -> WalletResult<(SendOperation, String)> {
        let _guard = self.locks.acquire(operation_id)?;

        let mut op = self.load(operation_id).await?;
        require_state(&op, SendState::Prepared)?;
        let prepared = op.clone();

        let inputs = self.reserved_inputs(&op).await?;

        let outcome = if op.needs_swap {
            self.swap_inputs(&mut op, &inputs).await?
        } else {
            SwapOutcome {
                send: inputs.clone(),
                keep: Vec::new(),
            }
        };

        let token = self.encode_token(&op.mint_url, &outcome.send)?;
        let spent_inputs = op.needs_swap;
        let record = self.store_pending(&mut op, &inputs, &outcome, &token).await?;

        self.events.emit(WalletEvent::SendPrepared {
            mint_url: op.mint_url.clone(),
            operation: prepared,
        });
        self.emit_pending_effects(&op, &inputs, &outcome, spent_inputs);
        self.events.emit(WalletEvent::SendPending {
            mint_url: op.mint_url.clone(),
            operation_id: op.id.clone(),
            token: token.clone(),
        });
        self.history.notify(&record);

        log::info!("Send {} pending: {} on {}", op.id, op.amount, op.mint_url);
        Ok((op, token))
    }

    /// Inputs of a prepared operation, verified to still be held by it
    async fn reserved_inputs(&self, op: &SendOperation) -> WalletResult<Vec<ProofData>> {
        let inputs = self
            .proofs
            .get_proofs_by_secrets(&op.mint_url, &op.input_secrets)
            .await?;
        if inputs.len() != op.input_secrets.len() {
            return Err(WalletError::Storage(format!(
                "Send {} references {} inputs, {} found",
                op.id,
                op.input_secrets.len(),
                inputs.len()
            )));
        }
        if let Some(foreign) = inputs
            .iter()
            .find(|p| p.used_by_operation_id.as_deref() != Some(op.id.as_str()))
        {
            return Err(WalletError::ReservationConflict {
                secret: crate::utils::short_secret(&foreign.secret).to_string(),
                reason: format!("input no longer reserved by send {}", op.id),
            });
        }
        Ok(inputs)
    }

    /// Swap the inputs for send and keep proofs
    ///
    /// Outputs are persisted on the operation, now executing, before the mint is
    /// contacted. On a mint error the operation stays executing for recovery.
    async fn swap_inputs(
        &self,
        op: &mut SendOperation,
        inputs: &[ProofData],
    ) -> WalletResult<SwapOutcome> {
        let change = op
            .input_amount
            .checked_sub(op.amount)
            .and_then(|v| v.checked_sub(op.fee))
            .ok_or_else(|| {
                WalletError::validation(format!(
                    "Inputs {} do not cover {} plus fee {}",
                    op.input_amount, op.amount, op.fee
                ))
            })?;

        let outputs = self
            .mints
            .prepare_outputs(&op.mint_url, &split_amount(op.amount), &split_amount(change))
            .await?;
        transition(op, SendState::Executing)?;
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
        let mut send = Vec::with_capacity(outputs.primary.len());
        let mut keep = Vec::with_capacity(outputs.keep.len());
        for (i, proof) in signed.into_iter().enumerate() {
            let mut data = ProofData::from_cashu(&op.mint_url, proof, Some(op.id.clone()), now);
            if i < outputs.primary.len() {
                data.state = ProofState::Inflight;
                data.used_by_operation_id = Some(op.id.clone());
                send.push(data);
            } else {
                keep.push(data);
            }
        }
        Ok(SwapOutcome { send, keep })
    }

    async fn record_failure(&self, op: &mut SendOperation, error: WalletError) -> WalletError {
        log::warn!("Send {} failed while {}: {}", op.id, op.state, error);
        op.error = Some(error.to_string());
        op.updated_at = now_secs();
        if let Err(save_err) = self.save_operation(op).await {
            log::error!("Could not record failure of send {}: {}", op.id, save_err);
        }
        error
    }

    fn encode_token(&self, mint_url: &str, send: &[ProofData]) -> WalletResult<String> {
        let proofs: Vec<CashuProof> = send.iter().map(ProofData::to_cashu).collect();
        Ok(Token::new(mint_url, &proofs, &self.config.unit, None)?.encode())
    }

    fn history_record(&self, op: &SendOperation, token: Option<String>) -> HistoryEntry {
        let mut record = history::entry(
            history::send_entry_id(&op.id),
            HistoryKind::Send,
            &op.mint_url,
            op.amount,
            &self.config.unit,
            op.state.as_str(),
        );
        record.operation_id = Some(op.id.clone());
        record.token = token;
        record
    }

    /// Apply the result of execution in one transaction and move to pending
    async fn store_pending(
        &self,
        op: &mut SendOperation,
        inputs: &[ProofData],
        outcome: &SwapOutcome,
        token: &str,
    ) -> WalletResult<HistoryEntry> {
        if op.state == SendState::Prepared {
            transition(op, SendState::Executing)?;
        }
        transition(op, SendState::Pending)?;
        op.send_secrets = secrets_of(&outcome.send);
        op.keep_secrets = secrets_of(&outcome.keep);
        op.outputs = None;
        op.error = None;
        let record = self.history_record(op, Some(token.to_string()));

        let tx = self.repos.begin(None).await?;
        let result = self
            .persist_pending(tx.context(), op, inputs, outcome, record)
            .await;
        finish(tx, result).await
    }

    async fn persist_pending(
        &self,
        ctx: &TxContext,
        op: &SendOperation,
        inputs: &[ProofData],
        outcome: &SwapOutcome,
        record: HistoryEntry,
    ) -> WalletResult<HistoryEntry> {
        let input_secrets = secrets_of(inputs);
        if op.needs_swap {
            self.proofs
                .set_proof_state(&op.mint_url, &input_secrets, ProofState::Spent, Some(ctx))
                .await?;
            let mut created = outcome.keep.clone();
            created.extend(outcome.send.iter().cloned());
            self.proofs
                .save_proofs(&op.mint_url, created, Some(ctx))
                .await?;
        } else {
            self.proofs
                .set_proof_state(&op.mint_url, &input_secrets, ProofState::Inflight, Some(ctx))
                .await?;
        }
        self.save_in(ctx, op).await?;
        self.history.record(record, Some(ctx)).await
    }

    async fn save_in(&self, ctx: &TxContext, op: &SendOperation) -> WalletResult<()> {
        let tx = self.repos.begin(Some(ctx)).await?;
        let result = tx
            .repositories()
            .send_operations
            .save_send_operation(op.clone())
            .await;
        finish(tx, result).await
    }

    fn emit_pending_effects(
        &self,
        op: &SendOperation,
        inputs: &[ProofData],
        outcome: &SwapOutcome,
        spent_inputs: bool,
    ) {
        let input_secrets = secrets_of(inputs);
        if spent_inputs {
            self.proofs
                .emit_state_changed(&op.mint_url, input_secrets, ProofState::Spent);
            let saved = outcome
                .keep
                .iter()
                .chain(outcome.send.iter())
                .map(|p| (p.secret.clone(), p.state))
                .collect();
            self.proofs.emit_saved(&op.mint_url, saved);
        } else {
            self.proofs
                .emit_state_changed(&op.mint_url, input_secrets, ProofState::Inflight);
        }
    }

    /// Prepare and execute in one call
    ///
    /// If execution fails before the operation leaves `prepared`, the
    /// reservation is released again.
    pub async fn send(&self, mint_url: &str, amount: u64) -> WalletResult<(SendOperation, String)> {
        let op = self.prepare_send(mint_url, amount).await?;
        match self.execute_prepared_send(&op.id).await {
            Ok(result) => Ok(result),
            Err(e) => {
                if let Ok(Some(current)) = self.get_operation(&op.id).await {
                    if current.state == SendState::Prepared {
                        if let Err(rollback_err) = self.rollback(&op.id).await {
                            log::error!("Rollback of send {} failed: {}", op.id, rollback_err);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // Mint checks
    // =========================================================================

    async fn mint_view(&self, mint_url: &str, secrets: &[String]) -> WalletResult<MintView> {
        let states = self.connector.check_proof_states(mint_url, secrets).await?;
        Ok(MintView {
            any_spent: states.iter().any(|s| *s == MintProofState::Spent),
            all_spent: !states.is_empty() && states.iter().all(|s| *s == MintProofState::Spent),
            any_pending: states.iter().any(|s| *s == MintProofState::Pending),
        })
    }

    fn pending_at_mint(op: &SendOperation) -> WalletError {
        WalletError::Mint(MintClientError::with_code(
            NutErrorCode::TokenPending,
            format!("Proofs of send {} are pending at the mint", op.id),
        ))
    }

    /// Signatures the mint already issued for the operation's outputs
    async fn restore_outputs(&self, op: &SendOperation) -> WalletResult<Vec<Option<CashuProof>>> {
        let Some(outputs) = &op.outputs else {
            return Ok(Vec::new());
        };
        let all = outputs.all();
        let restored = self.connector.restore(&op.mint_url, &all).await?;
        if restored.len() != all.len() {
            return Err(WalletError::Crypto(format!(
                "Mint restored {} of {} outputs",
                restored.len(),
                all.len()
            )));
        }
        Ok(restored)
    }

    /// Restored outputs that the mint had signed, as ready wallet proofs
    async fn restored_proofs(&self, op: &SendOperation) -> WalletResult<Vec<ProofData>> {
        let now = now_secs();
        Ok(self
            .restore_outputs(op)
            .await?
            .into_iter()
            .flatten()
            .map(|p| ProofData::from_cashu(&op.mint_url, p, Some(op.id.clone()), now))
            .collect())
    }

    // =========================================================================
    // Rollback
    // =========================================================================

    /// Undo a send that has not been finalized
    ///
    /// A pending send whose proofs the recipient already claimed cannot be
    /// rolled back and fails with `SendAlreadyClaimed`.
    pub async fn rollback(&self, operation_id: &str) -> WalletResult<SendOperation> {
        let _guard = self.locks.acquire(operation_id)?;
        let op = self.load(operation_id).await?;
        match op.state {
            SendState::Prepared => self.rollback_prepared(op).await,
            SendState::Executing => self.rollback_executing(op).await,
            SendState::Pending => self.rollback_pending(op).await,
            other => Err(WalletError::InvalidState {
                operation_id: op.id.clone(),
                expected: "prepared, executing or pending".to_string(),
                actual: other.to_string(),
            }),
        }
    }

    async fn rollback_prepared(&self, mut op: SendOperation) -> WalletResult<SendOperation> {
        transition(&mut op, SendState::RolledBack)?;
        let tx = self.repos.begin(None).await?;
        let result = self.persist_released(tx.context(), &op).await;
        finish(tx, result).await?;

        log::info!("Rolled back prepared send {}", op.id);
        self.emit_rolled_back(&op);
        Ok(op)
    }

    async fn persist_released(&self, ctx: &TxContext, op: &SendOperation) -> WalletResult<()> {
        self.proofs
            .release_proofs(&op.mint_url, &op.input_secrets, Some(ctx))
            .await?;
        self.proofs
            .set_proof_state(&op.mint_url, &op.input_secrets, ProofState::Ready, Some(ctx))
            .await?;
        self.save_in(ctx, op).await
    }

    /// The swap may or may not have happened; the inputs' state at the mint decides
    async fn rollback_executing(&self, mut op: SendOperation) -> WalletResult<SendOperation> {
        let view = self.mint_view(&op.mint_url, &op.input_secrets).await?;
        if view.any_pending {
            return Err(Self::pending_at_mint(&op));
        }
        if !view.any_spent {
            transition(&mut op, SendState::RolledBack)?;
            let tx = self.repos.begin(None).await?;
            let result = self.persist_released(tx.context(), &op).await;
            finish(tx, result).await?;
            log::info!("Rolled back send {}, swap never reached the mint", op.id);
            self.emit_rolled_back(&op);
            return Ok(op);
        }

        // Swap went through; keep every output as ready change
        let restored = self.restore_outputs(&op).await?;
        let now = now_secs();
        let recovered: Vec<ProofData> = restored
            .into_iter()
            .flatten()
            .map(|p| ProofData::from_cashu(&op.mint_url, p, Some(op.id.clone()), now))
            .collect();
        let expected = op.outputs.as_ref().map_or(0, |o| o.len());
        if recovered.len() < expected {
            log::warn!(
                "Send {}: mint restored {} of {} outputs",
                op.id,
                recovered.len(),
                expected
            );
        }

        transition(&mut op, SendState::RolledBack)?;
        op.keep_secrets = secrets_of(&recovered);
        let record = self.history_record(&op, None);
        let tx = self.repos.begin(None).await?;
        let result = self
            .persist_reclaimed(tx.context(), &op, &op.input_secrets, recovered.clone(), record)
            .await;
        let record = finish(tx, result).await?;

        log::info!(
            "Rolled back send {} after swap, recovered {}",
            op.id,
            sum_amounts(recovered.iter().map(|p| p.amount))?
        );
        self.proofs
            .emit_state_changed(&op.mint_url, op.input_secrets.clone(), ProofState::Spent);
        self.proofs.emit_saved(
            &op.mint_url,
            recovered.iter().map(|p| (p.secret.clone(), p.state)).collect(),
        );
        self.history.notify(&record);
        self.emit_rolled_back(&op);
        Ok(op)
    }

    /// Reclaim unclaimed send proofs by swapping them back into the wallet
    async fn rollback_pending(&self, mut op: SendOperation) -> WalletResult<SendOperation> {
        let send_proofs = self
            .proofs
            .get_proofs_by_secrets(&op.mint_url, &op.send_secrets)
            .await?;
        let view = self.mint_view(&op.mint_url, &op.send_secrets).await?;

        let reclaimed: Vec<ProofData> = if view.any_spent {
            // Spent either by the recipient or by an earlier reclaim swap whose
            // response was lost; only the latter can be restored.
            let restored = self.restore_outputs(&op).await?;
            if restored.is_empty() || restored.iter().any(Option::is_none) {
                log::info!("Send {} was already claimed, nothing to roll back", op.id);
                return Err(WalletError::SendAlreadyClaimed {
                    operation_id: op.id.clone(),
                });
            }
            let now = now_secs();
            restored
                .into_iter()
                .flatten()
                .map(|p| ProofData::from_cashu(&op.mint_url, p, Some(op.id.clone()), now))
                .collect()
        } else if view.any_pending {
            return Err(Self::pending_at_mint(&op));
        } else {
            let fees: HashMap<String, u64> = self.proofs.keyset_fees(&op.mint_url).await?;
            let fee = calculate_input_fee(&send_proofs, &fees);
            let total = sum_amounts(send_proofs.iter().map(|p| p.amount))?;
            let amount = total.saturating_sub(fee);
            if amount == 0 {
                return self.return_send_proofs(op).await;
            }

            let outputs = self
                .mints
                .prepare_outputs(&op.mint_url, &split_amount(amount), &[])
                .await?;
            op.outputs = Some(outputs.clone());
            op.updated_at = now_secs();
            self.save_operation(&op).await?;

            let cashu: Vec<CashuProof> = send_proofs.iter().map(ProofData::to_cashu).collect();
            let signed = match self
                .connector
                .swap(&op.mint_url, &cashu, &outputs.primary)
                .await
            {
                Ok(signed) => signed,
                Err(e) => return Err(self.record_failure(&mut op, e.into()).await),
            };
            let now = now_secs();
            signed
                .into_iter()
                .map(|p| ProofData::from_cashu(&op.mint_url, p, Some(op.id.clone()), now))
                .collect()
        };

        self.complete_reclaim(op, reclaimed).await
    }

    /// Store reclaimed proofs, mark the send proofs spent and close the operation
    async fn complete_reclaim(
        &self,
        mut op: SendOperation,
        reclaimed: Vec<ProofData>,
    ) -> WalletResult<SendOperation> {
        transition(&mut op, SendState::RolledBack)?;
        op.error = None;
        op.outputs = None;
        let record = self.history_record(&op, None);
        let send_secrets = op.send_secrets.clone();
        let tx = self.repos.begin(None).await?;
        let result = self
            .persist_reclaimed(tx.context(), &op, &send_secrets, reclaimed.clone(), record)
            .await;
        let record = finish(tx, result).await?;

        log::info!(
            "Rolled back pending send {}, reclaimed {}",
            op.id,
            sum_amounts(reclaimed.iter().map(|p| p.amount))?
        );
        self.proofs
            .emit_state_changed(&op.mint_url, send_secrets, ProofState::Spent);
        self.proofs.emit_saved(
            &op.mint_url,
            reclaimed.iter().map(|p| (p.secret.clone(), p.state)).collect(),
        );
        self.history.notify(&record);
        self.emit_rolled_back(&op);
        Ok(op)
    }

    /// Send proofs too small to pay a reclaim swap go back to ready as they are
    async fn return_send_proofs(&self, mut op: SendOperation) -> WalletResult<SendOperation> {
        transition(&mut op, SendState::RolledBack)?;
        let record = self.history_record(&op, None);
        let tx = self.repos.begin(None).await?;
        let result = self.persist_returned(tx.context(), &op, record).await;
        let record = finish(tx, result).await?;

        self.proofs
            .emit_state_changed(&op.mint_url, op.send_secrets.clone(), ProofState::Ready);
        self.history.notify(&record);
        self.emit_rolled_back(&op);
        Ok(op)
    }

    async fn persist_returned(
        &self,
        ctx: &TxContext,
        op: &SendOperation,
        record: HistoryEntry,
    ) -> WalletResult<HistoryEntry> {
        self.proofs
            .release_proofs(&op.mint_url, &op.send_secrets, Some(ctx))
            .await?;
        self.proofs
            .set_proof_state(&op.mint_url, &op.send_secrets, ProofState::Ready, Some(ctx))
            .await?;
        self.save_in(ctx, op).await?;
        self.history.record(record, Some(ctx)).await
    }

    async fn persist_reclaimed(
        &self,
        ctx: &TxContext,
        op: &SendOperation,
        spent: &[String],
        reclaimed: Vec<ProofData>,
        record: HistoryEntry,
    ) -> WalletResult<HistoryEntry> {
        self.proofs
            .set_proof_state(&op.mint_url, spent, ProofState::Spent, Some(ctx))
            .await?;
        self.proofs
            .save_proofs(&op.mint_url, reclaimed, Some(ctx))
            .await?;
        self.save_in(ctx, op).await?;
        self.history.record(record, Some(ctx)).await
    }

    fn emit_rolled_back(&self, op: &SendOperation) {
        self.events.emit(WalletEvent::SendRolledBack {
            mint_url: op.mint_url.clone(),
            operation_id: op.id.clone(),
        });
    }

    // =========================================================================
    // Finalize
    // =========================================================================

    /// Finalize a pending send once the mint reports every send proof spent
    ///
    /// Safe to call speculatively: an unclaimed send is returned unchanged.
    pub async fn finalize(&self, operation_id: &str) -> WalletResult<SendOperation> {
        let _guard = self.locks.acquire(operation_id)?;
        let mut op = self.load(operation_id).await?;
        if op.state == SendState::Finalized {
            return Ok(op);
        }
        require_state(&op, SendState::Pending)?;

        let view = self.mint_view(&op.mint_url, &op.send_secrets).await?;
        if !view.all_spent {
            log::debug!("Send {} not claimed yet", op.id);
            return Ok(op);
        }

        // Spent by our own reclaim swap whose response never arrived
        if op.outputs.is_some() {
            let reclaimed = self.restored_proofs(&op).await?;
            if !reclaimed.is_empty() {
                log::warn!("Send {} was reclaimed by an interrupted rollback", op.id);
                return self.complete_reclaim(op, reclaimed).await;
            }
        }

        transition(&mut op, SendState::Finalized)?;
        let record = self.history_record(&op, None);
        let tx = self.repos.begin(None).await?;
        let result = self.persist_finalized(tx.context(), &op, record).await;
        let record = finish(tx, result).await?;

        log::info!("Send {} finalized", op.id);
        self.proofs
            .emit_state_changed(&op.mint_url, op.send_secrets.clone(), ProofState::Spent);
        self.events.emit(WalletEvent::SendFinalized {
            mint_url: op.mint_url.clone(),
            operation_id: op.id.clone(),
        });
        self.history.notify(&record);
        Ok(op)
    }

    async fn persist_finalized(
        &self,
        ctx: &TxContext,
        op: &SendOperation,
        record: HistoryEntry,
    ) -> WalletResult<HistoryEntry> {
        self.proofs
            .set_proof_state(&op.mint_url, &op.send_secrets, ProofState::Spent, Some(ctx))
            .await?;
        self.save_in(ctx, op).await?;
        self.history.record(record, Some(ctx)).await
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Resolve every non-terminal operation left from a previous session
    ///
    /// Only one pass runs at a time. Prepared operations are left for an
    /// explicit rollback; operations locked by a running call are skipped.
    pub async fn recover_pending_operations(&self) -> WalletResult<RecoveryReport> {
        let _guard = self.recovery.acquire("send-recovery")?;
        let mut report = RecoveryReport::default();

        for op in self.get_pending_operations().await? {
            if self.locks.is_locked(&op.id) {
                report.skipped.push(op.id);
                continue;
            }
            let outcome = match op.state {
                SendState::Pending => self.finalize(&op.id).await,
                SendState::Executing => self.resume_executing(&op.id).await,
                _ => {
                    report.skipped.push(op.id);
                    continue;
                }
            };
            match outcome {
                Ok(updated) => match updated.state {
                    SendState::Finalized => report.finalized.push(updated.id),
                    SendState::RolledBack => report.rolled_back.push(updated.id),
                    SendState::Pending if op.state == SendState::Executing => {
                        report.resumed.push(updated.id)
                    }
                    _ => report.still_pending.push(updated.id),
                },
                Err(e) => {
                    log::warn!("Recovery of send {} failed: {}", op.id, e);
                    report.errors.push((op.id, e.to_string()));
                }
            }
        }

        log::info!(
            "Send recovery: {} finalized, {} rolled back, {} resumed, {} pending, {} errors",
            report.finalized.len(),
            report.rolled_back.len(),
            report.resumed.len(),
            report.still_pending.len(),
            report.errors.len()
        );
        Ok(report)
    }

    /// Move an interrupted swap forward, or roll it back if it never happened
    async fn resume_executing(&self, operation_id: &str) -> WalletResult<SendOperation> {
        let _guard = self.locks.acquire(operation_id)?;
        let mut op = self.load(operation_id).await?;
        require_state(&op, SendState::Executing)?;

        let view = self.mint_view(&op.mint_url, &op.input_secrets).await?;
        if view.any_pending {
            return Err(Self::pending_at_mint(&op));
        }
        if !view.any_spent {
            return self.rollback_executing(op).await;
        }

        let Some(outputs) = op.outputs.clone() else {
            return self.rollback_executing(op).await;
        };
        let restored = self.restore_outputs(&op).await?;
        let (primary, keep) = restored.split_at(outputs.primary.len());
        if primary.iter().any(Option::is_none) {
            log::warn!("Send {}: send outputs not restorable, keeping them as change", op.id);
            return self.rollback_executing(op).await;
        }

        let now = now_secs();
        let send: Vec<ProofData> = primary
            .iter()
            .flatten()
            .map(|p| {
                let mut data = ProofData::from_cashu(&op.mint_url, p.clone(), Some(op.id.clone()), now);
                data.state = ProofState::Inflight;
                data.used_by_operation_id = Some(op.id.clone());
                data
            })
            .collect();
        let keep: Vec<ProofData> = keep
            .iter()
            .flatten()
            .map(|p| ProofData::from_cashu(&op.mint_url, p.clone(), Some(op.id.clone()), now))
            .collect();

        let inputs = self
            .proofs
            .get_proofs_by_secrets(&op.mint_url, &op.input_secrets)
            .await?;
        let outcome = SwapOutcome { send, keep };
        let token = self.encode_token(&op.mint_url, &outcome.send)?;
        let record = self.store_pending(&mut op, &inputs, &outcome, &token).await?;

        log::info!("Resumed send {} to pending", op.id);
        self.emit_pending_effects(&op, &inputs, &outcome, true);
        self.events.emit(WalletEvent::SendPending {
            mint_url: op.mint_url.clone(),
            operation_id: op.id.clone(),
            token,
        });
        self.history.notify(&record);
        Ok(op)
    }
}
