//! Wallet Service
//!
//! Balances, receiving tokens and sweeping funds from another seed.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::config::WalletConfig;
use crate::errors::{WalletError, WalletResult};
use crate::mint_client::MintConnector;
use crate::services::history::{self, HistoryService};
use crate::services::keyring::KeyRingService;
use crate::services::mints::MintService;
use crate::services::proofs::ProofService;
use crate::stores::{finish, RepositoryProvider, TxContext};
use crate::token::{p2pk_lock_pubkey, Token};
use crate::types::{
    sum_amounts, CashuProof, HistoryEntry, HistoryKind, MintBalance, MintProofState, ProofData,
    ProofState,
};
use crate::utils::{calculate_input_fee, normalize_mint_url, now_secs, split_amount};

/// Result of a receive or sweep
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceiveResult {
    pub mint_url: String,
    /// Value credited after fees
    pub amount: u64,
    pub fee: u64,
    pub proofs: Vec<ProofData>,
}

pub struct WalletService {
    repos: Arc<dyn RepositoryProvider>,
    connector: Arc<dyn MintConnector>,
    mints: Arc<MintService>,
    proofs: Arc<ProofService>,
    keyring: Arc<KeyRingService>,
    history: Arc<HistoryService>,
    config: Arc<WalletConfig>,
}

impl WalletService {
    pub fn new(
        repos: Arc<dyn RepositoryProvider>,
        connector: Arc<dyn MintConnector>,
        mints: Arc<MintService>,
        proofs: Arc<ProofService>,
        keyring: Arc<KeyRingService>,
        history: Arc<HistoryService>,
        config: Arc<WalletConfig>,
    ) -> Self {
        Self {
            repos,
            connector,
            mints,
            proofs,
            keyring,
            history,
            config,
        }
    }

    // =========================================================================
    // Balances
    // =========================================================================

    pub async fn get_balance(&self, mint_url: &str) -> WalletResult<MintBalance> {
        let mint_url = normalize_mint_url(mint_url)?;
        let proofs = self.proofs.get_proofs(&mint_url).await?;

        let mut balance = MintBalance::default();
        for proof in proofs.iter().filter(|p| p.state != ProofState::Spent) {
            if proof.is_spendable() {
                balance.spendable = balance.spendable.saturating_add(proof.amount);
            } else {
                balance.pending = balance.pending.saturating_add(proof.amount);
            }
        }
        balance.total = balance.spendable.saturating_add(balance.pending);
        Ok(balance)
    }

    /// Balance of every known mint
    pub async fn get_balances(&self) -> WalletResult<BTreeMap<String, MintBalance>> {
        let mut balances = BTreeMap::new();
        for mint in self.mints.get_mints().await? {
            let balance = self.get_balance(&mint.mint_url).await?;
            balances.insert(mint.mint_url, balance);
        }
        Ok(balances)
    }

    // =========================================================================
    // Receive
    // =========================================================================

    /// Claim a token into fresh wallet proofs
    ///
    /// The mint must be trusted. Proofs locked to a key in the keyring are
    /// signed before the swap; a lock to a foreign key fails with `KeyNotFound`.
    pub async fn receive(&self, encoded: &str) -> WalletResult<ReceiveResult> {
        let token = Token::decode(encoded)?;
        let mint_url = self.mints.require_trusted(&token.mint_url()?).await?;
        let keyset_ids: Vec<String> = self
            .mints
            .get_keysets(&mint_url)
            .await?
            .into_iter()
            .map(|k| k.id)
            .collect();
        let proofs = token.proofs(&keyset_ids)?;

        let mut inputs = Vec::with_capacity(proofs.len());
        for proof in proofs {
            match p2pk_lock_pubkey(&proof.secret) {
                Some(pubkey) => inputs.push(self.keyring.sign_proof(&proof, &pubkey).await?),
                None => inputs.push(proof),
            }
        }

        let result = self
            .swap_in(&mint_url, inputs, HistoryKind::Receive, Some(encoded.to_string()))
            .await?;
        log::info!(
            "Received {} {} from {} (fee {})",
            result.amount,
            self.config.unit,
            mint_url,
            result.fee
        );
        Ok(result)
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    /// Move every unspent proof derivable from `seed` into this wallet
    ///
    /// Returns `None` when the other seed holds nothing at the mint.
    pub async fn sweep(&self, mint_url: &str, seed: &[u8]) -> WalletResult<Option<ReceiveResult>> {
        let mint_url = self.mints.require_trusted(mint_url).await?;
        let restored = self.connector.restore_from_seed(&mint_url, seed).await?;
        if restored.is_empty() {
            return Ok(None);
        }

        let secrets: Vec<String> = restored.iter().map(|p| p.secret.clone()).collect();
        let states = self.connector.check_proof_states(&mint_url, &secrets).await?;
        let unspent: Vec<CashuProof> = restored
            .into_iter()
            .zip(states)
            .filter(|(_, state)| *state == MintProofState::Unspent)
            .map(|(proof, _)| proof)
            .collect();
        if unspent.is_empty() {
            log::info!("Nothing to sweep on {}", mint_url);
            return Ok(None);
        }

        let result = self
            .swap_in(&mint_url, unspent, HistoryKind::Receive, None)
            .await?;
        log::info!("Swept {} {} on {}", result.amount, self.config.unit, mint_url);
        Ok(Some(result))
    }

    /// Swap foreign proofs for wallet outputs and store them
    async fn swap_in(
        &self,
        mint_url: &str,
        inputs: Vec<CashuProof>,
        kind: HistoryKind,
        token: Option<String>,
    ) -> WalletResult<ReceiveResult> {
        if inputs.is_empty() {
            return Err(WalletError::validation("No proofs to receive"));
        }
        let total = sum_amounts(inputs.iter().map(|p| p.amount))?;
        let fees = self.proofs.keyset_fees(mint_url).await?;
        let as_data: Vec<ProofData> = inputs
            .iter()
            .map(|p| ProofData::from_cashu(mint_url, p.clone(), None, 0))
            .collect();
        let fee = calculate_input_fee(&as_data, &fees);
        if total <= fee {
            return Err(WalletError::validation(format!(
                "Token value {} does not cover the fee {}",
                total, fee
            )));
        }
        let amount = total - fee;

        let outputs = self
            .mints
            .prepare_outputs(mint_url, &split_amount(amount), &[])
            .await?;
        let signed = self
            .connector
            .swap(mint_url, &inputs, &outputs.primary)
            .await?;

        let now = now_secs();
        let proofs: Vec<ProofData> = signed
            .into_iter()
            .map(|p| ProofData::from_cashu(mint_url, p, None, now))
            .collect();

        let mut record = history::entry(
            history::receive_entry_id(),
            kind,
            mint_url,
            amount,
            &self.config.unit,
            "received",
        );
        record.token = token;

        let tx = self.repos.begin(None).await?;
        let result = self
            .store_received(tx.context(), mint_url, proofs.clone(), record)
            .await;
        let record = finish(tx, result).await?;

        self.proofs.emit_saved(
            mint_url,
            proofs
                .iter()
                .map(|p| (p.secret.clone(), ProofState::Ready))
                .collect(),
        );
        self.history.notify(&record);

        Ok(ReceiveResult {
            mint_url: mint_url.to_string(),
            amount,
            fee,
            proofs,
        })
    }

    async fn store_received(
        &self,
        ctx: &TxContext,
        mint_url: &str,
        proofs: Vec<ProofData>,
        record: HistoryEntry,
    ) -> WalletResult<HistoryEntry> {
        self.proofs.save_proofs(mint_url, proofs, Some(ctx)).await?;
        self.history.record(record, Some(ctx)).await
    }
}
