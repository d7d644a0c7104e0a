//! Proof Service
//!
//! Proof lifecycle: save, reserve, release, state transitions, selection and
//! reconciliation of inflight proofs against the mint.
//!
//! Methods taking a `parent` context roll up into the caller's transaction.
//! Events are emitted only by the outermost scope; when rolled up, the caller
//! emits after its own commit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::config::WalletConfig;
use crate::errors::{WalletError, WalletResult};
use crate::events::{EventBus, WalletEvent};
use crate::mint_client::MintConnector;
use crate::stores::{finish, Repositories, RepositoryProvider, TxContext};
use crate::types::{sum_amounts, MintProofState, ProofData, ProofState};
use crate::utils::{calculate_input_fee, short_secret};

// =============================================================================
// Selection
// =============================================================================

/// Proofs chosen to cover an amount
#[derive(Debug, Clone, PartialEq)]
pub struct ProofSelection {
    pub proofs: Vec<ProofData>,
    pub total: u64,
    /// Input fee the mint charges for spending the selection
    pub fee: u64,
    /// Selection sums to exactly the requested amount (plus fee when fees apply)
    pub exact: bool,
    /// Total exceeds `(amount + fee) * over_selection_ratio`
    pub over_selected: bool,
}

impl ProofSelection {
    pub fn secrets(&self) -> Vec<String> {
        self.proofs.iter().map(|p| p.secret.clone()).collect()
    }
}

/// Largest-first exact match; denominations are powers of two
fn exact_match(candidates: &[ProofData], target: u64) -> Option<Vec<ProofData>> {
    let mut remaining = target;
    let mut picked = Vec::new();
    for proof in candidates {
        if remaining == 0 {
            break;
        }
        if proof.amount <= remaining {
            remaining -= proof.amount;
            picked.push(proof.clone());
        }
    }
    (remaining == 0 && !picked.is_empty()).then_some(picked)
}

/// Smallest single proof covering `need`, else largest-first accumulation
fn cover(candidates: &[ProofData], need: u64) -> Option<Vec<ProofData>> {
    if let Some(single) = candidates.iter().rev().find(|p| p.amount >= need) {
        return Some(vec![single.clone()]);
    }
    let mut picked = Vec::new();
    let mut total = 0u64;
    for proof in candidates {
        picked.push(proof.clone());
        total = total.saturating_add(proof.amount);
        if total >= need {
            return Some(picked);
        }
    }
    None
}

/// Select spendable proofs for `amount`
///
/// An exact match is preferred. With `include_fees` the exact match must also
/// cover the input fee of the selected proofs. A covering selection always
/// accounts for the input fee since it will be spent in a swap or melt.
pub fn select_proofs(
    available: &[ProofData],
    amount: u64,
    fee_ppk_by_keyset: &HashMap<String, u64>,
    include_fees: bool,
    over_selection_ratio: f64,
) -> WalletResult<ProofSelection> {
    if amount == 0 {
        return Err(WalletError::validation("Amount must be greater than zero"));
    }

    let mut candidates: Vec<ProofData> = available
        .iter()
        .filter(|p| p.is_spendable())
        .cloned()
        .collect();
    candidates.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.secret.cmp(&b.secret)));
    let available_total = sum_amounts(candidates.iter().map(|p| p.amount))?;

    let build = |proofs: Vec<ProofData>, fee: u64, exact: bool| -> WalletResult<ProofSelection> {
        let total = sum_amounts(proofs.iter().map(|p| p.amount))?;
        let target = amount.saturating_add(fee) as f64;
        Ok(ProofSelection {
            over_selected: total as f64 > target * over_selection_ratio,
            proofs,
            total,
            fee,
            exact,
        })
    };

    // Exact match
    if include_fees {
        let mut fee_guess = 0u64;
        for _ in 0..4 {
            let Some(picked) = exact_match(&candidates, amount.saturating_add(fee_guess)) else {
                break;
            };
            let fee = calculate_input_fee(&picked, fee_ppk_by_keyset);
            if fee == fee_guess {
                return build(picked, fee, true);
            }
            fee_guess = fee;
        }
    } else if let Some(picked) = exact_match(&candidates, amount) {
        return build(picked, 0, true);
    }

    // Cover amount + fee, re-selecting until the fee of the selection is covered
    let mut fee = 0u64;
    for _ in 0..=candidates.len() {
        let need = amount.saturating_add(fee);
        let picked = cover(&candidates, need).ok_or(WalletError::InsufficientFunds {
            available: available_total,
            required: need,
        })?;
        let picked_fee = calculate_input_fee(&picked, fee_ppk_by_keyset);
        let picked_total = sum_amounts(picked.iter().map(|p| p.amount))?;
        if picked_total >= amount.saturating_add(picked_fee) {
            return build(picked, picked_fee, false);
        }
        fee = picked_fee;
    }

    Err(WalletError::InsufficientFunds {
        available: available_total,
        required: amount.saturating_add(fee),
    })
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Outcome of `check_inflight_proofs`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProofReconcileReport {
    pub checked: usize,
    /// Secrets now marked spent
    pub spent: Vec<String>,
    /// Secrets returned to ready
    pub restored: Vec<String>,
    /// Secrets the mint still reports pending
    pub pending: Vec<String>,
}

// =============================================================================
// Service
// =============================================================================

pub struct ProofService {
    repos: Arc<dyn RepositoryProvider>,
    connector: Arc<dyn MintConnector>,
    events: Arc<EventBus>,
    config: Arc<WalletConfig>,
}

impl ProofService {
    pub fn new(
        repos: Arc<dyn RepositoryProvider>,
        connector: Arc<dyn MintConnector>,
        events: Arc<EventBus>,
        config: Arc<WalletConfig>,
    ) -> Self {
        Self {
            repos,
            connector,
            events,
            config,
        }
    }

    /// Insert a batch of proofs for a mint; all or nothing
    pub async fn save_proofs(
        &self,
        mint_url: &str,
        mut proofs: Vec<ProofData>,
        parent: Option<&TxContext>,
    ) -> WalletResult<()> {
        if proofs.is_empty() {
            return Ok(());
        }
        for proof in &mut proofs {
            if proof.secret.is_empty() {
                return Err(WalletError::validation("Proof secret is empty"));
            }
            if proof.amount == 0 {
                return Err(WalletError::validation("Proof amount must be greater than zero"));
            }
            proof.mint_url = mint_url.to_string();
        }

        let saved: Vec<(String, ProofState)> =
            proofs.iter().map(|p| (p.secret.clone(), p.state)).collect();

        let tx = self.repos.begin(parent).await?;
        let outermost = !tx.context().is_nested();
        let result = tx.repositories().proofs.save_proofs(proofs).await;
        finish(tx, result).await?;

        log::info!("Saved {} proofs for {}", saved.len(), mint_url);
        if outermost {
            self.emit_saved(mint_url, saved);
        }
        Ok(())
    }

    /// Reserve proofs for an operation; all or nothing
    ///
    /// Every proof must exist, be ready and carry no reservation.
    pub async fn reserve_proofs(
        &self,
        mint_url: &str,
        secrets: &[String],
        operation_id: &str,
        parent: Option<&TxContext>,
    ) -> WalletResult<()> {
        if operation_id.is_empty() {
            return Err(WalletError::validation("Operation id is empty"));
        }
        if secrets.is_empty() {
            return Err(WalletError::validation("No proofs to reserve"));
        }

        let tx = self.repos.begin(parent).await?;
        let result = Self::reserve_in(tx.repositories(), mint_url, secrets, operation_id).await;
        finish(tx, result).await?;

        log::debug!(
            "Reserved {} proofs on {} for operation {}",
            secrets.len(),
            mint_url,
            operation_id
        );
        Ok(())
    }

    async fn reserve_in(
        repos: &Repositories,
        mint_url: &str,
        secrets: &[String],
        operation_id: &str,
    ) -> WalletResult<()> {
        let unique: HashSet<&String> = secrets.iter().collect();
        if unique.len() != secrets.len() {
            return Err(WalletError::validation("Duplicate secret in reservation"));
        }

        let found: HashMap<String, ProofData> = repos
            .proofs
            .get_proofs_by_secrets(mint_url, secrets)
            .await?
            .into_iter()
            .map(|p| (p.secret.clone(), p))
            .collect();

        for secret in secrets {
            let conflict = |reason: String| WalletError::ReservationConflict {
                secret: short_secret(secret).to_string(),
                reason,
            };
            let proof = found
                .get(secret)
                .ok_or_else(|| conflict("proof not found".to_string()))?;
            if proof.state != ProofState::Ready {
                return Err(conflict(format!("proof is {}", proof.state)));
            }
            if let Some(owner) = &proof.used_by_operation_id {
                return Err(conflict(format!("reserved by operation {}", owner)));
            }
        }

        repos
            .proofs
            .set_reservation(mint_url, secrets, Some(operation_id))
            .await
    }

    /// Clear the reservation back-reference
    pub async fn release_proofs(
        &self,
        mint_url: &str,
        secrets: &[String],
        parent: Option<&TxContext>,
    ) -> WalletResult<()> {
        let tx = self.repos.begin(parent).await?;
        let result = tx
            .repositories()
            .proofs
            .set_reservation(mint_url, secrets, None)
            .await;
        finish(tx, result).await?;
        log::debug!("Released {} proofs on {}", secrets.len(), mint_url);
        Ok(())
    }

    pub async fn set_proof_state(
        &self,
        mint_url: &str,
        secrets: &[String],
        state: ProofState,
        parent: Option<&TxContext>,
    ) -> WalletResult<()> {
        if secrets.is_empty() {
            return Ok(());
        }
        let tx = self.repos.begin(parent).await?;
        let outermost = !tx.context().is_nested();
        let result = tx
            .repositories()
            .proofs
            .set_proof_state(mint_url, secrets, state)
            .await;
        finish(tx, result).await?;

        log::debug!("Marked {} proofs {} on {}", secrets.len(), state, mint_url);
        if outermost {
            self.emit_state_changed(mint_url, secrets.to_vec(), state);
        }
        Ok(())
    }

    pub async fn delete_proofs(&self, mint_url: &str, secrets: &[String]) -> WalletResult<()> {
        self.repos
            .repositories()
            .proofs
            .delete_proofs(mint_url, secrets)
            .await
    }

    /// Remove every proof of a keyset the mint no longer honours
    pub async fn wipe_proofs_by_keyset_id(&self, keyset_id: &str) -> WalletResult<usize> {
        let removed = self
            .repos
            .repositories()
            .proofs
            .delete_proofs_by_keyset(keyset_id)
            .await?;
        if removed > 0 {
            log::warn!("Wiped {} proofs of retired keyset {}", removed, keyset_id);
        }
        Ok(removed)
    }

    pub async fn get_proofs(&self, mint_url: &str) -> WalletResult<Vec<ProofData>> {
        self.repos.repositories().proofs.get_proofs(mint_url).await
    }

    pub async fn get_proofs_by_secrets(
        &self,
        mint_url: &str,
        secrets: &[String],
    ) -> WalletResult<Vec<ProofData>> {
        self.repos
            .repositories()
            .proofs
            .get_proofs_by_secrets(mint_url, secrets)
            .await
    }

    /// Ready, unreserved proofs of a mint
    pub async fn get_spendable_proofs(&self, mint_url: &str) -> WalletResult<Vec<ProofData>> {
        Ok(self
            .repos
            .repositories()
            .proofs
            .get_proofs_by_state(Some(mint_url), ProofState::Ready)
            .await?
            .into_iter()
            .filter(|p| !p.is_reserved())
            .collect())
    }

    pub async fn get_inflight_proofs(&self, mint_url: Option<&str>) -> WalletResult<Vec<ProofData>> {
        self.repos
            .repositories()
            .proofs
            .get_proofs_by_state(mint_url, ProofState::Inflight)
            .await
    }

    /// Input fee rate per keyset of a mint
    pub async fn keyset_fees(&self, mint_url: &str) -> WalletResult<HashMap<String, u64>> {
        Ok(self
            .repos
            .repositories()
            .keysets
            .get_keysets_by_mint(mint_url)
            .await?
            .into_iter()
            .map(|k| (k.id, k.input_fee_ppk))
            .collect())
    }

    pub async fn select_proofs_for_amount(
        &self,
        mint_url: &str,
        amount: u64,
        include_fees: bool,
    ) -> WalletResult<ProofSelection> {
        let available = self.get_spendable_proofs(mint_url).await?;
        let fees = self.keyset_fees(mint_url).await?;
        let selection = select_proofs(
            &available,
            amount,
            &fees,
            include_fees,
            self.config.over_selection_ratio,
        )?;
        log::debug!(
            "Selected {} proofs ({} sats, fee {}, exact {}) for {} on {}",
            selection.proofs.len(),
            selection.total,
            selection.fee,
            selection.exact,
            amount,
            mint_url
        );
        Ok(selection)
    }

    /// Ask the mint whether inflight proofs were spent and reconcile
    ///
    /// Spent proofs become spent. Unspent proofs without a reservation go back
    /// to ready; reserved ones belong to their operation and stay inflight.
    pub async fn check_inflight_proofs(
        &self,
        mint_url: Option<&str>,
    ) -> WalletResult<ProofReconcileReport> {
        let inflight = self.get_inflight_proofs(mint_url).await?;
        self.reconcile_proofs(inflight).await
    }

    /// Reconcile proofs of any number of mints, one state check per mint
    pub async fn reconcile_proofs(
        &self,
        proofs: Vec<ProofData>,
    ) -> WalletResult<ProofReconcileReport> {
        let mut by_mint: BTreeMap<String, Vec<ProofData>> = BTreeMap::new();
        for proof in proofs {
            by_mint.entry(proof.mint_url.clone()).or_default().push(proof);
        }

        let mut report = ProofReconcileReport::default();
        for (mint, proofs) in by_mint {
            let mint_report = self.reconcile_mint(&mint, &proofs).await?;
            report.checked += mint_report.checked;
            report.spent.extend(mint_report.spent);
            report.restored.extend(mint_report.restored);
            report.pending.extend(mint_report.pending);
        }
        Ok(report)
    }

    /// Reconcile specific proofs of one mint with the mint's view
    pub async fn reconcile_mint(
        &self,
        mint_url: &str,
        proofs: &[ProofData],
    ) -> WalletResult<ProofReconcileReport> {
        let secrets: Vec<String> = proofs.iter().map(|p| p.secret.clone()).collect();
        if secrets.is_empty() {
            return Ok(ProofReconcileReport::default());
        }
        let states = self.connector.check_proof_states(mint_url, &secrets).await?;
        if states.len() != secrets.len() {
            return Err(WalletError::Storage(format!(
                "Mint returned {} states for {} proofs",
                states.len(),
                secrets.len()
            )));
        }

        let mut report = ProofReconcileReport {
            checked: proofs.len(),
            ..Default::default()
        };
        for (proof, state) in proofs.iter().zip(states) {
            match state {
                MintProofState::Spent if proof.state != ProofState::Spent => {
                    report.spent.push(proof.secret.clone())
                }
                MintProofState::Unspent
                    if proof.state == ProofState::Inflight && !proof.is_reserved() =>
                {
                    report.restored.push(proof.secret.clone())
                }
                MintProofState::Pending => report.pending.push(proof.secret.clone()),
                _ => {}
            }
        }

        let tx = self.repos.begin(None).await?;
        let result = Self::apply_report(tx.repositories(), mint_url, &report).await;
        finish(tx, result).await?;

        if !report.spent.is_empty() {
            log::info!("{} inflight proofs on {} are spent", report.spent.len(), mint_url);
            self.emit_state_changed(mint_url, report.spent.clone(), ProofState::Spent);
        }
        if !report.restored.is_empty() {
            log::info!(
                "{} inflight proofs on {} returned to ready",
                report.restored.len(),
                mint_url
            );
            self.emit_state_changed(mint_url, report.restored.clone(), ProofState::Ready);
        }
        Ok(report)
    }

    async fn apply_report(
        repos: &Repositories,
        mint_url: &str,
        report: &ProofReconcileReport,
    ) -> WalletResult<()> {
        repos
            .proofs
            .set_proof_state(mint_url, &report.spent, ProofState::Spent)
            .await?;
        repos
            .proofs
            .set_proof_state(mint_url, &report.restored, ProofState::Ready)
            .await
    }

    /// Announce saved proofs grouped by their initial state
    pub fn emit_saved(&self, mint_url: &str, saved: Vec<(String, ProofState)>) {
        let mut by_state: BTreeMap<String, (ProofState, Vec<String>)> = BTreeMap::new();
        for (secret, state) in saved {
            by_state
                .entry(state.to_string())
                .or_insert_with(|| (state, Vec::new()))
                .1
                .push(secret);
        }
        for (_, (state, secrets)) in by_state {
            self.events.emit(WalletEvent::ProofsSaved {
                mint_url: mint_url.to_string(),
                secrets,
                state,
            });
        }
    }

    pub fn emit_state_changed(&self, mint_url: &str, secrets: Vec<String>, state: ProofState) {
        if secrets.is_empty() {
            return;
        }
        self.events.emit(WalletEvent::ProofsStateChanged {
            mint_url: mint_url.to_string(),
            secrets,
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::stores::MemoryRepositoryProvider;
    use crate::test_utils::{FakeMint, TEST_MINT};
    use std::sync::Mutex;

    fn proof(secret: &str, amount: u64) -> ProofData {
        ProofData {
            id: "00ks".into(),
            amount,
            secret: secret.into(),
            c: format!("c-{}", secret),
            witness: None,
            dleq: None,
            mint_url: TEST_MINT.into(),
            state: ProofState::Ready,
            used_by_operation_id: None,
            created_by_operation_id: None,
            created_at: 1,
        }
    }

    fn service() -> (ProofService, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        let service = ProofService::new(
            Arc::new(MemoryRepositoryProvider::new()),
            FakeMint::new(0).client(b"proof service seed"),
            events.clone(),
            Arc::new(WalletConfig::default()),
        );
        (service, events)
    }

    fn secrets(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_prefers_exact_match() {
        let available = vec![proof("a", 32), proof("b", 16), proof("c", 2), proof("d", 64)];
        let selection = select_proofs(&available, 18, &HashMap::new(), false, 1.1).unwrap();
        assert!(selection.exact);
        assert_eq!(selection.total, 18);
        assert_eq!(selection.fee, 0);
        assert!(!selection.over_selected);
    }

    #[test]
    fn test_select_smallest_covering_proof() {
        let available = vec![proof("a", 64), proof("b", 32), proof("c", 8)];
        let selection = select_proofs(&available, 20, &HashMap::new(), false, 1.1).unwrap();
        assert!(!selection.exact);
        assert_eq!(selection.total, 32);
        assert!(selection.over_selected);
    }

    #[test]
    fn test_select_accumulates_and_covers_fee() {
        let fees: HashMap<String, u64> = [("00ks".to_string(), 1000)].into_iter().collect();
        let available = vec![proof("a", 4), proof("b", 4), proof("c", 4), proof("d", 1)];
        let selection = select_proofs(&available, 8, &fees, true, 1.1).unwrap();
        // 8 + fee(3 proofs) = 11 needs all three 4s
        assert_eq!(selection.total, 12);
        assert_eq!(selection.fee, 3);
        assert!(selection.total >= 8 + selection.fee);
    }

    #[test]
    fn test_select_exact_with_fee() {
        let fees: HashMap<String, u64> = [("00ks".to_string(), 1000)].into_iter().collect();
        let available = vec![proof("a", 8), proof("b", 2), proof("c", 1)];
        let selection = select_proofs(&available, 8, &fees, true, 1.1).unwrap();
        assert!(selection.exact);
        assert_eq!(selection.total, 10);
        assert_eq!(selection.fee, 2);

        // 8 + 1 cannot pay its own 2 sat fee, the 16 covers instead
        let available = vec![proof("a", 8), proof("b", 1), proof("c", 16)];
        let selection = select_proofs(&available, 8, &fees, true, 1.1).unwrap();
        assert!(!selection.exact);
        assert_eq!(selection.total, 16);
        assert_eq!(selection.fee, 1);
    }

    #[test]
    fn test_select_ignores_reserved_and_fails_when_short() {
        let mut reserved = proof("a", 64);
        reserved.used_by_operation_id = Some("op".into());
        let available = vec![reserved, proof("b", 4)];
        let err = select_proofs(&available, 10, &HashMap::new(), false, 1.1).unwrap_err();
        assert!(matches!(
            err,
            WalletError::InsufficientFunds { available: 4, required: 10 }
        ));
        assert!(select_proofs(&available, 0, &HashMap::new(), false, 1.1).is_err());
    }

    #[tokio::test]
    async fn test_reservation_is_all_or_nothing() {
        let (service, _) = service();
        service
            .save_proofs(TEST_MINT, vec![proof("a", 1), proof("b", 2), proof("c", 4)], None)
            .await
            .unwrap();

        service
            .reserve_proofs(TEST_MINT, &secrets(&["a", "b"]), "op-1", None)
            .await
            .unwrap();

        // Overlapping reservation fails and changes nothing
        let err = service
            .reserve_proofs(TEST_MINT, &secrets(&["c", "b"]), "op-2", None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let c = service
            .get_proofs_by_secrets(TEST_MINT, &secrets(&["c"]))
            .await
            .unwrap();
        assert!(!c[0].is_reserved());

        let err = service
            .reserve_proofs(TEST_MINT, &secrets(&["c", "missing"]), "op-2", None)
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::ReservationConflict { .. }));

        service
            .release_proofs(TEST_MINT, &secrets(&["a", "b"]), None)
            .await
            .unwrap();
        service
            .reserve_proofs(TEST_MINT, &secrets(&["c", "b"]), "op-2", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_reservations_have_one_winner() {
        let (service, _) = service();
        let service = Arc::new(service);
        service
            .save_proofs(TEST_MINT, vec![proof("a", 1), proof("b", 2), proof("c", 4)], None)
            .await
            .unwrap();

        let first = secrets(&["a", "b"]);
        let second = secrets(&["b", "c"]);
        let (r1, r2) = tokio::join!(
            service.reserve_proofs(TEST_MINT, &first, "op-1", None),
            service.reserve_proofs(TEST_MINT, &second, "op-2", None),
        );
        assert!(r1.is_ok() ^ r2.is_ok());

        let reserved: Vec<ProofData> = service
            .get_proofs(TEST_MINT)
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.is_reserved())
            .collect();
        assert_eq!(reserved.len(), 2);
        let owner = reserved[0].used_by_operation_id.clone();
        assert!(reserved.iter().all(|p| p.used_by_operation_id == owner));
    }

    #[tokio::test]
    async fn test_non_ready_proof_cannot_be_reserved() {
        let (service, _) = service();
        service
            .save_proofs(TEST_MINT, vec![proof("a", 1)], None)
            .await
            .unwrap();
        service
            .set_proof_state(TEST_MINT, &secrets(&["a"]), ProofState::Inflight, None)
            .await
            .unwrap();
        let err = service
            .reserve_proofs(TEST_MINT, &secrets(&["a"]), "op-1", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("inflight"));
    }

    #[tokio::test]
    async fn test_save_emits_and_rejects_duplicates() {
        let (service, events) = service();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        events.on(Some(EventKind::ProofsSaved), move |e| {
            s.lock().unwrap().push(e.clone());
        });

        service
            .save_proofs(TEST_MINT, vec![proof("a", 1)], None)
            .await
            .unwrap();
        let err = service
            .save_proofs(TEST_MINT, vec![proof("b", 1), proof("a", 1)], None)
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::DuplicateProof { .. }));
        assert_eq!(service.get_proofs(TEST_MINT).await.unwrap().len(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);

        let mut empty_secret = proof("x", 1);
        empty_secret.secret.clear();
        assert!(service
            .save_proofs(TEST_MINT, vec![empty_secret], None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_wipe_by_keyset() {
        let (service, _) = service();
        let mut old = proof("old", 2);
        old.id = "00old".into();
        service
            .save_proofs(TEST_MINT, vec![old, proof("a", 1)], None)
            .await
            .unwrap();
        assert_eq!(service.wipe_proofs_by_keyset_id("00old").await.unwrap(), 1);
        assert_eq!(service.get_proofs(TEST_MINT).await.unwrap().len(), 1);
    }
}
