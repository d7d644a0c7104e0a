//! Test doubles: a scripted in-process mint and a fixed seed

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cdk::dhke::hash_to_curve;

use crate::config::WalletConfig;
use crate::errors::{MintClientError, NutErrorCode, WalletResult};
use crate::events::EventBus;
use crate::mint_client::{
    MeltQuoteResponse, MintConnector, MintKeyset, MintQuoteResponse, MintResult, SeedProvider,
};
use crate::operations::{
    Bolt11Handler, MeltEngine, MeltHandlerRegistry, MeltMethodHandler, SendEngine,
};
use crate::services::{HistoryService, MintService, ProofService, QuoteService};
use crate::stores::{MemoryRepositoryProvider, RepositoryProvider};
use crate::types::{
    BlindedOutput, CashuProof, MeltQuoteState, MintInfo, MintProofState, MintQuoteState,
    PaymentMethod, ProofData,
};
use crate::token::p2pk_lock_pubkey;
use crate::utils::{calculate_proof_fee, split_amount};

pub const TEST_MINT: &str = "https://mint.example.com";
pub const TEST_KEYSET: &str = "00ffd48b8f5ecf80";

/// Deterministic curve point standing in for an unblinded signature
pub fn signature_point(tag: &str) -> String {
    hash_to_curve(tag.as_bytes())
        .expect("hash_to_curve")
        .to_hex()
}

pub struct FixedSeed(Vec<u8>);

impl FixedSeed {
    pub fn new(seed: &[u8]) -> Self {
        Self(seed.to_vec())
    }
}

#[async_trait]
impl SeedProvider for FixedSeed {
    async fn seed(&self) -> WalletResult<Vec<u8>> {
        Ok(self.0.clone())
    }
}

/// Scripted result of the next melt request
#[derive(Debug, Clone)]
pub enum MeltOutcome {
    /// Lightning fee actually paid out of the reserve
    Paid { fee_paid: u64 },
    Pending,
    Failed,
}

#[derive(Default)]
struct MintState {
    keysets: Vec<MintKeyset>,
    /// secret -> proof, every proof the mint ever signed
    issued: HashMap<String, CashuProof>,
    /// blinded output data -> proof
    signed_outputs: HashMap<String, CashuProof>,
    spent: HashSet<String>,
    pending: HashSet<String>,
    mint_quotes: HashMap<String, MintQuoteResponse>,
    melt_quotes: HashMap<String, MeltQuoteResponse>,
    /// quote -> (inputs, blank outputs) of a pending melt
    pending_melts: HashMap<String, (Vec<String>, Vec<BlindedOutput>, u64)>,
    melt_outcomes: VecDeque<MeltOutcome>,
    fee_reserve: u64,
    next_quote: u64,
    expired_quotes: HashSet<String>,
    fail_after_swap: bool,
    fail_before_swap: bool,
    latency: Option<Duration>,
}

/// In-process mint shared by any number of wallet clients
pub struct FakeMint {
    state: Mutex<MintState>,
}

fn err(code: NutErrorCode, message: &str) -> MintClientError {
    MintClientError::with_code(code, message)
}

impl FakeMint {
    pub fn new(input_fee_ppk: u64) -> Arc<Self> {
        let keys = (0..16).map(|bit| (1u64 << bit, format!("02{:064x}", bit))).collect();
        Arc::new(Self {
            state: Mutex::new(MintState {
                keysets: vec![MintKeyset {
                    id: TEST_KEYSET.to_string(),
                    unit: "sat".to_string(),
                    active: true,
                    input_fee_ppk,
                    keys,
                }],
                fee_reserve: 2,
                ..Default::default()
            }),
        })
    }

    /// Client for one wallet; output secrets are namespaced by the seed
    pub fn client(self: &Arc<Self>, seed: &[u8]) -> Arc<FakeMintClient> {
        Arc::new(FakeMintClient {
            mint: self.clone(),
            tag: hex::encode(seed),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MintState> {
        self.state.lock().unwrap()
    }

    pub fn pay_mint_quote(&self, quote_id: &str) {
        if let Some(q) = self.lock().mint_quotes.get_mut(quote_id) {
            q.state = MintQuoteState::Paid;
        }
    }

    /// The mint refuses to issue against this quote from now on
    pub fn expire_mint_quote(&self, quote_id: &str) {
        self.lock().expired_quotes.insert(quote_id.to_string());
    }

    pub fn push_melt_outcome(&self, outcome: MeltOutcome) {
        self.lock().melt_outcomes.push_back(outcome);
    }

    pub fn set_fee_reserve(&self, fee_reserve: u64) {
        self.lock().fee_reserve = fee_reserve;
    }

    /// Next swap is applied by the mint but the response is lost
    pub fn fail_after_next_swap(&self) {
        self.lock().fail_after_swap = true;
    }

    /// Next swap fails without touching mint state
    pub fn fail_next_swap(&self) {
        self.lock().fail_before_swap = true;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    pub fn rotate_keyset(&self, new_id: &str) {
        let mut state = self.lock();
        let keys = state.keysets[0].keys.clone();
        let fee = state.keysets[0].input_fee_ppk;
        state.keysets = vec![MintKeyset {
            id: new_id.to_string(),
            unit: "sat".to_string(),
            active: true,
            input_fee_ppk: fee,
            keys,
        }];
    }

    /// Settle a pending melt, paid or failed
    pub fn settle_melt(&self, quote_id: &str, paid: bool) {
        let mut state = self.lock();
        let Some((inputs, _, _)) = state.pending_melts.remove(quote_id) else {
            return;
        };
        if !paid {
            state.pending_melts.remove(&format!("change:{}", quote_id));
        }
        for secret in &inputs {
            state.pending.remove(secret);
            if paid {
                state.spent.insert(secret.clone());
            }
        }
        if let Some(q) = state.melt_quotes.get_mut(quote_id) {
            q.state = if paid {
                MeltQuoteState::Paid
            } else {
                MeltQuoteState::Unpaid
            };
            if paid {
                q.payment_preimage = Some(format!("preimage-{}", quote_id));
            }
        }
    }

    /// Issue a proof with an arbitrary secret, e.g. a P2PK lock
    pub fn issue_proof(&self, secret: &str, amount: u64) -> CashuProof {
        let proof = CashuProof {
            id: TEST_KEYSET.to_string(),
            amount,
            secret: secret.to_string(),
            c: signature_point(&format!("issued/{}", secret)),
            witness: None,
            dleq: None,
        };
        self.lock().issued.insert(proof.secret.clone(), proof.clone());
        proof
    }

    pub fn is_spent(&self, secret: &str) -> bool {
        self.lock().spent.contains(secret)
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn fee_for(state: &MintState, inputs: &[CashuProof]) -> u64 {
        let ppk = state.keysets.first().map_or(0, |k| k.input_fee_ppk);
        calculate_proof_fee(inputs.len(), ppk)
    }

    fn check_inputs(state: &MintState, inputs: &[CashuProof]) -> MintResult<u64> {
        let mut total = 0;
        let mut seen = HashSet::new();
        for input in inputs {
            let issued = state
                .issued
                .get(&input.secret)
                .ok_or_else(|| err(NutErrorCode::Unknown, "Unknown proof"))?;
            if issued.c != input.c || issued.amount != input.amount {
                return Err(err(NutErrorCode::Unknown, "Invalid proof"));
            }
            if p2pk_lock_pubkey(&input.secret).is_some() && input.witness.is_none() {
                return Err(err(NutErrorCode::WitnessMissingOrInvalid, "Witness missing"));
            }
            if state.spent.contains(&input.secret) {
                return Err(err(NutErrorCode::TokenAlreadySpent, "Token already spent"));
            }
            if state.pending.contains(&input.secret) || !seen.insert(&input.secret) {
                return Err(err(NutErrorCode::TokenPending, "Token pending"));
            }
            total += input.amount;
        }
        Ok(total)
    }

    fn sign(state: &mut MintState, output: &BlindedOutput, amount: u64) -> MintResult<CashuProof> {
        if state.signed_outputs.contains_key(&output.data) {
            return Err(err(
                NutErrorCode::BlindedMessageAlreadySigned,
                "Blinded message already signed",
            ));
        }
        let keyset_id = output
            .data
            .split('/')
            .nth(1)
            .unwrap_or(TEST_KEYSET)
            .to_string();
        let proof = CashuProof {
            id: keyset_id,
            amount,
            secret: output.data.clone(),
            c: signature_point(&format!("signed/{}", output.data)),
            witness: None,
            dleq: None,
        };
        state.signed_outputs.insert(output.data.clone(), proof.clone());
        state.issued.insert(proof.secret.clone(), proof.clone());
        Ok(proof)
    }

    fn sign_change(
        state: &mut MintState,
        outputs: &[BlindedOutput],
        change: u64,
    ) -> MintResult<Vec<CashuProof>> {
        split_amount(change)
            .into_iter()
            .zip(outputs.iter())
            .map(|(amount, output)| Self::sign(state, output, amount))
            .collect()
    }
}

/// `MintConnector` view of a `FakeMint` for one wallet
pub struct FakeMintClient {
    mint: Arc<FakeMint>,
    tag: String,
}

#[async_trait]
impl MintConnector for FakeMintClient {
    async fn get_mint_info(&self, _mint_url: &str) -> MintResult<MintInfo> {
        self.mint.delay().await;
        Ok(MintInfo {
            name: Some("Test Mint".to_string()),
            description: None,
            icon_url: None,
        })
    }

    async fn get_keysets(&self, _mint_url: &str) -> MintResult<Vec<MintKeyset>> {
        Ok(self.mint.lock().keysets.clone())
    }

    async fn create_mint_quote(
        &self,
        _mint_url: &str,
        amount: u64,
        _unit: &str,
    ) -> MintResult<MintQuoteResponse> {
        let mut state = self.mint.lock();
        state.next_quote += 1;
        let quote = MintQuoteResponse {
            quote: format!("mint-quote-{}", state.next_quote),
            request: format!("lnbc{}n1fake", amount),
            amount,
            state: MintQuoteState::Unpaid,
            expiry: None,
        };
        state.mint_quotes.insert(quote.quote.clone(), quote.clone());
        Ok(quote)
    }

    async fn check_mint_quote(&self, _mint_url: &str, quote_id: &str) -> MintResult<MintQuoteResponse> {
        self.mint.delay().await;
        self.mint
            .lock()
            .mint_quotes
            .get(quote_id)
            .cloned()
            .ok_or_else(|| err(NutErrorCode::Unknown, "Unknown quote"))
    }

    async fn mint(
        &self,
        _mint_url: &str,
        quote_id: &str,
        outputs: &[BlindedOutput],
    ) -> MintResult<Vec<CashuProof>> {
        let mut state = self.mint.lock();
        let quote = state
            .mint_quotes
            .get(quote_id)
            .cloned()
            .ok_or_else(|| err(NutErrorCode::Unknown, "Unknown quote"))?;
        if state.expired_quotes.contains(quote_id) {
            return Err(err(NutErrorCode::QuoteExpired, "Quote expired"));
        }
        match quote.state {
            MintQuoteState::Unpaid => return Err(err(NutErrorCode::QuoteNotPaid, "Quote not paid")),
            MintQuoteState::Issued => return Err(err(NutErrorCode::Unknown, "Quote already issued")),
            MintQuoteState::Paid => {}
        }
        if outputs.iter().map(|o| o.amount).sum::<u64>() != quote.amount {
            return Err(err(NutErrorCode::TransactionUnbalanced, "Outputs do not match quote"));
        }
        let proofs = outputs
            .iter()
            .map(|o| FakeMint::sign(&mut state, o, o.amount))
            .collect::<MintResult<Vec<_>>>()?;
        if let Some(q) = state.mint_quotes.get_mut(quote_id) {
            q.state = MintQuoteState::Issued;
        }
        Ok(proofs)
    }

    async fn create_melt_quote(
        &self,
        _mint_url: &str,
        _method: PaymentMethod,
        request: &str,
    ) -> MintResult<MeltQuoteResponse> {
        let amount: u64 = request
            .trim_start_matches("lnbc")
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .map_err(|_| err(NutErrorCode::Unknown, "Invalid invoice"))?;
        let mut state = self.mint.lock();
        state.next_quote += 1;
        let quote = MeltQuoteResponse {
            quote: format!("melt-quote-{}", state.next_quote),
            amount,
            fee_reserve: state.fee_reserve,
            state: MeltQuoteState::Unpaid,
            expiry: None,
            payment_preimage: None,
            change: Vec::new(),
        };
        state.melt_quotes.insert(quote.quote.clone(), quote.clone());
        Ok(quote)
    }

    async fn check_melt_quote(
        &self,
        _mint_url: &str,
        _method: PaymentMethod,
        quote_id: &str,
    ) -> MintResult<MeltQuoteResponse> {
        self.mint.delay().await;
        let mut state = self.mint.lock();
        let mut quote = state
            .melt_quotes
            .get(quote_id)
            .cloned()
            .ok_or_else(|| err(NutErrorCode::Unknown, "Unknown quote"))?;
        if quote.state == MeltQuoteState::Paid && quote.change.is_empty() {
            if let Some((_, outputs, change)) = state.pending_melts.remove(&format!("change:{}", quote_id)) {
                quote.change = FakeMint::sign_change(&mut state, &outputs, change)?;
            }
        }
        Ok(quote)
    }

    async fn melt(
        &self,
        _mint_url: &str,
        _method: PaymentMethod,
        quote_id: &str,
        inputs: &[CashuProof],
        change_outputs: &[BlindedOutput],
    ) -> MintResult<MeltQuoteResponse> {
        self.mint.delay().await;
        let mut state = self.mint.lock();
        let mut quote = state
            .melt_quotes
            .get(quote_id)
            .cloned()
            .ok_or_else(|| err(NutErrorCode::Unknown, "Unknown quote"))?;
        let total = FakeMint::check_inputs(&state, inputs)?;
        let fee = FakeMint::fee_for(&state, inputs);
        if total < quote.amount + quote.fee_reserve + fee {
            return Err(err(NutErrorCode::TransactionUnbalanced, "Insufficient inputs"));
        }
        let overpaid = total - fee - quote.amount;

        let outcome = state
            .melt_outcomes
            .pop_front()
            .unwrap_or(MeltOutcome::Paid { fee_paid: 0 });
        let secrets: Vec<String> = inputs.iter().map(|p| p.secret.clone()).collect();
        match outcome {
            MeltOutcome::Paid { fee_paid } => {
                state.spent.extend(secrets);
                quote.change = FakeMint::sign_change(
                    &mut state,
                    change_outputs,
                    overpaid.saturating_sub(fee_paid),
                )?;
                quote.state = MeltQuoteState::Paid;
                quote.payment_preimage = Some(format!("preimage-{}", quote_id));
            }
            MeltOutcome::Pending => {
                state.pending.extend(secrets.iter().cloned());
                state
                    .pending_melts
                    .insert(quote_id.to_string(), (secrets, change_outputs.to_vec(), 0));
                state.pending_melts.insert(
                    format!("change:{}", quote_id),
                    (Vec::new(), change_outputs.to_vec(), overpaid),
                );
                quote.state = MeltQuoteState::Pending;
            }
            MeltOutcome::Failed => {
                quote.state = MeltQuoteState::Unpaid;
            }
        }

        let mut stored = quote.clone();
        stored.change = Vec::new();
        state.melt_quotes.insert(quote_id.to_string(), stored);
        Ok(quote)
    }

    async fn prepare_outputs(
        &self,
        _mint_url: &str,
        keyset_id: &str,
        amounts: &[u64],
        counter: u32,
    ) -> MintResult<Vec<BlindedOutput>> {
        Ok(amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| BlindedOutput {
                amount: *amount,
                data: format!("{}/{}/{}", self.tag, keyset_id, counter + i as u32),
            })
            .collect())
    }

    async fn swap(
        &self,
        _mint_url: &str,
        inputs: &[CashuProof],
        outputs: &[BlindedOutput],
    ) -> MintResult<Vec<CashuProof>> {
        self.mint.delay().await;
        let mut state = self.mint.lock();
        if std::mem::take(&mut state.fail_before_swap) {
            return Err(MintClientError::new("connection reset"));
        }
        let total = FakeMint::check_inputs(&state, inputs)?;
        let fee = FakeMint::fee_for(&state, inputs);
        let out_total: u64 = outputs.iter().map(|o| o.amount).sum();
        if total != out_total + fee {
            return Err(err(NutErrorCode::TransactionUnbalanced, "Transaction unbalanced"));
        }
        for input in inputs {
            state.spent.insert(input.secret.clone());
        }
        let proofs = outputs
            .iter()
            .map(|o| FakeMint::sign(&mut state, o, o.amount))
            .collect::<MintResult<Vec<_>>>()?;
        if std::mem::take(&mut state.fail_after_swap) {
            return Err(MintClientError::new("connection reset"));
        }
        Ok(proofs)
    }

    async fn restore(
        &self,
        _mint_url: &str,
        outputs: &[BlindedOutput],
    ) -> MintResult<Vec<Option<CashuProof>>> {
        let state = self.mint.lock();
        Ok(outputs
            .iter()
            .map(|o| state.signed_outputs.get(&o.data).cloned())
            .collect())
    }

    async fn restore_from_seed(&self, _mint_url: &str, seed: &[u8]) -> MintResult<Vec<CashuProof>> {
        let prefix = format!("{}/", hex::encode(seed));
        let state = self.mint.lock();
        let mut proofs: Vec<CashuProof> = state
            .signed_outputs
            .iter()
            .filter(|(data, _)| data.starts_with(&prefix))
            .map(|(_, proof)| proof.clone())
            .collect();
        proofs.sort_by(|a, b| a.secret.cmp(&b.secret));
        Ok(proofs)
    }

    async fn check_proof_states(
        &self,
        _mint_url: &str,
        secrets: &[String],
    ) -> MintResult<Vec<MintProofState>> {
        self.mint.delay().await;
        let state = self.mint.lock();
        Ok(secrets
            .iter()
            .map(|s| {
                if state.spent.contains(s) {
                    MintProofState::Spent
                } else if state.pending.contains(s) {
                    MintProofState::Pending
                } else {
                    MintProofState::Unspent
                }
            })
            .collect())
    }
}

/// Services of one wallet wired to a `FakeMint`, with the test mint trusted
pub struct Services {
    pub repos: Arc<dyn RepositoryProvider>,
    pub events: Arc<EventBus>,
    pub proofs: Arc<ProofService>,
    pub mints: Arc<MintService>,
    pub history: Arc<HistoryService>,
    pub quotes: Arc<QuoteService>,
    pub send: Arc<SendEngine>,
    pub melt: Arc<MeltEngine>,
}

impl Services {
    pub async fn new(mint: &Arc<FakeMint>, seed: &[u8]) -> Self {
        let connector: Arc<dyn MintConnector> = mint.client(seed);
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
        let quotes = Arc::new(QuoteService::new(
            repos.clone(),
            connector.clone(),
            events.clone(),
            mints.clone(),
            proofs.clone(),
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
        let bolt11: Arc<dyn MeltMethodHandler> = Arc::new(Bolt11Handler::new(connector.clone()));
        let registry = Arc::new(MeltHandlerRegistry::new(vec![bolt11], &config.melt_methods).unwrap());
        let melt = Arc::new(MeltEngine::new(
            repos.clone(),
            connector,
            events.clone(),
            mints.clone(),
            proofs.clone(),
            history.clone(),
            registry,
            config,
        ));
        Self {
            repos,
            events,
            proofs,
            mints,
            history,
            quotes,
            send,
            melt,
        }
    }

    /// Store proofs issued directly by the mint, bypassing a mint quote
    pub async fn fund(&self, mint: &FakeMint, amounts: &[u64]) {
        let now = crate::utils::now_secs();
        let funded: Vec<ProofData> = amounts
            .iter()
            .map(|amount| {
                let proof = mint.issue_proof(&uuid::Uuid::new_v4().to_string(), *amount);
                ProofData::from_cashu(TEST_MINT, proof, None, now)
            })
            .collect();
        self.proofs.save_proofs(TEST_MINT, funded, None).await.unwrap();
    }
}
