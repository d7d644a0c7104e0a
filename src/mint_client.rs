//! Mint protocol client
//!
//! The wallet core never speaks the mint's wire protocol or performs blind
//! signature math itself. Hosts plug in a `MintConnector` (typically backed by
//! `cdk`'s HTTP client) and the core interprets only the result shapes below.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{MintClientError, WalletResult};
use crate::types::{
    default_unit, BlindedOutput, CashuProof, MeltQuoteState, MintInfo, MintProofState,
    MintQuoteState, PaymentMethod,
};

pub type MintResult<T> = Result<T, MintClientError>;

/// Keyset as listed by the mint (NUT-02)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintKeyset {
    pub id: String,
    #[serde(default = "default_unit")]
    pub unit: String,
    pub active: bool,
    #[serde(default)]
    pub input_fee_ppk: u64,
    #[serde(default)]
    pub keys: BTreeMap<u64, String>,
}

/// Mint quote as reported by the mint (NUT-04)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintQuoteResponse {
    pub quote: String,
    pub request: String,
    pub amount: u64,
    pub state: MintQuoteState,
    pub expiry: Option<u64>,
}

/// Melt quote as reported by the mint (NUT-05), also the result of a melt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeltQuoteResponse {
    pub quote: String,
    pub amount: u64,
    pub fee_reserve: u64,
    pub state: MeltQuoteState,
    pub expiry: Option<u64>,
    #[serde(default)]
    pub payment_preimage: Option<String>,
    /// Signed change for the blank outputs (NUT-08)
    #[serde(default)]
    pub change: Vec<CashuProof>,
}

/// Source of the wallet master seed
///
/// Called on each derivation; implementations should not cache the seed on
/// behalf of the wallet.
#[async_trait]
pub trait SeedProvider: Send + Sync {
    async fn seed(&self) -> WalletResult<Vec<u8>>;
}

/// Opaque mint protocol capability
#[async_trait]
pub trait MintConnector: Send + Sync {
    async fn get_mint_info(&self, mint_url: &str) -> MintResult<MintInfo>;

    async fn get_keysets(&self, mint_url: &str) -> MintResult<Vec<MintKeyset>>;

    async fn create_mint_quote(
        &self,
        mint_url: &str,
        amount: u64,
        unit: &str,
    ) -> MintResult<MintQuoteResponse>;

    async fn check_mint_quote(&self, mint_url: &str, quote_id: &str) -> MintResult<MintQuoteResponse>;

    /// Redeem a paid quote; proofs come back in output order
    async fn mint(
        &self,
        mint_url: &str,
        quote_id: &str,
        outputs: &[BlindedOutput],
    ) -> MintResult<Vec<CashuProof>>;

    async fn create_melt_quote(
        &self,
        mint_url: &str,
        method: PaymentMethod,
        request: &str,
    ) -> MintResult<MeltQuoteResponse>;

    async fn check_melt_quote(
        &self,
        mint_url: &str,
        method: PaymentMethod,
        quote_id: &str,
    ) -> MintResult<MeltQuoteResponse>;

    async fn melt(
        &self,
        mint_url: &str,
        method: PaymentMethod,
        quote_id: &str,
        inputs: &[CashuProof],
        change_outputs: &[BlindedOutput],
    ) -> MintResult<MeltQuoteResponse>;

    /// Build blinded outputs deterministically from the keyset counter
    ///
    /// Output `i` is derived from counter `counter + i`, so the same call can be
    /// replayed after a crash to recover signatures through `restore`.
    async fn prepare_outputs(
        &self,
        mint_url: &str,
        keyset_id: &str,
        amounts: &[u64],
        counter: u32,
    ) -> MintResult<Vec<BlindedOutput>>;

    /// Swap inputs for outputs; proofs come back in output order
    async fn swap(
        &self,
        mint_url: &str,
        inputs: &[CashuProof],
        outputs: &[BlindedOutput],
    ) -> MintResult<Vec<CashuProof>>;

    /// Recover signatures for outputs the mint already signed (NUT-09)
    ///
    /// Aligned with `outputs`; `None` where the mint never signed the output.
    async fn restore(
        &self,
        mint_url: &str,
        outputs: &[BlindedOutput],
    ) -> MintResult<Vec<Option<CashuProof>>>;

    /// Recover every proof derivable from another wallet's seed
    async fn restore_from_seed(&self, mint_url: &str, seed: &[u8]) -> MintResult<Vec<CashuProof>>;

    /// Proof states in the same order as `secrets` (NUT-07)
    async fn check_proof_states(
        &self,
        mint_url: &str,
        secrets: &[String],
    ) -> MintResult<Vec<MintProofState>>;
}
