//! Cashu wallet data types
//!
//! All data structures persisted or exchanged by the wallet core.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::WalletError;

/// Default unit for Cashu proofs
pub fn default_unit() -> String {
    "sat".to_string()
}

// =============================================================================
// Mints & Keysets
// =============================================================================

/// A mint known to the wallet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mint {
    pub mint_url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon_url: Option<String>,
    /// Gates receiving tokens from and melting to this mint
    pub trusted: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Keyset published by a mint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyset {
    pub id: String,
    pub mint_url: String,
    #[serde(default = "default_unit")]
    pub unit: String,
    /// Amount -> public key (hex)
    #[serde(default)]
    pub keys: BTreeMap<u64, String>,
    pub active: bool,
    /// Input fee in parts per thousand
    #[serde(default)]
    pub input_fee_ppk: u64,
    /// Deterministic output counter
    #[serde(default)]
    pub counter: u32,
    pub updated_at: u64,
}

/// Mint metadata as reported by the mint (NUT-06)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MintInfo {
    pub name: Option<String>,
    pub description: Option<String>,
    pub icon_url: Option<String>,
}

// =============================================================================
// Proof Types
// =============================================================================

/// Local proof state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProofState {
    /// Available for spending
    #[default]
    Ready,
    /// Sent but not yet confirmed by mint
    Inflight,
    /// Confirmed spent
    Spent,
}

impl fmt::Display for ProofState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Inflight => write!(f, "inflight"),
            Self::Spent => write!(f, "spent"),
        }
    }
}

/// Proof state as reported by the mint (NUT-07)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MintProofState {
    Unspent,
    Pending,
    Spent,
}

/// DLEQ proof data (NUT-12)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DleqData {
    pub e: String,
    pub s: String,
    pub r: String,
}

/// Proof as exchanged with mints and inside tokens
/// Uses uppercase "C" per NUT-00, with alias for backward compatibility
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashuProof {
    pub id: String,
    pub amount: u64,
    pub secret: String,
    #[serde(rename = "C", alias = "c")]
    pub c: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub witness: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dleq: Option<DleqData>,
}

/// Proof stored by the wallet, with local state tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofData {
    pub id: String,
    pub amount: u64,
    pub secret: String,
    pub c: String,
    #[serde(default)]
    pub witness: Option<String>,
    #[serde(default)]
    pub dleq: Option<DleqData>,
    pub mint_url: String,
    #[serde(default)]
    pub state: ProofState,
    /// Set while reserved by an outgoing operation
    #[serde(default)]
    pub used_by_operation_id: Option<String>,
    /// Set when produced as output of an operation
    #[serde(default)]
    pub created_by_operation_id: Option<String>,
    pub created_at: u64,
}

impl ProofData {
    pub fn from_cashu(
        mint_url: &str,
        proof: CashuProof,
        created_by_operation_id: Option<String>,
        created_at: u64,
    ) -> Self {
        Self {
            id: proof.id,
            amount: proof.amount,
            secret: proof.secret,
            c: proof.c,
            witness: proof.witness,
            dleq: proof.dleq,
            mint_url: mint_url.to_string(),
            state: ProofState::Ready,
            used_by_operation_id: None,
            created_by_operation_id,
            created_at,
        }
    }

    pub fn to_cashu(&self) -> CashuProof {
        CashuProof {
            id: self.id.clone(),
            amount: self.amount,
            secret: self.secret.clone(),
            c: self.c.clone(),
            witness: self.witness.clone(),
            dleq: self.dleq.clone(),
        }
    }

    /// Returns true if the proof is held by an operation
    pub fn is_reserved(&self) -> bool {
        self.used_by_operation_id.is_some()
    }

    /// Ready and not reserved
    pub fn is_spendable(&self) -> bool {
        self.state == ProofState::Ready && !self.is_reserved()
    }
}

/// Sum proof amounts, failing on overflow
pub fn sum_amounts<I>(amounts: I) -> Result<u64, WalletError>
where
    I: IntoIterator<Item = u64>,
{
    amounts
        .into_iter()
        .try_fold(0u64, |acc, amt| acc.checked_add(amt))
        .ok_or_else(|| WalletError::validation("Amount overflow"))
}

// =============================================================================
// Blinded Outputs
// =============================================================================

/// Blinded output prepared by the mint connector
///
/// `data` carries the blinded message, blinding factor and secret in whatever
/// encoding the connector uses; the wallet core never inspects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindedOutput {
    pub amount: u64,
    pub data: String,
}

/// Outputs persisted on an operation before contacting the mint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOutputs {
    pub keyset_id: String,
    pub counter_start: u32,
    /// Outputs that become the token (send) or the melt change
    pub primary: Vec<BlindedOutput>,
    /// Outputs the wallet keeps
    pub keep: Vec<BlindedOutput>,
}

impl PendingOutputs {
    pub fn all(&self) -> Vec<BlindedOutput> {
        self.primary.iter().chain(self.keep.iter()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.primary.len() + self.keep.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Quotes
// =============================================================================

/// Mint quote state (NUT-04)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MintQuoteState {
    Unpaid,
    Paid,
    Issued,
}

/// Melt quote state (NUT-05)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MeltQuoteState {
    Unpaid,
    Pending,
    Paid,
}

/// Payment rail used by a melt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Bolt11,
    Bolt12,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bolt11 => "bolt11",
            Self::Bolt12 => "bolt12",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bolt11" => Ok(Self::Bolt11),
            "bolt12" => Ok(Self::Bolt12),
            other => Err(WalletError::UnsupportedPaymentMethod(other.to_string())),
        }
    }
}

/// Mint quote (Lightning -> ecash)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MintQuote {
    pub quote_id: String,
    pub mint_url: String,
    pub amount: u64,
    #[serde(default = "default_unit")]
    pub unit: String,
    /// Payment request to pay (e.g. bolt11 invoice)
    pub request: String,
    pub state: MintQuoteState,
    pub expiry: Option<u64>,
    pub created_at: u64,
}

/// Melt quote (ecash -> Lightning)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeltQuote {
    pub quote_id: String,
    pub mint_url: String,
    pub method: PaymentMethod,
    pub request: String,
    pub amount: u64,
    pub fee_reserve: u64,
    #[serde(default = "default_unit")]
    pub unit: String,
    pub state: MeltQuoteState,
    pub expiry: Option<u64>,
    #[serde(default)]
    pub payment_preimage: Option<String>,
    pub created_at: u64,
}

// =============================================================================
// Operations
// =============================================================================

/// Send operation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendState {
    Init,
    Prepared,
    Executing,
    Pending,
    Finalized,
    RolledBack,
}

impl SendState {
    /// Allowed edges of the send state graph
    pub fn can_transition_to(&self, next: SendState) -> bool {
        use SendState::*;
        matches!(
            (self, next),
            (Init, Prepared)
                | (Prepared, Executing)
                | (Executing, Pending)
                | (Pending, Finalized)
                | (Prepared, RolledBack)
                | (Executing, RolledBack)
                | (Pending, RolledBack)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::RolledBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Prepared => "prepared",
            Self::Executing => "executing",
            Self::Pending => "pending",
            Self::Finalized => "finalized",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for SendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outgoing send attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendOperation {
    pub id: String,
    pub mint_url: String,
    pub amount: u64,
    /// Inputs do not sum to the amount, a swap is required
    pub needs_swap: bool,
    /// Input fee paid to the mint for the swap
    pub fee: u64,
    pub input_amount: u64,
    pub input_secrets: Vec<String>,
    #[serde(default)]
    pub send_secrets: Vec<String>,
    #[serde(default)]
    pub keep_secrets: Vec<String>,
    /// Blinded outputs, kept once the swap has started
    #[serde(default)]
    pub outputs: Option<PendingOutputs>,
    /// Selection exceeded the over-selection ratio
    #[serde(default)]
    pub over_selected: bool,
    pub state: SendState,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Melt operation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeltState {
    Init,
    Prepared,
    Executing,
    Pending,
    Finalized,
    Failed,
    RolledBack,
}

impl MeltState {
    /// Allowed edges of the melt state graph
    ///
    /// `Failed` has released its inputs already; its one outgoing edge closes
    /// it as `RolledBack`. `Finalized` and `RolledBack` are absorbing.
    pub fn can_transition_to(&self, next: MeltState) -> bool {
        use MeltState::*;
        matches!(
            (self, next),
            (Init, Prepared)
                | (Prepared, Executing)
                | (Executing, Pending)
                | (Executing, Finalized)
                | (Executing, Failed)
                | (Pending, Finalized)
                | (Prepared, RolledBack)
                | (Executing, RolledBack)
                | (Pending, RolledBack)
                | (Failed, RolledBack)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Failed | Self::RolledBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Prepared => "prepared",
            Self::Executing => "executing",
            Self::Pending => "pending",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for MeltState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outgoing melt attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeltOperation {
    pub id: String,
    pub mint_url: String,
    pub quote_id: String,
    pub method: PaymentMethod,
    pub amount: u64,
    pub fee_reserve: u64,
    pub needs_swap: bool,
    pub input_amount: u64,
    pub input_secrets: Vec<String>,
    #[serde(default)]
    pub change_secrets: Vec<String>,
    /// Blank outputs for fee return (NUT-08)
    #[serde(default)]
    pub outputs: Option<PendingOutputs>,
    pub state: MeltState,
    #[serde(default)]
    pub error: Option<String>,
    /// Handler-owned payload, opaque to the engine
    #[serde(default)]
    pub method_data: serde_json::Value,
    pub created_at: u64,
    pub updated_at: u64,
}

// =============================================================================
// Keys & History
// =============================================================================

/// Keypair held by the keyring
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keypair {
    /// Compressed public key (hex)
    pub public_key: String,
    pub secret_key: [u8; 32],
    pub derivation_index: Option<u32>,
    pub derivation_path: Option<String>,
    pub created_at: u64,
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key)
            .field("derivation_index", &self.derivation_index)
            .field("derivation_path", &self.derivation_path)
            .finish_non_exhaustive()
    }
}

/// History entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryKind {
    Mint,
    Melt,
    Send,
    Receive,
}

/// Append-only narrative record for UI and audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub kind: HistoryKind,
    pub mint_url: String,
    pub amount: u64,
    #[serde(default = "default_unit")]
    pub unit: String,
    pub state: String,
    #[serde(default)]
    pub quote_id: Option<String>,
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    pub created_at: u64,
}

/// Per-mint balance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintBalance {
    /// Ready and unreserved
    pub spendable: u64,
    /// Reserved by operations or inflight
    pub pending: u64,
    pub total: u64,
}
