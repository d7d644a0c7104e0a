//! Wallet error types
//!
//! Typed error handling for the wallet core. Mint-side failures keep their
//! NUT error code so callers can tell a spent token from a transport hiccup.

use std::fmt;

use thiserror::Error;

// =============================================================================
// NUT Error Codes (per NUT-00 specification)
// =============================================================================

/// NUT error codes from the Cashu specification
/// These map to standardized error responses from mints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NutErrorCode {
    /// Token already spent
    TokenAlreadySpent = 11001,
    /// Token pending (locked in transaction)
    TokenPending = 11002,
    /// Transaction unbalanced (inputs != outputs + fee)
    TransactionUnbalanced = 11003,
    /// Unit not supported by mint
    UnsupportedUnit = 11004,
    /// Quote not paid
    QuoteNotPaid = 11006,
    /// Quote expired
    QuoteExpired = 11007,
    /// Quote pending
    QuotePending = 11008,
    /// Blinded message already signed
    BlindedMessageAlreadySigned = 11009,
    /// Witness missing or invalid (P2PK)
    WitnessMissingOrInvalid = 11015,
    /// Lightning error
    LightningError = 20001,
    /// Invoice already paid
    InvoiceAlreadyPaid = 20002,
    /// Unknown/generic error
    Unknown = 65535,
}

impl NutErrorCode {
    /// Create from numeric code
    pub fn from_code(code: u16) -> Self {
        match code {
            11001 => Self::TokenAlreadySpent,
            11002 => Self::TokenPending,
            11003 => Self::TransactionUnbalanced,
            11004 => Self::UnsupportedUnit,
            11006 => Self::QuoteNotPaid,
            11007 => Self::QuoteExpired,
            11008 => Self::QuotePending,
            11009 => Self::BlindedMessageAlreadySigned,
            11015 => Self::WitnessMissingOrInvalid,
            20001 => Self::LightningError,
            20002 => Self::InvoiceAlreadyPaid,
            _ => Self::Unknown,
        }
    }

    /// Get numeric code value
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Check if error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TokenPending | Self::QuotePending | Self::LightningError | Self::Unknown
        )
    }

    /// Check if error indicates tokens are unusable
    pub fn is_token_lost(&self) -> bool {
        matches!(
            self,
            Self::TokenAlreadySpent | Self::BlindedMessageAlreadySigned
        )
    }
}

impl fmt::Display for NutErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenAlreadySpent => write!(f, "Token already spent (11001)"),
            Self::TokenPending => write!(f, "Token pending (11002)"),
            Self::TransactionUnbalanced => write!(f, "Transaction unbalanced (11003)"),
            Self::UnsupportedUnit => write!(f, "Unsupported unit (11004)"),
            Self::QuoteNotPaid => write!(f, "Quote not paid (11006)"),
            Self::QuoteExpired => write!(f, "Quote expired (11007)"),
            Self::QuotePending => write!(f, "Quote pending (11008)"),
            Self::BlindedMessageAlreadySigned => {
                write!(f, "Blinded message already signed (11009)")
            }
            Self::WitnessMissingOrInvalid => write!(f, "Witness missing or invalid (11015)"),
            Self::LightningError => write!(f, "Lightning error (20001)"),
            Self::InvoiceAlreadyPaid => write!(f, "Invoice already paid (20002)"),
            Self::Unknown => write!(f, "Unknown error (65535)"),
        }
    }
}

// =============================================================================
// Mint Client Errors
// =============================================================================

/// Error reported by the mint connector
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct MintClientError {
    /// NUT error code if the mint returned one
    pub code: Option<NutErrorCode>,
    pub message: String,
}

impl MintClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: NutErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    /// Transport failures carry no code and may be retried
    pub fn is_recoverable(&self) -> bool {
        self.code.map(|c| c.is_recoverable()).unwrap_or(true)
    }
}

// =============================================================================
// Wallet Errors
// =============================================================================

/// Wallet core error type
#[derive(Debug, Error)]
pub enum WalletError {
    // ==========================================================================
    // Input Validation
    // ==========================================================================
    #[error("Validation failed: {0}")]
    Validation(String),

    // ==========================================================================
    // Trust / Conflict
    // ==========================================================================
    #[error("Mint is not trusted: {mint_url}")]
    UntrustedMint { mint_url: String },

    #[error("Operation already in progress: {key}")]
    AlreadyInProgress { key: String },

    #[error("Proof {secret} cannot be reserved: {reason}")]
    ReservationConflict { secret: String, reason: String },

    #[error("Proof secret already stored for {mint_url}: {secret}")]
    DuplicateProof { mint_url: String, secret: String },

    #[error("Send {operation_id} was already claimed by the recipient")]
    SendAlreadyClaimed { operation_id: String },

    // ==========================================================================
    // Not Found
    // ==========================================================================
    #[error("Mint not found: {mint_url}")]
    MintNotFound { mint_url: String },

    #[error("Quote not found: {quote_id}")]
    QuoteNotFound { quote_id: String },

    #[error("Operation not found: {operation_id}")]
    OperationNotFound { operation_id: String },

    #[error("Key not found: {public_key}")]
    KeyNotFound { public_key: String },

    // ==========================================================================
    // Funds / State
    // ==========================================================================
    #[error("Insufficient funds: available={available}, required={required}")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("Operation {operation_id} in invalid state: expected {expected}, got {actual}")]
    InvalidState {
        operation_id: String,
        expected: String,
        actual: String,
    },

    #[error("Melt failed for quote {quote_id}: {reason}")]
    MeltFailed { quote_id: String, reason: String },

    #[error("Unsupported payment method: {0}")]
    UnsupportedPaymentMethod(String),

    // ==========================================================================
    // Collaborators
    // ==========================================================================
    #[error("Mint error: {0}")]
    Mint(#[from] MintClientError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for wallet operations
pub type WalletResult<T> = Result<T, WalletError>;

impl WalletError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn in_progress(key: impl Into<String>) -> Self {
        Self::AlreadyInProgress { key: key.into() }
    }

    /// Conflicts may succeed when retried later
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInProgress { .. }
                | Self::ReservationConflict { .. }
                | Self::SendAlreadyClaimed { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::MintNotFound { .. }
                | Self::QuoteNotFound { .. }
                | Self::OperationNotFound { .. }
                | Self::KeyNotFound { .. }
        )
    }

    /// Check if this is an insufficient funds error
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(self, Self::InsufficientFunds { .. })
    }

    /// Get NUT error code if applicable
    pub fn nut_error_code(&self) -> Option<NutErrorCode> {
        match self {
            Self::Mint(err) => err.code,
            _ => None,
        }
    }

    /// Check if tokens involved in this error are lost (cannot be recovered)
    pub fn are_tokens_lost(&self) -> bool {
        self.nut_error_code()
            .map(|code| code.is_token_lost())
            .unwrap_or(false)
    }

    /// Check if error is recoverable based on NUT error code
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Mint(err) => err.is_recoverable(),
            other => other.is_conflict(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nut_code_roundtrip() {
        assert_eq!(NutErrorCode::from_code(11001), NutErrorCode::TokenAlreadySpent);
        assert_eq!(NutErrorCode::from_code(12345), NutErrorCode::Unknown);
        assert_eq!(NutErrorCode::QuotePending.code(), 11008);
    }

    #[test]
    fn test_error_classification() {
        assert!(WalletError::in_progress("op-1").is_conflict());
        assert!(WalletError::QuoteNotFound {
            quote_id: "q".into()
        }
        .is_not_found());

        let spent: WalletError =
            MintClientError::with_code(NutErrorCode::TokenAlreadySpent, "spent").into();
        assert!(spent.are_tokens_lost());
        assert!(!spent.is_recoverable());

        let transport: WalletError = MintClientError::new("connection reset").into();
        assert!(transport.is_recoverable());
    }
}
