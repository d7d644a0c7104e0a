//! Token Utilities
//!
//! Wallet-side view of Cashu tokens. CDK parses and serializes both the V3
//! (`cashuA`) and V4 (`cashuB`) formats; this module converts between its
//! proof types and [`CashuProof`] and inspects P2PK-locked secrets (NUT-10/11).

use std::str::FromStr;

use cdk::mint_url::MintUrl;
use cdk::nuts::nut02::ShortKeysetId;
use cdk::nuts::{
    CurrencyUnit, Id, Proof, ProofDleq, PublicKey, SecretKey, Token as CdkToken, Witness,
};
use cdk::secret::Secret;
use cdk::Amount;

use crate::errors::{WalletError, WalletResult};
use crate::types::{CashuProof, DleqData};

// =============================================================================
// Token Format Detection
// =============================================================================

/// Token format version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFormat {
    /// V3 format (cashuA prefix, base64 JSON)
    V3,
    /// V4 format (cashuB prefix, compact CBOR)
    V4,
    /// Unknown format
    Unknown,
}

impl TokenFormat {
    /// Detect token format from string
    pub fn detect(token_str: &str) -> Self {
        let trimmed = token_str.trim();
        if trimmed.starts_with("cashuA") {
            TokenFormat::V3
        } else if trimmed.starts_with("cashuB") {
            TokenFormat::V4
        } else {
            TokenFormat::Unknown
        }
    }
}

fn invalid(what: &str, e: impl std::fmt::Display) -> WalletError {
    WalletError::validation(format!("Invalid {}: {}", what, e))
}

// =============================================================================
// Token
// =============================================================================

/// Single-mint ecash token
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    inner: CdkToken,
}

impl Token {
    /// Build a V4 token from wallet proofs
    pub fn new(
        mint_url: &str,
        proofs: &[CashuProof],
        unit: &str,
        memo: Option<String>,
    ) -> WalletResult<Self> {
        if proofs.is_empty() {
            return Err(WalletError::validation("Cannot create token with no proofs"));
        }
        let mint_url = MintUrl::from_str(mint_url).map_err(|e| invalid("mint URL", e))?;
        let unit = CurrencyUnit::from_str(unit).map_err(|e| invalid("unit", e))?;
        let proofs = proofs
            .iter()
            .map(to_cdk_proof)
            .collect::<WalletResult<Vec<_>>>()?;

        Ok(Self {
            inner: CdkToken::new(mint_url, proofs, memo, unit),
        })
    }

    /// Parse a `cashuA` or `cashuB` token string
    ///
    /// Multi-mint V3 tokens are rejected; the wallet receives one mint at a time.
    pub fn decode(token_str: &str) -> WalletResult<Self> {
        let trimmed = token_str.trim();
        if TokenFormat::detect(trimmed) == TokenFormat::Unknown {
            return Err(WalletError::validation(
                "Invalid token format - must start with 'cashuA' or 'cashuB'",
            ));
        }
        let inner = CdkToken::from_str(trimmed).map_err(|e| invalid("token", e))?;

        if let CdkToken::TokenV3(v3) = &inner {
            if v3.is_multi_mint() {
                return Err(WalletError::validation(
                    "Token spans multiple mints, receive each mint separately",
                ));
            }
        }
        let token = Self { inner };
        if token.proof_count() == 0 {
            return Err(WalletError::validation("Token contains no proofs"));
        }
        Ok(token)
    }

    /// Encode in the compact V4 format unless the token was parsed as V3
    pub fn encode(&self) -> String {
        self.inner.to_string()
    }

    pub fn encode_v3(&self) -> String {
        self.inner.to_v3_string()
    }

    pub fn format(&self) -> TokenFormat {
        match &self.inner {
            CdkToken::TokenV3(_) => TokenFormat::V3,
            CdkToken::TokenV4(_) => TokenFormat::V4,
        }
    }

    pub fn mint_url(&self) -> WalletResult<String> {
        self.inner
            .mint_url()
            .map(|u| u.to_string())
            .map_err(|e| invalid("token mint", e))
    }

    pub fn unit(&self) -> Option<String> {
        self.inner.unit().map(|u| u.to_string())
    }

    pub fn memo(&self) -> Option<&str> {
        self.inner.memo().as_deref()
    }

    /// Total value of the token
    pub fn value(&self) -> WalletResult<u64> {
        self.inner
            .value()
            .map(u64::from)
            .map_err(|e| invalid("token amount", e))
    }

    fn proof_count(&self) -> usize {
        match &self.inner {
            CdkToken::TokenV3(v3) => v3.token.iter().map(|t| t.proofs.len()).sum(),
            CdkToken::TokenV4(v4) => v4.token.iter().map(|t| t.proofs.len()).sum(),
        }
    }

    /// Proofs of the token, with short keyset ids expanded against `keyset_ids`
    ///
    /// Version 00 ids are complete on their own; version 01 ids are resolved by
    /// prefix and fail when no known keyset matches.
    pub fn proofs(&self, keyset_ids: &[String]) -> WalletResult<Vec<CashuProof>> {
        let mut proofs = Vec::with_capacity(self.proof_count());
        match &self.inner {
            CdkToken::TokenV3(v3) => {
                for p in v3.token.iter().flat_map(|t| t.proofs.iter()) {
                    let id = resolve_keyset_id(&p.keyset_id, keyset_ids)?;
                    proofs.push(from_cdk_parts(
                        id,
                        p.amount,
                        &p.secret,
                        &p.c,
                        p.witness.as_ref(),
                        p.dleq.as_ref(),
                    )?);
                }
            }
            CdkToken::TokenV4(v4) => {
                for t in &v4.token {
                    let id = resolve_keyset_id(&t.keyset_id, keyset_ids)?;
                    for p in &t.proofs {
                        proofs.push(from_cdk_parts(
                            id.clone(),
                            p.amount,
                            &p.secret,
                            &p.c,
                            p.witness.as_ref(),
                            p.dleq.as_ref(),
                        )?);
                    }
                }
            }
        }
        Ok(proofs)
    }
}

// =============================================================================
// Proof Conversion
// =============================================================================

fn resolve_keyset_id(short: &ShortKeysetId, keyset_ids: &[String]) -> WalletResult<String> {
    let prefix = short.to_string();
    if let Some(id) = keyset_ids.iter().find(|id| id.starts_with(&prefix)) {
        return Ok(id.clone());
    }
    Id::from_short_keyset_id(short, &[])
        .map(|id| id.to_string())
        .map_err(|e| invalid(&format!("keyset id {}", prefix), e))
}

/// Convert a wallet proof into CDK's proof type
pub fn to_cdk_proof(proof: &CashuProof) -> WalletResult<Proof> {
    let keyset_id = Id::from_str(&proof.id).map_err(|e| invalid("keyset id", e))?;
    let c = PublicKey::from_hex(&proof.c).map_err(|e| invalid("proof signature", e))?;
    let witness = proof
        .witness
        .as_ref()
        .map(|w| serde_json::from_value::<Witness>(serde_json::Value::String(w.clone())))
        .transpose()?;
    let dleq = proof
        .dleq
        .as_ref()
        .map(|d| -> WalletResult<ProofDleq> {
            let key = |hex: &str| SecretKey::from_hex(hex).map_err(|e| invalid("DLEQ", e));
            Ok(ProofDleq::new(key(&d.e)?, key(&d.s)?, key(&d.r)?))
        })
        .transpose()?;

    Ok(Proof {
        amount: Amount::from(proof.amount),
        keyset_id,
        secret: Secret::new(proof.secret.clone()),
        c,
        witness,
        dleq,
    })
}

fn from_cdk_parts(
    id: String,
    amount: Amount,
    secret: &Secret,
    c: &PublicKey,
    witness: Option<&Witness>,
    dleq: Option<&ProofDleq>,
) -> WalletResult<CashuProof> {
    let witness = match witness.map(serde_json::to_value).transpose()? {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
        None => None,
    };
    Ok(CashuProof {
        id,
        amount: u64::from(amount),
        secret: secret.to_string(),
        c: c.to_hex(),
        witness,
        dleq: dleq.map(|d| DleqData {
            e: d.e.to_secret_hex(),
            s: d.s.to_secret_hex(),
            r: d.r.to_secret_hex(),
        }),
    })
}

// =============================================================================
// Spending Conditions
// =============================================================================

/// Extract the locking public key from a P2PK secret, if the secret is one
///
/// Well-known secret format: `["P2PK", {"nonce": "...", "data": "<pubkey>", "tags": [...]}]`
pub fn p2pk_lock_pubkey(secret: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(secret).ok()?;
    let array = value.as_array()?;
    if array.len() != 2 || array[0].as_str()? != "P2PK" {
        return None;
    }
    array[1]
        .get("data")
        .and_then(|d| d.as_str())
        .map(|s| s.to_lowercase())
}
