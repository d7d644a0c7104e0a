//! Cashu wallet utility functions

use std::collections::HashMap;

use url::Url;

use crate::errors::{WalletError, WalletResult};
use crate::types::ProofData;

/// Normalize a mint URL to prevent duplicates like "mint.coinos.io" vs "mint.coinos.io/"
/// This should be called when storing or comparing mint URLs.
pub fn normalize_mint_url(url: &str) -> WalletResult<String> {
    let mut normalized = url.trim().to_string();

    if normalized.is_empty() {
        return Err(WalletError::validation("Mint URL is empty"));
    }

    // Remove trailing slashes
    while normalized.ends_with('/') {
        normalized.pop();
    }

    // Ensure https:// prefix if no scheme
    if !normalized.starts_with("http://") && !normalized.starts_with("https://") {
        normalized = format!("https://{}", normalized);
    }

    let parsed = Url::parse(&normalized)
        .map_err(|e| WalletError::validation(format!("Invalid mint URL {}: {}", url, e)))?;

    // Lowercase the host portion for consistency
    if let Some(host) = parsed.host_str() {
        let lowercase_host = host.to_lowercase();
        normalized = normalized.replacen(host, &lowercase_host, 1);
    } else {
        return Err(WalletError::validation(format!("Mint URL has no host: {}", url)));
    }

    Ok(normalized)
}

/// Get current timestamp in seconds
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

// =============================================================================
// Fees & Denominations
// =============================================================================

/// Calculate fee for a number of proofs
pub fn calculate_proof_fee(proof_count: usize, fee_ppk: u64) -> u64 {
    // Fee formula: ceil(proof_count * fee_ppk / 1000)
    // Use saturating arithmetic to prevent overflow
    let base = (proof_count as u64).saturating_mul(fee_ppk);
    base.saturating_add(999) / 1000
}

/// Input fee for a set of proofs, per keyset (NUT-02)
///
/// Keysets without a known fee rate are charged nothing.
pub fn calculate_input_fee(proofs: &[ProofData], fee_ppk_by_keyset: &HashMap<String, u64>) -> u64 {
    let mut sum_ppk = 0u64;
    for proof in proofs {
        sum_ppk = sum_ppk.saturating_add(fee_ppk_by_keyset.get(&proof.id).copied().unwrap_or(0));
    }
    sum_ppk.saturating_add(999) / 1000
}

/// Split an amount into power-of-two denominations, largest first
pub fn split_amount(amount: u64) -> Vec<u64> {
    (0..64)
        .rev()
        .map(|bit| 1u64 << bit)
        .filter(|denomination| amount & denomination != 0)
        .collect()
}

/// Short prefix of a secret for log lines
pub fn short_secret(secret: &str) -> &str {
    let end = secret
        .char_indices()
        .nth(8)
        .map(|(idx, _)| idx)
        .unwrap_or(secret.len());
    &secret[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mint_url() {
        assert_eq!(
            normalize_mint_url("mint.example.com").unwrap(),
            "https://mint.example.com"
        );
        assert_eq!(
            normalize_mint_url("https://mint.example.com/").unwrap(),
            "https://mint.example.com"
        );
        assert_eq!(
            normalize_mint_url("https://MINT.Example.COM").unwrap(),
            "https://mint.example.com"
        );
        assert_eq!(
            normalize_mint_url("  https://mint.example.com/  ").unwrap(),
            "https://mint.example.com"
        );
        assert!(normalize_mint_url("   ").is_err());
    }

    #[test]
    fn test_calculate_proof_fee() {
        assert_eq!(calculate_proof_fee(0, 100), 0);
        assert_eq!(calculate_proof_fee(1, 100), 1);
        assert_eq!(calculate_proof_fee(10, 100), 1);
        assert_eq!(calculate_proof_fee(11, 100), 2);
        assert_eq!(calculate_proof_fee(3, 0), 0);
    }

    #[test]
    fn test_split_amount() {
        assert_eq!(split_amount(0), Vec::<u64>::new());
        assert_eq!(split_amount(1), vec![1]);
        assert_eq!(split_amount(100), vec![64, 32, 4]);
        assert_eq!(split_amount(255).len(), 8);
    }

    #[test]
    fn test_short_secret() {
        assert_eq!(short_secret("abcdefghijkl"), "abcdefgh");
        assert_eq!(short_secret("abc"), "abc");
    }
}
