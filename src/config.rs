//! Wallet configuration
//!
//! Loaded from JSON with camelCase keys; every field has a default so an empty
//! object is a valid configuration.

use serde::{Deserialize, Serialize};

use crate::errors::{WalletError, WalletResult};
use crate::types::{default_unit, PaymentMethod};

/// Default threshold above which a selection counts as over-selected
pub const DEFAULT_OVER_SELECTION_RATIO: f64 = 1.10;

/// Mint quote watcher settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MintQuoteWatcherConfig {
    pub disabled: bool,
    /// Re-arm polling for quotes left unpaid by a previous session
    pub watch_existing_pending_on_start: bool,
    pub interval_ms: u64,
}

impl Default for MintQuoteWatcherConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            watch_existing_pending_on_start: true,
            interval_ms: 5_000,
        }
    }
}

/// Mint quote processor settings (auto-redeem of paid quotes)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MintQuoteProcessorConfig {
    pub disabled: bool,
    pub process_interval_ms: u64,
    /// Redeem attempts per quote before giving up
    pub max_retries: u32,
}

impl Default for MintQuoteProcessorConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            process_interval_ms: 3_000,
            max_retries: 3,
        }
    }
}

/// Proof state watcher settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProofStateWatcherConfig {
    pub disabled: bool,
    pub watch_existing_inflight_on_start: bool,
    pub interval_ms: u64,
}

impl Default for ProofStateWatcherConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            watch_existing_inflight_on_start: true,
            interval_ms: 10_000,
        }
    }
}

/// Top-level wallet configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WalletConfig {
    pub mint_quote_watcher: MintQuoteWatcherConfig,
    pub mint_quote_processor: MintQuoteProcessorConfig,
    pub proof_state_watcher: ProofStateWatcherConfig,
    pub over_selection_ratio: f64,
    pub unit: String,
    /// Payment methods that must have a melt handler registered
    pub melt_methods: Vec<PaymentMethod>,
    /// "error", "warn", "info", "debug" or "trace"
    pub log_level: Option<String>,
    /// Run send/melt recovery during init
    pub recover_on_init: bool,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            mint_quote_watcher: MintQuoteWatcherConfig::default(),
            mint_quote_processor: MintQuoteProcessorConfig::default(),
            proof_state_watcher: ProofStateWatcherConfig::default(),
            over_selection_ratio: DEFAULT_OVER_SELECTION_RATIO,
            unit: default_unit(),
            melt_methods: vec![PaymentMethod::Bolt11],
            log_level: None,
            recover_on_init: true,
        }
    }
}

impl WalletConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> WalletResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Config with every background loop disabled
    pub fn without_watchers() -> Self {
        let mut config = Self::default();
        config.mint_quote_watcher.disabled = true;
        config.mint_quote_processor.disabled = true;
        config.proof_state_watcher.disabled = true;
        config
    }

    pub fn validate(&self) -> WalletResult<()> {
        if !(self.over_selection_ratio >= 1.0) {
            return Err(WalletError::Config(format!(
                "overSelectionRatio must be >= 1.0, got {}",
                self.over_selection_ratio
            )));
        }
        if self.unit.trim().is_empty() {
            return Err(WalletError::Config("unit must not be empty".to_string()));
        }
        if self.mint_quote_watcher.interval_ms == 0
            || self.mint_quote_processor.process_interval_ms == 0
            || self.proof_state_watcher.interval_ms == 0
        {
            return Err(WalletError::Config(
                "polling intervals must be greater than zero".to_string(),
            ));
        }
        if let Some(level) = &self.log_level {
            self.parse_log_level(level)?;
        }
        Ok(())
    }

    /// Level filter for the `log` facade, if one is configured
    pub fn level_filter(&self) -> WalletResult<Option<log::LevelFilter>> {
        self.log_level
            .as_deref()
            .map(|level| self.parse_log_level(level))
            .transpose()
    }

    fn parse_log_level(&self, level: &str) -> WalletResult<log::LevelFilter> {
        level
            .parse::<log::LevelFilter>()
            .map_err(|_| WalletError::Config(format!("Unknown log level: {}", level)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = WalletConfig::from_json_str("{}").unwrap();
        assert_eq!(config, WalletConfig::default());
        assert_eq!(config.melt_methods, vec![PaymentMethod::Bolt11]);
    }

    #[test]
    fn test_camel_case_sections() {
        let config = WalletConfig::from_json_str(
            r#"{
                "mintQuoteWatcher": { "disabled": true, "watchExistingPendingOnStart": false },
                "mintQuoteProcessor": { "processIntervalMs": 250, "maxRetries": 7 },
                "overSelectionRatio": 1.5,
                "logLevel": "debug"
            }"#,
        )
        .unwrap();

        assert!(config.mint_quote_watcher.disabled);
        assert!(!config.mint_quote_watcher.watch_existing_pending_on_start);
        assert_eq!(config.mint_quote_watcher.interval_ms, 5_000);
        assert_eq!(config.mint_quote_processor.process_interval_ms, 250);
        assert_eq!(config.mint_quote_processor.max_retries, 7);
        assert_eq!(config.level_filter().unwrap(), Some(log::LevelFilter::Debug));
    }

    #[test]
    fn test_validation_errors() {
        assert!(WalletConfig::from_json_str(r#"{"overSelectionRatio": 0.5}"#).is_err());
        assert!(WalletConfig::from_json_str(r#"{"unit": " "}"#).is_err());
        assert!(WalletConfig::from_json_str(r#"{"logLevel": "loud"}"#).is_err());
        assert!(
            WalletConfig::from_json_str(r#"{"proofStateWatcher": {"intervalMs": 0}}"#).is_err()
        );
    }
}
