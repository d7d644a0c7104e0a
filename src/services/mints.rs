//! Mint Service
//!
//! Known mints, trust flags, keysets and the deterministic output counter.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::WalletConfig;
use crate::errors::{WalletError, WalletResult};
use crate::events::{EventBus, WalletEvent};
use crate::mint_client::{MintConnector, MintKeyset};
use crate::services::proofs::ProofService;
use crate::stores::{finish, Repositories, RepositoryProvider};
use crate::types::{Keyset, Mint, PendingOutputs, ProofState};
use crate::utils::{normalize_mint_url, now_secs};

pub struct MintService {
    repos: Arc<dyn RepositoryProvider>,
    connector: Arc<dyn MintConnector>,
    events: Arc<EventBus>,
    proofs: Arc<ProofService>,
    config: Arc<WalletConfig>,
}

impl MintService {
    pub fn new(
        repos: Arc<dyn RepositoryProvider>,
        connector: Arc<dyn MintConnector>,
        events: Arc<EventBus>,
        proofs: Arc<ProofService>,
        config: Arc<WalletConfig>,
    ) -> Self {
        Self {
            repos,
            connector,
            events,
            proofs,
            config,
        }
    }

    /// Register a mint, or update the trust flag of a known one
    pub async fn add_mint(&self, mint_url: &str, trusted: bool) -> WalletResult<Mint> {
        let mint_url = normalize_mint_url(mint_url)?;
        let repos = self.repos.repositories();

        if let Some(mut existing) = repos.mints.get_mint(&mint_url).await? {
            if existing.trusted != trusted {
                existing.trusted = trusted;
                existing.updated_at = now_secs();
                repos.mints.save_mint(existing.clone()).await?;
                self.events.emit(WalletEvent::MintUpdated {
                    mint: existing.clone(),
                });
            }
            return Ok(existing);
        }

        let info = self.connector.get_mint_info(&mint_url).await?;
        let keysets = self.connector.get_keysets(&mint_url).await?;
        let now = now_secs();
        let mint = Mint {
            mint_url: mint_url.clone(),
            name: info.name,
            description: info.description,
            icon_url: info.icon_url,
            trusted,
            created_at: now,
            updated_at: now,
        };

        let tx = self.repos.begin(None).await?;
        let result = Self::store_mint(tx.repositories(), &mint, keysets, now).await;
        finish(tx, result).await?;

        log::info!("Added mint {} (trusted: {})", mint_url, trusted);
        self.events.emit(WalletEvent::MintAdded { mint: mint.clone() });
        Ok(mint)
    }

    async fn store_mint(
        repos: &Repositories,
        mint: &Mint,
        keysets: Vec<MintKeyset>,
        now: u64,
    ) -> WalletResult<()> {
        repos.mints.save_mint(mint.clone()).await?;
        for keyset in keysets {
            repos
                .keysets
                .save_keyset(Keyset {
                    id: keyset.id,
                    mint_url: mint.mint_url.clone(),
                    unit: keyset.unit,
                    keys: keyset.keys,
                    active: keyset.active,
                    input_fee_ppk: keyset.input_fee_ppk,
                    counter: 0,
                    updated_at: now,
                })
                .await?;
        }
        Ok(())
    }

    pub async fn trust_mint(&self, mint_url: &str) -> WalletResult<Mint> {
        self.set_trusted(mint_url, true).await
    }

    pub async fn untrust_mint(&self, mint_url: &str) -> WalletResult<Mint> {
        self.set_trusted(mint_url, false).await
    }

    /// Forget a mint and its keysets; refused while it still holds unspent proofs
    pub async fn remove_mint(&self, mint_url: &str) -> WalletResult<()> {
        let mint = self.get_mint_by_url(mint_url).await?;
        let held = self
            .proofs
            .get_proofs(&mint.mint_url)
            .await?
            .into_iter()
            .filter(|p| p.state != ProofState::Spent)
            .count();
        if held > 0 {
            return Err(WalletError::validation(format!(
                "Mint {} still holds {} unspent proofs",
                mint.mint_url, held
            )));
        }

        let repos = self.repos.repositories();
        for keyset in repos.keysets.get_keysets_by_mint(&mint.mint_url).await? {
            repos.keysets.remove_keyset(&keyset.id).await?;
        }
        repos.mints.remove_mint(&mint.mint_url).await?;
        log::info!("Removed mint {}", mint.mint_url);
        Ok(())
    }

    async fn set_trusted(&self, mint_url: &str, trusted: bool) -> WalletResult<Mint> {
        let mut mint = self.get_mint_by_url(mint_url).await?;
        if mint.trusted == trusted {
            return Ok(mint);
        }
        mint.trusted = trusted;
        mint.updated_at = now_secs();
        self.repos.repositories().mints.save_mint(mint.clone()).await?;
        log::info!("Mint {} trusted: {}", mint.mint_url, trusted);
        self.events.emit(WalletEvent::MintUpdated { mint: mint.clone() });
        Ok(mint)
    }

    pub async fn get_mints(&self) -> WalletResult<Vec<Mint>> {
        let mut mints = self.repos.repositories().mints.get_mints().await?;
        mints.sort_by(|a, b| a.mint_url.cmp(&b.mint_url));
        Ok(mints)
    }

    pub async fn get_mint_by_url(&self, mint_url: &str) -> WalletResult<Mint> {
        let mint_url = normalize_mint_url(mint_url)?;
        self.repos
            .repositories()
            .mints
            .get_mint(&mint_url)
            .await?
            .ok_or(WalletError::MintNotFound { mint_url })
    }

    /// Unknown mints are untrusted
    pub async fn is_trusted(&self, mint_url: &str) -> WalletResult<bool> {
        let mint_url = normalize_mint_url(mint_url)?;
        Ok(self
            .repos
            .repositories()
            .mints
            .get_mint(&mint_url)
            .await?
            .is_some_and(|m| m.trusted))
    }

    /// Fail with `UntrustedMint` unless the mint is known and trusted
    pub async fn require_trusted(&self, mint_url: &str) -> WalletResult<String> {
        let mint_url = normalize_mint_url(mint_url)?;
        if !self.is_trusted(&mint_url).await? {
            return Err(WalletError::UntrustedMint { mint_url });
        }
        Ok(mint_url)
    }

    /// Re-fetch mint info and keysets
    ///
    /// Keysets the mint no longer lists are removed together with their proofs.
    pub async fn refresh_mint(&self, mint_url: &str) -> WalletResult<Mint> {
        let mut mint = self.get_mint_by_url(mint_url).await?;
        let info = self.connector.get_mint_info(&mint.mint_url).await?;
        let listed = self.connector.get_keysets(&mint.mint_url).await?;
        let listed_ids: HashSet<String> = listed.iter().map(|k| k.id.clone()).collect();

        let now = now_secs();
        mint.name = info.name;
        mint.description = info.description;
        mint.icon_url = info.icon_url;
        mint.updated_at = now;

        let tx = self.repos.begin(None).await?;
        let result = Self::store_mint(tx.repositories(), &mint, listed, now).await;
        finish(tx, result).await?;

        let repos = self.repos.repositories();
        for keyset in repos.keysets.get_keysets_by_mint(&mint.mint_url).await? {
            if listed_ids.contains(&keyset.id) {
                continue;
            }
            self.proofs.wipe_proofs_by_keyset_id(&keyset.id).await?;
            repos.keysets.remove_keyset(&keyset.id).await?;
            log::info!("Removed keyset {} of {}", keyset.id, mint.mint_url);
        }

        self.events.emit(WalletEvent::MintUpdated { mint: mint.clone() });
        Ok(mint)
    }

    pub async fn get_keysets(&self, mint_url: &str) -> WalletResult<Vec<Keyset>> {
        let mint_url = normalize_mint_url(mint_url)?;
        self.repos
            .repositories()
            .keysets
            .get_keysets_by_mint(&mint_url)
            .await
    }

    /// Active keyset in the wallet unit; lowest fee wins a tie
    pub async fn get_active_keyset(&self, mint_url: &str) -> WalletResult<Keyset> {
        self.get_keysets(mint_url)
            .await?
            .into_iter()
            .filter(|k| k.active && k.unit == self.config.unit)
            .min_by(|a, b| a.input_fee_ppk.cmp(&b.input_fee_ppk).then(a.id.cmp(&b.id)))
            .ok_or_else(|| {
                WalletError::validation(format!(
                    "No active {} keyset for mint {}",
                    self.config.unit, mint_url
                ))
            })
    }

    /// Reserve counter values and build blinded outputs for them
    ///
    /// The counter advances in its own unit so values are never reused, even if
    /// the operation that asked for them rolls back.
    pub async fn prepare_outputs(
        &self,
        mint_url: &str,
        primary_amounts: &[u64],
        keep_amounts: &[u64],
    ) -> WalletResult<PendingOutputs> {
        let keyset = self.get_active_keyset(mint_url).await?;
        let count = u32::try_from(primary_amounts.len() + keep_amounts.len())
            .map_err(|_| WalletError::validation("Too many outputs"))?;

        let counter_start = self
            .repos
            .repositories()
            .keysets
            .increment_counter(&keyset.id, count)
            .await?;

        let amounts: Vec<u64> = primary_amounts
            .iter()
            .chain(keep_amounts.iter())
            .copied()
            .collect();
        let mut outputs = self
            .connector
            .prepare_outputs(&keyset.mint_url, &keyset.id, &amounts, counter_start)
            .await?;
        if outputs.len() != amounts.len() {
            return Err(WalletError::Crypto(format!(
                "Expected {} blinded outputs, got {}",
                amounts.len(),
                outputs.len()
            )));
        }
        let keep = outputs.split_off(primary_amounts.len());

        self.events.emit(WalletEvent::CounterUpdated {
            mint_url: keyset.mint_url.clone(),
            keyset_id: keyset.id.clone(),
            counter: counter_start + count,
        });

        Ok(PendingOutputs {
            keyset_id: keyset.id,
            counter_start,
            primary: outputs,
            keep,
        })
    }
}
