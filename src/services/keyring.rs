//! KeyRing Service
//!
//! Deterministic and imported keypairs used to unlock P2PK proofs (NUT-11).
//!
//! Keys are derived from the wallet seed along `m/129372'/10'/0'/0'/{index}`.
//! The same seed always reproduces the same key at the same index, so P2PK
//! keys can be recovered from the seed alone.

use std::str::FromStr;
use std::sync::Arc;

use bip32::{DerivationPath, XPrv};
use cdk::nuts::SecretKey;
use rand::RngCore;
use serde::Serialize;

use crate::errors::{WalletError, WalletResult};
use crate::mint_client::SeedProvider;
use crate::stores::{finish, Repositories, RepositoryProvider};
use crate::types::{CashuProof, Keypair};
use crate::utils::now_secs;

/// NUT-13 style purpose for P2PK keys
pub const DERIVATION_PURPOSE: u32 = 129372;
pub const DERIVATION_COIN_TYPE: u32 = 10;

/// Derivation path of the key at `index`
pub fn derivation_path(index: u32) -> String {
    format!(
        "m/{}'/{}'/0'/0'/{}",
        DERIVATION_PURPOSE, DERIVATION_COIN_TYPE, index
    )
}

/// Options for `generate_new_key_pair`
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateKeyOptions {
    /// Return the secret key alongside the public key
    pub dump_secret_key: bool,
}

/// Result of a key generation; the secret is only present when asked for
#[derive(Clone, Serialize)]
pub struct GeneratedKeyPair {
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    pub derivation_index: Option<u32>,
}

impl std::fmt::Debug for GeneratedKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedKeyPair")
            .field("public_key", &self.public_key)
            .field("derivation_index", &self.derivation_index)
            .finish_non_exhaustive()
    }
}

/// P2PK witness (NUT-11)
#[derive(Debug, Serialize)]
struct P2pkWitness {
    signatures: Vec<String>,
}

fn crypto_err(e: impl std::fmt::Display) -> WalletError {
    WalletError::Crypto(e.to_string())
}

fn public_key_for(secret: &[u8; 32]) -> WalletResult<String> {
    let secret_key = SecretKey::from_slice(secret).map_err(crypto_err)?;
    Ok(secret_key.public_key().to_hex())
}

/// Derive the secret key bytes at `index`
pub fn derive_secret_key(seed: &[u8], index: u32) -> WalletResult<[u8; 32]> {
    let path = DerivationPath::from_str(&derivation_path(index)).map_err(crypto_err)?;
    let xprv = XPrv::derive_from_path(seed, &path).map_err(crypto_err)?;
    Ok(xprv.to_bytes())
}

/// Validate and normalise a compressed public key given as hex
fn normalize_public_key(public_key: &str) -> WalletResult<String> {
    let trimmed = public_key.trim();
    if trimmed.is_empty() {
        return Err(WalletError::validation("Public key is empty"));
    }
    let bytes = hex::decode(trimmed)
        .map_err(|e| WalletError::validation(format!("Public key is not hex: {}", e)))?;
    if bytes.len() != 33 {
        return Err(WalletError::validation(format!(
            "Public key must be 33 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(trimmed.to_lowercase())
}

pub struct KeyRingService {
    repos: Arc<dyn RepositoryProvider>,
    seed: Arc<dyn SeedProvider>,
}

impl KeyRingService {
    pub fn new(repos: Arc<dyn RepositoryProvider>, seed: Arc<dyn SeedProvider>) -> Self {
        Self { repos, seed }
    }

    /// Derive and store the key at the next unused index
    ///
    /// If the derived key was imported earlier without an index, the index is
    /// attached to the stored pair.
    pub async fn generate_new_key_pair(
        &self,
        options: GenerateKeyOptions,
    ) -> WalletResult<GeneratedKeyPair> {
        let seed = self.seed.seed().await?;

        let tx = self.repos.begin(None).await?;
        let result = Self::derive_next(tx.repositories(), &seed).await;
        let keypair = finish(tx, result).await?;

        log::info!(
            "Generated keypair {} at index {:?}",
            keypair.public_key,
            keypair.derivation_index
        );
        Ok(Self::generated(&keypair, options.dump_secret_key))
    }

    /// Create a random, non-derived keypair
    pub async fn generate_random_key_pair(
        &self,
        options: GenerateKeyOptions,
    ) -> WalletResult<GeneratedKeyPair> {
        let mut secret_key = [0u8; 32];
        let public_key = loop {
            rand::thread_rng().fill_bytes(&mut secret_key);
            if let Ok(public_key) = public_key_for(&secret_key) {
                break public_key;
            }
        };

        let keypair = Keypair {
            public_key,
            secret_key,
            derivation_index: None,
            derivation_path: None,
            created_at: now_secs(),
        };
        self.repos
            .repositories()
            .keyring
            .save_key_pair(keypair.clone())
            .await?;
        Ok(Self::generated(&keypair, options.dump_secret_key))
    }

    /// Import an externally supplied 32-byte secret key
    ///
    /// Importing a key that is already held keeps the stored pair, including any
    /// derivation index it has.
    pub async fn add_key_pair(&self, secret_key: &[u8]) -> WalletResult<String> {
        let secret_key: [u8; 32] = secret_key.try_into().map_err(|_| {
            WalletError::validation(format!(
                "Secret key must be 32 bytes, got {}",
                secret_key.len()
            ))
        })?;
        let public_key = public_key_for(&secret_key)?;

        let repos = self.repos.repositories();
        if repos.keyring.get_key_pair(&public_key).await?.is_some() {
            log::debug!("Keypair {} already in keyring", public_key);
            return Ok(public_key);
        }

        repos
            .keyring
            .save_key_pair(Keypair {
                public_key: public_key.clone(),
                secret_key,
                derivation_index: None,
                derivation_path: None,
                created_at: now_secs(),
            })
            .await?;
        log::info!("Imported keypair {}", public_key);
        Ok(public_key)
    }

    pub async fn get_key_pair(&self, public_key: &str) -> WalletResult<Option<Keypair>> {
        let public_key = normalize_public_key(public_key)?;
        self.repos
            .repositories()
            .keyring
            .get_key_pair(&public_key)
            .await
    }

    pub async fn get_latest_key_pair(&self) -> WalletResult<Option<Keypair>> {
        self.repos.repositories().keyring.get_latest_key_pair().await
    }

    pub async fn get_all_key_pairs(&self) -> WalletResult<Vec<Keypair>> {
        self.repos.repositories().keyring.get_all_key_pairs().await
    }

    pub async fn remove_key_pair(&self, public_key: &str) -> WalletResult<()> {
        let public_key = normalize_public_key(public_key)?;
        self.repos
            .repositories()
            .keyring
            .remove_key_pair(&public_key)
            .await
    }

    /// Sign a P2PK-locked proof with a held key
    ///
    /// Returns a copy of the proof with the witness attached; the input is untouched.
    pub async fn sign_proof(&self, proof: &CashuProof, public_key: &str) -> WalletResult<CashuProof> {
        if proof.secret.is_empty() {
            return Err(WalletError::validation("Proof secret is empty"));
        }
        let public_key = normalize_public_key(public_key)?;
        let keypair = self
            .repos
            .repositories()
            .keyring
            .get_key_pair(&public_key)
            .await?
            .ok_or_else(|| WalletError::KeyNotFound {
                public_key: public_key.clone(),
            })?;

        let secret_key = SecretKey::from_slice(&keypair.secret_key).map_err(crypto_err)?;
        let signature = secret_key
            .sign(proof.secret.as_bytes())
            .map_err(crypto_err)?;
        let witness = serde_json::to_string(&P2pkWitness {
            signatures: vec![signature.to_string()],
        })?;

        let mut signed = proof.clone();
        signed.witness = Some(witness);
        Ok(signed)
    }

    async fn derive_next(repos: &Repositories, seed: &[u8]) -> WalletResult<Keypair> {
        let mut index = repos
            .keyring
            .get_all_key_pairs()
            .await?
            .iter()
            .filter_map(|k| k.derivation_index)
            .max()
            .map_or(0, |max| max + 1);

        loop {
            let secret_key = derive_secret_key(seed, index)?;
            let public_key = public_key_for(&secret_key)?;

            match repos.keyring.get_key_pair(&public_key).await? {
                Some(existing) if existing.derivation_index.is_some() => {
                    index = index.checked_add(1).ok_or_else(|| {
                        WalletError::Crypto("Derivation index exhausted".to_string())
                    })?;
                }
                Some(mut imported) => {
                    log::info!(
                        "Derived key at index {} matches imported key {}, attaching index",
                        index,
                        public_key
                    );
                    imported.derivation_index = Some(index);
                    imported.derivation_path = Some(derivation_path(index));
                    repos.keyring.save_key_pair(imported.clone()).await?;
                    return Ok(imported);
                }
                None => {
                    let keypair = Keypair {
                        public_key,
                        secret_key,
                        derivation_index: Some(index),
                        derivation_path: Some(derivation_path(index)),
                        created_at: now_secs(),
                    };
                    repos.keyring.save_key_pair(keypair.clone()).await?;
                    return Ok(keypair);
                }
            }
        }
    }

    fn generated(keypair: &Keypair, dump_secret_key: bool) -> GeneratedKeyPair {
        GeneratedKeyPair {
            public_key: keypair.public_key.clone(),
            secret_key: dump_secret_key.then(|| hex::encode(keypair.secret_key)),
            derivation_index: keypair.derivation_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryRepositoryProvider;
    use crate::test_utils::FixedSeed;

    const SEED: &[u8] = b"keyring test seed keyring test seed keyring test seed 64 bytes!!";

    fn keyring() -> KeyRingService {
        KeyRingService::new(
            Arc::new(MemoryRepositoryProvider::new()),
            Arc::new(FixedSeed::new(SEED)),
        )
    }

    #[test]
    fn test_derivation_path() {
        assert_eq!(derivation_path(7), "m/129372'/10'/0'/0'/7");
    }

    #[tokio::test]
    async fn test_generate_hides_secret_by_default() {
        let ring = keyring();
        let key = ring
            .generate_new_key_pair(GenerateKeyOptions::default())
            .await
            .unwrap();
        assert!(key.secret_key.is_none());
        assert_eq!(key.derivation_index, Some(0));
        assert_eq!(key.public_key.len(), 66);

        let dumped = ring
            .generate_new_key_pair(GenerateKeyOptions {
                dump_secret_key: true,
            })
            .await
            .unwrap();
        assert_eq!(dumped.derivation_index, Some(1));
        assert_eq!(
            dumped.secret_key.unwrap(),
            hex::encode(derive_secret_key(SEED, 1).unwrap())
        );
    }

    #[tokio::test]
    async fn test_deterministic_derivation_survives_import() {
        let a = keyring();
        let b = keyring();

        let mut from_a = Vec::new();
        for _ in 0..3 {
            from_a.push(
                a.generate_new_key_pair(GenerateKeyOptions { dump_secret_key: true })
                    .await
                    .unwrap(),
            );
        }

        let mut from_b = Vec::new();
        from_b.push(
            b.generate_new_key_pair(GenerateKeyOptions { dump_secret_key: true })
                .await
                .unwrap(),
        );
        b.add_key_pair(&[7u8; 32]).await.unwrap();
        for _ in 0..2 {
            from_b.push(
                b.generate_new_key_pair(GenerateKeyOptions { dump_secret_key: true })
                    .await
                    .unwrap(),
            );
        }

        for (x, y) in from_a.iter().zip(from_b.iter()) {
            assert_eq!(x.public_key, y.public_key);
            assert_eq!(x.secret_key, y.secret_key);
            assert_eq!(x.derivation_index, y.derivation_index);
        }
    }

    #[tokio::test]
    async fn test_import_then_derive_attaches_index() {
        let ring = keyring();
        let secret = derive_secret_key(SEED, 0).unwrap();
        let public_key = ring.add_key_pair(&secret).await.unwrap();

        let imported = ring.get_key_pair(&public_key).await.unwrap().unwrap();
        assert_eq!(imported.derivation_index, None);

        let derived = ring
            .generate_new_key_pair(GenerateKeyOptions::default())
            .await
            .unwrap();
        assert_eq!(derived.public_key, public_key);
        assert_eq!(derived.derivation_index, Some(0));

        let stored = ring.get_key_pair(&public_key).await.unwrap().unwrap();
        assert_eq!(stored.derivation_index, Some(0));
        assert_eq!(stored.derivation_path.as_deref(), Some("m/129372'/10'/0'/0'/0"));
        assert_eq!(ring.get_all_key_pairs().await.unwrap().len(), 1);

        // Re-importing keeps the attached index
        ring.add_key_pair(&secret).await.unwrap();
        let stored = ring.get_key_pair(&public_key).await.unwrap().unwrap();
        assert_eq!(stored.derivation_index, Some(0));
    }

    #[tokio::test]
    async fn test_lookup_validation() {
        let ring = keyring();
        assert!(ring.add_key_pair(&[1u8; 31]).await.is_err());
        assert!(ring.get_key_pair("").await.unwrap_err().to_string().contains("empty"));
        assert!(ring.get_key_pair("zz").await.is_err());

        let absent = format!("02{}", "11".repeat(32));
        assert!(ring.get_key_pair(&absent).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sign_proof() {
        let ring = keyring();
        let key = ring
            .generate_new_key_pair(GenerateKeyOptions::default())
            .await
            .unwrap();

        let proof = CashuProof {
            id: "00ks".into(),
            amount: 4,
            secret: format!(r#"["P2PK",{{"nonce":"n1","data":"{}"}}]"#, key.public_key),
            c: "02aa".into(),
            witness: None,
            dleq: None,
        };

        let signed = ring.sign_proof(&proof, &key.public_key).await.unwrap();
        assert!(proof.witness.is_none());
        let witness: serde_json::Value =
            serde_json::from_str(signed.witness.as_deref().unwrap()).unwrap();
        assert_eq!(witness["signatures"].as_array().unwrap().len(), 1);
        assert_eq!(witness["signatures"][0].as_str().unwrap().len(), 128);

        let other = format!("03{}", "22".repeat(32));
        let err = ring.sign_proof(&proof, &other).await.unwrap_err();
        assert!(matches!(err, WalletError::KeyNotFound { .. }));
    }

    #[tokio::test]
    async fn test_random_and_latest() {
        let ring = keyring();
        assert!(ring.get_latest_key_pair().await.unwrap().is_none());

        let random = ring
            .generate_random_key_pair(GenerateKeyOptions::default())
            .await
            .unwrap();
        assert_eq!(random.derivation_index, None);

        ring.generate_new_key_pair(GenerateKeyOptions::default())
            .await
            .unwrap();
        let derived = ring
            .generate_new_key_pair(GenerateKeyOptions::default())
            .await
            .unwrap();

        let latest = ring.get_latest_key_pair().await.unwrap().unwrap();
        assert_eq!(latest.public_key, derived.public_key);

        ring.remove_key_pair(&derived.public_key).await.unwrap();
        assert!(ring.get_key_pair(&derived.public_key).await.unwrap().is_none());
    }
}
