//! Wallet services
//!
//! Stateless façades over the repositories. Each service owns handles to the
//! provider, the mint connector and the event bus; none of them hold wallet
//! data in memory.

pub mod history;
pub mod keyring;
pub mod mints;
pub mod proofs;
pub mod quotes;
pub mod wallet;

pub use history::HistoryService;
pub use keyring::{GenerateKeyOptions, GeneratedKeyPair, KeyRingService};
pub use mints::MintService;
pub use proofs::{select_proofs, ProofReconcileReport, ProofSelection, ProofService};
pub use quotes::QuoteService;
pub use wallet::{ReceiveResult, WalletService};
