// =============================================================================
// Wallet Tracker — per-chain polymorphism behind one capability trait
// =============================================================================
//
// The abstract `WalletTracker` of §9's Design Notes: EVM and Solana have
// entirely different data shapes (logs vs. parsed transactions), but the
// wallet watcher only needs one operation out of either — fetch whatever
// changed for a batch of addresses and hand back a uniform `WalletSnapshot`.
// =============================================================================

pub mod evm;
pub mod solana;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::models::WalletSnapshot;

pub use evm::EvmWalletTracker;
pub use solana::SolanaWalletTracker;

#[async_trait]
pub trait WalletTracker: Send + Sync {
    async fn get_wallet_data(&self, wallets: &[String]) -> anyhow::Result<HashMap<String, WalletSnapshot>>;
}
