// =============================================================================
// Watchers — concrete watch loops plus the shared runtime they embed
// =============================================================================

pub mod airdrop;
pub mod base;
pub mod pool;
pub mod token;
pub mod wallet;
pub mod wallet_tracker;

pub use airdrop::AirdropWatcher;
pub use base::{Watcher, WatcherRuntime};
pub use pool::WatcherPool;
pub use token::TokenWatcher;
pub use wallet::WalletWatcher;
