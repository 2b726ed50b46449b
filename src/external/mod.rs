// =============================================================================
// External Data Clients — price, alerts, EVM RPC, and Solana RPC
// =============================================================================
//
// All wrapped with the shared `retry` backoff helper per §4's "External Data
// Clients" contract.
// =============================================================================

pub mod alerts_client;
pub mod evm_rpc;
pub mod price_client;
pub mod retry;
pub mod solana_rpc;

pub use alerts_client::AlertsClient;
pub use evm_rpc::EvmRpcClient;
pub use price_client::PriceClient;
pub use solana_rpc::SolanaRpcClient;
