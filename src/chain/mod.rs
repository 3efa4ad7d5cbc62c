//! Chain module - the RPC capability the escrow engine depends on
//!
//! This module provides:
//! - The `ChainGateway` contract consumed by the lifecycle engine
//! - An ethers JSON-RPC implementation with multi-URL failover
//! - Confirmation counting and canonical-block checks

pub mod finality;
pub mod provider;

pub use finality::{receipt_status, FinalityChecker, ReceiptStatus};
pub use provider::ChainProvider;

use crate::error::EscrowResult;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};

/// Receipt fields the engine relies on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedReceipt {
    pub tx_hash: H256,
    /// `true` when the receipt status is 1
    pub success: bool,
    pub block_number: u64,
    pub block_hash: Option<H256>,
}

/// Transaction fields the deposit validator compares against the record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedTransaction {
    pub hash: H256,
    pub from: Address,
    /// `None` for contract creation
    pub to: Option<Address>,
    pub value: U256,
}

/// Blocking chain RPC capability
///
/// Every call is a network round trip; errors are transient unless the
/// caller decides otherwise.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Mined receipt, or `None` while the transaction is unknown or pending
    async fn get_receipt(&self, tx_hash: H256) -> EscrowResult<Option<ObservedReceipt>>;

    async fn get_transaction(&self, tx_hash: H256) -> EscrowResult<Option<ObservedTransaction>>;

    async fn current_block_height(&self) -> EscrowResult<u64>;

    /// Canonical hash of the block at `number`
    async fn block_hash(&self, number: u64) -> EscrowResult<Option<H256>>;

    /// Wei per gas unit
    async fn gas_price(&self) -> EscrowResult<U256>;

    async fn chain_id(&self) -> EscrowResult<u64>;

    /// Next nonce for `address`, counting transactions still in the mempool
    async fn pending_nonce(&self, address: Address) -> EscrowResult<u64>;

    async fn send_raw_signed(&self, raw: Bytes) -> EscrowResult<H256>;
}
