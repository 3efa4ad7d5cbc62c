//! Confirmation counting and canonical-chain checks
//!
//! A receipt is final once `current_height - receipt.block_number` reaches the
//! configured threshold and the block it points at is still canonical.

use super::{ChainGateway, ObservedReceipt};
use crate::error::EscrowResult;

use std::sync::Arc;
use tracing::{debug, warn};

/// Where a receipt stands against the confirmation threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    /// Not mined yet (or unknown to the node)
    Absent,
    /// Mined with status 0
    Reverted { block_number: u64 },
    Confirming { block_number: u64, confirmations: u64 },
    Confirmed { block_number: u64, confirmations: u64 },
}

/// Classify a receipt against a block height read once per poll cycle
pub fn receipt_status(
    receipt: Option<&ObservedReceipt>,
    current_height: u64,
    required_confirmations: u64,
) -> ReceiptStatus {
    let Some(receipt) = receipt else {
        return ReceiptStatus::Absent;
    };

    if !receipt.success {
        return ReceiptStatus::Reverted {
            block_number: receipt.block_number,
        };
    }

    // A lagging node can report a height below the receipt's block
    let confirmations = current_height.saturating_sub(receipt.block_number);
    if confirmations >= required_confirmations {
        ReceiptStatus::Confirmed {
            block_number: receipt.block_number,
            confirmations,
        }
    } else {
        ReceiptStatus::Confirming {
            block_number: receipt.block_number,
            confirmations,
        }
    }
}

/// Threshold plus reorg check against the gateway
pub struct FinalityChecker {
    gateway: Arc<dyn ChainGateway>,
    required_confirmations: u64,
}

impl FinalityChecker {
    pub fn new(gateway: Arc<dyn ChainGateway>, required_confirmations: u64) -> Self {
        Self {
            gateway,
            required_confirmations,
        }
    }

    pub fn status(&self, receipt: Option<&ObservedReceipt>, current_height: u64) -> ReceiptStatus {
        receipt_status(receipt, current_height, self.required_confirmations)
    }

    /// Whether the receipt's block is still the canonical block at its height
    ///
    /// Receipts without a block hash (some light nodes) are trusted as-is.
    pub async fn is_canonical(&self, receipt: &ObservedReceipt) -> EscrowResult<bool> {
        let Some(expected) = receipt.block_hash else {
            debug!("Receipt {:?} carries no block hash", receipt.tx_hash);
            return Ok(true);
        };

        match self.gateway.block_hash(receipt.block_number).await? {
            Some(actual) if actual == expected => Ok(true),
            actual => {
                warn!(
                    "Reorg suspected for {:?}: block {} is now {:?}, receipt says {:?}",
                    receipt.tx_hash, receipt.block_number, actual, expected
                );
                Ok(false)
            }
        }
    }
}
