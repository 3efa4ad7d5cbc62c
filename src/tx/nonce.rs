//! Nonce management for the escrow wallet
//!
//! Handles:
//! - Serializing sign-and-broadcast so two forwards never share a nonce
//! - Fetching the pending-inclusive nonce immediately before each signature
//! - Guarding against a node that lags behind our own broadcasts

use crate::chain::ChainGateway;
use crate::error::EscrowResult;

use ethers::types::Address;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Local view of the wallet's nonce sequence
#[derive(Debug, Default)]
pub struct NonceState {
    /// Highest nonce known to be taken, by an accepted broadcast or a
    /// journaled payload still waiting to be sent
    last_used: Option<u64>,
}

/// Manages the single escrow wallet's nonces
pub struct NonceManager {
    wallet_address: Address,
    state: Mutex<NonceState>,
}

/// Exclusive hold on the wallet's nonce sequence until dropped
pub struct NonceLease<'a> {
    wallet_address: Address,
    state: MutexGuard<'a, NonceState>,
}

impl NonceManager {
    pub fn new(wallet_address: Address) -> Self {
        Self {
            wallet_address,
            state: Mutex::new(NonceState::default()),
        }
    }

    /// Wait for exclusive use of the wallet
    pub async fn acquire(&self) -> NonceLease<'_> {
        NonceLease {
            wallet_address: self.wallet_address,
            state: self.state.lock().await,
        }
    }
}

impl NonceLease<'_> {
    /// Next nonce to sign with
    ///
    /// The node's pending count is authoritative unless it is behind a
    /// nonce this process already broadcast.
    pub async fn next(&self, gateway: &dyn ChainGateway) -> EscrowResult<u64> {
        let on_chain = gateway.pending_nonce(self.wallet_address).await?;

        let nonce = match self.state.last_used {
            Some(last) if on_chain <= last => {
                warn!(
                    "Node reports pending nonce {} but {} was already used, using {}",
                    on_chain,
                    last,
                    last + 1
                );
                last + 1
            }
            _ => on_chain,
        };

        debug!("Allocated nonce {} for {:?}", nonce, self.wallet_address);
        Ok(nonce)
    }

    /// Mark a nonce as consumed by an accepted broadcast
    pub fn confirm(&mut self, nonce: u64) {
        self.mark_used(nonce);
    }

    /// Hold back a nonce a journaled payload was signed with
    ///
    /// The in-memory view is empty after a restart; the ledger is not.
    pub fn reserve(&mut self, nonce: u64) {
        self.mark_used(nonce);
    }

    fn mark_used(&mut self, nonce: u64) {
        if self.state.last_used.map_or(true, |last| nonce > last) {
            self.state.last_used = Some(nonce);
        }
    }
}
