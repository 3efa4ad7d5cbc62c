//! Forwarder: builds, signs, journals and broadcasts the outbound transfer

use super::nonce::NonceManager;
use super::planner::ForwardPlan;
use crate::chain::ChainGateway;
use crate::config::WalletConfig;
use crate::error::{EscrowError, EscrowResult};
use crate::state::{EscrowRecord, EscrowStatus, LedgerStore};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, H256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Node responses that mean an identical payload is already in flight
const ALREADY_SEEN: [&str; 2] = ["already known", "known transaction"];

/// Outcome of a successful broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardResult {
    pub tx_hash: H256,
    pub nonce: u64,
}

/// Forward failure, split by whether anything left the process
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Nothing was signed or journaled; the record is untouched
    #[error("forward not sent: {0}")]
    NotSent(EscrowError),

    /// The signed payload is journaled but the node did not accept it
    #[error("broadcast of {tx_hash:?} failed: {source}")]
    Broadcast { tx_hash: H256, source: EscrowError },
}

/// Load the escrow signing key from the configured environment variable
pub fn load_wallet(config: &WalletConfig) -> EscrowResult<LocalWallet> {
    let key = std::env::var(&config.private_key_env).map_err(|_| {
        EscrowError::Wallet(format!(
            "No wallet configured. Set {}",
            config.private_key_env
        ))
    })?;

    key.trim()
        .parse::<LocalWallet>()
        .map_err(|e| EscrowError::Wallet(format!("Invalid private key: {}", e)))
}

/// Sends the net amount from the escrow wallet to the record's destination
pub struct Forwarder {
    gateway: Arc<dyn ChainGateway>,
    ledger: Arc<LedgerStore>,
    nonce_manager: NonceManager,
    wallet: LocalWallet,
    /// Chain id from configuration; signing is refused on any other network
    expected_chain_id: Option<u64>,
}

impl Forwarder {
    pub fn new(
        gateway: Arc<dyn ChainGateway>,
        ledger: Arc<LedgerStore>,
        wallet: LocalWallet,
        expected_chain_id: Option<u64>,
    ) -> Self {
        info!("Forwarder initialized with escrow wallet: {:?}", wallet.address());

        Self {
            gateway,
            ledger,
            nonce_manager: NonceManager::new(wallet.address()),
            wallet,
            expected_chain_id,
        }
    }

    pub fn escrow_address(&self) -> Address {
        self.wallet.address()
    }

    /// Chain id reported by the node, checked against configuration
    pub async fn chain_id(&self) -> EscrowResult<u64> {
        let chain_id = self.gateway.chain_id().await?;
        match self.expected_chain_id {
            Some(expected) if expected != chain_id => Err(EscrowError::Config(format!(
                "Node is on chain {} but chain {} is configured",
                chain_id, expected
            ))),
            _ => Ok(chain_id),
        }
    }

    /// Sign, journal and broadcast the transfer described by `plan`
    pub async fn forward(
        &self,
        record: &EscrowRecord,
        plan: &ForwardPlan,
    ) -> Result<ForwardResult, ForwardError> {
        let mut lease = self.nonce_manager.acquire().await;

        // Re-read under the wallet lock; the ledger copy is authoritative
        let mut current = self
            .ledger
            .get(&record.id)
            .await
            .ok_or_else(|| {
                ForwardError::NotSent(EscrowError::NotFound {
                    id: record.id.clone(),
                })
            })?;
        if let Some(existing) = current.forward_tx_hash {
            return Err(ForwardError::NotSent(EscrowError::AlreadyForwarded {
                id: record.id.clone(),
                forward_tx_hash: format!("{:?}", existing),
            }));
        }

        // Journaled payloads that may still be unsent keep their nonces
        if let Some(held) = self.highest_journaled_nonce().await {
            lease.reserve(held);
        }

        let chain_id = self.chain_id().await.map_err(ForwardError::NotSent)?;
        let nonce = lease
            .next(self.gateway.as_ref())
            .await
            .map_err(ForwardError::NotSent)?;

        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.wallet.address())
            .to(current.destination)
            .value(plan.forward_amount)
            .nonce(nonce)
            .gas(plan.gas_limit)
            .gas_price(plan.gas_price)
            .chain_id(chain_id)
            .into();

        let signature = self
            .wallet
            .clone()
            .with_chain_id(chain_id)
            .sign_transaction(&tx)
            .await
            .map_err(|e| ForwardError::NotSent(EscrowError::Wallet(e.to_string())))?;
        let raw = tx.rlp_signed(&signature);
        let tx_hash = payload_hash(&raw);

        current
            .journal_forward(tx_hash, raw.clone(), nonce, plan.forward_amount, plan.fee_amount)
            .map_err(ForwardError::NotSent)?;
        self.ledger
            .upsert(current)
            .await
            .map_err(ForwardError::NotSent)?;

        info!(
            "Forwarding {} wei for {} to {:?} (nonce {}, tx {:?})",
            plan.forward_amount, record.id, record.destination, nonce, tx_hash
        );

        match self.gateway.send_raw_signed(raw).await {
            Ok(node_hash) => {
                if node_hash != tx_hash {
                    warn!(
                        "Node returned {:?} for forward {:?} of {}",
                        node_hash, tx_hash, record.id
                    );
                }
                lease.confirm(nonce);
                crate::metrics::record_forward_broadcast();
                Ok(ForwardResult { tx_hash, nonce })
            }
            Err(source) => {
                error!("Forward broadcast for {} failed: {}", record.id, source);
                Err(ForwardError::Broadcast { tx_hash, source })
            }
        }
    }

    /// Re-send a journaled payload after a restart; never signs anything new
    pub async fn rebroadcast(&self, record: &EscrowRecord) -> Result<ForwardResult, ForwardError> {
        let (Some(tx_hash), Some(raw)) = (record.forward_tx_hash, record.forward_raw_tx.clone())
        else {
            return Err(ForwardError::NotSent(EscrowError::Internal(format!(
                "transaction {} has no journaled forward",
                record.id
            ))));
        };
        let nonce = record.forward_nonce.ok_or_else(|| {
            ForwardError::NotSent(EscrowError::Nonce(format!(
                "transaction {} has no journaled nonce",
                record.id
            )))
        })?;

        let mut lease = self.nonce_manager.acquire().await;
        info!("Re-broadcasting journaled forward {:?} for {}", tx_hash, record.id);

        match self.gateway.send_raw_signed(raw).await {
            Ok(_) => {}
            Err(EscrowError::Broadcast(message)) if is_already_seen(&message) => {
                info!("Forward {:?} already known to the node: {}", tx_hash, message);
            }
            // Only our own payload landing makes this a success
            Err(EscrowError::Broadcast(message)) if is_nonce_too_low(&message) => {
                let landed = self
                    .gateway
                    .get_transaction(tx_hash)
                    .await
                    .map_err(ForwardError::NotSent)?;
                if landed.is_none() {
                    return Err(ForwardError::Broadcast {
                        tx_hash,
                        source: EscrowError::Nonce(format!(
                            "nonce {} was used by another transaction",
                            nonce
                        )),
                    });
                }
                info!("Forward {:?} already on chain", tx_hash);
            }
            Err(source) => return Err(ForwardError::Broadcast { tx_hash, source }),
        }

        lease.confirm(nonce);
        Ok(ForwardResult { tx_hash, nonce })
    }

    async fn highest_journaled_nonce(&self) -> Option<u64> {
        self.ledger
            .list()
            .await
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    EscrowStatus::Verified | EscrowStatus::ForwardingPending
                )
            })
            .filter_map(|r| r.forward_nonce)
            .max()
    }
}

fn is_already_seen(message: &str) -> bool {
    let message = message.to_lowercase();
    ALREADY_SEEN.iter().any(|needle| message.contains(needle))
}

fn is_nonce_too_low(message: &str) -> bool {
    message.to_lowercase().contains("nonce too low")
}

/// Hash the chain assigns to a signed legacy payload
pub fn payload_hash(raw: &Bytes) -> H256 {
    H256::from(ethers::utils::keccak256(raw))
}
