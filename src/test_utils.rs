//! Fixtures and a scripted in-memory chain for tests

use crate::chain::{ChainGateway, ObservedReceipt, ObservedTransaction};
use crate::error::{EscrowError, EscrowResult};
use crate::state::{EscrowRecord, EscrowStatus, LedgerStore};

use async_trait::async_trait;
use chrono::Utc;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, Transaction, H256, U256};
use ethers::utils::{keccak256, rlp};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// First well-known development key; never holds real funds
pub const TEST_PRIVATE_KEY: &str =
    "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub const TEST_CHAIN_ID: u64 = 11155111;

pub fn test_wallet() -> LocalWallet {
    TEST_PRIVATE_KEY
        .parse::<LocalWallet>()
        .unwrap()
        .with_chain_id(TEST_CHAIN_ID)
}

pub fn escrow_address() -> Address {
    test_wallet().address()
}

pub fn sender_address() -> Address {
    Address::repeat_byte(0x11)
}

pub fn destination_address() -> Address {
    Address::repeat_byte(0x22)
}

/// Pending record: 1_000_000 wei deposit, 950_000 requested, 50_000 gas buffer
pub fn sample_record_with_id(n: u8) -> EscrowRecord {
    EscrowRecord {
        id: format!("{:?}", H256::repeat_byte(n)),
        sender: sender_address(),
        destination: destination_address(),
        deposit_wei: U256::from(1_000_000),
        recipient_amount_wei: U256::from(950_000),
        gas_buffer_wei: U256::from(50_000),
        fee_wei: U256::from(10_000),
        forwarded_amount_wei: None,
        status: EscrowStatus::Pending,
        forward_tx_hash: None,
        forward_raw_tx: None,
        forward_nonce: None,
        escrow_block: None,
        forward_block: None,
        error: None,
        created_at: Utc::now(),
        verified_at: None,
        forwarded_at: None,
        completed_at: None,
        failed_at: None,
        client_token: format!("{:0>64}", format!("{:x}", n)),
    }
}

pub fn sample_record() -> EscrowRecord {
    sample_record_with_id(0xaa)
}

pub fn verified_record() -> EscrowRecord {
    let mut record = sample_record();
    record.mark_verified(100, Utc::now()).unwrap();
    record
}

/// Ledger in a fresh temp dir; keep the `TempDir` alive for the test
pub fn temp_ledger() -> (Arc<LedgerStore>, TempDir) {
    let dir = TempDir::new().unwrap();
    let ledger = LedgerStore::open(dir.path().join("transactions.json")).unwrap();
    (Arc::new(ledger), dir)
}

/// Canonical hash the fake chain reports for a block
pub fn block_hash_at(number: u64) -> H256 {
    H256::from_low_u64_be(number + 1)
}

#[derive(Debug, Default)]
pub struct FakeChainState {
    pub height: u64,
    pub receipts: HashMap<H256, ObservedReceipt>,
    pub transactions: HashMap<H256, ObservedTransaction>,
    /// Overrides of the canonical block hash, used to simulate reorgs
    pub replaced_blocks: HashMap<u64, H256>,
    pub gas_price: U256,
    pub chain_id: u64,
    /// Next pending nonce of the escrow wallet
    pub nonce: u64,
    /// Nonces taken by accepted payloads
    pub used_nonces: HashSet<u64>,
    pub sent: Vec<Bytes>,
    pub height_unavailable: bool,
    pub gas_price_unavailable: bool,
    pub broadcast_rejection: Option<String>,
}

/// Scripted chain: tests place deposits and mine broadcasts explicitly
///
/// Broadcasts are decoded and a nonce is accepted once, like a node would.
pub struct FakeChain {
    state: Mutex<FakeChainState>,
}

impl FakeChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeChainState {
                gas_price: U256::from(2),
                chain_id: TEST_CHAIN_ID,
                ..Default::default()
            }),
        }
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&mut FakeChainState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_height(&self, height: u64) {
        self.with_state(|s| s.height = height);
    }

    /// Put a transaction and its receipt on chain
    pub fn add_transaction(&self, tx: ObservedTransaction, block_number: u64, success: bool) {
        self.with_state(|s| {
            s.receipts.insert(
                tx.hash,
                ObservedReceipt {
                    tx_hash: tx.hash,
                    success,
                    block_number,
                    block_hash: Some(block_hash_at(block_number)),
                },
            );
            s.transactions.insert(tx.hash, tx);
        });
    }

    /// Mine the deposit the record declares, exactly as declared
    pub fn add_deposit(&self, record: &EscrowRecord, block_number: u64) {
        self.add_transaction(
            ObservedTransaction {
                hash: record.escrow_tx_hash().unwrap(),
                from: record.sender,
                to: Some(escrow_address()),
                value: record.deposit_wei,
            },
            block_number,
            true,
        );
    }

    /// Mine every broadcast payload not yet mined
    pub fn mine_sent(&self, block_number: u64, success: bool) {
        self.with_state(|s| {
            for raw in &s.sent {
                let hash = H256::from(keccak256(raw));
                s.receipts.entry(hash).or_insert(ObservedReceipt {
                    tx_hash: hash,
                    success,
                    block_number,
                    block_hash: Some(block_hash_at(block_number)),
                });
            }
        });
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.with_state(|s| s.sent.clone())
    }
}

#[async_trait]
impl ChainGateway for FakeChain {
    async fn get_receipt(&self, tx_hash: H256) -> EscrowResult<Option<ObservedReceipt>> {
        Ok(self.with_state(|s| s.receipts.get(&tx_hash).cloned()))
    }

    async fn get_transaction(&self, tx_hash: H256) -> EscrowResult<Option<ObservedTransaction>> {
        Ok(self.with_state(|s| s.transactions.get(&tx_hash).cloned()))
    }

    async fn current_block_height(&self) -> EscrowResult<u64> {
        self.with_state(|s| {
            if s.height_unavailable {
                Err(EscrowError::ChainConnection {
                    message: "eth_blockNumber: node unavailable".to_string(),
                })
            } else {
                Ok(s.height)
            }
        })
    }

    async fn block_hash(&self, number: u64) -> EscrowResult<Option<H256>> {
        Ok(self.with_state(|s| {
            Some(
                s.replaced_blocks
                    .get(&number)
                    .copied()
                    .unwrap_or_else(|| block_hash_at(number)),
            )
        }))
    }

    async fn gas_price(&self) -> EscrowResult<U256> {
        self.with_state(|s| {
            if s.gas_price_unavailable {
                Err(EscrowError::Timeout {
                    operation: "eth_gasPrice".to_string(),
                })
            } else {
                Ok(s.gas_price)
            }
        })
    }

    async fn chain_id(&self) -> EscrowResult<u64> {
        Ok(self.with_state(|s| s.chain_id))
    }

    async fn pending_nonce(&self, _address: Address) -> EscrowResult<u64> {
        Ok(self.with_state(|s| s.nonce))
    }

    async fn send_raw_signed(&self, raw: Bytes) -> EscrowResult<H256> {
        let decoded: Transaction = rlp::decode(raw.as_ref())
            .map_err(|e| EscrowError::Broadcast(format!("rlp: {}", e)))?;
        let nonce = decoded.nonce.as_u64();

        self.with_state(|s| {
            if let Some(reason) = &s.broadcast_rejection {
                return Err(EscrowError::Broadcast(reason.clone()));
            }
            if s.sent.contains(&raw) {
                return Err(EscrowError::Broadcast("already known".to_string()));
            }
            if s.used_nonces.contains(&nonce) {
                return Err(EscrowError::Broadcast(format!(
                    "nonce too low: nonce {} already used",
                    nonce
                )));
            }

            let hash = H256::from(keccak256(&raw));
            s.used_nonces.insert(nonce);
            s.nonce = s.nonce.max(nonce + 1);
            s.transactions.insert(
                hash,
                ObservedTransaction {
                    hash,
                    from: escrow_address(),
                    to: decoded.to,
                    value: decoded.value,
                },
            );
            s.sent.push(raw);
            Ok(hash)
        })
    }
}
