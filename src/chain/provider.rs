//! Chain provider with multi-RPC support and automatic failover

use super::{ChainGateway, ObservedReceipt, ObservedTransaction};
use crate::config::ChainConfig;
use crate::error::{EscrowError, EscrowResult};

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::types::{Address, BlockNumber, Bytes, H256, U256};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Per-request timeout
    request_timeout: Duration,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: &ChainConfig) -> EscrowResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider);
                    debug!("Added HTTP provider #{}", http_providers.len());
                }
                Err(e) => {
                    // URLs may embed API keys, keep them out of the logs
                    warn!("Failed to create provider: {}", e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(EscrowError::ChainConnection {
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            http_providers,
            current_provider: AtomicUsize::new(0),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("RPC failover to provider {}", next);
    }

    /// Run a read-only call, rotating through providers on error
    async fn with_failover<T, F, Fut>(&self, operation: &str, call: F) -> EscrowResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = String::from("no providers tried");

        for _ in 0..self.http_providers.len() {
            match timeout(self.request_timeout, call(self.http().clone())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    warn!("{} failed: {}", operation, e);
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!("{} timed out after {:?}", operation, self.request_timeout);
                    last_error = format!("timed out after {:?}", self.request_timeout);
                }
            }
            self.failover();
        }

        Err(EscrowError::ChainConnection {
            message: format!("{}: all providers failed ({})", operation, last_error),
        })
    }
}

#[async_trait]
impl ChainGateway for ChainProvider {
    async fn get_receipt(&self, tx_hash: H256) -> EscrowResult<Option<ObservedReceipt>> {
        let receipt = self
            .with_failover("eth_getTransactionReceipt", |p| async move {
                p.get_transaction_receipt(tx_hash).await
            })
            .await?;

        // A receipt without a block number has not been mined yet
        Ok(receipt.and_then(|r| {
            let block_number = r.block_number?.as_u64();
            Some(ObservedReceipt {
                tx_hash: r.transaction_hash,
                success: r.status == Some(1u64.into()),
                block_number,
                block_hash: r.block_hash,
            })
        }))
    }

    async fn get_transaction(&self, tx_hash: H256) -> EscrowResult<Option<ObservedTransaction>> {
        let tx = self
            .with_failover("eth_getTransactionByHash", |p| async move {
                p.get_transaction(tx_hash).await
            })
            .await?;

        Ok(tx.map(|t| ObservedTransaction {
            hash: t.hash,
            from: t.from,
            to: t.to,
            value: t.value,
        }))
    }

    async fn current_block_height(&self) -> EscrowResult<u64> {
        let block = self
            .with_failover("eth_blockNumber", |p| async move { p.get_block_number().await })
            .await?;
        Ok(block.as_u64())
    }

    async fn block_hash(&self, number: u64) -> EscrowResult<Option<H256>> {
        let block = self
            .with_failover("eth_getBlockByNumber", |p| async move {
                p.get_block(BlockNumber::Number(number.into())).await
            })
            .await?;
        Ok(block.and_then(|b| b.hash))
    }

    async fn gas_price(&self) -> EscrowResult<U256> {
        self.with_failover("eth_gasPrice", |p| async move { p.get_gas_price().await })
            .await
    }

    async fn chain_id(&self) -> EscrowResult<u64> {
        let id = self
            .with_failover("eth_chainId", |p| async move { p.get_chainid().await })
            .await?;
        Ok(id.as_u64())
    }

    async fn pending_nonce(&self, address: Address) -> EscrowResult<u64> {
        let nonce = self
            .with_failover("eth_getTransactionCount", |p| async move {
                p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                    .await
            })
            .await?;
        Ok(nonce.as_u64())
    }

    /// Single attempt on the active provider; a node rejection is final
    async fn send_raw_signed(&self, raw: Bytes) -> EscrowResult<H256> {
        let provider = self.http().clone();
        let result = timeout(self.request_timeout, async move {
            provider
                .send_raw_transaction(raw)
                .await
                .map(|pending| pending.tx_hash())
        })
        .await;

        match result {
            Ok(Ok(tx_hash)) => Ok(tx_hash),
            Ok(Err(e)) => Err(EscrowError::Broadcast(e.to_string())),
            Err(_) => Err(EscrowError::Timeout {
                operation: "eth_sendRawTransaction".to_string(),
            }),
        }
    }
}
