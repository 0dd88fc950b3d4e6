//! # Chain Client
//!
//! A narrow, timeout-aware interface to the chain's JSON-RPC API. Everything
//! the pipeline and the transaction builder need from the node goes through
//! the [`ChainClient`] trait so tests can substitute a mock; the production
//! implementation wraps an ethers HTTP provider.
//!
//! Block bodies are fetched as raw JSON (`RpcBlock`/`RpcTx`) rather than
//! typed ethers structs: a malformed field on one transaction must not
//! poison the rest of the block, so per-field parsing happens downstream
//! with error accumulation.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockId, BlockNumber, Bytes, TransactionReceipt, H256, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::BlockchainError;

//================================================================================================//
//                                        WIRE TYPES                                              //
//================================================================================================//

/// A block as returned by `eth_getBlockByNumber(.., true)`, with quantity
/// fields left as hex strings for tolerant downstream parsing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RpcBlock {
    pub number: String,
    pub hash: String,
    pub timestamp: String,
    pub transactions: Vec<RpcTx>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RpcTx {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub nonce: String,
    pub value: String,
    pub gas: String,
    pub gas_price: String,
    pub max_fee_per_gas: String,
    pub max_priority_fee_per_gas: String,
    #[serde(rename = "type")]
    pub tx_type: String,
    pub input: String,
}

//================================================================================================//
//                                           TRAIT                                                //
//================================================================================================//

#[async_trait]
pub trait ChainClient: Debug + Send + Sync {
    /// Latest block number known to the node.
    async fn head_number(&self) -> Result<u64, BlockchainError>;

    /// Full block with transactions, as raw JSON.
    async fn raw_block_by_number(&self, number: u64) -> Result<RpcBlock, BlockchainError>;

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, BlockchainError>;

    /// `base_fee_per_gas` of the latest header, when the chain has one.
    async fn latest_base_fee(&self) -> Result<Option<U256>, BlockchainError>;

    async fn suggest_gas_price(&self) -> Result<U256, BlockchainError>;

    async fn suggest_gas_tip(&self) -> Result<U256, BlockchainError>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, BlockchainError>;

    /// Pending-state nonce for `addr`.
    async fn pending_nonce(&self, addr: Address) -> Result<u64, BlockchainError>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, BlockchainError>;

    /// `eth_call` against latest. Reverts surface as
    /// [`BlockchainError::Revert`] with the raw payload preserved.
    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, BlockchainError>;

    async fn balance(&self, addr: Address) -> Result<U256, BlockchainError>;
}

//================================================================================================//
//                                     ETHERS IMPLEMENTATION                                      //
//================================================================================================//

#[derive(Debug, Clone)]
pub struct EthersChainClient {
    provider: Arc<Provider<Http>>,
    request_timeout: Duration,
}

impl EthersChainClient {
    pub fn connect(http_url: &str, request_timeout: Duration) -> Result<Self, BlockchainError> {
        let provider = Provider::<Http>::try_from(http_url)
            .map_err(|e| BlockchainError::Provider(format!("dial {http_url}: {e}")))?;
        Ok(Self {
            provider: Arc::new(provider),
            request_timeout,
        })
    }

    pub fn provider(&self) -> Arc<Provider<Http>> {
        self.provider.clone()
    }

    async fn timed<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, BlockchainError>>,
    ) -> Result<T, BlockchainError> {
        if self.request_timeout.is_zero() {
            return fut.await;
        }
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| BlockchainError::Timeout(self.request_timeout))?
    }
}

fn provider_err(e: impl std::fmt::Display) -> BlockchainError {
    BlockchainError::Provider(e.to_string())
}

#[async_trait]
impl ChainClient for EthersChainClient {
    async fn head_number(&self) -> Result<u64, BlockchainError> {
        self.timed(async {
            self.provider
                .get_block_number()
                .await
                .map(|n| n.as_u64())
                .map_err(provider_err)
        })
        .await
    }

    async fn raw_block_by_number(&self, number: u64) -> Result<RpcBlock, BlockchainError> {
        self.timed(async {
            let params = [Value::String(format!("{number:#x}")), Value::Bool(true)];
            let block: Option<RpcBlock> = self
                .provider
                .request("eth_getBlockByNumber", params)
                .await
                .map_err(provider_err)?;
            block.ok_or_else(|| BlockchainError::Provider(format!("block {number} not found")))
        })
        .await
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, BlockchainError> {
        self.timed(async {
            self.provider
                .get_transaction_receipt(hash)
                .await
                .map_err(provider_err)
        })
        .await
    }

    async fn latest_base_fee(&self) -> Result<Option<U256>, BlockchainError> {
        self.timed(async {
            let block = self
                .provider
                .get_block(BlockId::Number(BlockNumber::Latest))
                .await
                .map_err(provider_err)?;
            Ok(block.and_then(|b| b.base_fee_per_gas))
        })
        .await
    }

    async fn suggest_gas_price(&self) -> Result<U256, BlockchainError> {
        self.timed(async { self.provider.get_gas_price().await.map_err(provider_err) })
            .await
    }

    async fn suggest_gas_tip(&self) -> Result<U256, BlockchainError> {
        self.timed(async {
            self.provider
                .request("eth_maxPriorityFeePerGas", ())
                .await
                .map_err(provider_err)
        })
        .await
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, BlockchainError> {
        self.timed(async {
            self.provider
                .estimate_gas(tx, None)
                .await
                .map_err(provider_err)
        })
        .await
    }

    async fn pending_nonce(&self, addr: Address) -> Result<u64, BlockchainError> {
        self.timed(async {
            self.provider
                .get_transaction_count(addr, Some(BlockId::Number(BlockNumber::Pending)))
                .await
                .map(|n| n.as_u64())
                .map_err(provider_err)
        })
        .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, BlockchainError> {
        self.timed(async {
            let pending = self
                .provider
                .send_raw_transaction(raw)
                .await
                .map_err(provider_err)?;
            Ok(pending.tx_hash())
        })
        .await
    }

    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, BlockchainError> {
        self.timed(async {
            match self.provider.call(tx, None).await {
                Ok(out) => Ok(out),
                Err(e) => {
                    if let Some(jsonrpc) = e.as_error_response() {
                        return Err(BlockchainError::Revert {
                            message: jsonrpc.message.clone(),
                            data: jsonrpc.data.as_ref().and_then(|d| match d {
                                Value::String(s) => Some(s.clone()),
                                other => Some(other.to_string()),
                            }),
                        });
                    }
                    Err(provider_err(e))
                }
            }
        })
        .await
    }

    async fn balance(&self, addr: Address) -> Result<U256, BlockchainError> {
        self.timed(async {
            self.provider
                .get_balance(addr, None)
                .await
                .map_err(provider_err)
        })
        .await
    }
}
