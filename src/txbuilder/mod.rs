//! # Transaction Builder
//!
//! Deterministic calldata encoding for the pair contract's three methods
//! and assembly of EIP-1559 dynamic-fee transactions. The ABI tail is
//! byte-exact: non-negative big integers big-endian left-padded to 32
//! bytes, addresses left-padded to 32 bytes.

pub mod auto;
pub mod erc20;
pub mod fees;
pub mod nonce;

pub use auto::AutoBuilder;
pub use erc20::{parse_big_int, parse_units};
pub use fees::{gwei_to_wei, FeeOracle, FeeOracleConfig, FeeParams};
pub use nonce::NonceManager;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ethers::types::{Address, Bytes, Eip1559TransactionRequest, U256};

use crate::errors::BuilderError;

/// `buy(uint256 minTokensOut, uint256 deadline)`
pub const SELECTOR_BUY: [u8; 4] = [0xd6, 0xfe, 0xbd, 0xe8];
/// `sell(uint256 tokenAmountIn, uint256 minRefundWei, uint256 deadline)`
pub const SELECTOR_SELL: [u8; 4] = [0xd3, 0xc9, 0x72, 0x7c];
/// `approve(address spender, uint256 amount)`
pub const SELECTOR_APPROVE: [u8; 4] = [0x09, 0x5e, 0xa7, 0xb3];

const DEFAULT_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildParams {
    pub nonce: U256,
    pub gas_limit: U256,
    pub fee: FeeParams,
}

pub fn encode_uint256(v: U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    v.to_big_endian(&mut word);
    word
}

pub fn encode_address(addr: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(addr.as_bytes());
    word
}

pub fn build_buy_data(min_tokens_out: U256, deadline: u64) -> Bytes {
    let mut data = Vec::with_capacity(4 + 64);
    data.extend_from_slice(&SELECTOR_BUY);
    data.extend_from_slice(&encode_uint256(min_tokens_out));
    data.extend_from_slice(&encode_uint256(U256::from(deadline)));
    data.into()
}

pub fn build_sell_data(token_amount_in: U256, min_refund_wei: U256, deadline: u64) -> Bytes {
    let mut data = Vec::with_capacity(4 + 96);
    data.extend_from_slice(&SELECTOR_SELL);
    data.extend_from_slice(&encode_uint256(token_amount_in));
    data.extend_from_slice(&encode_uint256(min_refund_wei));
    data.extend_from_slice(&encode_uint256(U256::from(deadline)));
    data.into()
}

pub fn build_approve_data(spender: Address, amount: U256) -> Bytes {
    let mut data = Vec::with_capacity(4 + 64);
    data.extend_from_slice(&SELECTOR_APPROVE);
    data.extend_from_slice(&encode_address(spender));
    data.extend_from_slice(&encode_uint256(amount));
    data.into()
}

/// Assembles a dynamic-fee transaction. The gas limit must be non-zero;
/// fee fields are always present by construction.
pub fn build_dynamic_tx(
    chain_id: u64,
    to: Address,
    value: U256,
    data: Bytes,
    params: BuildParams,
) -> Result<Eip1559TransactionRequest, BuilderError> {
    if chain_id == 0 {
        return Err(BuilderError::MissingField("chain_id"));
    }
    if params.gas_limit.is_zero() {
        return Err(BuilderError::ZeroGasLimit);
    }
    Ok(Eip1559TransactionRequest::new()
        .chain_id(chain_id)
        .nonce(params.nonce)
        .gas(params.gas_limit)
        .max_fee_per_gas(params.fee.max_fee_per_gas)
        .max_priority_fee_per_gas(params.fee.max_priority_fee_per_gas)
        .to(to)
        .value(value)
        .data(data))
}

/// Builds buy/sell/approve transactions against a single pair contract,
/// stamping each call with `now + default_deadline` as its unix-seconds
/// deadline. The clock is injectable for deterministic tests.
#[derive(Debug, Clone)]
pub struct Builder {
    chain_id: u64,
    default_deadline: Duration,
    clock: fn() -> u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Builder {
    pub fn new(chain_id: u64, default_deadline: Duration) -> Self {
        let default_deadline = if default_deadline.is_zero() {
            DEFAULT_DEADLINE
        } else {
            default_deadline
        };
        Self {
            chain_id,
            default_deadline,
            clock: unix_now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn next_deadline(&self) -> u64 {
        (self.clock)() + self.default_deadline.as_secs()
    }

    pub fn build_buy_tx(
        &self,
        pair: Address,
        eth_in_wei: U256,
        min_tokens_out: U256,
        params: BuildParams,
    ) -> Result<Eip1559TransactionRequest, BuilderError> {
        let data = build_buy_data(min_tokens_out, self.next_deadline());
        build_dynamic_tx(self.chain_id, pair, eth_in_wei, data, params)
    }

    pub fn build_sell_tx(
        &self,
        pair: Address,
        token_amount_in: U256,
        min_refund_wei: U256,
        params: BuildParams,
    ) -> Result<Eip1559TransactionRequest, BuilderError> {
        let data = build_sell_data(token_amount_in, min_refund_wei, self.next_deadline());
        build_dynamic_tx(self.chain_id, pair, U256::zero(), data, params)
    }

    pub fn build_approve_tx(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
        params: BuildParams,
    ) -> Result<Eip1559TransactionRequest, BuilderError> {
        let data = build_approve_data(spender, amount);
        build_dynamic_tx(self.chain_id, token, U256::zero(), data, params)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ethers::types::transaction::eip2718::TypedTransaction;
    use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};

    use crate::blockchain::{ChainClient, RpcBlock};
    use crate::errors::BlockchainError;

    /// Configurable in-memory chain client for builder tests.
    #[derive(Debug)]
    pub struct MockChainClient {
        pub base_fee: Mutex<Option<U256>>,
        pub gas_price: Mutex<U256>,
        pub gas_tip: Mutex<U256>,
        pub pending_nonce: AtomicU64,
        pub nonce_queries: AtomicU64,
        pub estimate: Mutex<Result<U256, String>>,
        pub call_result: Mutex<Result<Bytes, MockErrorKind>>,
    }

    impl Default for MockChainClient {
        fn default() -> Self {
            Self {
                base_fee: Mutex::new(None),
                gas_price: Mutex::new(U256::zero()),
                gas_tip: Mutex::new(U256::zero()),
                pending_nonce: AtomicU64::new(0),
                nonce_queries: AtomicU64::new(0),
                estimate: Mutex::new(Ok(U256::from(100_000u64))),
                call_result: Mutex::new(Ok(Bytes::new())),
            }
        }
    }

    /// Cloneable stand-in for errors the mock should produce.
    #[derive(Debug, Clone)]
    pub enum MockErrorKind {
        Provider(String),
        Revert { message: String, data: Option<String> },
    }

    impl From<MockErrorKind> for BlockchainError {
        fn from(kind: MockErrorKind) -> Self {
            match kind {
                MockErrorKind::Provider(m) => BlockchainError::Provider(m),
                MockErrorKind::Revert { message, data } => {
                    BlockchainError::Revert { message, data }
                }
            }
        }
    }

    impl MockChainClient {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl ChainClient for MockChainClient {
        async fn head_number(&self) -> Result<u64, BlockchainError> {
            Ok(0)
        }

        async fn raw_block_by_number(&self, _number: u64) -> Result<RpcBlock, BlockchainError> {
            Ok(RpcBlock::default())
        }

        async fn transaction_receipt(
            &self,
            _hash: H256,
        ) -> Result<Option<TransactionReceipt>, BlockchainError> {
            Ok(None)
        }

        async fn latest_base_fee(&self) -> Result<Option<U256>, BlockchainError> {
            Ok(*self.base_fee.lock().unwrap())
        }

        async fn suggest_gas_price(&self) -> Result<U256, BlockchainError> {
            Ok(*self.gas_price.lock().unwrap())
        }

        async fn suggest_gas_tip(&self) -> Result<U256, BlockchainError> {
            Ok(*self.gas_tip.lock().unwrap())
        }

        async fn estimate_gas(&self, _tx: &TypedTransaction) -> Result<U256, BlockchainError> {
            self.estimate
                .lock()
                .unwrap()
                .clone()
                .map_err(BlockchainError::Provider)
        }

        async fn pending_nonce(&self, _addr: Address) -> Result<u64, BlockchainError> {
            self.nonce_queries.fetch_add(1, Ordering::SeqCst);
            Ok(self.pending_nonce.load(Ordering::SeqCst))
        }

        async fn send_raw_transaction(&self, _raw: Bytes) -> Result<H256, BlockchainError> {
            Ok(H256::zero())
        }

        async fn call(&self, _tx: &TypedTransaction) -> Result<Bytes, BlockchainError> {
            self.call_result.lock().unwrap().clone().map_err(Into::into)
        }

        async fn balance(&self, _addr: Address) -> Result<U256, BlockchainError> {
            Ok(U256::zero())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pad_u64(v: u64) -> [u8; 32] {
        encode_uint256(U256::from(v))
    }

    #[test]
    fn buy_calldata_is_byte_exact() {
        let data = build_buy_data(U256::from(1000u64), 1_700_000_120);
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(&data[..4], &SELECTOR_BUY);
        assert_eq!(&data[4..36], &pad_u64(1000));
        assert_eq!(&data[36..68], &pad_u64(1_700_000_120));
    }

    #[test]
    fn sell_calldata_is_byte_exact() {
        let data = build_sell_data(U256::from(5u64), U256::from(9u64), 77);
        assert_eq!(data.len(), 4 + 96);
        assert_eq!(&data[..4], &SELECTOR_SELL);
        assert_eq!(&data[4..36], &pad_u64(5));
        assert_eq!(&data[36..68], &pad_u64(9));
        assert_eq!(&data[68..100], &pad_u64(77));
    }

    #[test]
    fn approve_calldata_left_pads_the_spender() {
        let spender: Address = "0x4444444444444444444444444444444444444444".parse().unwrap();
        let data = build_approve_data(spender, U256::from(1_000_000u64));
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(&data[..4], &SELECTOR_APPROVE);
        assert_eq!(&data[4..16], &[0u8; 12]);
        assert_eq!(&data[16..36], spender.as_bytes());
        assert_eq!(&data[36..68], &pad_u64(1_000_000));
    }

    #[test]
    fn build_buy_tx_assembles_dynamic_fee_fields() {
        let builder =
            Builder::new(8453, Duration::from_secs(120)).with_clock(|| 1_700_000_000);
        let pair: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        let params = BuildParams {
            nonce: U256::from(7u64),
            gas_limit: U256::from(210_000u64),
            fee: FeeParams {
                max_fee_per_gas: U256::from(1_000_000_000u64),
                max_priority_fee_per_gas: U256::from(200_000_000u64),
            },
        };
        let tx = builder
            .build_buy_tx(pair, U256::one(), U256::from(1000u64), params)
            .unwrap();
        assert_eq!(tx.chain_id, Some(8453.into()));
        assert_eq!(tx.nonce, Some(U256::from(7u64)));
        assert_eq!(tx.gas, Some(U256::from(210_000u64)));
        assert_eq!(tx.value, Some(U256::one()));
        assert_eq!(tx.max_fee_per_gas, Some(U256::from(1_000_000_000u64)));
        assert_eq!(tx.max_priority_fee_per_gas, Some(U256::from(200_000_000u64)));
        let data = tx.data.unwrap();
        assert_eq!(&data[..4], &SELECTOR_BUY);
        assert_eq!(&data[4..36], &pad_u64(1000));
        // deadline = clock + 120
        assert_eq!(&data[36..68], &pad_u64(1_700_000_120));
    }

    #[test]
    fn sell_and_approve_carry_zero_value() {
        let builder = Builder::new(1, Duration::ZERO).with_clock(|| 0);
        let addr: Address = "0x2222222222222222222222222222222222222222".parse().unwrap();
        let params = BuildParams {
            gas_limit: U256::from(50_000u64),
            ..Default::default()
        };
        let sell = builder
            .build_sell_tx(addr, U256::one(), U256::one(), params)
            .unwrap();
        assert_eq!(sell.value, Some(U256::zero()));
        let approve = builder
            .build_approve_tx(addr, addr, U256::one(), params)
            .unwrap();
        assert_eq!(approve.value, Some(U256::zero()));
    }

    #[test]
    fn zero_gas_limit_is_rejected() {
        let out = build_dynamic_tx(
            1,
            Address::zero(),
            U256::zero(),
            Bytes::new(),
            BuildParams::default(),
        );
        assert!(matches!(out, Err(BuilderError::ZeroGasLimit)));
    }

    #[test]
    fn zero_deadline_config_falls_back_to_default() {
        let builder = Builder::new(1, Duration::ZERO).with_clock(|| 100);
        assert_eq!(builder.next_deadline(), 220);
    }
}
