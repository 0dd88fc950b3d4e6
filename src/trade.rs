//! # Trade Service
//!
//! Validates buy/sell/approve requests, resolves human-unit amounts to wei
//! (with on-chain decimals lookup when not overridden), builds the
//! transaction through the auto-builder, optionally simulates it, then
//! signs and submits. Any signing or send failure resets the sender's
//! nonce allocator so the next request re-syncs with the chain.

use std::sync::Arc;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Eip1559TransactionRequest, NameOrAddress, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::blockchain::ChainClient;
use crate::errors::{BlockchainError, TradeError};
use crate::keys::KeysManager;
use crate::metrics;
use crate::txbuilder::{parse_big_int, parse_units, AutoBuilder};

//================================================================================================//
//                                      REQUEST / RESPONSE                                        //
//================================================================================================//

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuyRequest {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub pair: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub token_decimals: Option<u8>,
    #[serde(default)]
    pub eth_in: String,
    #[serde(default)]
    pub eth_in_wei: String,
    #[serde(default)]
    pub min_tokens_out: String,
    #[serde(default)]
    pub min_tokens_out_wei: String,
    #[serde(default)]
    pub simulate: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SellRequest {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub pair: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub token_decimals: Option<u8>,
    #[serde(default)]
    pub token_amount_in: String,
    #[serde(default)]
    pub token_amount_in_wei: String,
    #[serde(default)]
    pub min_refund_eth: String,
    #[serde(default)]
    pub min_refund_wei: String,
    #[serde(default)]
    pub simulate: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApproveRequest {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub pair: String,
    #[serde(default)]
    pub spender: String,
    #[serde(default)]
    pub token_decimals: Option<u8>,
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub amount_wei: String,
    #[serde(default)]
    pub simulate: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TxSummary {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(rename = "type")]
    pub tx_type: u8,
    pub nonce: u64,
    pub to: String,
    pub value: String,
    pub gas: u64,
    pub max_fee_wei: String,
    pub priority_fee_wei: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TxOutcome {
    pub tx: TxSummary,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tx_hash: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub simulation_error: String,
}

//================================================================================================//
//                                          SERVICE                                               //
//================================================================================================//

#[derive(Debug)]
pub struct TradeService {
    auto: Arc<AutoBuilder>,
    client: Arc<dyn ChainClient>,
    keys: Arc<KeysManager>,
}

impl TradeService {
    pub fn new(
        auto: Arc<AutoBuilder>,
        client: Arc<dyn ChainClient>,
        keys: Arc<KeysManager>,
    ) -> Self {
        Self { auto, client, keys }
    }

    pub async fn buy(&self, req: BuyRequest) -> Result<TxOutcome, TradeError> {
        let from = parse_address(&req.from)?;
        let pair = parse_address(&req.pair)?;
        let eth_in = parse_eth_amount(&req.eth_in, &req.eth_in_wei)?;
        let decimals = self.resolve_decimals(&req.token, req.token_decimals).await?;
        let min_out = parse_token_amount(&req.min_tokens_out, &req.min_tokens_out_wei, decimals)?;
        let tx = self.auto.build_buy_tx(from, pair, eth_in, min_out).await?;
        self.sign_and_send(from, tx, req.simulate, "buy").await
    }

    pub async fn sell(&self, req: SellRequest) -> Result<TxOutcome, TradeError> {
        let from = parse_address(&req.from)?;
        let pair = parse_address(&req.pair)?;
        let decimals = self.resolve_decimals(&req.token, req.token_decimals).await?;
        let token_in =
            parse_token_amount(&req.token_amount_in, &req.token_amount_in_wei, decimals)?;
        let min_refund = parse_eth_amount(&req.min_refund_eth, &req.min_refund_wei)?;
        let tx = self.auto.build_sell_tx(from, pair, token_in, min_refund).await?;
        self.sign_and_send(from, tx, req.simulate, "sell").await
    }

    pub async fn approve(&self, req: ApproveRequest) -> Result<TxOutcome, TradeError> {
        let from = parse_address(&req.from)?;
        let token = parse_address(&req.token)?;
        let spender_raw = if req.spender.trim().is_empty() {
            &req.pair
        } else {
            &req.spender
        };
        let spender = parse_address(spender_raw)?;
        let decimals = self.resolve_decimals(&req.token, req.token_decimals).await?;
        let amount = parse_token_amount(&req.amount, &req.amount_wei, decimals)?;
        let tx = self.auto.build_approve_tx(from, token, spender, amount).await?;
        self.sign_and_send(from, tx, req.simulate, "approve").await
    }

    async fn sign_and_send(
        &self,
        from: Address,
        tx: Eip1559TransactionRequest,
        simulate: bool,
        kind: &'static str,
    ) -> Result<TxOutcome, TradeError> {
        let typed: TypedTransaction = tx.clone().into();

        if simulate {
            let mut call = typed.clone();
            call.set_from(from);
            if let Err(e) = self.client.call(&call).await {
                let reason = simulation_error_message(&e);
                warn!(target: "trade", kind, from = %format!("{from:#x}"), error = %reason, "simulation failed");
                return Ok(TxOutcome {
                    tx: summarize(&tx, None),
                    simulation_error: reason,
                    ..Default::default()
                });
            }
        }

        let raw = match self
            .keys
            .sign_transaction(from, &typed, self.auto.chain_id())
        {
            Ok(raw) => raw,
            Err(e) => {
                self.auto.reset_nonce(from).await;
                return Err(e.into());
            }
        };
        let signed_hash = H256::from(keccak256(&raw));

        match self.client.send_raw_transaction(raw).await {
            Ok(_) => {
                metrics::TRADES_SUBMITTED.with_label_values(&[kind]).inc();
                info!(target: "trade", kind, tx = %format!("{signed_hash:#x}"), "transaction submitted");
                Ok(TxOutcome {
                    tx: summarize(&tx, Some(signed_hash)),
                    tx_hash: format!("{signed_hash:#x}"),
                    ..Default::default()
                })
            }
            Err(e) => {
                self.auto.reset_nonce(from).await;
                Err(TradeError::Send(e.to_string()))
            }
        }
    }

    async fn resolve_decimals(
        &self,
        token: &str,
        overridden: Option<u8>,
    ) -> Result<u8, TradeError> {
        if let Some(decimals) = overridden {
            return Ok(decimals);
        }
        if token.trim().is_empty() {
            return Ok(18);
        }
        let addr = parse_address(token)?;
        crate::txbuilder::erc20::read_erc20_decimals(&self.client, addr)
            .await
            .map_err(TradeError::Blockchain)
    }
}

//================================================================================================//
//                                          HELPERS                                               //
//================================================================================================//

pub fn parse_address(value: &str) -> Result<Address, TradeError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(TradeError::InvalidRequest("address is required".into()));
    }
    value
        .parse::<Address>()
        .map_err(|_| TradeError::InvalidRequest(format!("invalid address {value:?}")))
}

fn parse_eth_amount(eth: &str, wei: &str) -> Result<U256, TradeError> {
    if !wei.trim().is_empty() {
        return parse_big_int(wei).map_err(|e| TradeError::InvalidRequest(e.to_string()));
    }
    if eth.trim().is_empty() {
        return Err(TradeError::InvalidRequest("eth amount is required".into()));
    }
    parse_units(eth, 18).map_err(|e| TradeError::InvalidRequest(e.to_string()))
}

fn parse_token_amount(amount: &str, amount_wei: &str, decimals: u8) -> Result<U256, TradeError> {
    if !amount_wei.trim().is_empty() {
        return parse_big_int(amount_wei).map_err(|e| TradeError::InvalidRequest(e.to_string()));
    }
    if amount.trim().is_empty() {
        return Err(TradeError::InvalidRequest("token amount is required".into()));
    }
    parse_units(amount, decimals).map_err(|e| TradeError::InvalidRequest(e.to_string()))
}

fn summarize(tx: &Eip1559TransactionRequest, hash: Option<H256>) -> TxSummary {
    TxSummary {
        hash: hash.map(|h| format!("{h:#x}")).unwrap_or_default(),
        tx_type: 2,
        nonce: tx.nonce.map(|n| n.as_u64()).unwrap_or(0),
        to: match &tx.to {
            Some(NameOrAddress::Address(a)) => format!("{a:#x}"),
            _ => String::new(),
        },
        value: tx.value.unwrap_or_default().to_string(),
        gas: tx.gas.map(|g| g.as_u64()).unwrap_or(0),
        max_fee_wei: tx.max_fee_per_gas.unwrap_or_default().to_string(),
        priority_fee_wei: tx.max_priority_fee_per_gas.unwrap_or_default().to_string(),
        data: format!("0x{}", hex::encode(tx.data.clone().unwrap_or_default())),
    }
}

fn simulation_error_message(err: &BlockchainError) -> String {
    if let BlockchainError::Revert { message, data } = err {
        if let Some(reason) = data
            .as_deref()
            .and_then(|d| hex::decode(d.strip_prefix("0x").unwrap_or(d)).ok())
            .and_then(|bytes| decode_revert_reason(&bytes))
        {
            return format!("execution reverted: {reason}");
        }
        return message.clone();
    }
    err.to_string()
}

/// Best-effort decode of the standard `Error(string)` revert payload.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    const ERROR_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
    if data.len() < 4 + 32 + 32 || data[..4] != ERROR_SELECTOR {
        return None;
    }
    let offset = U256::from_big_endian(&data[4..36]).as_usize();
    let len_start = 4 + offset;
    if data.len() < len_start + 32 {
        return None;
    }
    let length = U256::from_big_endian(&data[len_start..len_start + 32]).as_usize();
    let str_start = len_start + 32;
    if data.len() < str_start + length {
        return None;
    }
    String::from_utf8(data[str_start..str_start + length].to_vec()).ok()
}
