//! Auto-builder.
//!
//! Composes the calldata encoder, fee oracle and nonce manager into
//! ready-to-sign dynamic-fee transactions: fetch fees, allocate a nonce,
//! estimate gas for the provisional call, scale the estimate, assemble.
//! A failed estimate surfaces as a structured error carrying the call
//! message so the caller can simulate it for a revert reason.

use std::sync::Arc;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, U256};

use crate::blockchain::ChainClient;
use crate::errors::BuilderError;
use crate::txbuilder::fees::{FeeOracle, FeeParams};
use crate::txbuilder::nonce::NonceManager;
use crate::txbuilder::{
    build_approve_data, build_buy_data, build_dynamic_tx, build_sell_data, BuildParams, Builder,
};

#[derive(Debug)]
pub struct AutoBuilder {
    builder: Builder,
    client: Arc<dyn ChainClient>,
    oracle: Arc<FeeOracle>,
    nonce: Arc<NonceManager>,
    gas_limit_multiplier: f64,
}

impl AutoBuilder {
    pub fn new(
        builder: Builder,
        client: Arc<dyn ChainClient>,
        oracle: Arc<FeeOracle>,
        nonce: Arc<NonceManager>,
        gas_limit_multiplier: f64,
    ) -> Self {
        let gas_limit_multiplier = if gas_limit_multiplier <= 0.0 {
            1.2
        } else {
            gas_limit_multiplier
        };
        Self {
            builder,
            client,
            oracle,
            nonce,
            gas_limit_multiplier,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.builder.chain_id()
    }

    pub async fn build_buy_tx(
        &self,
        from: Address,
        pair: Address,
        eth_in_wei: U256,
        min_tokens_out: U256,
    ) -> Result<Eip1559TransactionRequest, BuilderError> {
        let data = build_buy_data(min_tokens_out, self.builder.next_deadline());
        self.build_tx(from, pair, eth_in_wei, data).await
    }

    pub async fn build_sell_tx(
        &self,
        from: Address,
        pair: Address,
        token_amount_in: U256,
        min_refund_wei: U256,
    ) -> Result<Eip1559TransactionRequest, BuilderError> {
        let data = build_sell_data(token_amount_in, min_refund_wei, self.builder.next_deadline());
        self.build_tx(from, pair, U256::zero(), data).await
    }

    pub async fn build_approve_tx(
        &self,
        from: Address,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> Result<Eip1559TransactionRequest, BuilderError> {
        let data = build_approve_data(spender, amount);
        self.build_tx(from, token, U256::zero(), data).await
    }

    pub async fn reset_nonce(&self, from: Address) {
        self.nonce.reset(from).await;
    }

    async fn build_tx(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: Bytes,
    ) -> Result<Eip1559TransactionRequest, BuilderError> {
        let fees = self.oracle.fees().await?;
        let nonce = self.nonce.next(from).await?;
        let gas_limit = self.estimate_gas(from, to, value, data.clone(), fees).await?;
        build_dynamic_tx(
            self.builder.chain_id(),
            to,
            value,
            data,
            BuildParams {
                nonce: U256::from(nonce),
                gas_limit,
                fee: fees,
            },
        )
    }

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: Bytes,
        fees: FeeParams,
    ) -> Result<U256, BuilderError> {
        let call: TypedTransaction = Eip1559TransactionRequest::new()
            .from(from)
            .to(to)
            .value(value)
            .data(data)
            .max_fee_per_gas(fees.max_fee_per_gas)
            .max_priority_fee_per_gas(fees.max_priority_fee_per_gas)
            .into();
        let estimate = self
            .client
            .estimate_gas(&call)
            .await
            .map_err(|e| BuilderError::EstimateGas {
                reason: e.to_string(),
                call: Box::new(call.clone()),
            })?;
        Ok(apply_gas_multiplier(estimate, self.gas_limit_multiplier))
    }
}

/// Scales a gas estimate by the configured multiplier, never returning less
/// than the estimate itself.
pub fn apply_gas_multiplier(estimate: U256, multiplier: f64) -> U256 {
    if multiplier <= 0.0 || !multiplier.is_finite() {
        return estimate;
    }
    if estimate > U256::from(u64::MAX) {
        return estimate;
    }
    let scaled = (estimate.as_u64() as f64 * multiplier) as u64;
    let scaled = U256::from(scaled);
    if scaled < estimate {
        estimate
    } else {
        scaled
    }
}
