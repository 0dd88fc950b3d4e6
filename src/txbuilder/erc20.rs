//! ERC-20 reads and amount parsing.
//!
//! `balanceOf`/`decimals` calldata plus `eth_call` wrappers, and the exact
//! decimal-string scaling used by the trade surface: `parse_units("1.23",
//! 6)` is `1_230_000`, with excess fractional digits rejected rather than
//! rounded.

use std::sync::Arc;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, U256};

use crate::blockchain::ChainClient;
use crate::errors::{BlockchainError, BuilderError};
use crate::txbuilder::{encode_address, encode_uint256};

/// `balanceOf(address)`
pub const SELECTOR_BALANCE_OF: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];
/// `decimals()`
pub const SELECTOR_DECIMALS: [u8; 4] = [0x31, 0x3c, 0xe5, 0x67];

pub fn build_balance_of_calldata(owner: Address) -> Bytes {
    let mut data = Vec::with_capacity(4 + 32);
    data.extend_from_slice(&SELECTOR_BALANCE_OF);
    data.extend_from_slice(&encode_address(owner));
    data.into()
}

pub fn build_decimals_calldata() -> Bytes {
    SELECTOR_DECIMALS.to_vec().into()
}

pub async fn read_erc20_balance(
    client: &Arc<dyn ChainClient>,
    token: Address,
    owner: Address,
) -> Result<U256, BlockchainError> {
    let call: TypedTransaction = Eip1559TransactionRequest::new()
        .to(token)
        .data(build_balance_of_calldata(owner))
        .into();
    let out = client.call(&call).await?;
    decode_uint_return(&out)
}

pub async fn read_erc20_decimals(
    client: &Arc<dyn ChainClient>,
    token: Address,
) -> Result<u8, BlockchainError> {
    let call: TypedTransaction = Eip1559TransactionRequest::new()
        .to(token)
        .data(build_decimals_calldata())
        .into();
    let out = client.call(&call).await?;
    let value = decode_uint_return(&out)?;
    if value > U256::from(u8::MAX) {
        return Err(BlockchainError::Parse(format!(
            "decimals out of range: {value}"
        )));
    }
    Ok(value.as_u32() as u8)
}

fn decode_uint_return(data: &[u8]) -> Result<U256, BlockchainError> {
    if data.is_empty() {
        return Ok(U256::zero());
    }
    if data.len() > 32 {
        // standard 32-byte word returns; take the first word
        return Ok(U256::from_big_endian(&data[..32]));
    }
    Ok(U256::from_big_endian(data))
}

/// Scales a non-negative decimal string by `10^decimals`, exactly.
/// More fractional digits than `decimals` is an error.
pub fn parse_units(amount: &str, decimals: u8) -> Result<U256, BuilderError> {
    let amount = amount.trim();
    if amount.is_empty() {
        return Err(BuilderError::InvalidAmount("amount is empty".into()));
    }
    if amount.starts_with('-') {
        return Err(BuilderError::InvalidAmount(
            "amount must be non-negative".into(),
        ));
    }
    let (int_part, frac_part) = match amount.split_once('.') {
        Some((i, f)) => (i, f),
        None => (amount, ""),
    };
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    if frac_part.len() > decimals as usize {
        return Err(BuilderError::InvalidAmount(format!(
            "too many decimal places: {} > {}",
            frac_part.len(),
            decimals
        )));
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(BuilderError::InvalidAmount(format!(
            "invalid number format {amount:?}"
        )));
    }
    let mut combined = String::with_capacity(int_part.len() + decimals as usize);
    combined.push_str(int_part);
    combined.push_str(frac_part);
    for _ in 0..(decimals as usize - frac_part.len()) {
        combined.push('0');
    }
    let combined = combined.trim_start_matches('0');
    if combined.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_dec_str(combined)
        .map_err(|e| BuilderError::InvalidAmount(format!("invalid number format: {e}")))
}

/// Parses a decimal or 0x-hex integer string into a `U256`.
pub fn parse_big_int(value: &str) -> Result<U256, BuilderError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(BuilderError::InvalidAmount("value is empty".into()));
    }
    if let Some(digits) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        let digits = digits.trim_start_matches('0');
        if digits.is_empty() {
            return Ok(U256::zero());
        }
        return U256::from_str_radix(digits, 16)
            .map_err(|_| BuilderError::InvalidAmount(format!("invalid hex number {value:?}")));
    }
    U256::from_dec_str(value)
        .map_err(|_| BuilderError::InvalidAmount(format!("invalid integer {value:?}")))
}
