//! # Centralized Error Handling
//!
//! Hierarchical error enums for the whole service. Each subsystem gets its
//! own typed enum; `AppError` is the top-level type returned by the entry
//! point and the long-running tasks it supervises.

use ethers::types::transaction::eip2718::TypedTransaction;
use thiserror::Error;

/// The top-level error type, encapsulating all failures in the service.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),
    #[error("Decoder error: {0}")]
    Decoder(#[from] DecoderError),
    #[error("Key store error: {0}")]
    Keys(#[from] KeysError),
    #[error("API server error: {0}")]
    Api(String),
    #[error("Other error: {0}")]
    Other(String),
}

/// Errors raised while loading or validating the YAML configuration.
/// All of these are fatal: the service refuses to start on any of them.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Errors from the ingestion pipeline stages.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
    #[error("output sink error: {0}")]
    Output(String),
    #[error("stage panicked: {0}")]
    StagePanic(String),
}

/// Errors from the low-level chain RPC surface.
#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("provider error: {0}")]
    Provider(String),
    #[error("websocket error: {0}")]
    Websocket(String),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("execution reverted: {message}")]
    Revert {
        message: String,
        /// ABI-encoded revert payload when the node returned one, as 0x hex.
        data: Option<String>,
    },
    #[error("response parse error: {0}")]
    Parse(String),
    #[error("operation cancelled")]
    Cancelled,
}

/// Errors from the durable checkpoint store.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint encoding: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors raised while building the ABI decoder or decoding data with it.
#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("failed to read ABI file {path}: {source}")]
    AbiRead {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse ABI: {0}")]
    AbiParse(#[from] serde_json::Error),
    #[error("event {0:?} not found in ABI")]
    UnknownEvent(String),
    #[error("abi_path is required when decoding is enabled")]
    MissingAbi,
    #[error("log decode failed: {0}")]
    Log(String),
    #[error("input decode failed: {0}")]
    Input(String),
}

/// Errors from the transaction-construction core (encoder, fee oracle,
/// nonce manager, auto-builder).
#[derive(Error, Debug)]
pub enum BuilderError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("gas limit must be non-zero")]
    ZeroGasLimit,
    #[error("fee oracle unavailable: {0}")]
    FeeOracle(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    /// Gas estimation failed. Carries the original call message so callers
    /// can re-simulate it and extract a revert reason.
    #[error("estimate gas failed: {reason}")]
    EstimateGas {
        reason: String,
        call: Box<TypedTransaction>,
    },
    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),
}

/// Errors from the encrypted key store.
#[derive(Error, Debug)]
pub enum KeysError {
    #[error("keystore dir is required")]
    MissingDir,
    #[error("keystore passphrase is empty")]
    EmptyPassphrase,
    #[error("account {0} not found")]
    AccountNotFound(String),
    #[error("private key export is disabled")]
    PrivateExportDisabled,
    #[error("keystore io: {0}")]
    Io(#[from] std::io::Error),
    #[error("wallet error: {0}")]
    Wallet(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Errors from the trade service. These map to HTTP 400 at the API edge.
#[derive(Error, Debug)]
pub enum TradeError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("Builder error: {0}")]
    Builder(#[from] BuilderError),
    #[error("Key store error: {0}")]
    Keys(#[from] KeysError),
    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),
    #[error("send failed: {0}")]
    Send(String),
}
