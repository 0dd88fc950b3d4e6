//! # Configuration
//!
//! YAML-backed configuration for the whole service. A single file drives the
//! ingestion pipeline, the decoder, the transaction builder, the key store
//! and the API server. Missing values are filled with conservative defaults
//! after parsing; validation failures are fatal at startup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::ConfigError;

//================================================================================================//
//                                         DURATIONS                                              //
//================================================================================================//

/// A duration that deserializes from either an integer (milliseconds) or a
/// human-readable string such as `"500ms"`, `"5s"` or `"1m"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DurationMs(#[serde(serialize_with = "ser_millis")] pub Duration);

fn ser_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl DurationMs {
    pub fn get(&self) -> Duration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Duration> for DurationMs {
    fn from(d: Duration) -> Self {
        DurationMs(d)
    }
}

impl<'de> Deserialize<'de> for DurationMs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(DurationMs(Duration::from_millis(ms))),
            Raw::Text(s) => parse_duration(&s)
                .map(DurationMs)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid duration {:?}", s))),
        }
    }
}

/// Parses `"250ms"`, `"15s"`, `"2m"`, `"1h"` or a bare integer (milliseconds).
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Some(Duration::ZERO);
    }
    if let Ok(ms) = s.parse::<u64>() {
        return Some(Duration::from_millis(ms));
    }
    let (value, unit) = s.split_at(s.find(|c: char| c.is_ascii_alphabetic())?);
    let value: f64 = value.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    Some(Duration::from_secs_f64(secs))
}

//================================================================================================//
//                                       CONFIG SCHEMA                                            //
//================================================================================================//

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: String,
    #[serde(default)]
    pub chain_id: u64,
    #[serde(default)]
    pub factory_address: String,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub decoding: DecodingConfig,
    #[serde(default)]
    pub tx: TxConfig,
    #[serde(default)]
    pub keystore: KeystoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default)]
    pub http: String,
    #[serde(default)]
    pub ws: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// `"latest"` or a decimal block number.
    #[serde(default)]
    pub start_block: String,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default)]
    pub reorg_replay_depth: u64,
    #[serde(default)]
    pub poll_interval: DurationMs,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceConfig {
    #[serde(default)]
    pub block_fetch_concurrency: usize,
    #[serde(default)]
    pub receipt_fetch_concurrency: usize,
    #[serde(default)]
    pub request_timeout: DurationMs,
    #[serde(default)]
    pub retry_max: u32,
    #[serde(default)]
    pub retry_backoff: DurationMs,
    #[serde(default)]
    pub queue_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodingConfig {
    #[serde(default)]
    pub abi_path: String,
    #[serde(default)]
    pub event_mappings: Vec<EventMapping>,
    #[serde(default)]
    pub method_filter: Vec<String>,
    #[serde(default)]
    pub log_addresses: Vec<String>,
    #[serde(default)]
    pub decode_input: bool,
    #[serde(default)]
    pub decode_logs: bool,
    #[serde(default)]
    pub allow_missing_abi: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMapping {
    pub event: String,
    #[serde(default)]
    pub pool_field: String,
    #[serde(default)]
    pub token_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxConfig {
    #[serde(default)]
    pub default_deadline_seconds: u64,
    #[serde(default)]
    pub gas_limit_multiplier: f64,
    #[serde(default)]
    pub max_fee_multiplier: f64,
    #[serde(default)]
    pub min_priority_fee_gwei: f64,
    #[serde(default)]
    pub fee_refresh_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeystoreConfig {
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub passphrase_env: String,
    #[serde(default)]
    pub allow_private_export: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub listen: String,
    #[serde(default)]
    pub auth_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// `"-"` writes to standard output.
    #[serde(default)]
    pub jsonl_path: String,
}

//================================================================================================//
//                                     LOAD / DEFAULTS                                            //
//================================================================================================//

/// The resolved start position for the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBlock {
    Latest,
    Number(u64),
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let mut cfg: Config = serde_yaml::from_str(&contents)?;
        cfg.apply_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_defaults(&mut self) {
        if self.chain.is_empty() {
            self.chain = "base".to_string();
        }
        if self.chain_id == 0 {
            self.chain_id = match self.chain.to_ascii_lowercase().as_str() {
                "base" => 8453,
                "ethereum" | "mainnet" => 1,
                _ => 0,
            };
        }
        if self.ingestion.start_block.is_empty() {
            self.ingestion.start_block = "latest".to_string();
        }
        if self.ingestion.confirmations == 0 {
            self.ingestion.confirmations = 2;
        }
        if self.ingestion.reorg_replay_depth == 0 {
            self.ingestion.reorg_replay_depth = 5;
        }
        if self.ingestion.poll_interval.is_zero() {
            self.ingestion.poll_interval = Duration::from_secs(5).into();
        }
        if self.performance.block_fetch_concurrency == 0 {
            self.performance.block_fetch_concurrency = 1;
        }
        if self.performance.receipt_fetch_concurrency == 0 {
            self.performance.receipt_fetch_concurrency = 8;
        }
        if self.performance.request_timeout.is_zero() {
            self.performance.request_timeout = Duration::from_secs(15).into();
        }
        if self.performance.retry_max == 0 {
            self.performance.retry_max = 3;
        }
        if self.performance.retry_backoff.is_zero() {
            self.performance.retry_backoff = Duration::from_millis(500).into();
        }
        if self.performance.queue_size == 0 {
            self.performance.queue_size = 2000;
        }
        if self.tx.default_deadline_seconds == 0 {
            self.tx.default_deadline_seconds = 120;
        }
        if self.tx.gas_limit_multiplier == 0.0 {
            self.tx.gas_limit_multiplier = 1.2;
        }
        if self.tx.max_fee_multiplier == 0.0 {
            self.tx.max_fee_multiplier = 2.0;
        }
        if self.tx.fee_refresh_seconds == 0 {
            self.tx.fee_refresh_seconds = 5;
        }
        if self.keystore.dir.is_empty() {
            self.keystore.dir = "data/keystore".to_string();
        }
        if self.keystore.passphrase_env.is_empty() {
            self.keystore.passphrase_env = "FACTORYSCOPE_KEYSTORE_PASSPHRASE".to_string();
        }
        if self.api.listen.is_empty() {
            self.api.listen = "0.0.0.0:8080".to_string();
        }
        if self.checkpoint.path.is_empty() {
            self.checkpoint.path = "data/checkpoint.json".to_string();
        }
        if self.output.jsonl_path.is_empty() {
            self.output.jsonl_path = "data/output.jsonl".to_string();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.factory_address.is_empty() {
            return Err(ConfigError::MissingField("factory_address"));
        }
        if !is_hex_address(&self.factory_address) {
            return Err(ConfigError::InvalidValue {
                field: "factory_address",
                reason: format!("{:?} is not a hex address", self.factory_address),
            });
        }
        if self.rpc.http.is_empty() {
            return Err(ConfigError::MissingField("rpc.http"));
        }
        if self.rpc.ws.is_empty() {
            return Err(ConfigError::MissingField("rpc.ws"));
        }
        self.start_block()?;
        if self.tx.min_priority_fee_gwei < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "tx.min_priority_fee_gwei",
                reason: "must be non-negative".to_string(),
            });
        }
        Ok(())
    }

    pub fn start_block(&self) -> Result<StartBlock, ConfigError> {
        let raw = self.ingestion.start_block.trim();
        if raw.eq_ignore_ascii_case("latest") {
            return Ok(StartBlock::Latest);
        }
        raw.parse::<u64>()
            .map(StartBlock::Number)
            .map_err(|_| ConfigError::InvalidValue {
                field: "ingestion.start_block",
                reason: format!("{:?} is neither \"latest\" nor a block number", raw),
            })
    }
}

pub fn is_hex_address(value: &str) -> bool {
    let value = value.trim();
    let hex = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X"));
    match hex {
        Some(h) => h.len() == 40 && h.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}
