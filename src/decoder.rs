//! # Calldata and Log Decoder
//!
//! Decodes transaction input data and event logs against a configured
//! contract ABI, producing portable JSON values: addresses as lowercase
//! `0x…` hex, big integers as decimal strings, byte arrays as `0x…` hex,
//! arrays and tuples recursively.
//!
//! Event matching is a lookup table keyed by the 32-byte topic hash. When
//! explicit event mappings are configured, unmatched logs are skipped; with
//! no mappings, any event in the ABI matches.

use std::collections::{HashMap, HashSet};

use ethers::abi::{Abi, Event, RawLog, Token};
use ethers::types::{Address, Log, H256};
use serde_json::{Map, Value};

use crate::config::DecodingConfig;
use crate::errors::DecoderError;
use crate::types::{DecodedLog, DecodedMethod};

#[derive(Debug, Clone)]
struct EventBinding {
    event: Event,
    pool_field: String,
    token_fields: Vec<String>,
}

/// Result of decoding one receipt's logs.
#[derive(Debug, Clone, Default)]
pub struct DecodedLogs {
    pub logs: Vec<DecodedLog>,
    pub pool_address: String,
    pub token_addresses: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Decoder {
    abi: Option<Abi>,
    method_filter: HashSet<String>,
    event_bindings: HashMap<H256, EventBinding>,
    log_addresses: HashSet<Address>,
    decode_all_logs: bool,
}

impl Decoder {
    pub fn new(cfg: &DecodingConfig) -> Result<Self, DecoderError> {
        let mut decoder = Decoder {
            abi: None,
            method_filter: cfg
                .method_filter
                .iter()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect(),
            event_bindings: HashMap::new(),
            log_addresses: cfg
                .log_addresses
                .iter()
                .filter_map(|a| a.trim().parse::<Address>().ok())
                .collect(),
            decode_all_logs: false,
        };

        if cfg.abi_path.is_empty() {
            if cfg.allow_missing_abi {
                return Ok(decoder);
            }
            return Err(DecoderError::MissingAbi);
        }
        let contents = match std::fs::read_to_string(&cfg.abi_path) {
            Ok(c) => c,
            Err(source) => {
                if cfg.allow_missing_abi {
                    return Ok(decoder);
                }
                return Err(DecoderError::AbiRead {
                    path: cfg.abi_path.clone(),
                    source,
                });
            }
        };
        let abi: Abi = serde_json::from_str(&contents)?;

        if cfg.event_mappings.is_empty() {
            decoder.decode_all_logs = true;
        }
        for mapping in &cfg.event_mappings {
            let event = abi
                .event(&mapping.event)
                .map_err(|_| DecoderError::UnknownEvent(mapping.event.clone()))?
                .clone();
            decoder.event_bindings.insert(
                event.signature(),
                EventBinding {
                    event,
                    pool_field: mapping.pool_field.clone(),
                    token_fields: mapping.token_fields.clone(),
                },
            );
        }
        decoder.abi = Some(abi);
        Ok(decoder)
    }

    /// Builds a decoder with no ABI; both decode operations become no-ops.
    pub fn disabled() -> Self {
        Decoder {
            abi: None,
            method_filter: HashSet::new(),
            event_bindings: HashMap::new(),
            log_addresses: HashSet::new(),
            decode_all_logs: false,
        }
    }

    pub fn has_abi(&self) -> bool {
        self.abi.is_some()
    }

    /// Decodes transaction input data by its 4-byte selector. Returns
    /// `Ok(None)` when there is no ABI, the data is too short, the selector
    /// is unknown, or the method is excluded by the filter.
    pub fn decode_input(&self, data: &[u8]) -> Result<Option<DecodedMethod>, DecoderError> {
        let abi = match &self.abi {
            Some(abi) if data.len() >= 4 => abi,
            _ => return Ok(None),
        };
        let function = match abi
            .functions()
            .find(|f| f.short_signature() == data[..4])
        {
            Some(f) => f,
            None => return Ok(None),
        };
        if !self.method_filter.is_empty() && !self.method_filter.contains(&function.name) {
            return Ok(None);
        }
        let tokens = function
            .decode_input(&data[4..])
            .map_err(|e| DecoderError::Input(format!("{}: {}", function.name, e)))?;
        let mut args = Map::new();
        for (i, (param, token)) in function.inputs.iter().zip(tokens).enumerate() {
            let name = if param.name.is_empty() {
                format!("arg{i}")
            } else {
                param.name.clone()
            };
            args.insert(name, token_to_json(token));
        }
        Ok(Some(DecodedMethod {
            name: function.name.clone(),
            args,
        }))
    }

    /// Decodes every matchable log of a receipt and captures the pool and
    /// token addresses named by the event mappings (tokens deduplicated,
    /// in first-seen order).
    pub fn decode_logs(&self, logs: &[Log]) -> Result<DecodedLogs, DecoderError> {
        let abi = match &self.abi {
            Some(abi) => abi,
            None => return Ok(DecodedLogs::default()),
        };
        let mut out = DecodedLogs::default();
        let mut seen_tokens: HashSet<String> = HashSet::new();

        for log in logs {
            if !self.log_addresses.is_empty() && !self.log_addresses.contains(&log.address) {
                continue;
            }
            let topic0 = match log.topics.first() {
                Some(t) => *t,
                None => continue,
            };
            let binding = match self.event_bindings.get(&topic0) {
                Some(b) => b.clone(),
                None if self.decode_all_logs => {
                    match abi.events().find(|e| e.signature() == topic0) {
                        Some(event) => EventBinding {
                            event: event.clone(),
                            pool_field: String::new(),
                            token_fields: Vec::new(),
                        },
                        None => continue,
                    }
                }
                None => continue,
            };

            let parsed = binding
                .event
                .parse_log(RawLog {
                    topics: log.topics.clone(),
                    data: log.data.to_vec(),
                })
                .map_err(|e| DecoderError::Log(format!("{}: {}", binding.event.name, e)))?;

            let mut args = Map::new();
            for param in parsed.params {
                args.insert(param.name, token_to_json(param.value));
            }

            if !binding.pool_field.is_empty() {
                if let Some(addr) = address_arg(&args, &binding.pool_field) {
                    out.pool_address = addr;
                }
            }
            for field in &binding.token_fields {
                if let Some(addr) = address_arg(&args, field) {
                    if seen_tokens.insert(addr.clone()) {
                        out.token_addresses.push(addr);
                    }
                }
            }

            out.logs.push(DecodedLog {
                event: binding.event.name.clone(),
                address: format!("{:#x}", log.address),
                args,
                topics: log.topics.iter().map(|t| format!("{t:#x}")).collect(),
                data: format!("0x{}", hex::encode(&log.data)),
            });
        }
        Ok(out)
    }
}

/// Converts an ABI token to its portable JSON form.
pub fn token_to_json(token: Token) -> Value {
    match token {
        Token::Address(addr) => Value::String(format!("{addr:#x}")),
        Token::Uint(v) | Token::Int(v) => Value::String(v.to_string()),
        Token::Bool(b) => Value::Bool(b),
        Token::String(s) => Value::String(s),
        Token::Bytes(b) | Token::FixedBytes(b) => Value::String(format!("0x{}", hex::encode(b))),
        Token::Array(items) | Token::FixedArray(items) | Token::Tuple(items) => {
            Value::Array(items.into_iter().map(token_to_json).collect())
        }
    }
}

fn address_arg(args: &Map<String, Value>, field: &str) -> Option<String> {
    match args.get(field) {
        Some(Value::String(s)) if s.starts_with("0x") && s.len() == 42 => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventMapping;
    use ethers::abi::{encode, Token};
    use ethers::types::{Bytes, U256};
    use std::io::Write;

    const TEST_ABI: &str = r#"[
        {
            "type": "function",
            "name": "buy",
            "inputs": [
                {"name": "minTokensOut", "type": "uint256"},
                {"name": "deadline", "type": "uint256"}
            ],
            "outputs": [],
            "stateMutability": "payable"
        },
        {
            "type": "event",
            "name": "PairCreated",
            "inputs": [
                {"name": "token0", "type": "address", "indexed": true},
                {"name": "token1", "type": "address", "indexed": true},
                {"name": "pair", "type": "address", "indexed": false},
                {"name": "length", "type": "uint256", "indexed": false}
            ],
            "anonymous": false
        }
    ]"#;

    fn decoder_with(mappings: Vec<EventMapping>) -> Decoder {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TEST_ABI.as_bytes()).unwrap();
        let cfg = DecodingConfig {
            abi_path: file.path().to_string_lossy().into_owned(),
            event_mappings: mappings,
            decode_input: true,
            decode_logs: true,
            ..Default::default()
        };
        let decoder = Decoder::new(&cfg).unwrap();
        // keep the temp file alive until Decoder::new has read it
        drop(file);
        decoder
    }

    fn topic_for(addr: Address) -> H256 {
        H256::from(addr)
    }

    fn pair_created_log(token0: Address, token1: Address, pair: Address) -> Log {
        let abi: Abi = serde_json::from_str(TEST_ABI).unwrap();
        let event = abi.event("PairCreated").unwrap();
        Log {
            address: "0x00000000000000000000000000000000000000fa".parse().unwrap(),
            topics: vec![event.signature(), topic_for(token0), topic_for(token1)],
            data: Bytes::from(encode(&[
                Token::Address(pair),
                Token::Uint(U256::from(3u64)),
            ])),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_input_by_selector() {
        let decoder = decoder_with(vec![]);
        let abi: Abi = serde_json::from_str(TEST_ABI).unwrap();
        let function = abi.function("buy").unwrap();
        let mut data = function.short_signature().to_vec();
        data.extend(encode(&[
            Token::Uint(U256::from(1000u64)),
            Token::Uint(U256::from(1_700_000_120u64)),
        ]));

        let method = decoder.decode_input(&data).unwrap().unwrap();
        assert_eq!(method.name, "buy");
        assert_eq!(method.args["minTokensOut"], "1000");
        assert_eq!(method.args["deadline"], "1700000120");
    }

    #[test]
    fn unknown_selector_and_short_input_are_skipped() {
        let decoder = decoder_with(vec![]);
        assert!(decoder.decode_input(&[0xde, 0xad, 0xbe, 0xef, 0x00]).unwrap().is_none());
        assert!(decoder.decode_input(&[0x01]).unwrap().is_none());
    }

    #[test]
    fn method_filter_excludes_unlisted_methods() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TEST_ABI.as_bytes()).unwrap();
        let cfg = DecodingConfig {
            abi_path: file.path().to_string_lossy().into_owned(),
            method_filter: vec!["somethingElse".into()],
            ..Default::default()
        };
        let decoder = Decoder::new(&cfg).unwrap();
        let abi: Abi = serde_json::from_str(TEST_ABI).unwrap();
        let mut data = abi.function("buy").unwrap().short_signature().to_vec();
        data.extend(encode(&[Token::Uint(U256::one()), Token::Uint(U256::one())]));
        assert!(decoder.decode_input(&data).unwrap().is_none());
    }

    #[test]
    fn decodes_mapped_event_and_captures_pool_and_tokens() {
        let decoder = decoder_with(vec![EventMapping {
            event: "PairCreated".into(),
            pool_field: "pair".into(),
            token_fields: vec!["token0".into(), "token1".into()],
        }]);
        let token0: Address = "0x0000000000000000000000000000000000000001".parse().unwrap();
        let token1: Address = "0x0000000000000000000000000000000000000002".parse().unwrap();
        let pair: Address = "0x00000000000000000000000000000000000000cc".parse().unwrap();

        let out = decoder
            .decode_logs(&[
                pair_created_log(token0, token1, pair),
                // duplicate tokens must be deduplicated
                pair_created_log(token0, token1, pair),
            ])
            .unwrap();

        assert_eq!(out.logs.len(), 2);
        assert_eq!(out.logs[0].event, "PairCreated");
        assert_eq!(out.pool_address, format!("{pair:#x}"));
        assert_eq!(
            out.token_addresses,
            vec![format!("{token0:#x}"), format!("{token1:#x}")]
        );
        assert_eq!(out.logs[0].args["length"], "3");
    }

    #[test]
    fn without_mappings_any_abi_event_matches() {
        let decoder = decoder_with(vec![]);
        let token0: Address = "0x0000000000000000000000000000000000000011".parse().unwrap();
        let token1: Address = "0x0000000000000000000000000000000000000022".parse().unwrap();
        let pair: Address = "0x0000000000000000000000000000000000000033".parse().unwrap();

        let out = decoder
            .decode_logs(&[pair_created_log(token0, token1, pair)])
            .unwrap();
        assert_eq!(out.logs.len(), 1);
        // no mapping means no pool/token capture
        assert!(out.pool_address.is_empty());
        assert!(out.token_addresses.is_empty());
    }

    #[test]
    fn unmatched_topic_is_skipped() {
        let decoder = decoder_with(vec![EventMapping {
            event: "PairCreated".into(),
            pool_field: String::new(),
            token_fields: vec![],
        }]);
        let log = Log {
            topics: vec![H256::repeat_byte(0x42)],
            ..Default::default()
        };
        let out = decoder.decode_logs(&[log]).unwrap();
        assert!(out.logs.is_empty());
    }

    #[test]
    fn normalizes_tokens_to_portable_json() {
        let addr: Address = "0x00000000000000000000000000000000000000AB".parse().unwrap();
        assert_eq!(
            token_to_json(Token::Address(addr)),
            Value::String("0x00000000000000000000000000000000000000ab".into())
        );
        assert_eq!(
            token_to_json(Token::Uint(U256::from_dec_str("340282366920938463463374607431768211456").unwrap())),
            Value::String("340282366920938463463374607431768211456".into())
        );
        assert_eq!(
            token_to_json(Token::Bytes(vec![0xde, 0xad])),
            Value::String("0xdead".into())
        );
        assert_eq!(
            token_to_json(Token::Array(vec![Token::Bool(true), Token::Bool(false)])),
            serde_json::json!([true, false])
        );
    }
}
