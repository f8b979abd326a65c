//! Wire encodings shared by the url surface
//!
//! Shard-name lists travel as zlib-compressed JSON arrays, percent-encoded
//! when they ride in a url. Query strings accept `;` as a separator in
//! addition to `&`, so everything here parses and builds urls by hand
//! rather than through a form codec that only knows `&`.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::HashMap;
use std::io::{Read, Write};

use crate::error::PipelineError;

/// Escape set for url parameter values. Keep `-`, `_`, `.`, `~` (the
/// unreserved set) literal and encode everything else.
const PARAM: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encode a parameter value.
pub fn escape(value: &str) -> String {
    utf8_percent_encode(value, PARAM).to_string()
}

/// Percent-encode raw bytes (compressed payloads are not utf-8).
pub fn escape_bytes(value: &[u8]) -> String {
    percent_encoding::percent_encode(value, PARAM).to_string()
}

/// Parsed request parameters. Values are kept as raw bytes because the
/// `shards` payload is binary; string access validates utf-8 on demand.
#[derive(Debug, Default)]
pub struct Params {
    values: HashMap<String, Vec<u8>>,
}

impl Params {
    /// Parse a query or form-encoded body, splitting pairs on both `&`
    /// and `;`. Later occurrences of a name win.
    pub fn parse(input: &str) -> Self {
        let mut values = HashMap::new();
        for pair in input.split(['&', ';']) {
            if pair.is_empty() {
                continue;
            }
            let (name, value) = match pair.split_once('=') {
                Some((n, v)) => (n, v),
                None => (pair, ""),
            };
            let name = percent_decode_str(name).decode_utf8_lossy().into_owned();
            // '+' means space in form encoding.
            let value = value.replace('+', " ");
            let value: Vec<u8> = percent_decode_str(&value).collect();
            values.insert(name, value);
        }
        Self { values }
    }

    /// Merge another parameter set into this one; `other` wins conflicts.
    pub fn merge(&mut self, other: Params) {
        self.values.extend(other.values);
    }

    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        self.values.get(name).map(|v| v.as_slice())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn require(&self, name: &'static str) -> Result<&str, PipelineError> {
        match self.get(name) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(PipelineError::MissingParameter(name)),
        }
    }

    pub fn require_bytes(&self, name: &'static str) -> Result<&[u8], PipelineError> {
        match self.bytes(name) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(PipelineError::MissingParameter(name)),
        }
    }
}

/// Compress a shard-name list for a reduce task's `read_from` payload.
pub fn encode_shard_names(names: &[String]) -> Result<Vec<u8>, PipelineError> {
    let json = serde_json::to_vec(names)
        .map_err(|err| PipelineError::CorruptShardNames(err.to_string()))?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|err| PipelineError::CorruptShardNames(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| PipelineError::CorruptShardNames(err.to_string()))
}

/// Inverse of [`encode_shard_names`]. Corruption here is fatal: a reduce
/// task with an unreadable shard list can never succeed.
pub fn decode_shard_names(raw: &[u8]) -> Result<Vec<String>, PipelineError> {
    let mut decoder = ZlibDecoder::new(raw);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|err| PipelineError::CorruptShardNames(err.to_string()))?;
    serde_json::from_slice(&json).map_err(|err| PipelineError::CorruptShardNames(err.to_string()))
}
