//! Ready-made key and value handlers
//!
//! Cover the common cases so a pipeline only writes a handler when its keys
//! need custom ordering or routing. Shard selection hashes the dumped key
//! with FNV so placement is stable across workers and runs.

use anyhow::{Context, Result};
use fnv::FnvHasher;
use std::hash::Hasher;

use crate::pipeline::{KeyHandler, ValueHandler};

fn fnv_shard(raw: &[u8], shard_count: usize) -> usize {
    let mut hasher = FnvHasher::default();
    hasher.write(raw);
    (hasher.finish() % shard_count as u64) as usize
}

/// [`KeyHandler`] for `String` keys: lexicographic order, UTF-8 dump.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringKeyHandler;

impl KeyHandler for StringKeyHandler {
    type Key = String;

    fn less(&self, a: &String, b: &String) -> bool {
        a < b
    }

    fn equal(&self, a: &String, b: &String) -> bool {
        a == b
    }

    fn key_dump(&self, key: &String) -> Vec<u8> {
        key.as_bytes().to_vec()
    }

    fn key_load(&self, raw: &[u8]) -> Result<String> {
        String::from_utf8(raw.to_vec()).context("key is not valid utf-8")
    }

    fn shard(&self, key: &String, shard_count: usize) -> usize {
        fnv_shard(key.as_bytes(), shard_count)
    }
}

/// [`KeyHandler`] for `i64` keys. Keys are dumped as decimal strings for
/// readability; the hash spreads sequential ids across partitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct I64KeyHandler;

impl KeyHandler for I64KeyHandler {
    type Key = i64;

    fn less(&self, a: &i64, b: &i64) -> bool {
        a < b
    }

    fn equal(&self, a: &i64, b: &i64) -> bool {
        a == b
    }

    fn key_dump(&self, key: &i64) -> Vec<u8> {
        key.to_string().into_bytes()
    }

    fn key_load(&self, raw: &[u8]) -> Result<i64> {
        std::str::from_utf8(raw)
            .context("key is not valid utf-8")?
            .parse()
            .context("key is not a decimal integer")
    }

    fn shard(&self, key: &i64, shard_count: usize) -> usize {
        fnv_shard(key.to_string().as_bytes(), shard_count)
    }
}

/// [`ValueHandler`] for `String` values.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringValueHandler;

impl ValueHandler for StringValueHandler {
    type Value = String;

    fn value_dump(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn value_load(&self, raw: &[u8]) -> Result<String> {
        String::from_utf8(raw.to_vec()).context("value is not valid utf-8")
    }
}

/// [`ValueHandler`] for `i64` values, dumped as decimal strings.
#[derive(Debug, Default, Clone, Copy)]
pub struct I64ValueHandler;

impl ValueHandler for I64ValueHandler {
    type Value = i64;

    fn value_dump(&self, value: &i64) -> Result<Vec<u8>> {
        Ok(value.to_string().into_bytes())
    }

    fn value_load(&self, raw: &[u8]) -> Result<i64> {
        std::str::from_utf8(raw)
            .context("value is not valid utf-8")?
            .parse()
            .context("value is not a decimal integer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_keys_round_trip() {
        let handler = StringKeyHandler;
        let raw = handler.key_dump(&"quince".to_string());
        assert_eq!(handler.key_load(&raw).unwrap(), "quince");
        assert!(handler.less(&"a".into(), &"b".into()));
        assert!(handler.equal(&"a".into(), &"a".into()));
    }

    #[test]
    fn i64_keys_round_trip() {
        let handler = I64KeyHandler;
        let raw = handler.key_dump(&-42);
        assert_eq!(raw, b"-42");
        assert_eq!(handler.key_load(&raw).unwrap(), -42);
        assert!(handler.key_load(b"zebra").is_err());
    }

    #[test]
    fn sharding_is_deterministic_and_in_range() {
        let handler = StringKeyHandler;
        for key in ["alpha", "beta", "gamma", ""] {
            let first = handler.shard(&key.to_string(), 7);
            let second = handler.shard(&key.to_string(), 7);
            assert_eq!(first, second);
            assert!(first < 7);
        }
    }
}
