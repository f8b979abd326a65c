//! Ordered k-way merge
//!
//! Merges a set of iterators that each yield `(key, value)` pairs in
//! non-decreasing key order into one non-decreasing stream over the union.
//! The reduce engine drives this over a task's intermediate shards, and the
//! spill merger over one partition's spill shards. A linear scan picks the
//! next item; `k` is small (shards per task), so a heap buys nothing.

use anyhow::Result;

use crate::pipeline::{KeyHandler, MappedDatum, ShardIterator, ValueHandler};

struct MergeSlot<K, V> {
    iter: Box<dyn ShardIterator<K, V>>,
    current: MappedDatum<K, V>,
}

/// Streaming merge over sorted shard iterators.
pub struct Merger<'h, H: KeyHandler + ValueHandler> {
    handler: &'h H,
    slots: Vec<MergeSlot<H::Key, H::Value>>,
}

impl<'h, H: KeyHandler + ValueHandler> Merger<'h, H> {
    pub fn new(handler: &'h H) -> Self {
        Self {
            handler,
            slots: Vec::new(),
        }
    }

    /// Prime `iter` with its first item and add it to the merge. Returns
    /// `false` when the iterator is empty and was dropped.
    pub async fn add_source(
        &mut self,
        mut iter: Box<dyn ShardIterator<H::Key, H::Value>>,
    ) -> Result<bool> {
        match iter.next().await? {
            Some(current) => {
                self.slots.push(MergeSlot { iter, current });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Next item in merged order, or `None` when every source is drained.
    /// Ties prefer the earliest-added source, which keeps the merge stable.
    /// Iterator errors propagate unwrapped.
    pub async fn next(&mut self) -> Result<Option<MappedDatum<H::Key, H::Value>>> {
        if self.slots.is_empty() {
            return Ok(None);
        }

        let mut least = 0;
        for i in 1..self.slots.len() {
            if self
                .handler
                .less(&self.slots[i].current.key, &self.slots[least].current.key)
            {
                least = i;
            }
        }

        let slot = &mut self.slots[least];
        let item = match slot.iter.next().await? {
            Some(next) => std::mem::replace(&mut slot.current, next),
            None => self.slots.remove(least).current,
        };
        Ok(Some(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyhandlers::{I64ValueHandler, StringKeyHandler};
    use async_trait::async_trait;

    struct Handler;

    impl KeyHandler for Handler {
        type Key = String;
        fn less(&self, a: &String, b: &String) -> bool {
            StringKeyHandler.less(a, b)
        }
        fn equal(&self, a: &String, b: &String) -> bool {
            StringKeyHandler.equal(a, b)
        }
        fn key_dump(&self, key: &String) -> Vec<u8> {
            StringKeyHandler.key_dump(key)
        }
        fn key_load(&self, raw: &[u8]) -> Result<String> {
            StringKeyHandler.key_load(raw)
        }
        fn shard(&self, key: &String, shard_count: usize) -> usize {
            StringKeyHandler.shard(key, shard_count)
        }
    }

    impl ValueHandler for Handler {
        type Value = i64;
        fn value_dump(&self, value: &i64) -> Result<Vec<u8>> {
            I64ValueHandler.value_dump(value)
        }
        fn value_load(&self, raw: &[u8]) -> Result<i64> {
            I64ValueHandler.value_load(raw)
        }
    }

    struct VecIterator(std::vec::IntoIter<MappedDatum<String, i64>>);

    #[async_trait]
    impl ShardIterator<String, i64> for VecIterator {
        async fn next(&mut self) -> Result<Option<MappedDatum<String, i64>>> {
            Ok(self.0.next())
        }
    }

    fn source(items: &[(&str, i64)]) -> Box<dyn ShardIterator<String, i64>> {
        let items: Vec<_> = items
            .iter()
            .map(|(k, v)| MappedDatum::new(k.to_string(), *v))
            .collect();
        Box::new(VecIterator(items.into_iter()))
    }

    async fn drain(merger: &mut Merger<'_, Handler>) -> Vec<(String, i64)> {
        let mut out = Vec::new();
        while let Some(item) = merger.next().await.unwrap() {
            out.push((item.key, item.value));
        }
        out
    }

    #[tokio::test]
    async fn yields_every_item_in_order() {
        let handler = Handler;
        let mut merger = Merger::new(&handler);
        assert!(merger.add_source(source(&[("a", 1), ("c", 3), ("e", 5)])).await.unwrap());
        assert!(merger.add_source(source(&[("b", 2), ("d", 4)])).await.unwrap());
        assert!(merger.add_source(source(&[("a", 9)])).await.unwrap());

        let merged = drain(&mut merger).await;
        assert_eq!(merged.len(), 6);
        for window in merged.windows(2) {
            assert!(window[0].0 <= window[1].0);
        }
    }

    #[tokio::test]
    async fn empty_sources_are_dropped() {
        let handler = Handler;
        let mut merger = Merger::new(&handler);
        assert!(!merger.add_source(source(&[])).await.unwrap());
        assert!(merger.is_empty());
        assert!(merger.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ties_prefer_the_earlier_source() {
        let handler = Handler;
        let mut merger = Merger::new(&handler);
        merger.add_source(source(&[("k", 1), ("k", 2)])).await.unwrap();
        merger.add_source(source(&[("k", 10), ("k", 20)])).await.unwrap();

        let merged = drain(&mut merger).await;
        assert_eq!(
            merged,
            vec![
                ("k".to_string(), 1),
                ("k".to_string(), 2),
                ("k".to_string(), 10),
                ("k".to_string(), 20)
            ]
        );
    }
}
