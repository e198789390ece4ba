//! In-memory key-value store.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::{KvError, MetaKv, Result};

/// In-memory store over an ordered map.
///
/// Data is lost when the process exits; production deployments back the
/// coordinator with an external store instead. The `BTreeMap` keeps prefix
/// scans in key order, matching the external store's contract.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Returns true if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetaKv for MemoryKv {
    async fn save(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| KvError::LockPoisoned)?;
        entries.insert(key.to_owned(), value);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().map_err(|_| KvError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    async fn load_with_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read().map_err(|_| KvError::LockPoisoned)?;
        Ok(entries
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn multi_save(&self, kvs: Vec<(String, Vec<u8>)>) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| KvError::LockPoisoned)?;
        for (key, value) in kvs {
            entries.insert(key, value);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| KvError::LockPoisoned)?;
        entries.remove(key);
        Ok(())
    }

    async fn multi_remove(&self, keys: Vec<String>) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| KvError::LockPoisoned)?;
        for key in keys {
            entries.remove(&key);
        }
        Ok(())
    }

    async fn remove_with_prefix(&self, prefix: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| KvError::LockPoisoned)?;
        let keys: Vec<String> = entries
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            entries.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_and_load() {
        let kv = MemoryKv::new();
        kv.save("a/1", b"one".to_vec()).await.unwrap();

        assert_eq!(kv.load("a/1").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(kv.load("a/2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn prefix_scan_is_ordered() {
        let kv = MemoryKv::new();
        kv.save("task/3", b"c".to_vec()).await.unwrap();
        kv.save("task/1", b"a".to_vec()).await.unwrap();
        kv.save("task/2", b"b".to_vec()).await.unwrap();
        kv.save("other/1", b"x".to_vec()).await.unwrap();

        let entries = kv.load_with_prefix("task/").await.unwrap();
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["task/1", "task/2", "task/3"]);
    }

    #[tokio::test]
    async fn multi_save_and_multi_remove() {
        let kv = MemoryKv::new();
        kv.multi_save(vec![
            ("x/1".to_owned(), b"1".to_vec()),
            ("x/2".to_owned(), b"2".to_vec()),
        ])
        .await
        .unwrap();
        assert_eq!(kv.len(), 2);

        kv.multi_remove(vec!["x/1".to_owned(), "x/2".to_owned()])
            .await
            .unwrap();
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn remove_with_prefix() {
        let kv = MemoryKv::new();
        kv.save("t/1", b"1".to_vec()).await.unwrap();
        kv.save("t/2", b"2".to_vec()).await.unwrap();
        kv.save("u/1", b"3".to_vec()).await.unwrap();

        kv.remove_with_prefix("t/").await.unwrap();

        assert!(kv.load_with_prefix("t/").await.unwrap().is_empty());
        assert_eq!(kv.load("u/1").await.unwrap(), Some(b"3".to_vec()));
    }

    #[tokio::test]
    async fn remove_missing_key_is_ok() {
        let kv = MemoryKv::new();
        kv.remove("nope").await.unwrap();
    }
}
