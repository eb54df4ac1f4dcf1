use super::Persistence;
use crate::{error::StoreError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory persistence (for testing or single-run; not durable).
pub struct MemoryPersistence {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .write()
            .map_err(|e| StoreError::Save(e.to_string()))?
            .remove(key);
        Ok(())
    }

    async fn load_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self
            .entries
            .read()
            .map_err(|e| StoreError::Load(e.to_string()))?;
        Ok(entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_persistence_save_and_load() {
        let p = MemoryPersistence::new();
        p.save("a/1", b"one").await.unwrap();
        p.save("b/1", b"two").await.unwrap();
        let loaded = p.load_prefix("a/").await.unwrap();
        assert_eq!(loaded, vec![("a/1".to_string(), b"one".to_vec())]);
    }

    #[tokio::test]
    async fn memory_persistence_delete() {
        let p = MemoryPersistence::new();
        p.save("a/1", b"one").await.unwrap();
        p.delete("a/1").await.unwrap();
        p.delete("a/missing").await.unwrap();
        assert!(p.is_empty());
    }
}
