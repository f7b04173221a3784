use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use djbooth_core::{KvStore, KvStoreError};

/// An in-memory key-value store, useful for tests and single-process setups.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, KvStoreError> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), KvStoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}
