use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub type BoxedKvStore = Box<dyn KvStore>;

#[derive(Debug, Error)]
pub enum KvStoreError {
    /// An unknown or internal error happened with the store
    #[error("{0}")]
    Internal(String),
    /// The store rejected a write from a participant without write access
    #[error("Write access is restricted to the privileged participant")]
    WriteDenied,
}

/// Represents an external persistent key-value store.
///
/// Writes are restricted to a single privileged participant, everyone else
/// requests persisted changes via ordinary messages. The stored value is
/// eventually consistent with in-memory state.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, KvStoreError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), KvStoreError>;
}
