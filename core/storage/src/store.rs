//! Durable queue store trait definition.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use sanctuary_common::{Error, Result};

/// Key-value persistence for pending mutations and cached entities.
///
/// Values survive process restart. Implementations must not partially
/// write: after `set` returns, readers observe the complete new value, and
/// after a failed `set` they observe the complete old value.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Get the store name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Read the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the value stored under `key`.
    ///
    /// # Errors
    /// - Storage full or not writable
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Read and decode a JSON value from the store.
pub async fn read_json<S, T>(store: &S, key: &str) -> Result<Option<T>>
where
    S: QueueStore + ?Sized,
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::Serialization(e.to_string())),
        None => Ok(None),
    }
}

/// Encode a value as JSON and write it to the store.
pub async fn write_json<S, T>(store: &S, key: &str, value: &T) -> Result<()>
where
    S: QueueStore + ?Sized,
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))?;
    store.set(key, bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn test_json_helpers() {
        let store = MemoryStore::new();
        write_json(&store, "numbers", &vec![1, 2, 3]).await.unwrap();

        let back: Option<Vec<i32>> = read_json(&store, "numbers").await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));

        let missing: Option<Vec<i32>> = read_json(&store, "absent").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_read_json_malformed() {
        let store = MemoryStore::new();
        store.set("bad", b"{not json".to_vec()).await.unwrap();

        let result: Result<Option<Vec<i32>>> = read_json(&store, "bad").await;
        assert!(matches!(result, Err(Error::Serialization(_))));
    }
}
