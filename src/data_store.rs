//! External cache for specification payloads (e.g. Redis), shared between SDK instances.
use async_trait::async_trait;

use crate::{eval::hashing, Result};

const SPECS_PATH: &str = "/v2/download_config_specs";

/// A cached value and the lcut it was written with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataStoreResponse {
    pub result: String,
    pub time: Option<u64>,
}

/// Host-implemented key/value store for specification payloads.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn initialize(&self) -> Result<()>;
    async fn shutdown(&self) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<DataStoreResponse>>;
    async fn set(&self, key: &str, value: &str, time: Option<u64>) -> Result<()>;
    /// When `true`, the SDK polls this store for `key` on every sync cycle in addition to the
    /// network.
    async fn support_polling_updates_for(&self, key: &str) -> bool;
}

/// Store that holds nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDataStore;

#[async_trait]
impl DataStore for NoopDataStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, _key: &str) -> Result<Option<DataStoreResponse>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &str, _time: Option<u64>) -> Result<()> {
        Ok(())
    }

    async fn support_polling_updates_for(&self, _key: &str) -> bool {
        false
    }
}

/// Key under which specification payloads for `sdk_key` are stored. The SDK key itself is
/// hashed so it never ends up in the store.
pub fn specs_data_store_key(sdk_key: &str) -> String {
    format!(
        "statsig|{SPECS_PATH}|plain_text|{}",
        hashing::sha256_base64(sdk_key)
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use super::*;

    /// In-memory store used by tests.
    #[derive(Default)]
    pub(crate) struct MemoryDataStore {
        pub(crate) values: Mutex<HashMap<String, DataStoreResponse>>,
        pub(crate) polling: bool,
    }

    #[async_trait]
    impl DataStore for MemoryDataStore {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<DataStoreResponse>> {
            Ok(self.values.lock().unwrap().get(key).cloned())
        }

        async fn set(&self, key: &str, value: &str, time: Option<u64>) -> Result<()> {
            self.values.lock().unwrap().insert(
                key.to_owned(),
                DataStoreResponse {
                    result: value.to_owned(),
                    time,
                },
            );
            Ok(())
        }

        async fn support_polling_updates_for(&self, _key: &str) -> bool {
            self.polling
        }
    }

    #[test]
    fn key_hides_sdk_key() {
        let key = specs_data_store_key("secret-abc");

        assert!(key.starts_with("statsig|/v2/download_config_specs|plain_text|"));
        assert!(!key.contains("secret-abc"));
        assert_eq!(key, specs_data_store_key("secret-abc"));
    }

    #[tokio::test]
    async fn noop_store_is_empty() {
        let store = NoopDataStore;
        store.set("k", "v", Some(1)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.support_polling_updates_for("k").await);
    }
}
