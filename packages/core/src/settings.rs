//! Persisted user settings
//!
//! A thin typed layer over the store's `settings` collection, a flat
//! key-to-JSON-value mapping. Values that fail to deserialize into the
//! requested type read as absent rather than as an error, so a setting
//! written by another version never blocks startup.

use crate::db::{EntityStore, StoreError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

pub const LAST_BACKUP: &str = "lastBackup";
pub const THEME: &str = "theme";
pub const SEARCH_FILTERS: &str = "searchFilters";
pub const SEARCH_HISTORY: &str = "searchHistory";

/// Handle to the settings collection
#[derive(Clone)]
pub struct Settings {
    store: Arc<dyn EntityStore>,
}

impl Settings {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let Some(value) = self.store.get_setting(key).await? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => {
                tracing::warn!("Ignoring unreadable setting '{}': {}", key, e);
                Ok(None)
            }
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        self.store.put_setting(key, value).await
    }

    pub async fn last_backup(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.get(LAST_BACKUP).await
    }

    pub async fn record_backup(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.set(LAST_BACKUP, &at).await
    }

    pub async fn theme(&self) -> Result<Option<String>, StoreError> {
        self.get(THEME).await
    }

    pub async fn set_theme(&self, theme: &str) -> Result<(), StoreError> {
        self.set(THEME, theme).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_typed_round_trip() {
        let settings = Settings::new(Arc::new(MemoryStore::new()));
        assert_eq!(settings.theme().await.unwrap(), None);

        settings.set_theme("dark").await.unwrap();
        assert_eq!(settings.theme().await.unwrap().as_deref(), Some("dark"));

        let at = Utc::now();
        settings.record_backup(at).await.unwrap();
        assert_eq!(settings.last_backup().await.unwrap(), Some(at));
    }

    #[tokio::test]
    async fn test_wrong_type_reads_as_absent() {
        let store = Arc::new(MemoryStore::new());
        store.put_setting(LAST_BACKUP, json!({"not": "a date"})).await.unwrap();

        let settings = Settings::new(store);
        assert_eq!(settings.last_backup().await.unwrap(), None);
    }
}
