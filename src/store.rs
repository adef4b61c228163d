//! Metadata store collaborator.
//!
//! Datasets are registered under an ordered tuple of string keys (for
//! example `["landsat", "2024-06-01", "nir"]`) whose names are fixed when
//! the store is created. The tile service resolves keys to dataset handles
//! and reads or persists [`Metadata`] through [`MetadataStore`].
//!
//! [`InMemoryMetadataStore`] is the in-process implementation. Relational
//! backends implement the same trait outside this crate.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::raster::DatasetHandle;
use crate::stats::Metadata;

/// Capability set every metadata backend provides.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Initialise an empty store with the given key names.
    async fn create(&self, key_names: &[String]) -> Result<(), StoreError>;

    /// Check that the store exists and is usable.
    async fn connect(&self) -> Result<(), StoreError>;

    /// Names of the dataset keys, in order.
    async fn get_keys(&self) -> Result<Vec<String>, StoreError>;

    /// Datasets whose keys match every `key name -> value` pair in `filter`.
    async fn get_datasets(
        &self,
        filter: &HashMap<String, String>,
    ) -> Result<BTreeMap<Vec<String>, DatasetHandle>, StoreError>;

    /// Handle of the dataset registered under `keys`.
    async fn get_handle(&self, keys: &[String]) -> Result<DatasetHandle, StoreError>;

    /// Stored metadata, `None` if the dataset exists but has none yet.
    async fn get_metadata(&self, keys: &[String]) -> Result<Option<Metadata>, StoreError>;

    /// Register or replace a dataset.
    async fn insert(
        &self,
        keys: &[String],
        handle: &DatasetHandle,
        metadata: Option<Metadata>,
    ) -> Result<(), StoreError>;

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;
}

// =============================================================================
// In-memory backend
// =============================================================================

#[derive(Debug, Clone)]
struct Record {
    handle: DatasetHandle,
    metadata: Option<Metadata>,
}

#[derive(Debug, Default)]
struct StoreState {
    key_names: Option<Vec<String>>,
    datasets: BTreeMap<Vec<String>, Record>,
}

impl StoreState {
    fn key_names(&self) -> Result<&[String], StoreError> {
        self.key_names
            .as_deref()
            .ok_or_else(|| StoreError::Backend("store has not been created".to_string()))
    }

    fn check_keys(&self, keys: &[String]) -> Result<(), StoreError> {
        let names = self.key_names()?;
        if keys.len() != names.len() {
            return Err(StoreError::InvalidKeys(format!(
                "expected {} keys ({}), got {}",
                names.len(),
                names.join(", "),
                keys.len()
            )));
        }
        Ok(())
    }

    fn record(&self, keys: &[String]) -> Result<&Record, StoreError> {
        self.check_keys(keys)?;
        self.datasets
            .get(keys)
            .ok_or_else(|| StoreError::NotFound(keys.to_vec()))
    }
}

/// Metadata store held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    state: RwLock<StoreState>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that is already initialised with `key_names`.
    pub fn with_keys<S: Into<String>>(key_names: impl IntoIterator<Item = S>) -> Self {
        Self {
            state: RwLock::new(StoreState {
                key_names: Some(key_names.into_iter().map(Into::into).collect()),
                datasets: BTreeMap::new(),
            }),
        }
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn create(&self, key_names: &[String]) -> Result<(), StoreError> {
        if key_names.is_empty() {
            return Err(StoreError::InvalidKeys("at least one key is required".to_string()));
        }
        let mut state = self.state.write().await;
        if state.key_names.is_some() {
            return Err(StoreError::Backend("store already exists".to_string()));
        }
        state.key_names = Some(key_names.to_vec());
        Ok(())
    }

    async fn connect(&self) -> Result<(), StoreError> {
        self.state.read().await.key_names().map(|_| ())
    }

    async fn get_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.state.read().await.key_names()?.to_vec())
    }

    async fn get_datasets(
        &self,
        filter: &HashMap<String, String>,
    ) -> Result<BTreeMap<Vec<String>, DatasetHandle>, StoreError> {
        let state = self.state.read().await;
        let names = state.key_names()?;

        let mut positions = Vec::with_capacity(filter.len());
        for (name, value) in filter {
            let index = names
                .iter()
                .position(|n| n == name)
                .ok_or_else(|| StoreError::InvalidKeys(format!("unknown key '{}'", name)))?;
            positions.push((index, value));
        }

        Ok(state
            .datasets
            .iter()
            .filter(|(keys, _)| positions.iter().all(|(i, v)| keys[*i] == **v))
            .map(|(keys, record)| (keys.clone(), record.handle.clone()))
            .collect())
    }

    async fn get_handle(&self, keys: &[String]) -> Result<DatasetHandle, StoreError> {
        Ok(self.state.read().await.record(keys)?.handle.clone())
    }

    async fn get_metadata(&self, keys: &[String]) -> Result<Option<Metadata>, StoreError> {
        Ok(self.state.read().await.record(keys)?.metadata.clone())
    }

    async fn insert(
        &self,
        keys: &[String],
        handle: &DatasetHandle,
        metadata: Option<Metadata>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check_keys(keys)?;
        state.datasets.insert(
            keys.to_vec(),
            Record {
                handle: handle.clone(),
                metadata,
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.check_keys(keys)?;
        state
            .datasets
            .remove(keys)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(keys.to_vec()))
    }
}
