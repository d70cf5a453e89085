use std::collections::BTreeMap;
use std::slice;
use std::sync::Arc;

use crate::backend::MetadataStore;
use crate::error::{IkatsError, Result};
use crate::model::{MDType, Metadata, Tsuid};

#[derive(Clone)]
pub struct MetadataManager {
    store: Arc<dyn MetadataStore>,
}

impl MetadataManager {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, tsuid: &Tsuid) -> Result<Metadata> {
        let mut all = self.store.get_typed(slice::from_ref(tsuid)).await?;
        Ok(all.remove(tsuid).unwrap_or_default())
    }

    pub async fn get_many(&self, tsuids: &[Tsuid]) -> Result<BTreeMap<Tsuid, Metadata>> {
        self.store.get_typed(tsuids).await
    }

    /// Force write: creates the entry or overwrites its value.
    pub async fn set(&self, tsuid: &Tsuid, name: &str, value: &str, dtype: MDType) -> Result<()> {
        check_entry(name, value)?;
        self.store.upsert(tsuid, name, value, dtype).await
    }

    pub async fn create(&self, tsuid: &Tsuid, name: &str, value: &str, dtype: MDType) -> Result<()> {
        check_entry(name, value)?;
        self.store.create(tsuid, name, value, dtype).await
    }

    pub async fn update(&self, tsuid: &Tsuid, name: &str, value: &str) -> Result<()> {
        check_entry(name, value)?;
        self.store.update(tsuid, name, value).await
    }

    pub async fn delete(&self, tsuid: &Tsuid, name: &str, missing_ok: bool) -> Result<bool> {
        if name.is_empty() {
            return Err(IkatsError::input("metadata name must not be empty"));
        }
        match self.store.delete(tsuid, name).await {
            Ok(()) => Ok(true),
            Err(e) if missing_ok && e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn check_entry(name: &str, value: &str) -> Result<()> {
    if name.is_empty() {
        return Err(IkatsError::input("metadata name must not be empty"));
    }
    if value.is_empty() {
        return Err(IkatsError::input(format!("value of metadata {} must not be empty", name)));
    }
    Ok(())
}
