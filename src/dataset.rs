use std::sync::Arc;

use tracing::info;

use crate::backend::DatasetStore;
use crate::error::{IkatsError, Result};
use crate::model::{check_identifier, Dataset, DatasetSummary, Tsuid};

#[derive(Clone)]
pub struct DatasetManager {
    store: Arc<dyn DatasetStore>,
}

impl DatasetManager {
    pub fn new(store: Arc<dyn DatasetStore>) -> Self {
        Self { store }
    }

    pub async fn create(&self, name: &str, description: &str, tsuids: &[Tsuid]) -> Result<()> {
        check_identifier("dataset name", name)?;
        if tsuids.is_empty() {
            return Err(IkatsError::input(format!("No timeseries to save in dataset {}", name)));
        }
        self.store.create(name, description, tsuids).await
    }

    pub async fn read(&self, name: &str) -> Result<Dataset> {
        check_identifier("dataset name", name)?;
        self.store.read(name).await
    }

    pub async fn list(&self) -> Result<Vec<DatasetSummary>> {
        self.store.list().await
    }

    /// `deep` also drops the member timeseries no other dataset references.
    pub async fn delete(&self, name: &str, deep: bool, missing_ok: bool) -> Result<bool> {
        check_identifier("dataset name", name)?;
        match self.store.delete(name, deep).await {
            Ok(()) => {
                info!("Dataset {} removed{}", name, if deep { " with its timeseries" } else { "" });
                Ok(true)
            }
            Err(e) if missing_ok && e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::model::Fid;

    fn manager() -> (Arc<MemoryBackend>, DatasetManager) {
        let backend = Arc::new(MemoryBackend::new());
        (backend.clone(), DatasetManager::new(backend))
    }

    #[tokio::test]
    async fn test_create_read_list() {
        let (backend, mgr) = manager();
        let t = Tsuid::new("AAA").unwrap();
        backend.bind_fid(&t, &Fid::new("fid_a").unwrap()).unwrap();

        mgr.create("my_dataset", "flights", &[t.clone()]).await.unwrap();
        assert!(mgr.create("my_dataset", "again", &[t.clone()]).await.unwrap_err().is_conflict());

        let ds = mgr.read("my_dataset").await.unwrap();
        assert_eq!(ds.description, "flights");
        assert_eq!(ds.timeseries[0].tsuid, t);
        assert_eq!(mgr.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_name_shape_and_members_checked() {
        let (_backend, mgr) = manager();
        let t = Tsuid::new("AAA").unwrap();
        assert!(matches!(mgr.create("ds", "", &[t.clone()]).await, Err(IkatsError::Input(_))));
        assert!(matches!(mgr.create("my ds", "", &[t]).await, Err(IkatsError::Input(_))));
        assert!(matches!(mgr.create("my_ds", "", &[]).await, Err(IkatsError::Input(_))));
    }

    #[tokio::test]
    async fn test_delete_missing_ok() {
        let (_backend, mgr) = manager();
        assert!(mgr.read("unknown").await.unwrap_err().is_not_found());
        assert!(!mgr.delete("unknown", false, true).await.unwrap());
        assert!(mgr.delete("unknown", true, false).await.unwrap_err().is_not_found());
    }
}
