pub mod backend;
pub mod config;
pub mod dataset;
pub mod emulator;
pub mod error;
pub mod http;
pub mod import;
pub mod metadata;
pub mod model;
pub mod operator;
pub mod parser;
pub mod table;
pub mod timeseries;
pub mod tsuid;

use std::fmt;
use std::sync::Arc;

use crate::backend::memory::MemoryBackend;
use crate::backend::Backends;
use crate::config::SessionConfig;
use crate::dataset::DatasetManager;
use crate::error::Result;
use crate::metadata::MetadataManager;
use crate::operator::OperatorManager;
use crate::table::TableManager;
use crate::timeseries::TimeseriesManager;

pub use crate::error::IkatsError;
pub use crate::model::{DataPoint, Dataset, Fid, MDType, Operator, Table, Timeseries, Tsuid};

/// Entry point of the client: one manager per resource family, all sharing
/// the same backends.
pub struct Ikats {
    timeseries: TimeseriesManager,
    metadata: MetadataManager,
    datasets: DatasetManager,
    tables: TableManager,
    operators: OperatorManager,
}

impl fmt::Debug for Ikats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ikats").finish_non_exhaustive()
    }
}

impl Ikats {
    /// Client of a live IKATS instance.
    pub fn connect(config: &SessionConfig) -> Result<Self> {
        Self::with_backends(Backends::http(config)?)
    }

    /// Client over a fresh, private in-memory backend.
    pub fn emulated() -> Result<Self> {
        Self::with_backends(Backends::memory(Arc::new(MemoryBackend::new())))
    }

    pub fn with_backends(backends: Backends) -> Result<Self> {
        Ok(Self {
            metadata: MetadataManager::new(backends.metadata.clone()),
            datasets: DatasetManager::new(backends.datasets.clone()),
            tables: TableManager::new(backends.tables.clone()),
            operators: OperatorManager::new(backends.catalog.clone()),
            timeseries: TimeseriesManager::new(backends)?,
        })
    }

    pub fn timeseries(&self) -> &TimeseriesManager {
        &self.timeseries
    }

    pub fn metadata(&self) -> &MetadataManager {
        &self.metadata
    }

    pub fn datasets(&self) -> &DatasetManager {
        &self.datasets
    }

    pub fn tables(&self) -> &TableManager {
        &self.tables
    }

    pub fn operators(&self) -> &OperatorManager {
        &self.operators
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emulated_instances_are_isolated() {
        let first = Ikats::emulated().unwrap();
        let second = Ikats::emulated().unwrap();
        let fid = Fid::new("fid_isolated").unwrap();

        first.timeseries().new_timeseries(Some(fid.clone())).await.unwrap();
        assert!(first.timeseries().fid_to_tsuid(&fid).await.unwrap().is_some());
        assert!(second.timeseries().fid_to_tsuid(&fid).await.unwrap().is_none());
    }
}
