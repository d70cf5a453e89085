//! Collaborator interfaces of the client, plus their HTTP and in-memory
//! implementations.
//!
//! Every component above this layer (resolver, importer, managers) only sees
//! these traits, so the same code runs against a live backend or against an
//! isolated [`memory::MemoryBackend`].

pub mod catalog;
pub mod datamodel;
pub mod memory;
pub mod opentsdb;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::error::{IkatsError, Result};
use crate::model::{
    DataPoint, Dataset, DatasetSummary, Fid, FidRecord, MDType, Metadata, Operator, Table, TableSummary, Tags, Tsuid,
};

/// The three uid namespaces of the timeseries store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UidKind {
    Metric,
    TagKey,
    TagValue,
}

impl UidKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UidKind::Metric => "metric",
            UidKind::TagKey => "tagk",
            UidKind::TagValue => "tagv",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "metric" => Some(UidKind::Metric),
            "tagk" => Some(UidKind::TagKey),
            "tagv" => Some(UidKind::TagValue),
            _ => None,
        }
    }
}

/// Answer of a uid assignment. Newly allocated names land in the kind's
/// bucket; names already known land in `<kind>_errors` with a message that
/// embeds the existing uid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignResponse {
    pub metric: BTreeMap<String, String>,
    pub metric_errors: BTreeMap<String, String>,
    pub tagk: BTreeMap<String, String>,
    pub tagk_errors: BTreeMap<String, String>,
    pub tagv: BTreeMap<String, String>,
    pub tagv_errors: BTreeMap<String, String>,
}

impl AssignResponse {
    pub fn created(&self, kind: UidKind) -> &BTreeMap<String, String> {
        match kind {
            UidKind::Metric => &self.metric,
            UidKind::TagKey => &self.tagk,
            UidKind::TagValue => &self.tagv,
        }
    }

    pub fn errors(&self, kind: UidKind) -> &BTreeMap<String, String> {
        match kind {
            UidKind::Metric => &self.metric_errors,
            UidKind::TagKey => &self.tagk_errors,
            UidKind::TagValue => &self.tagv_errors,
        }
    }

    pub fn created_mut(&mut self, kind: UidKind) -> &mut BTreeMap<String, String> {
        match kind {
            UidKind::Metric => &mut self.metric,
            UidKind::TagKey => &mut self.tagk,
            UidKind::TagValue => &mut self.tagv,
        }
    }

    pub fn errors_mut(&mut self, kind: UidKind) -> &mut BTreeMap<String, String> {
        match kind {
            UidKind::Metric => &mut self.metric_errors,
            UidKind::TagKey => &mut self.tagk_errors,
            UidKind::TagValue => &mut self.tagv_errors,
        }
    }

    pub fn has_errors(&self) -> bool {
        !(self.metric_errors.is_empty() && self.tagk_errors.is_empty() && self.tagv_errors.is_empty())
    }
}

#[async_trait]
pub trait UidAssigner: Send + Sync {
    async fn assign_uid(&self, metric: &str, tags: &Tags) -> Result<AssignResponse>;
}

#[async_trait]
pub trait PointStore: Send + Sync {
    /// Returns how many points the store accepted. A count below
    /// `points.len()` is a partial write, not an error.
    async fn write_points(&self, tsuid: &Tsuid, points: &[DataPoint]) -> Result<usize>;

    /// Points in `[start, end]`, sorted by timestamp.
    async fn read_points(&self, tsuid: &Tsuid, start: i64, end: i64) -> Result<Vec<DataPoint>>;
}

#[async_trait]
pub trait FidRegistry: Send + Sync {
    async fn lookup_tsuid(&self, fid: &Fid) -> Result<Option<Tsuid>>;

    async fn lookup_fid(&self, tsuid: &Tsuid) -> Result<Option<Fid>>;

    /// Fails with `Conflict` when the FID (or the TSUID) is already bound.
    async fn register(&self, tsuid: &Tsuid, fid: &Fid) -> Result<()>;

    async fn unregister(&self, tsuid: &Tsuid) -> Result<()>;

    async fn list(&self) -> Result<Vec<FidRecord>>;

    /// Drops the timeseries with its metadata. `Conflict` if a dataset still
    /// references it.
    async fn remove_timeseries(&self, tsuid: &Tsuid) -> Result<()>;
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Every requested TSUID is present in the answer, possibly with no entry.
    async fn get_typed(&self, tsuids: &[Tsuid]) -> Result<BTreeMap<Tsuid, Metadata>>;

    /// `Conflict` if `name` already exists for `tsuid`.
    async fn create(&self, tsuid: &Tsuid, name: &str, value: &str, dtype: MDType) -> Result<()>;

    /// `NotFound` if `name` doesn't exist for `tsuid`.
    async fn update(&self, tsuid: &Tsuid, name: &str, value: &str) -> Result<()>;

    async fn delete(&self, tsuid: &Tsuid, name: &str) -> Result<()>;

    /// Timeseries whose metadata satisfy every name, with any of its values.
    async fn find(&self, constraint: &BTreeMap<String, Vec<String>>) -> Result<Vec<FidRecord>>;

    /// Create, or update when the name already exists.
    async fn upsert(&self, tsuid: &Tsuid, name: &str, value: &str, dtype: MDType) -> Result<()> {
        match self.create(tsuid, name, value, dtype).await {
            Err(IkatsError::Conflict(_)) => self.update(tsuid, name, value).await,
            other => other,
        }
    }
}

#[async_trait]
pub trait DatasetStore: Send + Sync {
    async fn create(&self, name: &str, description: &str, tsuids: &[Tsuid]) -> Result<()>;

    async fn read(&self, name: &str) -> Result<Dataset>;

    async fn list(&self) -> Result<Vec<DatasetSummary>>;

    async fn delete(&self, name: &str, deep: bool) -> Result<()>;
}

#[async_trait]
pub trait TableStore: Send + Sync {
    /// `Conflict` if a table with the same name exists.
    async fn create(&self, table: &Table) -> Result<()>;

    /// With `strict` off, `*` in `name` matches any characters.
    async fn list(&self, name: Option<&str>, strict: bool) -> Result<Vec<TableSummary>>;

    async fn read(&self, name: &str) -> Result<Table>;

    async fn delete(&self, name: &str) -> Result<()>;
}

/// Read side of the operator catalog.
#[async_trait]
pub trait OperatorCatalog: Send + Sync {
    async fn list(&self) -> Result<Vec<Operator>>;

    async fn get(&self, name: &str) -> Result<Operator>;
}

/// One handle per collaborator, shared by all managers.
#[derive(Clone)]
pub struct Backends {
    pub uids: Arc<dyn UidAssigner>,
    pub points: Arc<dyn PointStore>,
    pub registry: Arc<dyn FidRegistry>,
    pub metadata: Arc<dyn MetadataStore>,
    pub datasets: Arc<dyn DatasetStore>,
    pub tables: Arc<dyn TableStore>,
    pub catalog: Arc<dyn OperatorCatalog>,
}

impl Backends {
    /// Live backends reached over REST.
    pub fn http(config: &SessionConfig) -> Result<Self> {
        let tsdb = Arc::new(opentsdb::OpenTsdbClient::new(config)?);
        let tdm = Arc::new(datamodel::DatamodelClient::new(config)?);
        Ok(Self {
            uids: tsdb.clone(),
            points: tsdb,
            registry: tdm.clone(),
            metadata: tdm.clone(),
            datasets: tdm.clone(),
            tables: tdm,
            catalog: Arc::new(catalog::CatalogClient::new(config)?),
        })
    }

    /// Every collaborator served by the same in-memory instance.
    pub fn memory(backend: Arc<memory::MemoryBackend>) -> Self {
        Self {
            uids: backend.clone(),
            points: backend.clone(),
            registry: backend.clone(),
            metadata: backend.clone(),
            datasets: backend.clone(),
            tables: backend.clone(),
            catalog: backend,
        }
    }
}
