use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use super::{DatasetStore, FidRegistry, MetadataStore, TableStore};
use crate::config::SessionConfig;
use crate::error::{IkatsError, Result};
use crate::http::{endpoint, Payload, RestClient, RestResponse, Verb};
use crate::model::{Dataset, DatasetSummary, Fid, FidRecord, MDType, MetaEntry, Metadata, Table, TableSummary, Tsuid};

#[derive(Debug, Deserialize)]
struct MetaRow {
    tsuid: Tsuid,
    name: String,
    value: String,
    #[serde(default)]
    dtype: MDType,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DatasetBody {
    description: Option<String>,
    fids: Vec<FidRecord>,
}

#[derive(Debug, Deserialize)]
struct DatasetRow {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

/// REST client of the Temporal Data Manager: functional identifiers,
/// metadata and datasets.
#[derive(Debug, Clone)]
pub struct DatamodelClient {
    rest: RestClient,
    root: Url,
    chunk_size: usize,
}

impl DatamodelClient {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        Ok(Self {
            rest: RestClient::new(config.timeout())?,
            root: config.tdm_url()?,
            chunk_size: config.metadata_chunk_size.max(1),
        })
    }

    async fn call(&self, verb: Verb, segments: &[&str], query: &[(&str, String)], payload: Payload) -> Result<RestResponse> {
        let url = endpoint(&self.root, segments)?;
        self.rest.send(verb, url, query, payload, None).await
    }

    async fn metadata_chunk(&self, chunk: &[Tsuid], out: &mut BTreeMap<Tsuid, Metadata>) -> Result<()> {
        let joined = chunk.iter().map(Tsuid::as_str).collect::<Vec<_>>().join(",");
        debug!("Looking up metadata of {} timeseries", chunk.len());
        let resp = self
            .call(Verb::Get, &["metadata", "list", "json"], &[("tsuid", joined)], Payload::Empty)
            .await?;

        for tsuid in chunk {
            out.entry(tsuid.clone()).or_default();
        }
        if resp.status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.check("Metadata lookup")?;

        // "{}" or an empty body means no metadata at all
        let rows: Vec<MetaRow> = match resp.json() {
            Ok(value) if value.is_array() => resp.json_as()?,
            _ => Vec::new(),
        };
        for row in rows {
            out.entry(row.tsuid)
                .or_default()
                .insert(row.name, MetaEntry::new(row.value, row.dtype));
        }
        Ok(())
    }
}

#[async_trait]
impl FidRegistry for DatamodelClient {
    async fn lookup_tsuid(&self, fid: &Fid) -> Result<Option<Tsuid>> {
        let body = json!({ "funcIds": [fid.as_str()] });
        let resp = self.call(Verb::Post, &["metadata", "funcId"], &[], Payload::Json(body)).await?;
        if resp.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        resp.check(&format!("Looking up FID {}", fid))?;
        let records: Vec<FidRecord> = resp.json_as()?;
        Ok(records.into_iter().find(|r| r.fid == *fid).map(|r| r.tsuid))
    }

    async fn lookup_fid(&self, tsuid: &Tsuid) -> Result<Option<Fid>> {
        let resp = self.call(Verb::Get, &["metadata", "funcId", tsuid.as_str()], &[], Payload::Empty).await?;
        if resp.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        resp.check(&format!("Looking up FID of {}", tsuid))?;
        Ok(Some(resp.json_as::<FidRecord>()?.fid))
    }

    async fn register(&self, tsuid: &Tsuid, fid: &Fid) -> Result<()> {
        let resp = self
            .call(Verb::Post, &["metadata", "funcId", tsuid.as_str(), fid.as_str()], &[], Payload::Empty)
            .await?;
        resp.check(&format!("TSUID:{} - FID already exists (not updated) {}", tsuid, fid))?;
        info!("Registered {} as {}", fid, tsuid);
        Ok(())
    }

    async fn unregister(&self, tsuid: &Tsuid) -> Result<()> {
        let resp = self.call(Verb::Delete, &["metadata", "funcId", tsuid.as_str()], &[], Payload::Empty).await?;
        resp.check(&format!("No FID for TSUID [{}]", tsuid))
    }

    async fn list(&self) -> Result<Vec<FidRecord>> {
        let resp = self.call(Verb::Get, &["metadata", "funcId"], &[], Payload::Empty).await?;
        if resp.status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        resp.check("Listing timeseries")?;
        resp.json_as()
    }

    async fn remove_timeseries(&self, tsuid: &Tsuid) -> Result<()> {
        let resp = self.call(Verb::Delete, &["ts", tsuid.as_str()], &[], Payload::Empty).await?;
        match resp.status {
            StatusCode::NOT_FOUND => Err(IkatsError::NotFound(format!("Timeseries {} not found in database", tsuid))),
            StatusCode::CONFLICT => Err(IkatsError::Conflict(format!("{} belongs to -at least- one dataset", tsuid))),
            _ => resp.check(&format!("Removing timeseries {}", tsuid)),
        }
    }
}

#[async_trait]
impl MetadataStore for DatamodelClient {
    async fn get_typed(&self, tsuids: &[Tsuid]) -> Result<BTreeMap<Tsuid, Metadata>> {
        let mut out = BTreeMap::new();
        // bounded by the URL length limit of the server
        for chunk in tsuids.chunks(self.chunk_size) {
            self.metadata_chunk(chunk, &mut out).await?;
        }
        Ok(out)
    }

    async fn create(&self, tsuid: &Tsuid, name: &str, value: &str, dtype: MDType) -> Result<()> {
        let resp = self
            .call(
                Verb::Post,
                &["metadata", "import", tsuid.as_str(), name, value],
                &[("dtype", dtype.as_str().to_string())],
                Payload::Empty,
            )
            .await?;
        resp.check(&format!("Can't set metadata {} to {} (for tsuid {})", name, value, tsuid))
    }

    async fn update(&self, tsuid: &Tsuid, name: &str, value: &str) -> Result<()> {
        let resp = self
            .call(Verb::Put, &["metadata", tsuid.as_str(), name, value], &[], Payload::Empty)
            .await?;
        resp.check(&format!("TSUID:{} - MetaData {} doesn't exist", tsuid, name))
    }

    async fn delete(&self, tsuid: &Tsuid, name: &str) -> Result<()> {
        let resp = self.call(Verb::Delete, &["metadata", tsuid.as_str(), name], &[], Payload::Empty).await?;
        resp.check(&format!("TSUID:{} - MetaData {} doesn't exist", tsuid, name))
    }

    async fn find(&self, constraint: &BTreeMap<String, Vec<String>>) -> Result<Vec<FidRecord>> {
        let query: Vec<(&str, String)> = constraint
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |v| (name.as_str(), v.clone())))
            .collect();
        let resp = self.call(Verb::Get, &["metadata", "tsmatch"], &query, Payload::Empty).await?;
        if resp.status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        resp.check("Matching metadata")?;
        resp.json_as()
    }
}

#[async_trait]
impl DatasetStore for DatamodelClient {
    async fn create(&self, name: &str, description: &str, tsuids: &[Tsuid]) -> Result<()> {
        let form = vec![
            ("name".to_string(), name.to_string()),
            ("description".to_string(), description.to_string()),
            (
                "tsuidList".to_string(),
                tsuids.iter().map(Tsuid::as_str).collect::<Vec<_>>().join(","),
            ),
        ];
        let resp = self.call(Verb::Post, &["dataset", "import", name], &[], Payload::Form(form)).await?;
        resp.check(&format!("Dataset {} already exists in database", name))?;
        info!("Created dataset {} with {} timeseries", name, tsuids.len());
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Dataset> {
        let resp = self.call(Verb::Get, &["dataset", name], &[], Payload::Empty).await?;
        resp.check(&format!("Dataset {} not found in database", name))?;
        let body: DatasetBody = resp.json_as()?;
        Ok(Dataset {
            name: name.to_string(),
            description: body.description.unwrap_or_default(),
            timeseries: body.fids,
        })
    }

    async fn list(&self) -> Result<Vec<DatasetSummary>> {
        let resp = self.call(Verb::Get, &["dataset"], &[], Payload::Empty).await?;
        if resp.status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        resp.check("Listing datasets")?;
        let rows: Vec<DatasetRow> = resp.json_as()?;
        Ok(rows
            .into_iter()
            .map(|r| DatasetSummary { name: r.name, description: r.description.unwrap_or_default() })
            .collect())
    }

    async fn delete(&self, name: &str, deep: bool) -> Result<()> {
        let query: Vec<(&str, String)> = if deep { vec![("deep", "true".to_string())] } else { Vec::new() };
        let resp = self.call(Verb::Delete, &["dataset", name], &query, Payload::Empty).await?;
        resp.check(&format!("Dataset {} not found in database", name))
    }
}

#[async_trait]
impl TableStore for DatamodelClient {
    async fn create(&self, table: &Table) -> Result<()> {
        let name = table.table_desc.as_ref().map(|d| d.name.as_str()).unwrap_or_default();
        let resp = self
            .call(Verb::Post, &["table"], &[], Payload::Json(serde_json::to_value(table)?))
            .await?;
        resp.check(&format!("Table {} already exists in database", name))?;
        info!("Created table {}", name);
        Ok(())
    }

    async fn list(&self, name: Option<&str>, strict: bool) -> Result<Vec<TableSummary>> {
        let mut query = vec![("strict", strict.to_string())];
        if let Some(name) = name {
            query.push(("name", name.to_string()));
        }
        let resp = self.call(Verb::Get, &["table"], &query, Payload::Empty).await?;
        if resp.status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        resp.check("Listing tables")?;
        resp.json_as()
    }

    async fn read(&self, name: &str) -> Result<Table> {
        let resp = self.call(Verb::Get, &["table", name], &[], Payload::Empty).await?;
        resp.check(&format!("Table {} not found", name))?;
        resp.json_as()
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let resp = self.call(Verb::Delete, &["table", name], &[], Payload::Empty).await?;
        resp.check(&format!("Table {} not found", name))
    }
}
