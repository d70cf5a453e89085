use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use regex::Regex;

use super::{
    AssignResponse, DatasetStore, FidRegistry, MetadataStore, OperatorCatalog, PointStore, TableStore, UidAssigner,
    UidKind,
};
use crate::error::{IkatsError, Result};
use crate::model::{
    checked_range, DataPoint, Dataset, DatasetSummary, Fid, FidRecord, MDType, MetaEntry, Metadata, MetricTags,
    Operator, Table, TableSummary, Tags, Tsuid,
};
use crate::tsuid::assemble_tsuid;

// 3-byte uids, as allocated by OpenTSDB
const MAX_UID: u32 = 0xFF_FFFF;

#[derive(Debug, Default)]
struct UidTable {
    by_name: HashMap<String, String>,
    by_uid: HashMap<String, String>,
    last: u32,
}

#[derive(Debug)]
struct StoredDataset {
    description: String,
    tsuids: Vec<Tsuid>,
}

#[derive(Debug, Default)]
struct State {
    uids: HashMap<UidKind, UidTable>,
    fids: BTreeMap<Tsuid, Fid>,
    metadata: BTreeMap<Tsuid, Metadata>,
    points: HashMap<Tsuid, BTreeMap<i64, f64>>,
    datasets: BTreeMap<String, StoredDataset>,
    tables: BTreeMap<String, Table>,
    operators: BTreeMap<String, Operator>,
}

impl State {
    fn table(&mut self, kind: UidKind) -> &mut UidTable {
        self.uids.entry(kind).or_default()
    }

    fn uid_of(&self, kind: UidKind, name: &str) -> Option<String> {
        self.uids.get(&kind)?.by_name.get(name).cloned()
    }

    fn in_dataset(&self, tsuid: &Tsuid, except: Option<&str>) -> bool {
        self.datasets
            .iter()
            .filter(|(name, _)| Some(name.as_str()) != except)
            .any(|(_, ds)| ds.tsuids.contains(tsuid))
    }

    fn purge(&mut self, tsuid: &Tsuid) {
        self.fids.remove(tsuid);
        self.metadata.remove(tsuid);
        self.points.remove(tsuid);
    }
}

// `*` is a wildcard unless `strict`; the whole name must match.
fn name_pattern(name: &str, strict: bool) -> Result<Regex> {
    let body = if strict {
        regex::escape(name)
    } else {
        name.split('*').map(regex::escape).collect::<Vec<_>>().join(".*")
    };
    Ok(Regex::new(&format!("^{}$", body))?)
}

fn table_name(table: &Table) -> Result<&str> {
    table
        .table_desc
        .as_ref()
        .map(|d| d.name.as_str())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| IkatsError::input("table shall have a name in table_desc"))
}

/// Self-contained backend keeping everything in process memory.
///
/// Each instance is isolated: build one per test (or per emulator) and share
/// it through an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| IkatsError::Server("Poisoned Lock".into()))
    }

    // --- UIDS ---

    pub fn assign(&self, metric: &str, tags: &Tags) -> Result<AssignResponse> {
        let mut state = self.state()?;
        let mut resp = AssignResponse::default();

        let mut wanted = vec![(UidKind::Metric, metric.to_string())];
        for (k, v) in tags {
            wanted.push((UidKind::TagKey, k.clone()));
            wanted.push((UidKind::TagValue, v.clone()));
        }

        for (kind, name) in wanted {
            let table = state.table(kind);
            if let Some(uid) = table.by_name.get(&name) {
                let msg = format!("Name already exists with UID: {}", uid);
                resp.errors_mut(kind).insert(name, msg);
            } else if table.last >= MAX_UID {
                resp.errors_mut(kind).insert(name, format!("No more UIDs available for {}", kind.as_str()));
            } else {
                table.last += 1;
                let uid = format!("{:06X}", table.last);
                table.by_name.insert(name.clone(), uid.clone());
                table.by_uid.insert(uid.clone(), name.clone());
                resp.created_mut(kind).insert(name, uid);
            }
        }
        Ok(resp)
    }

    pub fn uid_name(&self, kind: UidKind, uid: &str) -> Result<Option<String>> {
        let state = self.state()?;
        Ok(state.uids.get(&kind).and_then(|t| t.by_uid.get(uid)).cloned())
    }

    /// TSUID of an already-assigned (metric, tags), without allocating.
    pub fn tsuid_for(&self, metric: &str, tags: &Tags) -> Result<Option<Tsuid>> {
        let state = self.state()?;
        let mut known = AssignResponse::default();

        let Some(metric_uid) = state.uid_of(UidKind::Metric, metric) else { return Ok(None) };
        known.metric.insert(metric.to_string(), metric_uid);
        for (k, v) in tags {
            let (Some(ku), Some(vu)) = (state.uid_of(UidKind::TagKey, k), state.uid_of(UidKind::TagValue, v)) else {
                return Ok(None);
            };
            known.tagk.insert(k.clone(), ku);
            known.tagv.insert(v.clone(), vu);
        }
        drop(state);

        let mt = MetricTags { metric: metric.to_string(), tags: tags.clone() };
        assemble_tsuid(&known, &mt).map(Some)
    }

    // --- FUNCTIONAL IDENTIFIERS ---

    pub fn tsuid_of(&self, fid: &Fid) -> Result<Option<Tsuid>> {
        let state = self.state()?;
        Ok(state.fids.iter().find(|(_, f)| *f == fid).map(|(t, _)| t.clone()))
    }

    pub fn fid_of(&self, tsuid: &Tsuid) -> Result<Option<Fid>> {
        Ok(self.state()?.fids.get(tsuid).cloned())
    }

    pub fn bind_fid(&self, tsuid: &Tsuid, fid: &Fid) -> Result<()> {
        let mut state = self.state()?;
        if let Some(existing) = state.fids.get(tsuid) {
            return Err(IkatsError::Conflict(format!("TSUID:{} - already bound to {}", tsuid, existing)));
        }
        if state.fids.values().any(|f| f == fid) {
            return Err(IkatsError::Conflict(format!("TSUID:{} - FID already exists (not updated) {}", tsuid, fid)));
        }
        state.fids.insert(tsuid.clone(), fid.clone());
        Ok(())
    }

    pub fn unbind_fid(&self, tsuid: &Tsuid) -> Result<()> {
        match self.state()?.fids.remove(tsuid) {
            Some(_) => Ok(()),
            None => Err(IkatsError::NotFound(format!("No FID for TSUID [{}]", tsuid))),
        }
    }

    pub fn fid_records(&self) -> Result<Vec<FidRecord>> {
        let state = self.state()?;
        Ok(state
            .fids
            .iter()
            .map(|(tsuid, fid)| FidRecord { tsuid: tsuid.clone(), fid: fid.clone() })
            .collect())
    }

    pub fn drop_timeseries(&self, tsuid: &Tsuid) -> Result<()> {
        let mut state = self.state()?;
        let known = state.fids.contains_key(tsuid)
            || state.points.contains_key(tsuid)
            || state.metadata.contains_key(tsuid);
        if !known {
            return Err(IkatsError::NotFound(format!("Timeseries {} not found in database", tsuid)));
        }
        if state.in_dataset(tsuid, None) {
            return Err(IkatsError::Conflict(format!("{} belongs to -at least- one dataset", tsuid)));
        }
        state.purge(tsuid);
        Ok(())
    }

    // --- METADATA ---

    pub fn metadata_of(&self, tsuids: &[Tsuid]) -> Result<BTreeMap<Tsuid, Metadata>> {
        let state = self.state()?;
        Ok(tsuids
            .iter()
            .map(|t| (t.clone(), state.metadata.get(t).cloned().unwrap_or_default()))
            .collect())
    }

    pub fn create_meta(&self, tsuid: &Tsuid, name: &str, value: &str, dtype: MDType) -> Result<()> {
        let mut state = self.state()?;
        let md = state.metadata.entry(tsuid.clone()).or_default();
        if md.contains_key(name) {
            return Err(IkatsError::Conflict(format!("Can't set metadata {} to {} (for tsuid {})", name, value, tsuid)));
        }
        md.insert(name.to_string(), MetaEntry::new(value, dtype));
        Ok(())
    }

    pub fn update_meta(&self, tsuid: &Tsuid, name: &str, value: &str) -> Result<()> {
        let mut state = self.state()?;
        match state.metadata.get_mut(tsuid).and_then(|md| md.get_mut(name)) {
            Some(entry) => {
                entry.value = value.to_string();
                Ok(())
            }
            None => Err(IkatsError::NotFound(format!("TSUID:{} - MetaData {} doesn't exist", tsuid, name))),
        }
    }

    pub fn delete_meta(&self, tsuid: &Tsuid, name: &str) -> Result<()> {
        let mut state = self.state()?;
        match state.metadata.get_mut(tsuid).and_then(|md| md.remove(name)) {
            Some(_) => Ok(()),
            None => Err(IkatsError::NotFound(format!("TSUID:{} - MetaData {} doesn't exist", tsuid, name))),
        }
    }

    pub fn match_meta(&self, constraint: &BTreeMap<String, Vec<String>>) -> Result<Vec<FidRecord>> {
        let state = self.state()?;
        let empty = Metadata::new();
        Ok(state
            .fids
            .iter()
            .filter(|(tsuid, _)| {
                let md = state.metadata.get(*tsuid).unwrap_or(&empty);
                constraint
                    .iter()
                    .all(|(name, accepted)| md.get(name).map_or(false, |e| accepted.contains(&e.value)))
            })
            .map(|(tsuid, fid)| FidRecord { tsuid: tsuid.clone(), fid: fid.clone() })
            .collect())
    }

    // --- POINTS ---

    pub fn put_points(&self, tsuid: &Tsuid, points: &[DataPoint]) -> Result<usize> {
        let mut state = self.state()?;
        let series = state.points.entry(tsuid.clone()).or_default();
        for p in points {
            series.insert(p.timestamp, p.value);
        }
        Ok(points.len())
    }

    /// `None` when nothing was ever written for `tsuid`.
    pub fn points_in(&self, tsuid: &Tsuid, start: i64, end: i64) -> Result<Option<Vec<DataPoint>>> {
        // checked before locking: a reversed range must not reach BTreeMap::range
        let (start, end) = checked_range(start, end)?;
        let state = self.state()?;
        Ok(state.points.get(tsuid).map(|series| {
            series
                .range(start..=end)
                .map(|(ts, v)| DataPoint::new(*ts, *v))
                .collect()
        }))
    }

    // --- DATASETS ---

    pub fn create_dataset(&self, name: &str, description: &str, tsuids: &[Tsuid]) -> Result<()> {
        let mut state = self.state()?;
        if state.datasets.contains_key(name) {
            return Err(IkatsError::Conflict(format!("Dataset {} already exists in database", name)));
        }
        state.datasets.insert(
            name.to_string(),
            StoredDataset { description: description.to_string(), tsuids: tsuids.to_vec() },
        );
        Ok(())
    }

    pub fn dataset(&self, name: &str) -> Result<Dataset> {
        let state = self.state()?;
        let ds = state
            .datasets
            .get(name)
            .ok_or_else(|| IkatsError::NotFound(format!("Dataset {} not found in database", name)))?;
        let timeseries = ds
            .tsuids
            .iter()
            .filter_map(|t| state.fids.get(t).map(|f| FidRecord { tsuid: t.clone(), fid: f.clone() }))
            .collect();
        Ok(Dataset { name: name.to_string(), description: ds.description.clone(), timeseries })
    }

    pub fn dataset_summaries(&self) -> Result<Vec<DatasetSummary>> {
        let state = self.state()?;
        Ok(state
            .datasets
            .iter()
            .map(|(name, ds)| DatasetSummary { name: name.clone(), description: ds.description.clone() })
            .collect())
    }

    pub fn delete_dataset(&self, name: &str, deep: bool) -> Result<()> {
        let mut state = self.state()?;
        let Some(ds) = state.datasets.remove(name) else {
            return Err(IkatsError::NotFound(format!("Dataset {} not found in database", name)));
        };
        if deep {
            for tsuid in &ds.tsuids {
                if !state.in_dataset(tsuid, Some(name)) {
                    state.purge(tsuid);
                }
            }
        }
        Ok(())
    }

    // --- TABLES ---

    pub fn create_table(&self, table: &Table) -> Result<()> {
        let name = table_name(table)?;
        let mut state = self.state()?;
        if state.tables.contains_key(name) {
            return Err(IkatsError::Conflict(format!("Table {} already exists in database", name)));
        }
        state.tables.insert(name.to_string(), table.clone());
        Ok(())
    }

    pub fn table_summaries(&self, name: Option<&str>, strict: bool) -> Result<Vec<TableSummary>> {
        let pattern = name.map(|n| name_pattern(n, strict)).transpose()?;
        let state = self.state()?;
        Ok(state
            .tables
            .iter()
            .filter(|(name, _)| pattern.as_ref().map_or(true, |p| p.is_match(name)))
            .map(|(name, table)| {
                let desc = table.table_desc.clone().unwrap_or_default();
                TableSummary { name: name.clone(), title: desc.title, description: desc.description }
            })
            .collect())
    }

    pub fn table(&self, name: &str) -> Result<Table> {
        let state = self.state()?;
        state
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| IkatsError::NotFound(format!("Table {} not found", name)))
    }

    pub fn delete_table(&self, name: &str) -> Result<()> {
        let mut state = self.state()?;
        match state.tables.remove(name) {
            Some(_) => Ok(()),
            None => Err(IkatsError::NotFound(format!("Table {} not found", name))),
        }
    }

    // --- OPERATORS ---

    /// Adds an implementation to the catalog.
    pub fn register_operator(&self, op: Operator) -> Result<()> {
        if op.name.is_empty() {
            return Err(IkatsError::input("operator shall have a name"));
        }
        let mut state = self.state()?;
        if state.operators.contains_key(&op.name) {
            return Err(IkatsError::Conflict(format!("Operator {} already in catalog", op.name)));
        }
        state.operators.insert(op.name.clone(), op);
        Ok(())
    }

    pub fn operators(&self) -> Result<Vec<Operator>> {
        Ok(self.state()?.operators.values().cloned().collect())
    }

    pub fn operator(&self, name: &str) -> Result<Operator> {
        self.state()?
            .operators
            .get(name)
            .cloned()
            .ok_or_else(|| IkatsError::NotFound(format!("No implementation found matching {}", name)))
    }
}

#[async_trait]
impl UidAssigner for MemoryBackend {
    async fn assign_uid(&self, metric: &str, tags: &Tags) -> Result<AssignResponse> {
        self.assign(metric, tags)
    }
}

#[async_trait]
impl PointStore for MemoryBackend {
    async fn write_points(&self, tsuid: &Tsuid, points: &[DataPoint]) -> Result<usize> {
        self.put_points(tsuid, points)
    }

    async fn read_points(&self, tsuid: &Tsuid, start: i64, end: i64) -> Result<Vec<DataPoint>> {
        Ok(self.points_in(tsuid, start, end)?.unwrap_or_default())
    }
}

#[async_trait]
impl FidRegistry for MemoryBackend {
    async fn lookup_tsuid(&self, fid: &Fid) -> Result<Option<Tsuid>> {
        self.tsuid_of(fid)
    }

    async fn lookup_fid(&self, tsuid: &Tsuid) -> Result<Option<Fid>> {
        self.fid_of(tsuid)
    }

    async fn register(&self, tsuid: &Tsuid, fid: &Fid) -> Result<()> {
        self.bind_fid(tsuid, fid)
    }

    async fn unregister(&self, tsuid: &Tsuid) -> Result<()> {
        self.unbind_fid(tsuid)
    }

    async fn list(&self) -> Result<Vec<FidRecord>> {
        self.fid_records()
    }

    async fn remove_timeseries(&self, tsuid: &Tsuid) -> Result<()> {
        self.drop_timeseries(tsuid)
    }
}

#[async_trait]
impl MetadataStore for MemoryBackend {
    async fn get_typed(&self, tsuids: &[Tsuid]) -> Result<BTreeMap<Tsuid, Metadata>> {
        self.metadata_of(tsuids)
    }

    async fn create(&self, tsuid: &Tsuid, name: &str, value: &str, dtype: MDType) -> Result<()> {
        self.create_meta(tsuid, name, value, dtype)
    }

    async fn update(&self, tsuid: &Tsuid, name: &str, value: &str) -> Result<()> {
        self.update_meta(tsuid, name, value)
    }

    async fn delete(&self, tsuid: &Tsuid, name: &str) -> Result<()> {
        self.delete_meta(tsuid, name)
    }

    async fn find(&self, constraint: &BTreeMap<String, Vec<String>>) -> Result<Vec<FidRecord>> {
        self.match_meta(constraint)
    }
}

#[async_trait]
impl DatasetStore for MemoryBackend {
    async fn create(&self, name: &str, description: &str, tsuids: &[Tsuid]) -> Result<()> {
        self.create_dataset(name, description, tsuids)
    }

    async fn read(&self, name: &str) -> Result<Dataset> {
        self.dataset(name)
    }

    async fn list(&self) -> Result<Vec<DatasetSummary>> {
        self.dataset_summaries()
    }

    async fn delete(&self, name: &str, deep: bool) -> Result<()> {
        self.delete_dataset(name, deep)
    }
}

#[async_trait]
impl TableStore for MemoryBackend {
    async fn create(&self, table: &Table) -> Result<()> {
        self.create_table(table)
    }

    async fn list(&self, name: Option<&str>, strict: bool) -> Result<Vec<TableSummary>> {
        self.table_summaries(name, strict)
    }

    async fn read(&self, name: &str) -> Result<Table> {
        self.table(name)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.delete_table(name)
    }
}

#[async_trait]
impl OperatorCatalog for MemoryBackend {
    async fn list(&self) -> Result<Vec<Operator>> {
        self.operators()
    }

    async fn get(&self, name: &str) -> Result<Operator> {
        self.operator(name)
    }
}
