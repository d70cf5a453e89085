use std::collections::BTreeMap;
use std::slice;

use tracing::{info, warn};

use crate::backend::Backends;
use crate::error::{IkatsError, Result};
use crate::import::Importer;
use crate::model::{
    checked_range, DataPoint, Fid, FidRecord, ImportSummary, MDType, MetaEntry, Metadata, Tags, Timeseries, Tsuid,
    META_END_DATE, META_NB_POINTS, META_START_DATE,
};
use crate::tsuid::{Resolved, TsuidResolver};

/// Timeseries lifecycle: identity, points and intrinsic metadata.
#[derive(Clone)]
pub struct TimeseriesManager {
    backends: Backends,
    resolver: TsuidResolver,
    importer: Importer,
}

impl TimeseriesManager {
    pub fn new(backends: Backends) -> Result<Self> {
        let resolver = TsuidResolver::new(backends.uids.clone(), backends.registry.clone());
        let importer = Importer::new(backends.metadata.clone())?;
        Ok(Self { backends, resolver, importer })
    }

    /// Empty local timeseries, or a fresh reference when `fid` is given.
    pub async fn new_timeseries(&self, fid: Option<Fid>) -> Result<Timeseries> {
        match fid {
            None => Ok(Timeseries::new()),
            Some(fid) => {
                let resolved = self.resolver.resolve_or_create(&fid, None, None).await?;
                Ok(Timeseries::with_ids(Some(resolved.tsuid), Some(fid)))
            }
        }
    }

    /// Reference creation with explicit naming.
    pub async fn create_ref(&self, fid: &Fid, metric: Option<String>, tags: Option<Tags>) -> Result<Resolved> {
        self.resolver.resolve_or_create(fid, metric, tags).await
    }

    pub async fn get(&self, fid: Option<&Fid>, tsuid: Option<&Tsuid>) -> Result<Timeseries> {
        let (tsuid, fid) = match (fid, tsuid) {
            (Some(fid), None) => {
                let tsuid = self
                    .resolver
                    .lookup(fid)
                    .await?
                    .ok_or_else(|| IkatsError::NotFound(format!("FID {} not found", fid)))?;
                (tsuid, Some(fid.clone()))
            }
            (None, Some(tsuid)) => (tsuid.clone(), self.backends.registry.lookup_fid(tsuid).await?),
            _ => return Err(IkatsError::input("fid and tsuid are mutually exclusive")),
        };

        let mut ts = Timeseries::with_ids(Some(tsuid.clone()), fid);
        ts.metadata = self.metadata_of(&tsuid).await?;
        Ok(ts)
    }

    /// Writes the points of `ts`, creating its reference first if needed.
    pub async fn save(&self, ts: &mut Timeseries, parent: Option<&Tsuid>, generate_metadata: bool) -> Result<ImportSummary> {
        let Some(fid) = ts.fid.clone() else {
            return Err(IkatsError::input("timeseries shall have a FID to be saved"));
        };
        if ts.data.is_empty() {
            return Err(IkatsError::input(format!("no points to save for {}", fid)));
        }

        let mut generate_metadata = generate_metadata;
        let tsuid = match &ts.tsuid {
            Some(tsuid) => tsuid.clone(),
            None => {
                let resolved = self.resolver.resolve_or_create(&fid, None, None).await?;
                ts.tsuid = Some(resolved.tsuid.clone());
                // a fresh timeseries always gets its intrinsic metadata
                generate_metadata = true;
                resolved.tsuid
            }
        };

        let written = self.backends.points.write_points(&tsuid, &ts.data).await?;
        let summary = self
            .importer
            .finalize_import(&tsuid, &ts.data, written, parent, generate_metadata)
            .await?;

        if summary.is_partial() {
            warn!("{}: only {} points written out of {}", fid, summary.nb_points, summary.submitted);
        } else {
            info!("{}: {} points imported", fid, summary.nb_points);
        }

        if generate_metadata {
            if let Some(start) = summary.start_date {
                ts.metadata.insert(META_START_DATE.into(), MetaEntry::new(start.to_string(), MDType::Date));
            }
            if let Some(end) = summary.end_date {
                ts.metadata.insert(META_END_DATE.into(), MetaEntry::new(end.to_string(), MDType::Date));
            }
            ts.metadata.insert(META_NB_POINTS.into(), MetaEntry::new(summary.nb_points.to_string(), MDType::Number));
        }
        if summary.inherited > 0 {
            ts.metadata = self.metadata_of(&tsuid).await?;
        }
        Ok(summary)
    }

    /// Removes the timeseries and its metadata. With `missing_ok`, an unknown
    /// timeseries gives `Ok(false)` instead of `NotFound`.
    pub async fn delete(&self, ts: &Timeseries, missing_ok: bool) -> Result<bool> {
        let tsuid = match (&ts.tsuid, &ts.fid) {
            (Some(tsuid), _) => tsuid.clone(),
            (None, Some(fid)) => match self.resolver.lookup(fid).await? {
                Some(tsuid) => tsuid,
                None if missing_ok => return Ok(false),
                None => return Err(IkatsError::NotFound(format!("FID {} not found", fid))),
            },
            (None, None) => return Err(IkatsError::input("timeseries shall have at least a tsuid or a fid")),
        };
        self.delete_tsuid(&tsuid, missing_ok).await
    }

    pub async fn delete_tsuid(&self, tsuid: &Tsuid, missing_ok: bool) -> Result<bool> {
        match self.backends.registry.remove_timeseries(tsuid).await {
            Ok(()) => {
                info!("Timeseries {} removed", tsuid);
                Ok(true)
            }
            Err(e) if missing_ok && e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn list(&self) -> Result<Vec<FidRecord>> {
        self.backends.registry.list().await
    }

    /// Points of `ts` sorted by timestamp. Missing bounds come from the
    /// intrinsic date metadata.
    pub async fn fetch(&self, ts: &Timeseries, start: Option<i64>, end: Option<i64>) -> Result<Vec<DataPoint>> {
        let Some(tsuid) = &ts.tsuid else {
            return Err(IkatsError::input("timeseries shall have a tsuid to be fetched"));
        };

        let stored = if start.is_none() || end.is_none() {
            Some(self.metadata_of(tsuid).await?)
        } else {
            None
        };
        let bound = |explicit: Option<i64>, name: &str| -> Result<i64> {
            let value = explicit
                .or_else(|| ts.metadata.get(name).and_then(MetaEntry::as_i64))
                .or_else(|| stored.as_ref().and_then(|md| md.get(name)).and_then(MetaEntry::as_i64))
                .ok_or_else(|| IkatsError::input(format!("{} of {} is unknown", name, tsuid)))?;
            if value < 0 {
                return Err(IkatsError::input(format!("{} must be a positive epoch (got: {})", name, value)));
            }
            Ok(value)
        };
        let (start, end) = checked_range(bound(start, META_START_DATE)?, bound(end, META_END_DATE)?)?;

        let mut points = self.backends.points.read_points(tsuid, start, end).await?;
        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }

    /// Name -> accepted values. OR within a name, AND across names.
    pub async fn find_from_meta(&self, constraint: &BTreeMap<String, Vec<String>>) -> Result<Vec<FidRecord>> {
        self.backends.metadata.find(constraint).await
    }

    pub async fn tsuid_to_fid(&self, tsuid: &Tsuid) -> Result<Option<Fid>> {
        self.backends.registry.lookup_fid(tsuid).await
    }

    pub async fn fid_to_tsuid(&self, fid: &Fid) -> Result<Option<Tsuid>> {
        self.resolver.lookup(fid).await
    }

    pub async fn inherit(&self, ts: &Timeseries, parent: &Timeseries) -> Result<usize> {
        let (Some(child), Some(parent)) = (&ts.tsuid, &parent.tsuid) else {
            return Err(IkatsError::input("both timeseries shall have a tsuid"));
        };
        Ok(self.importer.inherit(child, parent).await)
    }

    async fn metadata_of(&self, tsuid: &Tsuid) -> Result<Metadata> {
        let mut all = self.backends.metadata.get_typed(slice::from_ref(tsuid)).await?;
        Ok(all.remove(tsuid).unwrap_or_default())
    }
}
