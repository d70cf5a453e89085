//! TSUID allocation.
//!
//! A TSUID is the metric uid followed by the `tagk_uid + tagv_uid` pairs in
//! ascending order. Uids come from the assigner: fresh ones in the kind's
//! bucket, known ones embedded in an `*_errors` message.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, info};

use crate::backend::{AssignResponse, FidRegistry, UidAssigner, UidKind};
use crate::error::{IkatsError, Result};
use crate::model::{Fid, MetricTags, Tags, Tsuid};

pub const TAG_IMPORT_YEAR: &str = "import_year";
pub const TAG_IMPORT_MONTH_DAY: &str = "import_month_day";
pub const TAG_IMPORT_TIME: &str = "import_time";

impl MetricTags {
    /// Import-date naming: the metric is the sub-second part in hundreds of
    /// nanoseconds (7 digits), the tags locate the import in time.
    pub fn at(now: OffsetDateTime) -> Self {
        let metric = format!("{:07}", now.nanosecond() / 100);
        let mut tags = Tags::new();
        tags.insert(TAG_IMPORT_YEAR.to_string(), format!("{:04}", now.year()));
        tags.insert(TAG_IMPORT_MONTH_DAY.to_string(), format!("{:02}_{:02}", u8::from(now.month()), now.day()));
        tags.insert(
            TAG_IMPORT_TIME.to_string(),
            format!("{:02}_{:02}_{:02}", now.hour(), now.minute(), now.second()),
        );
        Self { metric, tags }
    }

    /// Explicit values win; each missing part falls back to the generated one.
    pub fn resolve(metric: Option<String>, tags: Option<Tags>, now: OffsetDateTime) -> Self {
        let generated = Self::at(now);
        Self {
            metric: metric.filter(|m| !m.is_empty()).unwrap_or(generated.metric),
            tags: tags.filter(|t| !t.is_empty()).unwrap_or(generated.tags),
        }
    }
}

/// Uid of `name` in the assigner answer.
pub fn extract_uid(kind: UidKind, name: &str, resp: &AssignResponse) -> Result<String> {
    if let Some(uid) = resp.created(kind).get(name) {
        return Ok(uid.clone());
    }
    if let Some(message) = resp.errors(kind).get(name) {
        // "Name already exists with UID: 00002A"
        let uid = message.split(':').nth(1).map(str::trim).unwrap_or_default();
        if !uid.is_empty() && uid.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(uid.to_string());
        }
        return Err(IkatsError::decode(format!(
            "UID assignment of {} '{}': bad format ({})",
            kind.as_str(),
            name,
            message
        )));
    }
    Err(IkatsError::decode(format!("UID assignment: no {} '{}' in the answer", kind.as_str(), name)))
}

pub fn assemble_tsuid(resp: &AssignResponse, mt: &MetricTags) -> Result<Tsuid> {
    let mut tsuid = extract_uid(UidKind::Metric, &mt.metric, resp)?;

    let mut pairs = mt
        .tags
        .iter()
        .map(|(k, v)| Ok(extract_uid(UidKind::TagKey, k, resp)? + &extract_uid(UidKind::TagValue, v, resp)?))
        .collect::<Result<Vec<String>>>()?;
    pairs.sort();

    for pair in pairs {
        tsuid.push_str(&pair);
    }
    Tsuid::new(tsuid)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub tsuid: Tsuid,
    pub metric_tags: MetricTags,
}

#[derive(Clone)]
pub struct TsuidResolver {
    assigner: Arc<dyn UidAssigner>,
    registry: Arc<dyn FidRegistry>,
}

impl TsuidResolver {
    pub fn new(assigner: Arc<dyn UidAssigner>, registry: Arc<dyn FidRegistry>) -> Self {
        Self { assigner, registry }
    }

    pub async fn lookup(&self, fid: &Fid) -> Result<Option<Tsuid>> {
        self.registry.lookup_tsuid(fid).await
    }

    /// Allocates a TSUID for a FID that doesn't exist yet and registers it.
    pub async fn resolve_or_create(&self, fid: &Fid, metric: Option<String>, tags: Option<Tags>) -> Result<Resolved> {
        if let Some(existing) = self.registry.lookup_tsuid(fid).await? {
            return Err(IkatsError::Conflict(format!("FID {} already exists as {}", fid, existing)));
        }

        let metric_tags = MetricTags::resolve(metric, tags, OffsetDateTime::now_utc());
        debug!("Assigning uids for {} with metric {}", fid, metric_tags.metric);

        let resp = self.assigner.assign_uid(&metric_tags.metric, &metric_tags.tags).await?;
        let tsuid = assemble_tsuid(&resp, &metric_tags)?;

        self.registry.register(&tsuid, fid).await?;
        info!("Created timeseries {} ({})", fid, tsuid);

        Ok(Resolved { tsuid, metric_tags })
    }
}
