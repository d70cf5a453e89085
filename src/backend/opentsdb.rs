use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::{AssignResponse, PointStore, UidAssigner, UidKind};
use crate::config::SessionConfig;
use crate::error::{IkatsError, Result};
use crate::http::{endpoint, Payload, RestClient, Verb};
use crate::model::{checked_range, DataPoint, MetricTags, Tags, Tsuid};

/// Width of a single uid inside a TSUID
pub const UID_WIDTH: usize = 6;

#[derive(Debug, Serialize, Deserialize)]
pub struct PutPoint {
    pub metric: String,
    pub timestamp: i64,
    pub value: f64,
    pub tags: Tags,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PutSummary {
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryResult {
    pub metric: String,
    pub tags: Tags,
    pub dps: Option<BTreeMap<String, f64>>,
}

#[derive(Debug, Deserialize)]
struct UidMeta {
    name: String,
}

/// REST client of the OpenTSDB API: uid allocation and points.
#[derive(Debug, Clone)]
pub struct OpenTsdbClient {
    rest: RestClient,
    root: Url,
    retry_delay: Duration,
}

impl OpenTsdbClient {
    pub fn new(config: &SessionConfig) -> Result<Self> {
        Ok(Self {
            rest: RestClient::new(config.timeout())?,
            root: config.tsdb_url()?,
            retry_delay: config.read_retry_delay(),
        })
    }

    pub async fn uid_name(&self, kind: UidKind, uid: &str) -> Result<String> {
        let url = endpoint(&self.root, &["api", "uid", "uidmeta"])?;
        let query = [("uid", uid.to_string()), ("type", kind.as_str().to_string())];
        let resp = self.rest.send(Verb::Get, url, &query, Payload::Empty, None).await?;
        resp.check(&format!("UID unknown: {} ({})", uid, kind.as_str()))?;
        Ok(resp.json_as::<UidMeta>()?.name)
    }

    /// Maps a TSUID back to the metric and tags it was allocated from.
    /// Segments alternate metric, tagk, tagv, tagk, tagv...
    pub async fn metric_tags_of(&self, tsuid: &Tsuid) -> Result<MetricTags> {
        let uids = tsuid.segments(UID_WIDTH);
        let Some((metric_uid, pairs)) = uids.split_first() else {
            return Err(IkatsError::input(format!("TSUID incorrect (got: {})", tsuid)));
        };
        if pairs.len() % 2 != 0 {
            return Err(IkatsError::input(format!("TSUID incorrect (got: {})", tsuid)));
        }

        let metric = self.uid_name(UidKind::Metric, metric_uid).await?;
        let mut tags = Tags::new();
        for pair in pairs.chunks(2) {
            let key = self.uid_name(UidKind::TagKey, pair[0]).await?;
            let value = self.uid_name(UidKind::TagValue, pair[1]).await?;
            tags.insert(key, value);
        }
        Ok(MetricTags { metric, tags })
    }

    async fn query_once(&self, tsuid: &Tsuid, start: i64, end: i64) -> Result<Option<Vec<DataPoint>>> {
        let url = endpoint(&self.root, &["api", "query"])?;
        let query = [
            ("start", start.to_string()),
            ("end", end.to_string()),
            ("tsuid", format!("avg:{}", tsuid)),
            ("ms", "true".to_string()),
        ];
        let resp = self.rest.send(Verb::Get, url, &query, Payload::Empty, None).await?;
        resp.check(&format!("Reading points of {}", tsuid))?;

        let results: Vec<QueryResult> = resp.json_as()?;
        let Some(first) = results.into_iter().next() else {
            return Ok(Some(Vec::new()));
        };
        match first.dps {
            Some(dps) if !dps.is_empty() => decode_dps(dps).map(Some),
            _ => Ok(None),
        }
    }
}

fn decode_dps(dps: BTreeMap<String, f64>) -> Result<Vec<DataPoint>> {
    let mut points = dps
        .into_iter()
        .map(|(ts, value)| {
            ts.parse::<i64>()
                .map(|ts| DataPoint::new(ts, value))
                .map_err(|_| IkatsError::decode(format!("timestamp '{}' is not an integer", ts)))
        })
        .collect::<Result<Vec<_>>>()?;
    // keys are sorted as strings, not as numbers
    points.sort_by_key(|p| p.timestamp);
    Ok(points)
}

#[async_trait]
impl UidAssigner for OpenTsdbClient {
    async fn assign_uid(&self, metric: &str, tags: &Tags) -> Result<AssignResponse> {
        let url = endpoint(&self.root, &["api", "uid", "assign"])?;
        let mut query = vec![("metric", metric.to_string())];
        if !tags.is_empty() {
            query.push(("tagk", tags.keys().cloned().collect::<Vec<_>>().join(",")));
            query.push(("tagv", tags.values().cloned().collect::<Vec<_>>().join(",")));
        }
        let resp = self.rest.send(Verb::Get, url, &query, Payload::Empty, None).await?;

        // 400 still carries the buckets when some names already exist
        if resp.status != StatusCode::BAD_REQUEST {
            resp.check(&format!("UID assignment of {}", metric))?;
        }
        resp.json_as()
    }
}

#[async_trait]
impl PointStore for OpenTsdbClient {
    async fn write_points(&self, tsuid: &Tsuid, points: &[DataPoint]) -> Result<usize> {
        if points.is_empty() {
            return Ok(0);
        }
        let MetricTags { metric, tags } = self.metric_tags_of(tsuid).await?;

        let body: Vec<PutPoint> = points
            .iter()
            .map(|p| PutPoint { metric: metric.clone(), timestamp: p.timestamp, value: p.value, tags: tags.clone() })
            .collect();

        let url = endpoint(&self.root, &["api", "put"])?;
        let query = [("details", String::new()), ("ms", "true".to_string()), ("sync", String::new())];
        let resp = self
            .rest
            .send(Verb::Post, url, &query, Payload::Json(serde_json::to_value(&body)?), None)
            .await?;

        // a 400 still carries the summary when only some points were refused
        let summary = match resp.json_as::<PutSummary>() {
            Ok(summary) if resp.status == StatusCode::BAD_REQUEST => summary,
            _ => {
                resp.check(&format!("Writing points of {}", tsuid))?;
                resp.json_as::<PutSummary>()?
            }
        };
        if summary.success != points.len() {
            warn!(
                "Database wrote only {} points out of {} for {}: {:?}",
                summary.success,
                points.len(),
                tsuid,
                summary.errors
            );
        }
        Ok(summary.success)
    }

    async fn read_points(&self, tsuid: &Tsuid, start: i64, end: i64) -> Result<Vec<DataPoint>> {
        let (start, end) = checked_range(start, end)?;

        for attempt in 0..2 {
            if attempt > 0 {
                // not flushed yet by the store
                debug!("No points for {} yet, retrying in {:?}", tsuid, self.retry_delay);
                tokio::time::sleep(self.retry_delay).await;
            }
            if let Some(points) = self.query_once(tsuid, start, end).await? {
                return Ok(points);
            }
        }
        Err(IkatsError::Server("Backend didn't provide the points".into()))
    }
}
