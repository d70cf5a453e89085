//! HTTP emulator of the IKATS backends.
//!
//! Serves the datamodel and OpenTSDB routes used by the REST clients over a
//! [`MemoryBackend`], so the whole client stack can run without a cluster.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde_json::{json, Value};
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::reply::{Reply, Response};
use warp::{Filter, Rejection};

use crate::backend::memory::MemoryBackend;
use crate::backend::opentsdb::{PutPoint, PutSummary, QueryResult, UID_WIDTH};
use crate::backend::UidKind;
use crate::error::{IkatsError, Result};
use crate::model::{DataPoint, Fid, MDType, Table, Tags, Tsuid};

/// Binds the emulator; port 0 picks a free one.
pub fn bind(backend: Arc<MemoryBackend>, addr: SocketAddr) -> Result<(SocketAddr, impl Future<Output = ()>)> {
    let routes = routes(backend).with(warp::trace::request());
    warp::serve(routes)
        .try_bind_ephemeral(addr)
        .map_err(|e| IkatsError::Io(std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, e)))
}

pub fn routes(backend: Arc<MemoryBackend>) -> BoxedFilter<(Response,)> {
    let tdm = warp::path("datamodel-api").and(datamodel_routes(backend.clone()));
    let tsdb = warp::path("opentsdb").and(opentsdb_routes(backend.clone()));
    let catalog = warp::path!("pybase" / "ikats" / "algo" / "catalogue" / ..).and(catalog_routes(backend));
    tdm.or(tsdb).unify().or(catalog).unify().boxed()
}

fn with_backend(backend: Arc<MemoryBackend>) -> impl Filter<Extract = (Arc<MemoryBackend>,), Error = Infallible> + Clone {
    warp::any().map(move || backend.clone())
}

/// Path parameter, percent-decoded.
fn segment() -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::path::param::<String>().map(|raw: String| percent_decode_str(&raw).decode_utf8_lossy().into_owned())
}

fn optional_raw_query() -> impl Filter<Extract = (String,), Error = Infallible> + Clone {
    warp::query::raw().or(warp::any().map(String::new)).unify()
}

// --- REPLIES ---

fn status_of(e: &IkatsError) -> StatusCode {
    match e {
        IkatsError::Input(_) => StatusCode::BAD_REQUEST,
        IkatsError::NotFound(_) => StatusCode::NOT_FOUND,
        IkatsError::Conflict(_) => StatusCode::CONFLICT,
        IkatsError::Client { status, .. } => StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(e: &IkatsError) -> Response {
    let body = warp::reply::json(&json!({ "error": { "message": e.to_string() } }));
    warp::reply::with_status(body, status_of(e)).into_response()
}

fn reply_json<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(value) => warp::reply::json(&value).into_response(),
        Err(e) => failure(&e),
    }
}

fn reply_status(result: Result<()>, ok: StatusCode) -> Response {
    match result {
        Ok(()) => ok.into_response(),
        Err(e) => failure(&e),
    }
}

fn tsuid_list(raw: Option<&String>) -> Vec<Tsuid> {
    raw.map(|s| s.split(',').filter_map(|t| Tsuid::new(t.trim()).ok()).collect())
        .unwrap_or_default()
}

// --- DATAMODEL ROUTES ---

fn datamodel_routes(backend: Arc<MemoryBackend>) -> BoxedFilter<(Response,)> {
    let b = || with_backend(backend.clone());

    // POST /metadata/funcId  {"funcIds": [...]} or {"tsuids": [...]}
    let fid_search = warp::post()
        .and(warp::path!("metadata" / "funcId"))
        .and(warp::body::json::<Value>())
        .and(b())
        .map(|filter: Value, backend: Arc<MemoryBackend>| {
            let wanted = |key: &str| -> Vec<String> {
                filter[key]
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default()
            };
            let (fids, tsuids) = (wanted("funcIds"), wanted("tsuids"));
            let found = backend.fid_records().map(|records| {
                records
                    .into_iter()
                    .filter(|r| fids.iter().any(|f| f == r.fid.as_str()) || tsuids.iter().any(|t| t == r.tsuid.as_str()))
                    .collect::<Vec<_>>()
            });
            match found {
                Ok(records) if records.is_empty() => {
                    failure(&IkatsError::NotFound("No functional identifier matches".into()))
                }
                other => reply_json(other),
            }
        });

    // GET /metadata/funcId
    let fid_list = warp::get()
        .and(warp::path!("metadata" / "funcId"))
        .and(b())
        .map(|backend: Arc<MemoryBackend>| reply_json(backend.fid_records()));

    // GET /metadata/funcId/{tsuid}
    let fid_get = warp::get()
        .and(warp::path("metadata"))
        .and(warp::path("funcId"))
        .and(segment())
        .and(warp::path::end())
        .and(b())
        .map(|tsuid: String, backend: Arc<MemoryBackend>| {
            let found = Tsuid::new(tsuid.clone()).and_then(|t| backend.fid_of(&t));
            match found {
                Ok(Some(fid)) => warp::reply::json(&json!({ "tsuid": tsuid, "funcId": fid })).into_response(),
                Ok(None) => failure(&IkatsError::NotFound(format!("No FID for TSUID [{}]", tsuid))),
                Err(e) => failure(&e),
            }
        });

    // POST /metadata/funcId/{tsuid}/{fid}
    let fid_bind = warp::post()
        .and(warp::path("metadata"))
        .and(warp::path("funcId"))
        .and(segment())
        .and(segment())
        .and(warp::path::end())
        .and(b())
        .map(|tsuid: String, fid: String, backend: Arc<MemoryBackend>| {
            let bound = Tsuid::new(tsuid).and_then(|t| Ok((t, Fid::new(fid)?))).and_then(|(t, f)| backend.bind_fid(&t, &f));
            reply_status(bound, StatusCode::OK)
        });

    // DELETE /metadata/funcId/{tsuid}
    let fid_unbind = warp::delete()
        .and(warp::path("metadata"))
        .and(warp::path("funcId"))
        .and(segment())
        .and(warp::path::end())
        .and(b())
        .map(|tsuid: String, backend: Arc<MemoryBackend>| {
            reply_status(Tsuid::new(tsuid).and_then(|t| backend.unbind_fid(&t)), StatusCode::OK)
        });

    // GET /metadata/list/json?tsuid=a,b
    let meta_list = warp::get()
        .and(warp::path!("metadata" / "list" / "json"))
        .and(warp::query::<HashMap<String, String>>())
        .and(b())
        .map(|query: HashMap<String, String>, backend: Arc<MemoryBackend>| {
            let tsuids = tsuid_list(query.get("tsuid"));
            reply_json(backend.metadata_of(&tsuids).map(|all| {
                all.into_iter()
                    .flat_map(|(tsuid, md)| {
                        md.into_iter().map(move |(name, entry)| {
                            json!({ "tsuid": tsuid, "name": name, "value": entry.value, "dtype": entry.dtype })
                        })
                    })
                    .collect::<Vec<_>>()
            }))
        });

    // GET /metadata/tsmatch?name=v&name=w
    let meta_match = warp::get()
        .and(warp::path!("metadata" / "tsmatch"))
        .and(optional_raw_query())
        .and(b())
        .map(|raw: String, backend: Arc<MemoryBackend>| {
            let mut constraint: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for (name, value) in url::form_urlencoded::parse(raw.as_bytes()) {
                constraint.entry(name.into_owned()).or_default().push(value.into_owned());
            }
            reply_json(backend.match_meta(&constraint))
        });

    // POST /metadata/import/{tsuid}/{name}/{value}?dtype=
    let meta_create = warp::post()
        .and(warp::path("metadata"))
        .and(warp::path("import"))
        .and(segment())
        .and(segment())
        .and(segment())
        .and(warp::path::end())
        .and(warp::query::<HashMap<String, String>>())
        .and(b())
        .map(|tsuid: String, name: String, value: String, query: HashMap<String, String>, backend: Arc<MemoryBackend>| {
            let created = Tsuid::new(tsuid).and_then(|t| {
                let dtype = match query.get("dtype") {
                    Some(d) => d.parse()?,
                    None => MDType::default(),
                };
                backend.create_meta(&t, &name, &value, dtype)
            });
            reply_status(created, StatusCode::OK)
        });

    // PUT /metadata/{tsuid}/{name}/{value}
    let meta_update = warp::put()
        .and(warp::path("metadata"))
        .and(segment())
        .and(segment())
        .and(segment())
        .and(warp::path::end())
        .and(b())
        .map(|tsuid: String, name: String, value: String, backend: Arc<MemoryBackend>| {
            reply_status(Tsuid::new(tsuid).and_then(|t| backend.update_meta(&t, &name, &value)), StatusCode::OK)
        });

    // DELETE /metadata/{tsuid}/{name}
    let meta_delete = warp::delete()
        .and(warp::path("metadata"))
        .and(segment())
        .and(segment())
        .and(warp::path::end())
        .and(b())
        .map(|tsuid: String, name: String, backend: Arc<MemoryBackend>| {
            reply_status(Tsuid::new(tsuid).and_then(|t| backend.delete_meta(&t, &name)), StatusCode::OK)
        });

    // DELETE /ts/{tsuid}
    let ts_remove = warp::delete()
        .and(warp::path("ts"))
        .and(segment())
        .and(warp::path::end())
        .and(b())
        .map(|tsuid: String, backend: Arc<MemoryBackend>| {
            reply_status(Tsuid::new(tsuid).and_then(|t| backend.drop_timeseries(&t)), StatusCode::NO_CONTENT)
        });

    // POST /dataset/import/{name}  (form: name, description, tsuidList)
    let ds_create = warp::post()
        .and(warp::path("dataset"))
        .and(warp::path("import"))
        .and(segment())
        .and(warp::path::end())
        .and(warp::body::form::<HashMap<String, String>>())
        .and(b())
        .map(|name: String, form: HashMap<String, String>, backend: Arc<MemoryBackend>| {
            let description = form.get("description").cloned().unwrap_or_default();
            let tsuids = tsuid_list(form.get("tsuidList"));
            reply_status(backend.create_dataset(&name, &description, &tsuids), StatusCode::OK)
        });

    // GET /dataset
    let ds_list = warp::get()
        .and(warp::path("dataset"))
        .and(warp::path::end())
        .and(b())
        .map(|backend: Arc<MemoryBackend>| reply_json(backend.dataset_summaries()));

    // GET /dataset/{name}
    let ds_read = warp::get()
        .and(warp::path("dataset"))
        .and(segment())
        .and(warp::path::end())
        .and(b())
        .map(|name: String, backend: Arc<MemoryBackend>| reply_json(backend.dataset(&name)));

    // DELETE /dataset/{name}[?deep=true]
    let ds_delete = warp::delete()
        .and(warp::path("dataset"))
        .and(segment())
        .and(warp::path::end())
        .and(warp::query::<HashMap<String, String>>())
        .and(b())
        .map(|name: String, query: HashMap<String, String>, backend: Arc<MemoryBackend>| {
            let deep = query.get("deep").map_or(false, |d| d == "true");
            reply_status(backend.delete_dataset(&name, deep), StatusCode::OK)
        });

    // POST /table  (JSON table)
    let table_create = warp::post()
        .and(warp::path("table"))
        .and(warp::path::end())
        .and(warp::body::json::<Table>())
        .and(b())
        .map(|table: Table, backend: Arc<MemoryBackend>| reply_status(backend.create_table(&table), StatusCode::OK));

    // GET /table?name=&strict=
    let table_list = warp::get()
        .and(warp::path("table"))
        .and(warp::path::end())
        .and(warp::query::<HashMap<String, String>>())
        .and(b())
        .map(|query: HashMap<String, String>, backend: Arc<MemoryBackend>| {
            let strict = query.get("strict").map_or(true, |s| s != "false");
            let name = query.get("name").map(String::as_str).filter(|n| !n.is_empty());
            reply_json(backend.table_summaries(name, strict))
        });

    // GET /table/{name}
    let table_read = warp::get()
        .and(warp::path("table"))
        .and(segment())
        .and(warp::path::end())
        .and(b())
        .map(|name: String, backend: Arc<MemoryBackend>| reply_json(backend.table(&name)));

    // DELETE /table/{name}
    let table_delete = warp::delete()
        .and(warp::path("table"))
        .and(segment())
        .and(warp::path::end())
        .and(b())
        .map(|name: String, backend: Arc<MemoryBackend>| reply_status(backend.delete_table(&name), StatusCode::OK));

    // funcId routes first: "funcId" would otherwise match as a tsuid
    fid_search
        .or(fid_list)
        .unify()
        .boxed()
        .or(fid_get)
        .unify()
        .boxed()
        .or(fid_bind)
        .unify()
        .boxed()
        .or(fid_unbind)
        .unify()
        .boxed()
        .or(meta_list)
        .unify()
        .boxed()
        .or(meta_match)
        .unify()
        .boxed()
        .or(meta_create)
        .unify()
        .boxed()
        .or(meta_update)
        .unify()
        .boxed()
        .or(meta_delete)
        .unify()
        .boxed()
        .or(ts_remove)
        .unify()
        .boxed()
        .or(ds_create)
        .unify()
        .boxed()
        .or(ds_list)
        .unify()
        .boxed()
        .or(ds_read)
        .unify()
        .boxed()
        .or(ds_delete)
        .unify()
        .boxed()
        .or(table_create)
        .unify()
        .boxed()
        .or(table_list)
        .unify()
        .boxed()
        .or(table_read)
        .unify()
        .boxed()
        .or(table_delete)
        .unify()
        .boxed()
        .boxed()
}

// --- OPENTSDB ROUTES ---

fn parse_tags(query: &HashMap<String, String>) -> Result<Tags> {
    let split = |key: &str| -> Vec<String> {
        query
            .get(key)
            .filter(|s| !s.is_empty())
            .map(|s| s.split(',').map(str::to_string).collect())
            .unwrap_or_default()
    };
    let (keys, values) = (split("tagk"), split("tagv"));
    if keys.len() != values.len() {
        return Err(IkatsError::input(format!("{} tag keys for {} tag values", keys.len(), values.len())));
    }
    Ok(keys.into_iter().zip(values).collect())
}

fn parse_i64(query: &HashMap<String, String>, key: &str) -> Result<i64> {
    let raw = query.get(key).ok_or_else(|| IkatsError::input(format!("missing {}", key)))?;
    raw.parse().map_err(|_| IkatsError::input(format!("{} is not an integer: '{}'", key, raw)))
}

fn put_all(backend: &MemoryBackend, points: &[PutPoint]) -> Result<PutSummary> {
    let mut summary = PutSummary::default();
    for p in points {
        match backend.tsuid_for(&p.metric, &p.tags)? {
            Some(tsuid) => {
                summary.success += backend.put_points(&tsuid, &[DataPoint::new(p.timestamp, p.value)])?;
            }
            None => {
                summary.failed += 1;
                summary.errors.push(json!({
                    "datapoint": p,
                    "error": format!("Unknown metric or tags for '{}'", p.metric),
                }));
            }
        }
    }
    Ok(summary)
}

fn query_points(backend: &MemoryBackend, query: &HashMap<String, String>) -> Result<Vec<QueryResult>> {
    let selector = query.get("tsuid").ok_or_else(|| IkatsError::input("missing tsuid"))?;
    // "avg:T"
    let tsuid = Tsuid::new(selector.rsplit(':').next().unwrap_or_default())?;
    let (start, end) = (parse_i64(query, "start")?, parse_i64(query, "end")?);

    let points = match backend.points_in(&tsuid, start, end)? {
        Some(points) if !points.is_empty() => points,
        _ => return Ok(Vec::new()),
    };

    let mut result = QueryResult::default();
    let uids = tsuid.segments(UID_WIDTH);
    if let Some((metric, pairs)) = uids.split_first() {
        result.metric = backend.uid_name(UidKind::Metric, metric)?.unwrap_or_default();
        for pair in pairs.chunks(2) {
            if let [k, v] = pair {
                if let (Some(k), Some(v)) = (backend.uid_name(UidKind::TagKey, k)?, backend.uid_name(UidKind::TagValue, v)?) {
                    result.tags.insert(k, v);
                }
            }
        }
    }
    result.dps = Some(points.into_iter().map(|p| (p.timestamp.to_string(), p.value)).collect());
    Ok(vec![result])
}

fn opentsdb_routes(backend: Arc<MemoryBackend>) -> BoxedFilter<(Response,)> {
    let b = || with_backend(backend.clone());

    // GET /api/uid/assign?metric=&tagk=&tagv=
    let assign = warp::get()
        .and(warp::path!("api" / "uid" / "assign"))
        .and(warp::query::<HashMap<String, String>>())
        .and(b())
        .map(|query: HashMap<String, String>, backend: Arc<MemoryBackend>| {
            let assigned = parse_tags(&query).and_then(|tags| {
                let metric = query.get("metric").ok_or_else(|| IkatsError::input("missing metric"))?;
                backend.assign(metric, &tags)
            });
            match assigned {
                // OpenTSDB answers 400 as soon as one name already exists
                Ok(resp) if resp.has_errors() => {
                    warp::reply::with_status(warp::reply::json(&resp), StatusCode::BAD_REQUEST).into_response()
                }
                other => reply_json(other),
            }
        });

    // GET /api/uid/uidmeta?uid=&type=
    let uidmeta = warp::get()
        .and(warp::path!("api" / "uid" / "uidmeta"))
        .and(warp::query::<HashMap<String, String>>())
        .and(b())
        .map(|query: HashMap<String, String>, backend: Arc<MemoryBackend>| {
            let uid = query.get("uid").cloned().unwrap_or_default();
            let kind = query.get("type").and_then(|t| UidKind::parse(t));
            let Some(kind) = kind else {
                return failure(&IkatsError::input("type must be metric, tagk or tagv"));
            };
            match backend.uid_name(kind, &uid) {
                Ok(Some(name)) => {
                    warp::reply::json(&json!({ "uid": uid, "type": kind.as_str(), "name": name })).into_response()
                }
                Ok(None) => failure(&IkatsError::NotFound(format!("No such UID {} ({})", uid, kind.as_str()))),
                Err(e) => failure(&e),
            }
        });

    // POST /api/put?details&ms=true&sync
    let put = warp::post()
        .and(warp::path!("api" / "put"))
        .and(warp::body::json::<Vec<PutPoint>>())
        .and(b())
        .map(|points: Vec<PutPoint>, backend: Arc<MemoryBackend>| match put_all(&backend, &points) {
            Ok(summary) if summary.failed > 0 => {
                warp::reply::with_status(warp::reply::json(&summary), StatusCode::BAD_REQUEST).into_response()
            }
            other => reply_json(other),
        });

    // GET /api/query?start=&end=&tsuid=avg:T&ms=true
    let query = warp::get()
        .and(warp::path!("api" / "query"))
        .and(warp::query::<HashMap<String, String>>())
        .and(b())
        .map(|query: HashMap<String, String>, backend: Arc<MemoryBackend>| reply_json(query_points(&backend, &query)));

    assign.or(uidmeta).unify().or(put).unify().or(query).unify().boxed()
}

// --- CATALOG ROUTES ---

fn catalog_routes(backend: Arc<MemoryBackend>) -> BoxedFilter<(Response,)> {
    let b = || with_backend(backend.clone());

    // GET /implementations
    let list = warp::get()
        .and(warp::path("implementations"))
        .and(warp::path::end())
        .and(b())
        .map(|backend: Arc<MemoryBackend>| reply_json(backend.operators()));

    // GET /implementations/{name}
    let get = warp::get()
        .and(warp::path("implementations"))
        .and(segment())
        .and(warp::path::end())
        .and(b())
        .map(|name: String, backend: Arc<MemoryBackend>| reply_json(backend.operator(&name)));

    list.or(get).unify().boxed()
}
