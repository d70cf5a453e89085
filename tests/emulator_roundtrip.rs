//! Integration tests: the REST clients against the warp emulator.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ikats::backend::memory::MemoryBackend;
use ikats::backend::opentsdb::OpenTsdbClient;
use ikats::backend::PointStore;
use ikats::config::SessionConfig;
use ikats::emulator;
use ikats::model::{META_END_DATE, META_NB_POINTS, META_START_DATE};
use ikats::{DataPoint, Fid, IkatsError, Ikats, MDType, Operator, Table, Timeseries, Tsuid};
use pretty_assertions::assert_eq;
use serde_json::json;
use warp::Filter;

const LOCALHOST: ([u8; 4], u16) = ([127, 0, 0, 1], 0);

fn config_for(addr: SocketAddr) -> SessionConfig {
    let mut config = SessionConfig::new("http://127.0.0.1", addr.port());
    config.read_retry_delay_ms = 10;
    config.timeout_secs = 10;
    config
}

async fn setup_emulator() -> (Arc<MemoryBackend>, SessionConfig) {
    let backend = Arc::new(MemoryBackend::new());
    let (addr, server) = emulator::bind(backend.clone(), LOCALHOST.into()).unwrap();
    tokio::spawn(server);
    (backend, config_for(addr))
}

fn series(fid: &str, points: &[(i64, f64)]) -> Timeseries {
    let mut ts = Timeseries::with_ids(None, Some(Fid::new(fid).unwrap()));
    ts.data = points.iter().copied().map(DataPoint::from).collect();
    ts
}

#[tokio::test]
async fn test_import_fetch_roundtrip() {
    let (_backend, config) = setup_emulator().await;
    let client = Ikats::connect(&config).unwrap();

    let mut ts = series("fid_roundtrip", &[(900, 1.0), (1000, 2.0), (10000, 3.0)]);
    let summary = client.timeseries().save(&mut ts, None, true).await.unwrap();
    assert_eq!(summary.nb_points, 3);
    assert!(!summary.is_partial());

    let stored = client.timeseries().get(Some(&Fid::new("fid_roundtrip").unwrap()), None).await.unwrap();
    assert_eq!(stored.tsuid, ts.tsuid);
    assert_eq!(stored.metadata[META_START_DATE].value, "900");
    assert_eq!(stored.metadata[META_END_DATE].value, "10000");
    assert_eq!(stored.metadata[META_NB_POINTS].dtype, MDType::Number);

    // dps keys come back in string order; points must not
    let points = client.timeseries().fetch(&stored, None, None).await.unwrap();
    assert_eq!(
        points,
        vec![DataPoint::new(900, 1.0), DataPoint::new(1000, 2.0), DataPoint::new(10000, 3.0)]
    );

    let tsuid = ts.tsuid.clone().unwrap();
    assert_eq!(
        client.timeseries().tsuid_to_fid(&tsuid).await.unwrap(),
        Some(Fid::new("fid_roundtrip").unwrap())
    );
}

#[tokio::test]
async fn test_identity_conflicts_and_absence() {
    let (_backend, config) = setup_emulator().await;
    let client = Ikats::connect(&config).unwrap();
    let fid = Fid::new("fid_once").unwrap();

    let created = client.timeseries().new_timeseries(Some(fid.clone())).await.unwrap();
    assert_eq!(client.timeseries().fid_to_tsuid(&fid).await.unwrap(), created.tsuid);
    assert!(client.timeseries().new_timeseries(Some(fid)).await.unwrap_err().is_conflict());

    let unknown = Fid::new("fid_never").unwrap();
    assert_eq!(client.timeseries().fid_to_tsuid(&unknown).await.unwrap(), None);
    assert_eq!(client.timeseries().tsuid_to_fid(&Tsuid::new("FFFFFF").unwrap()).await.unwrap(), None);
}

#[tokio::test]
async fn test_explicit_metric_and_tags() {
    let (backend, config) = setup_emulator().await;
    let client = Ikats::connect(&config).unwrap();

    let mut tags = BTreeMap::new();
    tags.insert("flight".to_string(), "F1".to_string());
    tags.insert("aircraft".to_string(), "A320".to_string());
    let resolved = client
        .timeseries()
        .create_ref(&Fid::new("fid_named").unwrap(), Some("speed".into()), Some(tags.clone()))
        .await
        .unwrap();

    assert_eq!(backend.tsuid_for("speed", &tags).unwrap(), Some(resolved.tsuid));
    assert_eq!(resolved.metric_tags.metric, "speed");
}

#[tokio::test]
async fn test_widen_only_over_http() {
    let (_backend, config) = setup_emulator().await;
    let client = Ikats::connect(&config).unwrap();

    let mut ts = series("fid_chunks", &[(1000, 1.0), (2000, 2.0)]);
    client.timeseries().save(&mut ts, None, true).await.unwrap();

    // an older chunk widens the start and keeps the end
    ts.data = vec![DataPoint::new(500, 0.5), DataPoint::new(1500, 1.5)];
    let summary = client.timeseries().save(&mut ts, None, true).await.unwrap();
    assert_eq!((summary.start_date, summary.end_date), (Some(500), Some(2000)));

    let md = client.metadata().get(ts.tsuid.as_ref().unwrap()).await.unwrap();
    assert_eq!(md[META_START_DATE].value, "500");
    assert_eq!(md[META_END_DATE].value, "2000");
    assert_eq!(md[META_NB_POINTS].value, "2");
}

#[tokio::test]
async fn test_metadata_values_are_percent_encoded() {
    let (_backend, config) = setup_emulator().await;
    let client = Ikats::connect(&config).unwrap();
    let tsuid = Tsuid::new("00000A").unwrap();

    client.metadata().create(&tsuid, "unit", "m/s 2%", MDType::String).await.unwrap();
    assert!(client.metadata().create(&tsuid, "unit", "x", MDType::String).await.unwrap_err().is_conflict());
    client.metadata().set(&tsuid, "label", "a&b=c?", MDType::String).await.unwrap();

    let md = client.metadata().get(&tsuid).await.unwrap();
    assert_eq!(md["unit"].value, "m/s 2%");
    assert_eq!(md["label"].value, "a&b=c?");

    assert!(client.metadata().update(&tsuid, "missing", "v").await.unwrap_err().is_not_found());
    assert!(client.metadata().delete(&tsuid, "unit", false).await.unwrap());
    assert!(!client.metadata().delete(&tsuid, "unit", true).await.unwrap());
}

#[tokio::test]
async fn test_metadata_lookup_is_chunked() {
    let backend = Arc::new(MemoryBackend::new());
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let spy = warp::log::custom(move |info: warp::log::Info<'_>| {
        if info.path().ends_with("/metadata/list/json") {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    let (addr, server) = warp::serve(emulator::routes(backend.clone()).with(spy)).bind_ephemeral(LOCALHOST);
    tokio::spawn(server);

    let mut config = config_for(addr);
    config.metadata_chunk_size = 2;
    let client = Ikats::connect(&config).unwrap();

    let tsuids: Vec<Tsuid> = (0..5).map(|i| Tsuid::new(format!("00000{}", i)).unwrap()).collect();
    for (i, t) in tsuids.iter().enumerate() {
        backend.create_meta(t, "rank", &i.to_string(), MDType::Number).unwrap();
    }

    let all = client.metadata().get_many(&tsuids).await.unwrap();
    assert_eq!(all.len(), 5);
    assert_eq!(all[&tsuids[4]]["rank"].value, "4");
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_inheritance_and_find_over_http() {
    let (_backend, config) = setup_emulator().await;
    let client = Ikats::connect(&config).unwrap();

    let mut parent = series("fid_parent", &[(1, 1.0), (2, 2.0)]);
    client.timeseries().save(&mut parent, None, true).await.unwrap();
    let parent_tsuid = parent.tsuid.clone().unwrap();
    client.metadata().set(&parent_tsuid, "custom_unit", "m", MDType::String).await.unwrap();
    client.metadata().set(&parent_tsuid, "funcId", "fid_parent", MDType::String).await.unwrap();

    let mut child = series("fid_child", &[(5, 1.0)]);
    let summary = client.timeseries().save(&mut child, Some(&parent_tsuid), true).await.unwrap();
    assert_eq!(summary.inherited, 1);

    let md = client.metadata().get(child.tsuid.as_ref().unwrap()).await.unwrap();
    assert_eq!(md["custom_unit"].value, "m");
    assert!(!md.contains_key("funcId"));
    assert_eq!(md[META_START_DATE].value, "5");

    let mut constraint = BTreeMap::new();
    constraint.insert("custom_unit".to_string(), vec!["m".to_string(), "km".to_string()]);
    constraint.insert(META_START_DATE.to_string(), vec!["5".to_string()]);
    let found = client.timeseries().find_from_meta(&constraint).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].fid.as_str(), "fid_child");
}

#[tokio::test]
async fn test_datasets_over_http() {
    let (_backend, config) = setup_emulator().await;
    let client = Ikats::connect(&config).unwrap();

    let mut a = series("fid_ds_a", &[(1, 1.0)]);
    let mut b = series("fid_ds_b", &[(1, 1.0)]);
    client.timeseries().save(&mut a, None, true).await.unwrap();
    client.timeseries().save(&mut b, None, true).await.unwrap();
    let members = vec![a.tsuid.clone().unwrap(), b.tsuid.clone().unwrap()];

    client.datasets().create("flights", "two flights", &members).await.unwrap();
    assert!(client.datasets().create("flights", "again", &members).await.unwrap_err().is_conflict());
    assert!(client.datasets().read("nothing").await.unwrap_err().is_not_found());

    let ds = client.datasets().read("flights").await.unwrap();
    assert_eq!(ds.description, "two flights");
    assert_eq!(ds.timeseries.len(), 2);
    assert_eq!(client.datasets().list().await.unwrap()[0].name, "flights");

    // members of a dataset can't be removed
    assert!(client.timeseries().delete(&a, false).await.unwrap_err().is_conflict());

    assert!(client.datasets().delete("flights", true, false).await.unwrap());
    assert!(!client.datasets().delete("flights", false, true).await.unwrap());
    assert_eq!(client.timeseries().fid_to_tsuid(&Fid::new("fid_ds_a").unwrap()).await.unwrap(), None);
    assert!(!client.timeseries().delete(&a, true).await.unwrap());
}

#[tokio::test]
async fn test_empty_range_is_no_data() {
    let (_backend, config) = setup_emulator().await;
    let client = Ikats::connect(&config).unwrap();

    let mut ts = series("fid_sparse", &[(100, 1.0)]);
    client.timeseries().save(&mut ts, None, true).await.unwrap();
    assert!(client.timeseries().fetch(&ts, Some(200), Some(300)).await.unwrap().is_empty());
    // start == end still reads one millisecond
    assert_eq!(client.timeseries().fetch(&ts, Some(100), Some(100)).await.unwrap().len(), 1);
}

// --- STUBBED OPENTSDB ---

#[tokio::test]
async fn test_reversed_fetch_range_is_rejected_over_http() {
    let (_backend, config) = setup_emulator().await;
    let client = Ikats::connect(&config).unwrap();

    let mut ts = series("fid_reversed", &[(10, 1.0), (20, 2.0)]);
    client.timeseries().save(&mut ts, None, true).await.unwrap();

    let err = client.timeseries().fetch(&ts, Some(20), Some(10)).await.unwrap_err();
    assert!(matches!(err, IkatsError::Input(_)));
    let points = client.timeseries().fetch(&ts, Some(20), Some(20)).await.unwrap();
    assert_eq!(points, vec![DataPoint::new(20, 2.0)]);
}

#[tokio::test]
async fn test_tables_over_http() {
    let (_backend, config) = setup_emulator().await;
    let client = Ikats::connect(&config).unwrap();
    let table: Table = serde_json::from_value(json!({
        "table_desc": { "name": "tbl_flights", "desc": "durations" },
        "headers": { "col": { "data": ["flight", "duration"] } },
        "content": { "cells": [["F1", 90], ["F2", 45]] }
    }))
    .unwrap();

    let name = client.tables().create(table.clone(), None, None).await.unwrap();
    assert_eq!(name, "tbl_flights");
    client.tables().create(table.clone(), Some("tbl_other"), None).await.unwrap();
    let err = client.tables().create(table, None, None).await.unwrap_err();
    assert!(err.is_conflict());

    let listed = client.tables().list(Some("tbl_*"), false).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(client.tables().list(Some("tbl_*"), true).await.unwrap().is_empty());

    let stored = client.tables().read("tbl_flights").await.unwrap();
    assert_eq!(stored.extract("flight", &["duration"]).unwrap()["F2"]["duration"], json!(45));

    assert!(client.tables().delete("tbl_flights", false).await.unwrap());
    assert!(!client.tables().delete("tbl_flights", true).await.unwrap());
    assert!(client.tables().read("tbl_flights").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_operators_over_http() {
    let (backend, config) = setup_emulator().await;
    let client = Ikats::connect(&config).unwrap();
    assert!(client.operators().list().await.unwrap().is_empty());

    let op = Operator { name: "cut_ds".to_string(), family: Some("Preprocessing".to_string()), ..Operator::default() };
    backend.register_operator(op.clone()).unwrap();

    assert_eq!(client.operators().list().await.unwrap(), vec![op.clone()]);
    assert_eq!(client.operators().get("cut_ds").await.unwrap(), op);
    assert!(client.operators().get("unknown_op").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_partial_write_count_is_returned() {
    let uidmeta = warp::path!("opentsdb" / "api" / "uid" / "uidmeta").map(|| warp::reply::json(&json!({ "name": "x" })));
    let put = warp::post().and(warp::path!("opentsdb" / "api" / "put")).map(|| {
        let body = warp::reply::json(&json!({ "success": 2, "failed": 1, "errors": [] }));
        warp::reply::with_status(body, warp::http::StatusCode::BAD_REQUEST)
    });
    let (addr, server) = warp::serve(uidmeta.or(put)).bind_ephemeral(LOCALHOST);
    tokio::spawn(server);

    let client = OpenTsdbClient::new(&config_for(addr)).unwrap();
    let points = vec![DataPoint::new(1, 1.0), DataPoint::new(2, 2.0), DataPoint::new(3, 3.0)];
    let written = client.write_points(&Tsuid::new("000001000001000001").unwrap(), &points).await.unwrap();
    assert_eq!(written, 2);
}

#[tokio::test]
async fn test_unreadable_put_answer_is_a_decode_error() {
    let uidmeta = warp::path!("opentsdb" / "api" / "uid" / "uidmeta").map(|| warp::reply::json(&json!({ "name": "x" })));
    let put = warp::post().and(warp::path!("opentsdb" / "api" / "put")).map(|| "stored, probably");
    let (addr, server) = warp::serve(uidmeta.or(put)).bind_ephemeral(LOCALHOST);
    tokio::spawn(server);

    let client = OpenTsdbClient::new(&config_for(addr)).unwrap();
    let err = client
        .write_points(&Tsuid::new("000001000001000001").unwrap(), &[DataPoint::new(1, 1.0)])
        .await
        .unwrap_err();
    assert!(matches!(err, IkatsError::Decode(_)), "{:?}", err);
}

#[tokio::test]
async fn test_empty_dps_retries_once_then_fails() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let query = warp::path!("opentsdb" / "api" / "query").map(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        warp::reply::json(&json!([{ "metric": "m", "tags": {}, "dps": {} }]))
    });
    let (addr, server) = warp::serve(query).bind_ephemeral(LOCALHOST);
    tokio::spawn(server);

    let client = OpenTsdbClient::new(&config_for(addr)).unwrap();
    let err = client.read_points(&Tsuid::new("000001").unwrap(), 0, 10).await.unwrap_err();
    assert!(matches!(err, IkatsError::Server(_)));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_server_errors_are_mapped() {
    let failing = warp::any().map(|| warp::reply::with_status("boom", warp::http::StatusCode::BAD_GATEWAY));
    let (addr, server) = warp::serve(failing).bind_ephemeral(LOCALHOST);
    tokio::spawn(server);

    let client = Ikats::connect(&config_for(addr)).unwrap();
    let err = client.datasets().list().await.unwrap_err();
    assert!(err.is_server_error());
}
