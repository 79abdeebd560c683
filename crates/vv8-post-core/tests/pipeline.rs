use std::sync::Arc;

use vv8_post_core::aggregate::{
    dump_aggregator, make_aggregators, AggregationContext, Aggregator, AggregatorResources,
    Format, FormatSet, MemoryDatabaseSink, OutputSink, SqlValue,
};
use vv8_post_core::context::LogInfo;
use vv8_post_core::entity::EntityMap;
use vv8_post_core::idl::IdlTree;

const IDL_JSON: &str = r#"{
    "EventTarget": { "methods": ["addEventListener"] },
    "Window": { "parent": "EventTarget", "properties": ["foo", "name"] },
    "Document": { "methods": ["write", "writeln"] },
    "HTMLDocument": { "parent": "Document", "methods": ["createElement"] }
}"#;

const ENTITIES_JSON: &str = r#"{
    "a.test": { "displayName": "A Corp", "tracking": 0.2 }
}"#;

fn resources() -> AggregatorResources {
    AggregatorResources {
        idl: Arc::new(IdlTree::from_json(IDL_JSON).unwrap()),
        entities: Some(Arc::new(EntityMap::from_json(ENTITIES_JSON).unwrap())),
    }
}

fn formats(list: &[Format]) -> FormatSet {
    list.iter().copied().collect()
}

fn run_to_stream(trace: &str, selected: &[Format], root_domain: Option<&str>) -> Vec<serde_json::Value> {
    let set = formats(selected);
    let mut aggs = make_aggregators(&set, &resources()).unwrap();
    let mut log = LogInfo::new("vv8-pipeline.0.log", None);
    {
        let mut views: Vec<&mut dyn Aggregator> = Vec::with_capacity(aggs.len());
        for a in aggs.iter_mut() {
            views.push(a.as_mut());
        }
        log.ingest_stream(trace.as_bytes(), &mut views).unwrap();
    }
    let ctx = AggregationContext { formats: set, root_domain: root_domain.map(str::to_string) };
    let mut out = Vec::new();
    {
        let mut sink = OutputSink::Stream(&mut out);
        for agg in &mut aggs {
            dump_aggregator(agg.as_mut(), &ctx, &log, &mut sink).unwrap();
        }
    }
    String::from_utf8(out)
        .unwrap()
        .lines()
        .filter(|l| l.starts_with('['))
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

const FULL_TRACE: &str = concat!(
    "~0xCAFE\n",
    "@\"http://a.test\"\n",
    "$0:\"http://a.test/main.js\":var page = 1;\n",
    "!0\n",
    "g10:{Window}:\"foo\"\n",
    "g10:{Window}:\"foo\"\n",
    "c22:\"createElement\":{HTMLDocument}:\"DIV\"\n",
    "s30:{Node,HTMLScriptElement}:\"src\":\"http://b.test/q.js\"\n",
    "$1:\"http://b.test/q.js\":var included = 2;\n",
    "$2:0:var evaled = 3;\n",
    "!2\n",
    "g40:{Window}:\"name\"\n",
);

#[test]
fn one_ingest_feeds_every_selected_aggregator() {
    let records = run_to_stream(
        FULL_TRACE,
        &[
            Format::Features,
            Format::Scripts,
            Format::Causality,
            Format::CreateElement,
            Format::CallArgs,
            Format::Flow,
            Format::Fptp,
        ],
        Some("http://a.test"),
    );
    let tags: Vec<&str> = records.iter().map(|r| r[0].as_str().unwrap()).collect();
    for expected in [
        "feature_usage",
        "script_creation",
        "script_causality",
        "create_element",
        "callargs",
        "script_flow",
        "first_party_third_party",
    ] {
        assert!(tags.contains(&expected), "missing output tag {expected}");
    }
}

#[test]
fn feature_usage_spans_scripts_and_origins_correctly() {
    let records = run_to_stream(FULL_TRACE, &[Format::Features], Some("http://a.test"));
    // Window.foo twice at offset 10 in script 0; Window.name once at
    // offset 40 in the eval child. createElement is monomorphic too.
    let foo = records
        .iter()
        .find(|r| r[1]["feature_name"] == "Window.foo")
        .unwrap();
    assert_eq!(foo[1]["use_count"], 2);
    assert_eq!(foo[1]["security_origin"], "http://a.test");
    let name = records
        .iter()
        .find(|r| r[1]["feature_name"] == "Window.name")
        .unwrap();
    assert_eq!(name[1]["feature_use"], "g");
}

#[test]
fn causality_stream_reports_include_eval_and_static() {
    let records = run_to_stream(FULL_TRACE, &[Format::Causality], Some("http://a.test"));
    let genesis: Vec<&str> = records
        .iter()
        .map(|r| r[1]["genesis"].as_str().unwrap())
        .collect();
    assert!(genesis.contains(&"include"));
    assert!(genesis.contains(&"eval"));
    assert!(genesis.contains(&"static"));
    let include = records
        .iter()
        .find(|r| r[1]["genesis"] == "include")
        .unwrap();
    assert_eq!(include[1]["by_url"], "//b.test/q.js");
}

#[test]
fn database_sink_collects_relations_in_one_pass() {
    let set = formats(&[Format::Features, Format::Scripts, Format::Blobs]);
    let mut aggs = make_aggregators(&set, &resources()).unwrap();
    assert_eq!(aggs.len(), 1, "feature formats share one aggregator");
    let mut log = LogInfo::new("vv8-pipeline.0.log", None);
    {
        let mut views: Vec<&mut dyn Aggregator> = Vec::with_capacity(aggs.len());
        for a in aggs.iter_mut() {
            views.push(a.as_mut());
        }
        log.ingest_stream(FULL_TRACE.as_bytes(), &mut views).unwrap();
    }
    let ctx = AggregationContext {
        formats: set,
        root_domain: Some("http://a.test".to_string()),
    };
    let mut db = MemoryDatabaseSink::default();
    {
        let mut sink = OutputSink::Database(&mut db);
        for agg in &mut aggs {
            dump_aggregator(agg.as_mut(), &ctx, &log, &mut sink).unwrap();
        }
    }
    assert!(db.tables.contains_key("feature_usage"));
    assert!(db.tables.contains_key("script_creation"));
    assert!(db.tables.contains_key("script_blobs"));
    let (columns, rows) = &db.tables["script_creation"];
    assert_eq!(columns[0], "logfile_id");
    assert_eq!(rows.len(), 3);
    let (_, blob_rows) = &db.tables["script_blobs"];
    assert!(blob_rows
        .iter()
        .any(|row| matches!(&row[1], SqlValue::Text(code) if code == "var included = 2;")));
}

#[test]
fn stream_only_aggregators_skip_database_sinks_quietly() {
    let set = formats(&[Format::CallArgs]);
    let mut aggs = make_aggregators(&set, &resources()).unwrap();
    let mut log = LogInfo::new("t.log", None);
    {
        let mut views: Vec<&mut dyn Aggregator> = Vec::with_capacity(aggs.len());
        for a in aggs.iter_mut() {
            views.push(a.as_mut());
        }
        log.ingest_stream(FULL_TRACE.as_bytes(), &mut views).unwrap();
    }
    let ctx = AggregationContext { formats: set, root_domain: None };
    let mut db = MemoryDatabaseSink::default();
    let mut sink = OutputSink::Database(&mut db);
    for agg in &mut aggs {
        dump_aggregator(agg.as_mut(), &ctx, &log, &mut sink).unwrap();
    }
    assert!(db.tables.is_empty());
}

#[test]
fn synthetic_scripts_are_invisible_to_every_pass() {
    let trace = concat!(
        "~I\n",
        "@\"http://a.test\"\n",
        "$0:\"\":automation harness\n",
        "!0\n",
        "g10:{Window}:\"foo\"\n",
        "c22:\"createElement\":{HTMLDocument}:\"DIV\"\n",
        "c30:\"write\":{HTMLDocument}:\"<script src='http://x/y.js'></script>\"\n",
    );
    let records = run_to_stream(
        trace,
        &[
            Format::Features,
            Format::Scripts,
            Format::Causality,
            Format::CreateElement,
            Format::Flow,
        ],
        Some("http://a.test"),
    );
    assert!(records.is_empty(), "got: {records:?}");
}

#[test]
fn multi_isolate_traces_keep_contexts_apart() {
    let trace = concat!(
        "~A\n",
        "@\"http://a.test\"\n",
        "$0:\"http://a.test/one.js\":var one;\n",
        "!0\n",
        "g5:{Window}:\"foo\"\n",
        "~B\n",
        "@\"http://b.test\"\n",
        "$0:\"http://b.test/two.js\":var two;\n",
        "!0\n",
        "g6:{Window}:\"foo\"\n",
        "~A\n",
        "!0\n",
        "g7:{Window}:\"foo\"\n",
    );
    let records = run_to_stream(trace, &[Format::Features], None);
    assert_eq!(records.len(), 3);
    let origins: Vec<&str> = records
        .iter()
        .map(|r| r[1]["security_origin"].as_str().unwrap())
        .collect();
    assert_eq!(
        origins.iter().filter(|o| **o == "http://a.test").count(),
        2
    );
    assert_eq!(
        origins.iter().filter(|o| **o == "http://b.test").count(),
        1
    );
}
