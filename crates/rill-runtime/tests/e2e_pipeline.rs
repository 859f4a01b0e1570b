//! End-to-end pipeline tests over finite inline and JSONL sources.
//!
//! Each test builds a processor from inline TOML, runs it to end of stream
//! and inspects the outputs through the sink catalog or the files written.

use serde_json::{Value, json};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use rill_config::ProcessorConfig;
use rill_runtime::tracing_init::DomainFormat;
use rill_runtime::{Processor, ProcessorState, SinkCatalog};

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .event_format(DomainFormat::new())
                .with_test_writer()
                .with_filter(EnvFilter::try_new("debug").unwrap()),
        )
        .try_init();
}

async fn run_to_end(toml: &str, catalog: &SinkCatalog) -> Processor {
    init_tracing();
    let config: ProcessorConfig = toml.parse().expect("config");
    let mut p = Processor::create_with_catalog(config.name.clone(), config, catalog.clone());
    p.start().await.expect("start");
    p.wait().await.expect("wait");
    assert_eq!(p.state(), ProcessorState::Stopped);
    p
}

fn field(doc: &Value, name: &str) -> Value {
    doc.get(name).cloned().unwrap_or(Value::Null)
}

const COLORS: &str = r#"
[processor]
name = "colors"

[runtime]
workers = 3

[[stages]]
stage = "source"
connector = "inline"
time_field = "ts"
documents = [
    { ts = 1000, color = "red", x = 1 },
    { ts = 1500, color = "red", x = 2 },
    { ts = 2000, color = "blue", x = 4 },
]

[[stages]]
stage = "tumbling_window"
size = "3s"
[stages.group]
_id = "$color"
[stages.group.fields]
n = { sum = "$x" }

[[stages]]
stage = "merge"
into = { connector = "memory", name = "good" }
when_matched = "replace"
"#;

#[tokio::test]
async fn sums_per_color_in_one_window() {
    let catalog = SinkCatalog::new();
    let p = run_to_end(COLORS, &catalog).await;

    let good = catalog.collection("good");
    assert_eq!(good.len(), 2);

    let red = good.find_by_id(&json!("red"));
    assert_eq!(red.len(), 1);
    assert_eq!(field(&red[0], "n"), json!(3));
    assert_eq!(
        field(&red[0], "_window"),
        json!({"start": "1970-01-01T00:00:00.000Z", "end": "1970-01-01T00:00:03.000Z"})
    );
    assert_eq!(field(&good.find_by_id(&json!("blue"))[0], "n"), json!(4));

    let stats = p.stats();
    assert_eq!(stats.ingested, 3);
    assert_eq!(stats.folded, 3);
    assert_eq!(stats.records_emitted, 2);
}

#[tokio::test]
async fn replace_is_idempotent_across_runs() {
    let catalog = SinkCatalog::new();
    run_to_end(COLORS, &catalog).await;
    let first = catalog.collection("good").documents();

    run_to_end(COLORS, &catalog).await;
    assert_eq!(catalog.collection("good").documents(), first);
}

const MIXED: &str = r#"
[processor]
name = "mixed"

[dlq]
connector = "memory"
name = "bad"

[[stages]]
stage = "source"
connector = "inline"
time_field = "ts"
documents = [
    { ts = 100, x = 0 },
    { ts = 100, x = 1 },
    { ts = 100, x = 3.14 },
    { ts = 100, x = 2 },
    { ts = 100, x = "22" },
    { ts = 100, x = 3 },
    { ts = 100, text = "yo" },
    { ts = 100, x = 4 },
]

[[stages]]
stage = "validate"
required = ["x"]
action = "dlq"
[[stages.properties]]
field = "x"
type = "int"
minimum = 1
maximum = 42

[[stages]]
stage = "tumbling_window"
size = "3s"
[stages.group]
_id = "all"
[stages.group.fields]
theSum = { sum = "$x" }
count = { count = {} }

[[stages]]
stage = "merge"
into = { connector = "memory", name = "good" }
"#;

#[tokio::test]
async fn invalid_documents_are_dead_lettered_unmodified() {
    let catalog = SinkCatalog::new();
    let p = run_to_end(MIXED, &catalog).await;

    let good = catalog.collection("good").documents();
    assert_eq!(good.len(), 1);
    assert_eq!(field(&good[0], "theSum"), json!(10));
    assert_eq!(field(&good[0], "count"), json!(4));

    let letters = catalog.dead_letters("bad").letters();
    let docs: Vec<Value> = letters.iter().map(|l| l.doc.clone()).collect();
    assert_eq!(
        docs,
        vec![
            json!({"ts": 100, "x": 0}),
            json!({"ts": 100, "x": 3.14}),
            json!({"ts": 100, "x": "22"}),
            json!({"ts": 100, "text": "yo"}),
        ]
    );
    assert!(letters.iter().all(|l| l.processor == "mixed"));
    assert!(letters[3].reason.contains("'x'"), "{}", letters[3].reason);

    assert_eq!(p.stats().invalid, 4);
    assert_eq!(p.stats().dead_lettered, 4);
}

fn late_toml(policy: &str) -> String {
    late_toml_with(
        policy,
        "{ ts = 0, color = \"red\", x = 1 },\n\
         { ts = 5000, color = \"red\", x = 10 },\n\
         { ts = 100, color = \"red\", x = 100 },",
    )
}

fn late_toml_with(policy: &str, documents: &str) -> String {
    format!(
        r#"
[processor]
name = "late"

[runtime]
workers = 1

[window_defaults]
watermark = "0s"
allowed_lateness = "0s"
late_policy = "{policy}"

[dlq]
connector = "memory"
name = "late"

[[stages]]
stage = "source"
connector = "inline"
time_field = "ts"
documents = [
    {documents}
]

[[stages]]
stage = "tumbling_window"
size = "3s"
[stages.group]
_id = "$color"
[stages.group.fields]
n = {{ sum = "$x" }}

[[stages]]
stage = "merge"
into = {{ connector = "memory", name = "good" }}
"#
    )
}

fn sum_for_window(catalog: &SinkCatalog, start: &str) -> Value {
    catalog
        .collection("good")
        .find_by_id(&json!("red"))
        .into_iter()
        .find(|d| d["_window"]["start"] == json!(start))
        .map(|d| field(&d, "n"))
        .unwrap_or(Value::Null)
}

#[tokio::test]
async fn late_document_goes_to_dead_letter() {
    let catalog = SinkCatalog::new();
    let p = run_to_end(&late_toml("dlq"), &catalog).await;

    assert_eq!(sum_for_window(&catalog, "1970-01-01T00:00:00.000Z"), json!(1));
    assert_eq!(sum_for_window(&catalog, "1970-01-01T00:00:03.000Z"), json!(10));

    let letters = catalog.dead_letters("late").letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, "late document");
    assert_eq!(letters[0].doc["x"], json!(100));
    assert_eq!(p.stats().late_dead_lettered, 1);
}

#[tokio::test]
async fn late_document_revises_closed_window() {
    let catalog = SinkCatalog::new();
    let p = run_to_end(&late_toml("revise"), &catalog).await;

    assert_eq!(sum_for_window(&catalog, "1970-01-01T00:00:00.000Z"), json!(101));
    assert!(catalog.dead_letters("late").is_empty());
    assert_eq!(p.stats().revised, 1);
}

#[tokio::test]
async fn revise_past_retention_keeps_stored_aggregate() {
    let catalog = SinkCatalog::new();
    // Retention defaults to the window size, so window [0, 3s) is gone by
    // the time the watermark reaches 10s.
    let toml = late_toml_with(
        "revise",
        "{ ts = 0, color = \"red\", x = 1 },\n\
         { ts = 1000, color = \"red\", x = 2 },\n\
         { ts = 10000, color = \"red\", x = 10 },\n\
         { ts = 100, color = \"red\", x = 100 },",
    )
    .replace("name = \"good\" }", "name = \"good\" }\nwhen_matched = \"replace\"");
    let p = run_to_end(&toml, &catalog).await;

    assert_eq!(sum_for_window(&catalog, "1970-01-01T00:00:00.000Z"), json!(3));
    assert_eq!(sum_for_window(&catalog, "1970-01-01T00:00:09.000Z"), json!(10));
    let stats = p.stats();
    assert_eq!(stats.late_dropped, 1);
    assert_eq!(stats.revised, 0);
    assert!(catalog.dead_letters("late").is_empty());
}

#[tokio::test]
async fn late_document_is_dropped() {
    let catalog = SinkCatalog::new();
    let p = run_to_end(&late_toml("drop"), &catalog).await;

    assert_eq!(sum_for_window(&catalog, "1970-01-01T00:00:00.000Z"), json!(1));
    assert!(catalog.dead_letters("late").is_empty());
    assert_eq!(p.stats().late_dropped, 1);
}

#[tokio::test]
async fn jsonl_to_file_sinks() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.jsonl");
    std::fs::write(
        &input,
        concat!(
            "{\"ts\": 0, \"color\": \"red\", \"x\": 1}\n",
            "not json\n",
            "\n",
            "{\"ts\": 10, \"color\": \"red\", \"x\": 2}\n",
            "{\"ts\": 20, \"color\": \"blue\", \"x\": \"zz\"}\n",
        ),
    )
    .unwrap();

    let toml = format!(
        r#"
[processor]
name = "files"

[dlq]
connector = "file"
path = "dlq.jsonl"

[[stages]]
stage = "source"
connector = "jsonl"
path = "in.jsonl"
time_field = "ts"

[[stages]]
stage = "tumbling_window"
size = "1m"
[stages.group]
_id = "$color"
[stages.group.fields]
total = {{ sum = "$x" }}

[[stages]]
stage = "merge"
into = {{ connector = "file", path = "out/good.jsonl" }}
"#
    );
    let cfg_path = dir.path().join("processor.toml");
    std::fs::write(&cfg_path, toml).unwrap();

    let config = ProcessorConfig::load(&cfg_path).unwrap();
    let mut p = Processor::create("files", config);
    p.start().await.unwrap();
    p.wait().await.unwrap();

    let good: Vec<Value> = std::fs::read_to_string(dir.path().join("out/good.jsonl"))
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    // The blue document failed to fold, so blue never got a group.
    assert_eq!(good.len(), 1);
    assert_eq!(good[0]["_id"], json!("red"));
    assert_eq!(good[0]["total"], json!(3));

    let dlq: Vec<Value> = std::fs::read_to_string(dir.path().join("dlq.jsonl"))
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let reasons: Vec<&str> = dlq.iter().filter_map(|l| l["reason"].as_str()).collect();
    assert_eq!(reasons, vec!["malformed source record", "aggregation type error"]);
    assert_eq!(dlq[0]["doc"], json!("not json"));
    assert_eq!(dlq[1]["stage"], json!("aggregate"));
}
