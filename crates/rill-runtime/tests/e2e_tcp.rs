//! End-to-end test over the TCP source: the processor runs until stopped and
//! flushes its open windows on the way out.

use std::time::Duration;

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use rill_config::ProcessorConfig;
use rill_runtime::tracing_init::DomainFormat;
use rill_runtime::{Processor, ProcessorState};

const TCP_TOML: &str = r#"
[processor]
name = "tcp"

[runtime]
workers = 2
watermark_interval = "50ms"

[dlq]
connector = "memory"
name = "bad"

[[stages]]
stage = "source"
connector = "tcp"
listen = "tcp://127.0.0.1:0"
time_field = "ts"

[[stages]]
stage = "tumbling_window"
size = "1h"
[stages.group]
_id = "$host"
[stages.group.fields]
hits = { count = 1 }
peak = { max = "$ms" }

[[stages]]
stage = "merge"
into = { connector = "memory", name = "good" }
"#;

#[tokio::test]
async fn tcp_lines_are_aggregated_and_flushed_on_stop() {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .event_format(DomainFormat::new())
                .with_test_writer()
                .with_filter(EnvFilter::try_new("debug").unwrap()),
        )
        .try_init();

    let config: ProcessorConfig = TCP_TOML.parse().unwrap();
    let mut p = Processor::create("tcp", config);
    p.start().await.unwrap();
    let addr = p.listen_addr().expect("tcp source reports its address");

    let mut a = TcpStream::connect(addr).await.unwrap();
    let mut b = TcpStream::connect(addr).await.unwrap();
    a.write_all(b"{\"ts\": 1000, \"host\": \"a\", \"ms\": 12}\n{\"ts\": 2000, \"host\": \"a\", \"ms\": 40}\n")
        .await
        .unwrap();
    b.write_all(b"{\"ts\": 1500, \"host\": \"b\", \"ms\": 7}\n[1, 2]\n")
        .await
        .unwrap();
    a.flush().await.unwrap();
    b.flush().await.unwrap();

    // Wait until ingest has seen all four records.
    tokio::time::timeout(Duration::from_secs(5), async {
        while p.stats().ingested < 4 || p.watermark() < 2000 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("records ingested");
    assert_eq!(p.watermark(), 2000);

    // Windows are an hour wide: nothing has closed yet.
    assert!(p.catalog().collection("good").is_empty());

    p.stop();
    p.wait().await.unwrap();
    assert_eq!(p.state(), ProcessorState::Stopped);

    let good = p.catalog().collection("good");
    let a_doc = &good.find_by_id(&json!("a"))[0];
    assert_eq!(a_doc["hits"], json!(2));
    assert_eq!(a_doc["peak"], json!(40));
    assert_eq!(good.find_by_id(&json!("b"))[0]["hits"], json!(1));

    let bad = p.catalog().dead_letters("bad").letters();
    assert_eq!(bad.len(), 1);
    assert_eq!(bad[0].doc, json!([1, 2]));

    p.drop().await.unwrap();
}

#[tokio::test]
async fn stop_without_clients_ends_cleanly() {
    let config: ProcessorConfig = TCP_TOML.parse().unwrap();
    let mut p = Processor::create("tcp", config);
    p.start().await.unwrap();
    p.stop();
    p.wait().await.unwrap();
    assert!(p.catalog().collection("good").is_empty());
    assert_eq!(p.stats().ingested, 0);
}
