//! Integration tests: run the xlogd binary against a wiremock Elasticsearch, drive it with a
//! real RESP client, and assert on the bulk requests it sends.

use serde_json::json;
use std::path::PathBuf;
use std::process::{Child, Stdio};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn xlogd_bin() -> String {
    std::env::var("CARGO_BIN_EXE_xlogd").unwrap_or_else(|_| {
        format!(
            "{}/target/debug/xlogd",
            std::env::var("CARGO_MANIFEST_DIR").unwrap()
        )
    })
}

/// Fresh scratch directory per test.
fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("xlogd_it_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn write_config(dir: &std::path::Path, yaml: &str) -> PathBuf {
    let path = dir.join("xlogd.yaml");
    std::fs::write(&path, yaml).expect("write config");
    path
}

fn base_config(port: u16, sink_url: &str, extra: &str) -> String {
    format!(
        r#"
bind: "127.0.0.1:{}"
log_level: error
batch:
  size: 100
  timeout_secs: 1
stats:
  enabled: false
sink:
  urls: ["{}"]
  timeout_secs: 5
  retries:
    max_attempts: 1
    initial_backoff_secs: 0
{}
"#,
        port, sink_url, extra
    )
}

fn spawn_xlogd(config_path: &std::path::Path) -> Child {
    std::process::Command::new(xlogd_bin())
        .args(["run", "--config", config_path.to_str().unwrap()])
        .env("RUST_LOG", "error")
        .env("XLOGD_LOG_LEVEL", "error")
        .current_dir(std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into()))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn xlogd")
}

async fn connect(port: u16) -> redis::aio::MultiplexedConnection {
    let client = redis::Client::open(format!("redis://127.0.0.1:{}/", port)).unwrap();
    for _ in 0..50 {
        if let Ok(con) = client.get_multiplexed_async_connection().await {
            return con;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("xlogd did not start listening on port {}", port);
}

async fn mount_elasticsearch(server: &MockServer, bulk_status: u16) {
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": {"number": "7.10.2"}})))
        .mount(server)
        .await;
    let bulk = if bulk_status == 200 {
        ResponseTemplate::new(200).set_body_json(json!({"errors": false, "items": []}))
    } else {
        ResponseTemplate::new(bulk_status)
    };
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(bulk)
        .mount(server)
        .await;
}

async fn bulk_requests(server: &MockServer) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == "/_bulk")
        .collect()
}

/// Wait until at least one bulk request arrives, up to `timeout`.
async fn wait_for_bulk(server: &MockServer, timeout: Duration) -> Vec<Request> {
    let start = std::time::Instant::now();
    loop {
        let reqs = bulk_requests(server).await;
        if !reqs.is_empty() || start.elapsed() > timeout {
            return reqs;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn sigterm_and_wait(child: &mut Child, timeout: Duration) -> std::process::ExitStatus {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).expect("send SIGTERM");
    let start = std::time::Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(s)) => return s,
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    panic!("xlogd did not exit within {:?}", timeout);
                }
            }
            Err(e) => panic!("try_wait failed: {}", e),
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn filebeat_event(source: &str, message: &str) -> String {
    json!({
        "beat": {"hostname": "web-1"},
        "source": source,
        "message": message,
    })
    .to_string()
}

#[tokio::test]
async fn integration_push_is_bulk_indexed() {
    let server = MockServer::start().await;
    mount_elasticsearch(&server, 200).await;

    let dir = scratch_dir("push");
    let port = free_port();
    let config_path = write_config(&dir, &base_config(port, &server.uri(), ""));
    let mut child = spawn_xlogd(&config_path);

    let mut con = connect(port).await;
    let pong: String = redis::cmd("PING").query_async(&mut con).await.unwrap();
    assert_eq!(pong, "PONG");
    let info: String = redis::cmd("INFO").query_async(&mut con).await.unwrap();
    assert!(info.contains("redis_version:2.4"), "INFO: {}", info);

    let good = filebeat_event(
        "/data/logs/prod/checkout/shop.log",
        "[2020/01/02 03:04:05.006] CRID[xyz] K[pay] order placed",
    );
    let bad = filebeat_event("/data/logs/prod/checkout/shop.log", "no timestamp here");
    let depth: i64 = redis::cmd("RPUSH")
        .arg("logs")
        .arg(&good)
        .arg(&bad)
        .query_async(&mut con)
        .await
        .unwrap();
    assert!(depth >= 0);
    let len: i64 = redis::cmd("LLEN").arg("logs").query_async(&mut con).await.unwrap();
    assert!(len >= 0);

    let reqs = wait_for_bulk(&server, Duration::from_secs(10)).await;
    let status = sigterm_and_wait(&mut child, Duration::from_secs(15));

    assert!(!reqs.is_empty(), "expected a bulk request");
    let body = String::from_utf8_lossy(&reqs[0].body).to_string();
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 2, "one record (action + source), got: {}", body);
    let action: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(action["index"]["_index"], "checkout-2020-01-02");
    let doc: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(doc["hostname"], "web-1");
    assert_eq!(doc["env"], "prod");
    assert_eq!(doc["project"], "shop");
    assert_eq!(doc["crid"], "xyz");
    assert_eq!(doc["keyword"], "pay");
    assert!(doc["message"].as_str().unwrap_or("").contains("order placed"));
    assert!(!doc["message"].as_str().unwrap_or("").contains("CRID["));
    assert_eq!(
        reqs[0].headers.get("content-type").and_then(|v| v.to_str().ok()),
        Some("application/x-ndjson")
    );

    assert_eq!(status.code(), Some(0), "graceful exit: {:?}", status);
}

#[tokio::test]
async fn integration_sigterm_drains_queue_before_exit() {
    let server = MockServer::start().await;
    mount_elasticsearch(&server, 200).await;

    let dir = scratch_dir("drain");
    let port = free_port();
    // long batch timeout: only the shutdown drain can flush these records
    let yaml = format!(
        r#"
bind: "127.0.0.1:{}"
log_level: error
batch:
  size: 1000
  timeout_secs: 600
stats:
  enabled: false
sink:
  urls: ["{}"]
"#,
        port,
        server.uri()
    );
    let config_path = write_config(&dir, &yaml);
    let mut child = spawn_xlogd(&config_path);

    let mut con = connect(port).await;
    for i in 0..5 {
        let ev = filebeat_event(
            "/data/logs/prod/drain/app.log",
            &format!("[2020/01/02 03:04:05.006] line {}", i),
        );
        let _: i64 = redis::cmd("LPUSH")
            .arg("logs")
            .arg(ev)
            .query_async(&mut con)
            .await
            .unwrap();
    }
    drop(con);

    let status = sigterm_and_wait(&mut child, Duration::from_secs(20));
    assert_eq!(status.code(), Some(0), "graceful exit: {:?}", status);

    let reqs = bulk_requests(&server).await;
    let docs: usize = reqs
        .iter()
        .map(|r| String::from_utf8_lossy(&r.body).lines().count() / 2)
        .sum();
    assert_eq!(docs, 5, "all queued records delivered during drain");
}

#[tokio::test]
async fn integration_durable_queue_survives_restart() {
    let failing = MockServer::start().await;
    mount_elasticsearch(&failing, 503).await;

    let dir = scratch_dir("durable");
    let queue_dir = dir.join("queue");
    let durable = format!(
        "queue:\n  backend: durable\n  dir: \"{}\"\nshutdown_timeout_secs: 2\n",
        queue_dir.display()
    );
    let port = free_port();
    let config_path = write_config(&dir, &base_config(port, &failing.uri(), &durable));
    let mut child = spawn_xlogd(&config_path);

    let mut con = connect(port).await;
    let ev = filebeat_event(
        "/data/logs/prod/durable/app.log",
        "[2020/01/02 03:04:05.006] keep me",
    );
    let _: i64 = redis::cmd("RPUSH")
        .arg("logs")
        .arg(ev)
        .query_async(&mut con)
        .await
        .unwrap();
    drop(con);

    // at least one failed delivery attempt before shutdown
    let failed = wait_for_bulk(&failing, Duration::from_secs(10)).await;
    assert!(!failed.is_empty(), "expected a failed bulk attempt");
    let status = sigterm_and_wait(&mut child, Duration::from_secs(20));
    assert_eq!(status.code(), Some(0), "bounded drain still exits 0: {:?}", status);

    let healthy = MockServer::start().await;
    mount_elasticsearch(&healthy, 200).await;
    let port = free_port();
    let config_path = write_config(&dir, &base_config(port, &healthy.uri(), &durable));
    let mut child = spawn_xlogd(&config_path);

    let reqs = wait_for_bulk(&healthy, Duration::from_secs(10)).await;
    let status = sigterm_and_wait(&mut child, Duration::from_secs(20));
    assert_eq!(status.code(), Some(0));
    assert!(!reqs.is_empty(), "record from the previous run was redelivered");
    let body = String::from_utf8_lossy(&reqs[0].body).to_string();
    assert!(body.contains("keep me"), "bulk body: {}", body);
}

#[tokio::test]
async fn integration_metrics_and_healthz() {
    let server = MockServer::start().await;
    mount_elasticsearch(&server, 200).await;

    let dir = scratch_dir("metrics");
    let port = free_port();
    let metrics_port = free_port();
    let extra = format!(
        "metrics:\n  enabled: true\n  address: \"127.0.0.1\"\n  port: {}\n",
        metrics_port
    );
    let config_path = write_config(&dir, &base_config(port, &server.uri(), &extra));
    let mut child = spawn_xlogd(&config_path);

    let mut con = connect(port).await;
    let _: String = redis::cmd("PING").query_async(&mut con).await.unwrap();

    let base = format!("http://127.0.0.1:{}", metrics_port);
    let client = reqwest::Client::new();
    let health = client
        .get(format!("{}/healthz", base))
        .send()
        .await
        .expect("get healthz");
    assert!(health.status().is_success());
    let body: serde_json::Value = health.json().await.expect("healthz JSON");
    assert!(!body["version"].as_str().unwrap_or("").is_empty());
    assert!(body["uptime_secs"].as_f64().is_some());
    assert_eq!(body["durable"], false);
    assert!(body["connections"].as_i64().unwrap_or(0) >= 1);

    let text = client
        .get(format!("{}/metrics", base))
        .send()
        .await
        .expect("get metrics")
        .text()
        .await
        .unwrap();
    assert!(text.contains("xlogd_connections"), "metrics: {}", text);
    assert!(text.contains("xlogd_queue_depth"), "metrics: {}", text);

    drop(con);
    let status = sigterm_and_wait(&mut child, Duration::from_secs(15));
    assert_eq!(status.code(), Some(0));
}

#[tokio::test]
async fn integration_unreachable_sink_fails_startup() {
    let dir = scratch_dir("unreachable");
    let port = free_port();
    let dead = format!("http://127.0.0.1:{}", free_port());
    let config_path = write_config(&dir, &base_config(port, &dead, ""));

    let output = std::process::Command::new(xlogd_bin())
        .args(["run", "--config", config_path.to_str().unwrap()])
        .env("RUST_LOG", "error")
        .current_dir(std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into()))
        .output()
        .expect("run xlogd");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("sink unreachable"), "stderr: {}", stderr);
}

#[tokio::test]
async fn integration_validate_rejects_invalid_config() {
    let dir = scratch_dir("validate");
    let bad = write_config(&dir, "sink:\n  urls: []\n");
    let output = std::process::Command::new(xlogd_bin())
        .args(["validate", "--config", bad.to_str().unwrap()])
        .env("RUST_LOG", "error")
        .output()
        .expect("run xlogd");
    assert!(!output.status.success());

    let good = write_config(&dir, "sink:\n  urls: [\"http://127.0.0.1:9200\"]\n");
    let output = std::process::Command::new(xlogd_bin())
        .args(["validate", "--config", good.to_str().unwrap()])
        .env("RUST_LOG", "error")
        .output()
        .expect("run xlogd");
    assert!(output.status.success());
}
