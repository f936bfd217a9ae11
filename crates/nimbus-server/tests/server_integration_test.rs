// Integration tests for nimbus-server
//
// These tests start a real request server on an ephemeral port, then drive
// it with raw std TCP clients speaking the line protocol directly, so the
// ack/result ordering is observed exactly as it appears on the wire.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;

use nimbus_common::Result as NimbusResult;
use nimbus_server::{Dispatcher, RecordMap, RequestServer, ResourceProvider, SharedCache};

// ============================================================================
// Test Helpers
// ============================================================================

/// Provider whose START_INSTANCE blocks for a configurable time, to exercise
/// the requirement that slow handlers never stall other requests.
struct SlowStartProvider {
    start_delay: Duration,
}

impl ResourceProvider for SlowStartProvider {
    fn regions(&self) -> Vec<String> {
        vec!["us-east-1".to_string()]
    }

    fn list_instances(&self, _region: &str) -> NimbusResult<(RecordMap, bool)> {
        let mut map = BTreeMap::new();
        map.insert("i-1".to_string(), json!({"id": "i-1", "state": "stopped"}));
        Ok((map, false))
    }

    fn start_instance(&self, instance_id: &str, _region: &str, wait: bool) -> NimbusResult<Value> {
        if wait {
            std::thread::sleep(self.start_delay);
        }
        Ok(json!({"id": instance_id, "state": "running"}))
    }

    fn stop_instance(&self, _instance_id: &str, _region: &str, _wait: bool) -> NimbusResult<()> {
        Ok(())
    }

    fn connect_interface(
        &self,
        _region: &str,
        instance_id: &str,
        eni_id: &str,
        device_index: u32,
    ) -> NimbusResult<Value> {
        Ok(json!({"id": instance_id, "eni": eni_id, "device_index": device_index}))
    }

    fn detach_private_interfaces(
        &self,
        _region: &str,
        instance_id: &str,
    ) -> NimbusResult<(Vec<String>, Value)> {
        Ok((vec![], json!({"id": instance_id})))
    }

    fn list_interfaces(&self, _region: &str) -> NimbusResult<RecordMap> {
        Ok(BTreeMap::new())
    }

    fn list_subnets(&self, _region: &str) -> NimbusResult<RecordMap> {
        Ok(BTreeMap::new())
    }

    fn create_subnet(&self, _region: &str, _az: &str, name: &str) -> NimbusResult<Value> {
        Ok(json!({"id": format!("subnet-{}", name), "name": name}))
    }

    fn create_interface(&self, name: &str, _subnet: &Value) -> NimbusResult<Value> {
        Ok(json!({"id": format!("eni-{}", name)}))
    }

    fn region_long_names(&self) -> NimbusResult<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
}

struct TestServer {
    addr: std::net::SocketAddr,
    _shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

/// Starts a server with the given provider on an ephemeral port.
async fn start_server(start_delay: Duration) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let cache = SharedCache::new(dir.path().join("info"));
    let provider = Arc::new(SlowStartProvider { start_delay });
    let dispatcher = Arc::new(Dispatcher::new(cache, provider));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = RequestServer::bind("127.0.0.1:0", dispatcher, shutdown_rx)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    tokio::spawn(async move {
        let _ = server.run().await;
    });

    TestServer {
        addr,
        _shutdown: shutdown_tx,
        _dir: dir,
    }
}

/// Sends one raw line and collects reply lines until the connection closes.
fn exchange(addr: std::net::SocketAddr, line: &str) -> Vec<String> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(line.as_bytes()).unwrap();
    stream.flush().unwrap();

    let reader = BufReader::new(stream);
    reader.lines().map(|l| l.unwrap()).collect()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_ack_precedes_result() {
    let server = start_server(Duration::from_millis(50)).await;

    let replies = tokio::task::spawn_blocking(move || {
        exchange(server.addr, "7 START_INSTANCE us-east-1 i-123\n")
    })
    .await
    .unwrap();

    assert_eq!(replies[0], "7 ACK");
    assert!(
        replies[1].starts_with("7 RESULT 0 "),
        "unexpected result line: {}",
        replies[1]
    );

    // The payload is the whole updated region.
    let payload: Value = serde_json::from_str(&replies[1]["7 RESULT 0 ".len()..]).unwrap();
    assert_eq!(payload["i-123"]["state"], "running");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_command_reports_failure_and_server_survives() {
    let server = start_server(Duration::ZERO).await;
    let addr = server.addr;

    let replies = tokio::task::spawn_blocking(move || exchange(addr, "3 FOO\n"))
        .await
        .unwrap();
    assert_eq!(replies[0], "3 ACK");
    assert!(replies[1].starts_with("3 RESULT 1 "));
    assert!(replies[1].contains("FOO"));

    // The server keeps serving after the failure.
    let replies = tokio::task::spawn_blocking(move || exchange(addr, "4 QUERY_REGION us-east-1\n"))
        .await
        .unwrap();
    assert!(replies[1].starts_with("4 RESULT 0 "));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_arity_reports_failure_after_ack() {
    let server = start_server(Duration::ZERO).await;
    let addr = server.addr;

    let replies = tokio::task::spawn_blocking(move || exchange(addr, "9 START_INSTANCE\n"))
        .await
        .unwrap();
    assert_eq!(replies[0], "9 ACK");
    assert!(replies[1].starts_with("9 RESULT 1 "));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unparseable_id_closes_without_reply() {
    let server = start_server(Duration::ZERO).await;
    let addr = server.addr;

    let replies = tokio::task::spawn_blocking(move || exchange(addr, "nonsense line\n"))
        .await
        .unwrap();
    assert!(replies.is_empty(), "expected no reply, got {:?}", replies);

    // Fatal only for that connection.
    let replies = tokio::task::spawn_blocking(move || exchange(addr, "1 QUERY_REGION us-east-1\n"))
        .await
        .unwrap();
    assert_eq!(replies[0], "1 ACK");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_slow_request_does_not_stall_fast_one() {
    let server = start_server(Duration::from_millis(500)).await;
    let addr = server.addr;

    let slow = tokio::task::spawn_blocking(move || {
        let started = std::time::Instant::now();
        let replies = exchange(addr, "1 START_INSTANCE us-east-1 i-slow\n");
        (replies, started.elapsed())
    });

    // Give the slow request a head start, then race a fast one past it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let fast = tokio::task::spawn_blocking(move || {
        let started = std::time::Instant::now();
        let replies = exchange(addr, "2 QUERY_REGION us-east-1\n");
        (replies, started.elapsed())
    });

    let (fast_replies, fast_elapsed) = fast.await.unwrap();
    let (slow_replies, _) = slow.await.unwrap();

    assert!(fast_replies[1].starts_with("2 RESULT 0 "));
    assert!(slow_replies[1].starts_with("1 RESULT 0 "));
    assert!(
        fast_elapsed < Duration::from_millis(400),
        "fast request waited on the slow one: {:?}",
        fast_elapsed
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_results_complete_out_of_submission_order() {
    let server = start_server(Duration::from_millis(300)).await;
    let addr = server.addr;

    let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel::<u64>();

    let tx = order_tx.clone();
    let slow = tokio::task::spawn_blocking(move || {
        let replies = exchange(addr, "10 START_INSTANCE us-east-1 i-x\n");
        assert!(replies[1].starts_with("10 RESULT 0"));
        tx.send(10).unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let tx = order_tx.clone();
    let fast = tokio::task::spawn_blocking(move || {
        let replies = exchange(addr, "11 GET_CURRENT_COMPLETE_STATE\n");
        assert!(replies[1].starts_with("11 RESULT 0"));
        tx.send(11).unwrap();
    });

    fast.await.unwrap();
    slow.await.unwrap();

    // Submitted 10 then 11; completed 11 then 10.
    assert_eq!(order_rx.recv().await, Some(11));
    assert_eq!(order_rx.recv().await, Some(10));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_stops_accepting() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SharedCache::new(dir.path().join("info"));
    let provider = Arc::new(SlowStartProvider {
        start_delay: Duration::ZERO,
    });
    let dispatcher = Arc::new(Dispatcher::new(cache, provider));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = RequestServer::bind("127.0.0.1:0", dispatcher, shutdown_rx)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = tokio::spawn(async move { server.run().await });

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    // No listener anymore.
    let refused = TcpStream::connect(addr);
    assert!(refused.is_err());
}
