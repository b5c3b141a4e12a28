//! End-to-end tests: framed requests in, framed responses out, over in-memory
//! duplex streams against a stub HTTP backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use connector_runtime::{
    ErrorClass, ExecutionRequest, ExecutionResponse, FrameError, HttpDownstream, Phase,
    RecordCodec, ResponseWriter, RunSummary, Runtime, RuntimeConfig, RuntimeContext,
    RuntimeError, ShutdownCoordinator, StopReason,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use wiremock::matchers::{body_string, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    requests: FramedWrite<DuplexStream, RecordCodec<ExecutionRequest>>,
    responses: FramedRead<DuplexStream, RecordCodec<ExecutionResponse>>,
    ctx: Arc<RuntimeContext>,
    shutdown: Arc<ShutdownCoordinator>,
    handle: JoinHandle<Result<RunSummary, RuntimeError>>,
}

impl Harness {
    fn start(config: RuntimeConfig) -> Self {
        let (client_in, runtime_in) = tokio::io::duplex(64 * 1024);
        let (runtime_out, client_out) = tokio::io::duplex(64 * 1024);

        let downstream = HttpDownstream::new(config.downstream()).unwrap();
        let runtime = Runtime::new(
            &config,
            Arc::new(downstream),
            ResponseWriter::new(runtime_out),
        );
        let ctx = Arc::clone(runtime.context());
        let shutdown = runtime.shutdown();
        let handle = tokio::spawn(runtime.run(runtime_in));

        Self {
            requests: FramedWrite::new(client_in, RecordCodec::new()),
            responses: FramedRead::new(client_out, RecordCodec::new()),
            ctx,
            shutdown,
            handle,
        }
    }

    async fn send(&mut self, request: ExecutionRequest) {
        self.requests.send(request).await.unwrap();
    }

    async fn next_response(&mut self) -> ExecutionResponse {
        tokio::time::timeout(Duration::from_secs(10), self.responses.next())
            .await
            .expect("timed out waiting for a response")
            .expect("response stream ended")
            .unwrap()
    }

    async fn collect(&mut self, n: usize) -> HashMap<u64, ExecutionResponse> {
        let mut out = HashMap::new();
        for _ in 0..n {
            let response = self.next_response().await;
            out.insert(response.request_id(), response);
        }
        out
    }

    /// Close the inbound stream and wait for the runtime to finish.
    async fn finish(self) -> Result<RunSummary, RuntimeError> {
        drop(self.requests);
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("runtime did not stop")
            .unwrap()
    }
}

fn config(server: &MockServer) -> RuntimeConfig {
    RuntimeConfig::new(format!("{}/generate", server.uri()))
        .with_retry_pause(Duration::from_millis(10))
        .with_drain_log_interval(Duration::from_millis(50))
}

fn request(id: u64, payload: &[u8]) -> ExecutionRequest {
    let now_ms = chrono::Utc::now().timestamp_millis() as u64;
    ExecutionRequest {
        request_id: id,
        tenant_id: "acme".to_string(),
        workspace_id: Some("ws-1".to_string()),
        trace_id: Some(format!("trace-{id}")),
        connector_name: "gemini".to_string(),
        operation: "generate".to_string(),
        deadline_at_ms: now_ms + 30_000,
        payload: payload.to_vec(),
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn ping_pong_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string("ping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "pong"})))
        .expect(1)
        .mount(&server)
        .await;

    let mut harness = Harness::start(config(&server));
    harness.send(request(1, b"ping")).await;

    let response = harness.next_response().await;
    assert_eq!(response.request_id(), 1);
    assert_eq!(response.error_class(), ErrorClass::Success);
    assert_eq!(response.payload(), b"pong");
    assert!(response.is_done());

    let summary = harness.finish().await.unwrap();
    assert_eq!(summary.reason, StopReason::EndOfStream);
    assert_eq!(summary.stats.succeeded, 1);
}

#[tokio::test]
async fn queue_overflow_rejects_without_downstream_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"text": "slow"}))
                .set_delay(Duration::from_millis(500)),
        )
        .expect(2)
        .mount(&server)
        .await;

    let mut harness = Harness::start(config(&server).with_admission(2, 1, 4));
    harness.send(request(1, b"a")).await;
    harness.send(request(2, b"b")).await;
    let ctx = Arc::clone(&harness.ctx);
    wait_until("two queued requests", || ctx.admission.queue_depth() == 2).await;

    harness.send(request(3, b"c")).await;

    // The rejection is immediate, so it arrives ahead of the slow ones.
    let first = harness.next_response().await;
    assert_eq!(first.request_id(), 3);
    assert_eq!(first.error_class(), ErrorClass::RateLimited);
    assert_eq!(first.error_message(), Some("Overloaded"));
    let body: serde_json::Value = serde_json::from_slice(first.payload()).unwrap();
    assert_eq!(body["status"], 503);

    let rest = harness.collect(2).await;
    assert_eq!(rest[&1].error_class(), ErrorClass::Success);
    assert_eq!(rest[&2].error_class(), ErrorClass::Success);

    let summary = harness.finish().await.unwrap();
    assert_eq!(summary.stats.overloaded, 1);
    assert_eq!(summary.stats.queue_depth, 0);
}

#[tokio::test]
async fn drain_completes_in_flight_and_stops_intake() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"text": "done"}))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(3)
        .mount(&server)
        .await;

    let mut harness = Harness::start(config(&server));
    for id in 1..=3 {
        harness.send(request(id, b"work")).await;
    }
    let ctx = Arc::clone(&harness.ctx);
    wait_until("three in-flight requests", || ctx.admission.in_flight() == 3).await;

    let mut phases = harness.shutdown.subscribe();
    assert_eq!(*phases.borrow_and_update(), Phase::Running);
    assert!(harness.shutdown.begin_drain("test"));
    assert_eq!(*phases.borrow_and_update(), Phase::Draining);
    // Sent after draining began; must never be dispatched. The runtime may
    // already have dropped its end of the stream.
    let _ = harness.requests.send(request(4, b"late")).await;

    let responses = harness.collect(3).await;
    for id in 1..=3 {
        assert_eq!(responses[&id].error_class(), ErrorClass::Success);
        assert_eq!(responses[&id].payload(), b"done");
    }

    // The runtime closes the response stream once drained.
    assert!(harness.responses.next().await.is_none());

    let summary = harness.finish().await.unwrap();
    assert_eq!(summary.reason, StopReason::Cancelled);
    assert_eq!(summary.stats.received, 3);
    assert_eq!(summary.stats.succeeded, 3);
    assert_eq!(*phases.borrow_and_update(), Phase::Stopped);
}

#[tokio::test]
async fn open_circuit_fails_fast() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let config = config(&server)
        .with_max_retry(0)
        .with_breaker(2, Duration::from_secs(60));
    let mut harness = Harness::start(config);

    for id in 1..=2 {
        harness.send(request(id, b"x")).await;
        let response = harness.next_response().await;
        assert_eq!(response.error_class(), ErrorClass::Transient);
    }

    harness.send(request(3, b"x")).await;
    let response = harness.next_response().await;
    assert_eq!(response.request_id(), 3);
    assert_eq!(response.error_message(), Some("circuit open"));

    let summary = harness.finish().await.unwrap();
    assert_eq!(summary.stats.circuit_rejected, 1);
    assert_eq!(summary.stats.failed, 2);
    assert_eq!(summary.stats.failures(ErrorClass::Transient), 2);
}

#[tokio::test]
async fn prompt_format_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"content": {"parts": [{"text": "Hello from the model"}]}}]
        })))
        .mount(&server)
        .await;

    let config = config(&server).with_body_format(connector_runtime::BodyFormat::Prompt);
    let mut harness = Harness::start(config);
    harness.send(request(9, br#"{"prompt":"say hello"}"#)).await;

    let response = harness.next_response().await;
    assert_eq!(response.error_class(), ErrorClass::Success);
    assert_eq!(response.payload(), b"Hello from the model");
    harness.finish().await.unwrap();
}

#[tokio::test]
async fn unknown_frame_type_is_fatal() {
    let server = MockServer::start().await;
    let (mut client_in, runtime_in) = tokio::io::duplex(1024);
    let (runtime_out, _client_out) = tokio::io::duplex(1024);

    let config = config(&server);
    let runtime = Runtime::new(
        &config,
        Arc::new(HttpDownstream::new(config.downstream()).unwrap()),
        ResponseWriter::new(runtime_out),
    );
    let handle = tokio::spawn(runtime.run(runtime_in));

    client_in.write_all(&[0, 0, 0, 2, 0x07, b'x']).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        result,
        Err(RuntimeError::Protocol(FrameError::UnknownMessageType(0x07)))
    ));
}
