//! End-to-end integration tests for webterm.
//!
//! These tests verify complete flows work correctly:
//! - Session creation, listing, resizing and deletion over HTTP
//! - Input delivery and output streaming against real shells
//! - Multiple readers of one session
//! - Daemon startup and shutdown

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures_util::{Stream, StreamExt};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tower::ServiceExt;
use webterm_daemon::config::Config;
use webterm_daemon::orchestrator::{DaemonOrchestrator, OrchestratorState};
use webterm_daemon::protocol::{CreateSessionResponse, ErrorBody, SessionId, SessionSummary};

/// Create a test configuration that spawns `/bin/sh` in the temp directory.
fn create_test_config() -> Config {
    let mut config = Config::default();
    config.server.port = 0;
    config.session.default_shell = "/bin/sh".to_string();
    config.session.default_cwd = std::env::temp_dir();
    config.session.exit_grace_ms = 100;
    config
}

// =============================================================================
// Router helpers
// =============================================================================

struct TestApp {
    orchestrator: DaemonOrchestrator,
    router: Router,
}

impl TestApp {
    fn new(config: Config) -> Self {
        let orchestrator = DaemonOrchestrator::new(config).unwrap();
        let router = orchestrator.router();
        Self {
            orchestrator,
            router,
        }
    }

    async fn request(&self, method: &str, uri: &str, body: impl Into<Body>) -> (StatusCode, Vec<u8>) {
        let response = self
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(body.into())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    async fn create(&self) -> SessionId {
        let (status, body) = self.request("POST", "/terminals", Body::empty()).await;
        assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
        serde_json::from_slice::<CreateSessionResponse>(&body)
            .unwrap()
            .id
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.orchestrator.registry().shutdown();
    }
}

fn error_kind(body: &[u8]) -> String {
    serde_json::from_slice::<ErrorBody>(body).unwrap().error.kind
}

// =============================================================================
// Server helpers
// =============================================================================

struct TestServer {
    base: String,
    orchestrator: Arc<DaemonOrchestrator>,
    task: JoinHandle<anyhow::Result<()>>,
    client: reqwest::Client,
}

impl TestServer {
    async fn start(config: Config) -> Self {
        let orchestrator = Arc::new(DaemonOrchestrator::new(config).unwrap());
        let listener = orchestrator.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let task = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.run(listener).await })
        };

        timeout(Duration::from_secs(5), async {
            while orchestrator.state().await != OrchestratorState::Running {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server did not start");

        Self {
            base: format!("http://{}", addr),
            orchestrator,
            task,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn create(&self) -> SessionId {
        let response = self.client.post(self.url("/terminals")).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.json::<CreateSessionResponse>().await.unwrap().id
    }

    async fn send(&self, id: &SessionId, input: &'static str) -> reqwest::StatusCode {
        self.client
            .post(self.url(&format!("/terminals/{}/data", id)))
            .body(input)
            .send()
            .await
            .unwrap()
            .status()
    }

    async fn consumers(&self, id: &SessionId) -> usize {
        self.client
            .get(self.url(&format!("/terminals/{}", id)))
            .send()
            .await
            .unwrap()
            .json::<SessionSummary>()
            .await
            .unwrap()
            .consumers
    }

    /// Polls the session snapshot until it reports `expected` consumers.
    async fn wait_for_consumers(&self, id: &SessionId, expected: usize) -> usize {
        let mut count = self.consumers(id).await;
        let _ = timeout(Duration::from_secs(5), async {
            while count != expected {
                tokio::time::sleep(Duration::from_millis(20)).await;
                count = self.consumers(id).await;
            }
        })
        .await;
        count
    }

    async fn open_stream(
        &self,
        id: &SessionId,
    ) -> impl Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin {
        let response = self
            .client
            .get(self.url(&format!("/terminals/{}/data", id)))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "application/octet-stream"
        );
        Box::pin(response.bytes_stream())
    }

    async fn shutdown(self) {
        self.orchestrator.stop().await.unwrap();
        timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

/// Reads from `stream` until `done` accepts the accumulated output.
async fn read_until<S>(stream: &mut S, done: impl Fn(&str) -> bool) -> String
where
    S: Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
{
    let mut output = String::new();
    let _ = timeout(Duration::from_secs(5), async {
        while !done(&output) {
            match stream.next().await {
                Some(Ok(chunk)) => output.push_str(&String::from_utf8_lossy(&chunk)),
                _ => break,
            }
        }
    })
    .await;
    output
}

/// Returns whether `line` is command output, not the echoed command.
///
/// The shell prompt may precede output on the same line when input arrives
/// before the prompt is printed.
fn is_output_line(line: &str, word: &str) -> bool {
    let line = line.trim_end_matches('\r');
    line.ends_with(word) && !line.contains("echo")
}

fn has_line(output: &str, word: &str) -> bool {
    output.lines().any(|l| is_output_line(l, word))
}

/// Drains `stream`, returning whether it ended within the timeout.
async fn stream_ends<S>(stream: &mut S) -> bool
where
    S: Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
{
    timeout(Duration::from_secs(5), async {
        while let Some(Ok(_)) = stream.next().await {}
    })
    .await
    .is_ok()
}

// =============================================================================
// Control endpoint tests
// =============================================================================

#[tokio::test]
async fn test_health() {
    let app = TestApp::new(create_test_config());

    let (status, body) = app.request("GET", "/health", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["sessions"], 0);
}

#[tokio::test]
async fn test_create_with_empty_body() {
    let app = TestApp::new(create_test_config());
    let id = app.create().await;

    let (status, body) = app
        .request("GET", &format!("/terminals/{}", id), Body::empty())
        .await;
    assert_eq!(status, StatusCode::OK);

    let summary: SessionSummary = serde_json::from_slice(&body).unwrap();
    assert_eq!(summary.id, id);
    assert_eq!((summary.cols, summary.rows), (80, 30));
    assert_eq!(summary.shell, "/bin/sh");
}

#[tokio::test]
async fn test_create_with_options() {
    let app = TestApp::new(create_test_config());
    let cwd = TempDir::new().unwrap();
    let request = serde_json::json!({
        "cols": 120,
        "rows": 40,
        "cwd": cwd.path(),
    });

    let (status, body) = app
        .request("POST", "/terminals", request.to_string())
        .await;
    assert_eq!(status, StatusCode::OK);
    let id = serde_json::from_slice::<CreateSessionResponse>(&body)
        .unwrap()
        .id;

    let (_, body) = app
        .request("GET", &format!("/terminals/{}", id), Body::empty())
        .await;
    let summary: SessionSummary = serde_json::from_slice(&body).unwrap();
    assert_eq!((summary.cols, summary.rows), (120, 40));
    assert_eq!(summary.cwd, cwd.path().display().to_string());
}

#[tokio::test]
async fn test_create_rejects_bad_json() {
    let app = TestApp::new(create_test_config());

    let (status, body) = app.request("POST", "/terminals", "{cols: 80").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_kind(&body), "bad_request");

    let (status, _) = app.request("POST", "/terminals", r#"{"cols": 0}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.orchestrator.registry().count(), 0);
}

#[tokio::test]
async fn test_create_invalid_cwd_registers_nothing() {
    let app = TestApp::new(create_test_config());

    let (status, body) = app
        .request("POST", "/terminals", r#"{"cwd": "/nonexistent/webterm/dir"}"#)
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error_kind(&body), "spawn_failed");

    assert_eq!(app.orchestrator.registry().count(), 0);
    let (_, body) = app.request("GET", "/terminals", Body::empty()).await;
    let sessions: Vec<SessionSummary> = serde_json::from_slice(&body).unwrap();
    assert!(sessions.is_empty());
}

#[tokio::test]
async fn test_create_limit_reached() {
    let mut config = create_test_config();
    config.session.max_sessions = 1;
    let app = TestApp::new(config);

    app.create().await;
    let (status, body) = app.request("POST", "/terminals", Body::empty()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_kind(&body), "session_limit_reached");
}

#[tokio::test]
async fn test_concurrent_creates_unique_ids() {
    let app = Arc::new(TestApp::new(create_test_config()));

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let app = Arc::clone(&app);
            tokio::spawn(async move { app.create().await })
        })
        .collect();

    let mut ids = std::collections::HashSet::new();
    for task in tasks {
        assert!(ids.insert(task.await.unwrap()), "duplicate session id");
    }

    let (_, body) = app.request("GET", "/terminals", Body::empty()).await;
    let sessions: Vec<SessionSummary> = serde_json::from_slice(&body).unwrap();
    assert_eq!(sessions.len(), 10);
}

#[tokio::test]
async fn test_send_to_unknown_session() {
    let app = TestApp::new(create_test_config());
    let existing = app.create().await;

    let (status, body) = app.request("POST", "/terminals/zzz/data", "ls\n").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_kind(&body), "session_not_found");

    // No side effect on existing sessions.
    assert_eq!(app.orchestrator.registry().count(), 1);
    assert!(app
        .orchestrator
        .registry()
        .exists(&existing));
}

#[tokio::test]
async fn test_malformed_id_is_bad_request() {
    let app = TestApp::new(create_test_config());

    for (method, uri) in [
        ("POST", "/terminals/bad!id/data"),
        ("GET", "/terminals/bad!id/data"),
        ("GET", "/terminals/bad!id"),
        ("DELETE", "/terminals/bad!id"),
    ] {
        let (status, body) = app.request(method, uri, "x").await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{} {}", method, uri);
        assert_eq!(error_kind(&body), "invalid_session_id");
    }
}

#[tokio::test]
async fn test_send_rejects_empty_payload() {
    let app = TestApp::new(create_test_config());
    let id = app.create().await;

    let (status, body) = app
        .request("POST", &format!("/terminals/{}/data", id), Body::empty())
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_kind(&body), "invalid_payload");
}

#[tokio::test]
async fn test_send_rejects_oversized_payload() {
    let mut config = create_test_config();
    config.stream.max_input_bytes = 8;
    let app = TestApp::new(config);
    let id = app.create().await;

    let uri = format!("/terminals/{}/data", id);
    let (status, _) = app.request("POST", &uri, "12345678").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.request("POST", &uri, "123456789").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_kind(&body), "invalid_payload");
}

#[tokio::test]
async fn test_resize() {
    let app = TestApp::new(create_test_config());
    let id = app.create().await;
    let uri = format!("/terminals/{}/size", id);

    let (status, _) = app
        .request("POST", &uri, r#"{"cols": 132, "rows": 50}"#)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = app
        .request("GET", &format!("/terminals/{}", id), Body::empty())
        .await;
    let summary: SessionSummary = serde_json::from_slice(&body).unwrap();
    assert_eq!((summary.cols, summary.rows), (132, 50));

    let (status, _) = app.request("POST", &uri, r#"{"cols": 0, "rows": 50}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.request("POST", &uri, r#"{"cols": 10}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .request("POST", "/terminals/zzz/size", r#"{"cols": 10, "rows": 10}"#)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_is_idempotent_and_final() {
    let app = TestApp::new(create_test_config());
    let id = app.create().await;
    let uri = format!("/terminals/{}", id);

    let (status, _) = app.request("DELETE", &uri, Body::empty()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app.request("DELETE", &uri, Body::empty()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // The session never comes back.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let (status, _) = app.request("GET", &uri, Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = app
        .request("POST", &format!("{}/data", uri), "echo hi\n")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_static_assets() {
    let assets = TempDir::new().unwrap();
    std::fs::write(assets.path().join("index.html"), "<h1>webterm</h1>").unwrap();

    let mut config = create_test_config();
    config.server.static_dir = Some(assets.path().to_path_buf());
    let app = TestApp::new(config);

    let (status, body) = app.request("GET", "/index.html", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"<h1>webterm</h1>");

    // API routes still win over the fallback.
    let (status, _) = app.request("GET", "/health", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app.request("GET", "/missing.js", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// =============================================================================
// Streaming tests
// =============================================================================

#[tokio::test]
async fn test_echo_round_trip() {
    let server = TestServer::start(create_test_config()).await;
    let id = server.create().await;

    let mut stream = server.open_stream(&id).await;
    assert_eq!(server.send(&id, "echo hi\n").await, reqwest::StatusCode::OK);

    let output = read_until(&mut stream, |out| has_line(out, "hi")).await;
    assert!(has_line(&output, "hi"), "unexpected output: {:?}", output);

    server.shutdown().await;
}

#[tokio::test]
async fn test_input_order_preserved() {
    let server = TestServer::start(create_test_config()).await;
    let id = server.create().await;
    let mut stream = server.open_stream(&id).await;

    for input in ["echo first\n", "echo second\n", "echo third\n"] {
        assert_eq!(server.send(&id, input).await, reqwest::StatusCode::OK);
    }

    let output = read_until(&mut stream, |out| has_line(out, "third")).await;
    let lines: Vec<&str> = output.lines().collect();
    let pos = |word: &str| lines.iter().position(|l| is_output_line(l, word));
    assert!(pos("first") < pos("second"), "output: {:?}", output);
    assert!(pos("second") < pos("third"), "output: {:?}", output);

    server.shutdown().await;
}

#[tokio::test]
async fn test_two_readers_one_disconnects() {
    let server = TestServer::start(create_test_config()).await;
    let id = server.create().await;

    let mut stays = server.open_stream(&id).await;
    let leaves = server.open_stream(&id).await;
    assert_eq!(server.consumers(&id).await, 2);

    server.send(&id, "echo before\n").await;
    let output = read_until(&mut stays, |out| has_line(out, "before")).await;
    assert!(has_line(&output, "before"));

    drop(leaves);
    assert_eq!(server.wait_for_consumers(&id, 1).await, 1);

    assert_eq!(server.send(&id, "echo after\n").await, reqwest::StatusCode::OK);
    let output = read_until(&mut stays, |out| has_line(out, "after")).await;
    assert!(has_line(&output, "after"), "unexpected output: {:?}", output);

    server.shutdown().await;
}

#[tokio::test]
async fn test_all_readers_receive_output() {
    let server = TestServer::start(create_test_config()).await;
    let id = server.create().await;

    let mut first = server.open_stream(&id).await;
    let mut second = server.open_stream(&id).await;

    server.send(&id, "echo shared\n").await;

    for stream in [&mut first, &mut second] {
        let output = read_until(stream, |out| has_line(out, "shared")).await;
        assert!(has_line(&output, "shared"), "unexpected output: {:?}", output);
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_stream_ends_when_shell_exits() {
    let server = TestServer::start(create_test_config()).await;
    let id = server.create().await;
    let mut stream = server.open_stream(&id).await;

    server.send(&id, "exit\n").await;
    assert!(stream_ends(&mut stream).await, "stream stayed open after exit");

    server.shutdown().await;
}

#[tokio::test]
async fn test_attach_after_exit_is_not_found() {
    let server = TestServer::start(create_test_config()).await;
    let id = server.create().await;
    let info_url = server.url(&format!("/terminals/{}", id));

    server.send(&id, "exit\n").await;

    let gone = timeout(Duration::from_secs(5), async {
        loop {
            let status = server.client.get(&info_url).send().await.unwrap().status();
            if status == reqwest::StatusCode::NOT_FOUND {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "exited session was never removed");

    let response = server
        .client
        .get(server.url(&format!("/terminals/{}/data", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    assert_eq!(server.send(&id, "echo hi\n").await, reqwest::StatusCode::NOT_FOUND);

    server.shutdown().await;
}

#[tokio::test]
async fn test_delete_ends_open_stream() {
    let server = TestServer::start(create_test_config()).await;
    let id = server.create().await;
    let mut stream = server.open_stream(&id).await;

    let status = server
        .client
        .delete(server.url(&format!("/terminals/{}", id)))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::NO_CONTENT);
    assert!(stream_ends(&mut stream).await);

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_ends_streams_and_sessions() {
    let server = TestServer::start(create_test_config()).await;
    let id = server.create().await;
    let mut stream = server.open_stream(&id).await;
    let orchestrator = Arc::clone(&server.orchestrator);

    server.shutdown().await;

    assert!(stream_ends(&mut stream).await);
    assert_eq!(orchestrator.registry().count(), 0);
    assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
}
