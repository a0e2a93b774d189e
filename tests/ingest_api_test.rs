#![cfg(unix)]

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use camtrap_backend::config::IngestConfig;
use camtrap_backend::infrastructure::database;
use camtrap_backend::services::classifier::{
    ClassificationOutcome, Classifier, LabelPolicy, SubprocessClassifier,
};
use camtrap_backend::services::interpreter::ResultInterpreter;
use camtrap_backend::services::staging::{StagedFile, StagingStore};
use camtrap_backend::{AppState, create_app};
use http_body_util::BodyExt;
use sea_orm::Database;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const JPEG_HEADER: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00];

fn jpeg(tail: &[u8]) -> Vec<u8> {
    let mut data = JPEG_HEADER.to_vec();
    data.extend_from_slice(tail);
    data
}

struct TestApp {
    app: Router,
    tracker: TaskTracker,
    staging_dir: TempDir,
}

impl TestApp {
    async fn with_script(script: &str) -> Self {
        let classifier = SubprocessClassifier::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "classifier".to_string()],
            ResultInterpreter::new("cat"),
            Duration::from_secs(10),
            LabelPolicy::Last,
        );
        Self::with_classifier(Arc::new(classifier), IngestConfig::default()).await
    }

    async fn with_classifier(classifier: Arc<dyn Classifier>, config: IngestConfig) -> Self {
        let _ = tracing_subscriber::registry()
            .with(EnvFilter::new("camtrap_backend=debug"))
            .with(fmt::layer().with_test_writer())
            .try_init();

        let db = Database::connect("sqlite::memory:").await.unwrap();
        database::run_migrations(&db).await.unwrap();

        let staging_dir = tempfile::tempdir().unwrap();
        let staging = Arc::new(StagingStore::new(staging_dir.path(), "jpg"));
        let tracker = TaskTracker::new();

        let state = AppState::new(db, config, staging, classifier, tracker.clone());

        Self {
            app: create_app(state),
            tracker,
            staging_dir,
        }
    }

    async fn upload(&self, data: Vec<u8>) -> (StatusCode, Value) {
        let response = self
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/upload")
                    .header(header::CONTENT_TYPE, "image/jpeg")
                    .body(Body::from(data))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn get(&self, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        let response = self
            .app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, content_type, body.to_vec())
    }

    async fn summaries(&self) -> Vec<Value> {
        let (status, _, body) = self.get("/images").await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_slice::<Vec<Value>>(&body).unwrap()
    }

    /// Waits for every background pipeline spawned so far
    async fn settle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    fn staged_files(&self) -> usize {
        std::fs::read_dir(self.staging_dir.path()).unwrap().count()
    }
}

#[tokio::test]
async fn test_detected_upload_is_stored() {
    let app = TestApp::with_script("echo cat").await;
    let payload = jpeg(b"whiskers");

    let (status, json) = app.upload(payload.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "staged");
    assert!(json["uploadId"].as_str().is_some());

    app.settle().await;

    let summaries = app.summaries().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["label"], "cat");
    let id = summaries[0]["id"].as_i64().unwrap();

    let (status, content_type, body) = app.get("/latest").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("image/jpeg"));
    assert_eq!(body, payload);

    let (status, content_type, body) = app.get(&format!("/image/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("image/jpeg"));
    assert_eq!(body, payload);

    assert_eq!(app.staged_files(), 0);
}

#[tokio::test]
async fn test_label_is_raw_classifier_output() {
    let app = TestApp::with_script("echo '  dog,cat  '").await;

    let (status, _) = app.upload(jpeg(b"two animals")).await;
    assert_eq!(status, StatusCode::OK);
    app.settle().await;

    let summaries = app.summaries().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["label"], "dog,cat");
}

#[tokio::test]
async fn test_binary_stderr_does_not_lose_detection() {
    let app = TestApp::with_script(r"echo cat; printf '\377\376 warn\n' >&2").await;

    let (status, _) = app.upload(jpeg(b"noisy model")).await;
    assert_eq!(status, StatusCode::OK);
    app.settle().await;

    let summaries = app.summaries().await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["label"], "cat");
    assert_eq!(app.staged_files(), 0);
}

#[tokio::test]
async fn test_not_detected_upload_is_discarded() {
    let app = TestApp::with_script("echo none").await;

    let (status, _) = app.upload(jpeg(b"empty field")).await;
    assert_eq!(status, StatusCode::OK);
    app.settle().await;

    assert!(app.summaries().await.is_empty());
    let (status, _, _) = app.get("/latest").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(app.staged_files(), 0);
}

#[tokio::test]
async fn test_failed_classifier_stores_nothing() {
    let app = TestApp::with_script("exit 1").await;

    let (status, _) = app.upload(jpeg(b"whiskers")).await;
    assert_eq!(status, StatusCode::OK);
    app.settle().await;

    assert!(app.summaries().await.is_empty());
    assert_eq!(app.staged_files(), 0);
}

#[tokio::test]
async fn test_missing_classifier_stores_nothing() {
    let classifier = SubprocessClassifier::new(
        "/nonexistent/detect",
        vec![],
        ResultInterpreter::new("cat"),
        Duration::from_secs(1),
        LabelPolicy::Last,
    );
    let app = TestApp::with_classifier(Arc::new(classifier), IngestConfig::default()).await;

    let (status, _) = app.upload(jpeg(b"whiskers")).await;
    assert_eq!(status, StatusCode::OK);
    app.settle().await;

    assert!(app.summaries().await.is_empty());
    assert_eq!(app.staged_files(), 0);
}

#[tokio::test]
async fn test_latest_not_found_when_empty() {
    let app = TestApp::with_script("echo cat").await;

    let (status, _, _) = app.get("/latest").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = app.get("/image/42").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_latest_returns_newest() {
    let app = TestApp::with_script("echo cat").await;
    let first = jpeg(b"first");
    let second = jpeg(b"second");

    app.upload(first).await;
    app.settle().await;
    app.upload(second.clone()).await;
    app.settle().await;

    let (status, content_type, body) = app.get("/latest").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("image/jpeg"));
    assert_eq!(body, second);
}

#[tokio::test]
async fn test_images_listed_oldest_first_without_payload() {
    let app = TestApp::with_script("echo cat").await;

    for tail in [&b"one"[..], b"two", b"three"] {
        app.upload(jpeg(tail)).await;
        app.settle().await;
    }

    let summaries = app.summaries().await;
    assert_eq!(summaries.len(), 3);

    let ids: Vec<i64> = summaries.iter().map(|s| s["id"].as_i64().unwrap()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);

    let stamps: Vec<&str> = summaries
        .iter()
        .map(|s| s["createdAt"].as_str().unwrap())
        .collect();
    let parsed: Vec<chrono::DateTime<chrono::Utc>> =
        stamps.iter().map(|s| s.parse().unwrap()).collect();
    assert!(parsed.windows(2).all(|w| w[0] <= w[1]));

    for summary in &summaries {
        let keys: Vec<&String> = summary.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 3, "unexpected fields: {:?}", keys);
        assert!(summary.get("data").is_none());
    }
}

#[tokio::test]
async fn test_concurrent_uploads_keep_their_own_bytes() {
    // The label is derived from the staged bytes, so a record whose label
    // doesn't match its own payload means two uploads shared a file.
    let app = TestApp::with_script(r#"sleep 0.3; printf 'cat-%s\n' "$(tail -c 4 "$1")""#).await;
    let a = jpeg(b"AAAA");
    let b = jpeg(b"BBBB");

    let (first, second) = tokio::join!(app.upload(a.clone()), app.upload(b.clone()));
    assert_eq!(first.0, StatusCode::OK);
    assert_eq!(second.0, StatusCode::OK);
    assert_ne!(first.1["uploadId"], second.1["uploadId"]);

    app.settle().await;

    let summaries = app.summaries().await;
    assert_eq!(summaries.len(), 2);

    for summary in summaries {
        let id = summary["id"].as_i64().unwrap();
        let label = summary["label"].as_str().unwrap().to_string();
        let (_, _, body) = app.get(&format!("/image/{}", id)).await;

        match label.as_str() {
            "cat-AAAA" => assert_eq!(body, a),
            "cat-BBBB" => assert_eq!(body, b),
            other => panic!("unexpected label {}", other),
        }
    }

    assert_eq!(app.staged_files(), 0);
}

#[tokio::test]
async fn test_rejected_uploads() {
    let config = IngestConfig {
        max_upload_size: 1024,
        ..IngestConfig::default()
    };
    let classifier = SubprocessClassifier::new(
        "sh",
        vec!["-c".to_string(), "echo cat".to_string()],
        ResultInterpreter::new("cat"),
        Duration::from_secs(10),
        LabelPolicy::Last,
    );
    let app = TestApp::with_classifier(Arc::new(classifier), config).await;

    let (status, _) = app.upload(Vec::new()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.upload(b"definitely not a jpeg".to_vec()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.upload(jpeg(&[0u8; 2048])).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    let response = app
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/upload")
                .header(header::CONTENT_TYPE, "image/png")
                .body(Body::from(jpeg(b"x")))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    app.settle().await;
    assert_eq!(app.staged_files(), 0);
    assert!(app.summaries().await.is_empty());
}

#[tokio::test]
async fn test_staging_failure_is_server_error() {
    let app = TestApp::with_script("echo cat").await;
    // Pull the directory out from under the store
    let staging_path = app.staging_dir.path().to_path_buf();
    std::fs::remove_dir_all(&staging_path).unwrap();

    let (status, json) = app.upload(jpeg(b"whiskers")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json["error"].is_string());

    std::fs::create_dir_all(&staging_path).unwrap();
}

struct PanickingClassifier;

#[async_trait]
impl Classifier for PanickingClassifier {
    async fn classify(&self, _staged: &StagedFile) -> ClassificationOutcome {
        panic!("classifier blew up");
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn test_panicking_pipeline_still_releases_staged_file() {
    let app =
        TestApp::with_classifier(Arc::new(PanickingClassifier), IngestConfig::default()).await;

    let (status, _) = app.upload(jpeg(b"whiskers")).await;
    assert_eq!(status, StatusCode::OK);
    app.settle().await;

    assert_eq!(app.staged_files(), 0);
    assert!(app.summaries().await.is_empty());

    // The server keeps serving after a background panic
    let (status, _, _) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = TestApp::with_script("echo cat").await;

    let response = app
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/images")
                .header("x-request-id", "camera-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()["x-request-id"], "camera-42");

    let response = app
        .app
        .clone()
        .oneshot(Request::builder().uri("/images").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn test_health_reports_components() {
    let app = TestApp::with_script("echo cat").await;

    let (status, _, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["database"], "connected");
    assert_eq!(json["classifier"], "available");
}
