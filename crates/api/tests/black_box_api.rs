use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dirpack_api::app::{self, ApiConfig, AppServices};
use dirpack_core::OwnerId;
use dirpack_infra::config::PipelineConfig;
use reqwest::StatusCode;
use serde_json::{Value, json};

struct TestServer {
    base_url: String,
    files: PathBuf,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let files = dir.path().join("files");
        std::fs::create_dir_all(&files).unwrap();

        let pipeline = PipelineConfig {
            compressed_dirs_root: dir.path().join("compressed"),
            poll_interval: Duration::from_millis(10),
            max_active_per_owner: 4,
            ..PipelineConfig::default()
        };
        let api = ApiConfig {
            files_root: files.clone(),
            ..ApiConfig::default()
        };
        let services = Arc::new(app::build_services(pipeline, api).await.unwrap());

        // Same router as prod, bound to an ephemeral port.
        let router = app::build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            base_url,
            files,
            services,
            handle,
            _dir: dir,
        }
    }

    fn folder(&self, relative: &str, files: &[(&str, usize)]) {
        let root = self.files.join(relative);
        std::fs::create_dir_all(&root).unwrap();
        for (name, size) in files {
            write_file(&root.join(name), *size);
        }
    }

    async fn open_account(&self, client: &reqwest::Client, key: &str, bytes: u64) {
        let res = client
            .put(format!("{}/admin/quota/{}", self.base_url, key))
            .header("x-owner-id", OwnerId::new().to_string())
            .json(&json!({ "bytes_available": bytes }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
        let services = self.services.clone();
        // Worker threads must not outlive the temp dir.
        std::thread::spawn(move || services.shutdown()).join().unwrap();
    }
}

fn write_file(path: &Path, size: usize) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    std::fs::write(path, content).unwrap();
}

async fn submit(client: &reqwest::Client, base_url: &str, owner: OwnerId, body: Value) -> reqwest::Response {
    client
        .post(format!("{}/downloads", base_url))
        .header("x-owner-id", owner.to_string())
        .json(&body)
        .send()
        .await
        .unwrap()
}

async fn get_job(client: &reqwest::Client, base_url: &str, owner: OwnerId, job_id: &str) -> reqwest::Response {
    client
        .get(format!("{}/downloads/{}", base_url, job_id))
        .header("x-owner-id", owner.to_string())
        .send()
        .await
        .unwrap()
}

async fn wait_for_status(
    client: &reqwest::Client,
    base_url: &str,
    owner: OwnerId,
    job_id: &str,
    status: &str,
) -> Value {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        let body: Value = get_job(client, base_url, owner, job_id).await.json().await.unwrap();
        if body["status"] == status {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} did not reach {status} within timeout");
}

#[tokio::test]
async fn owner_header_required_for_protected_endpoints() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(format!("{}/health", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.get(format!("{}/downloads", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .get(format!("{}/downloads", srv.base_url))
        .header("x-owner-id", "someone")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn submitted_folder_completes_with_link_and_debit() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    srv.folder("albums/live", &[("a.flac", 4_000), ("disc2/b.flac", 6_000)]);
    srv.open_account(&client, "acct-1", 1_000_000).await;

    let owner = OwnerId::new();
    let res = submit(
        &client,
        &srv.base_url,
        owner,
        json!({ "path": "albums/live", "quota_account_key": "acct-1" }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let receipt: Value = res.json().await.unwrap();
    let job_id = receipt["job_id"].as_str().unwrap().to_string();
    assert!(receipt["queue_job_id"].as_str().is_some_and(|s| !s.is_empty()));

    let job = wait_for_status(&client, &srv.base_url, owner, &job_id, "completed").await;
    assert_eq!(job["source_path"], "/albums/live");
    assert_eq!(job["source_size_bytes"], 10_000);
    assert!(job["download_url"].as_str().is_some_and(|u| u.contains("/download-dir?name=") && u.contains(&job_id)));

    let quota: Value = client
        .get(format!("{}/quota/acct-1", srv.base_url))
        .header("x-owner-id", owner.to_string())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(quota["bytes_used"], 10_000);
    assert_eq!(quota["bytes_remaining"], 990_000);

    let history: Value = client
        .get(format!("{}/downloads?limit=5", srv.base_url))
        .header("x-owner-id", owner.to_string())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["id"], job_id);
}

#[tokio::test]
async fn rejected_submissions_map_to_client_errors() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    srv.folder("docs", &[("readme.txt", 100)]);
    let owner = OwnerId::new();

    let res = submit(&client, &srv.base_url, owner, json!({ "path": "docs", "quota_account_key": "nobody" })).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unknown_account");

    srv.open_account(&client, "acct-2", 1_000).await;

    let res = submit(&client, &srv.base_url, owner, json!({ "path": "../etc", "quota_account_key": "acct-2" })).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = submit(&client, &srv.base_url, owner, json!({ "path": "missing", "quota_account_key": "acct-2" })).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "source_not_found");

    let res = get_job(&client, &srv.base_url, owner, "not-an-id").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn jobs_are_private_and_only_running_jobs_cancel() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    srv.folder("photos", &[("one.jpg", 2_000)]);
    srv.open_account(&client, "acct-3", 1_000_000).await;

    let owner = OwnerId::new();
    let receipt: Value = submit(
        &client,
        &srv.base_url,
        owner,
        json!({ "path": "photos", "quota_account_key": "acct-3", "size_bytes": 2_000 }),
    )
    .await
    .json()
    .await
    .unwrap();
    let job_id = receipt["job_id"].as_str().unwrap().to_string();
    wait_for_status(&client, &srv.base_url, owner, &job_id, "completed").await;

    let stranger = OwnerId::new();
    let res = get_job(&client, &srv.base_url, stranger, &job_id).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = client
        .post(format!("{}/downloads/{}/cancel", srv.base_url, job_id))
        .header("x-owner-id", owner.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_cancellable");

    let res = client
        .post(format!("{}/downloads/{}/cancel", srv.base_url, OwnerId::new()))
        .header("x-owner-id", owner.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn event_stream_carries_the_owners_topics() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    srv.folder("tapes", &[("side-a.wav", 3_000)]);
    srv.open_account(&client, "acct-4", 1_000_000).await;
    let owner = OwnerId::new();

    let mut stream = client
        .get(format!("{}/events", srv.base_url))
        .header("x-owner-id", owner.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(stream.status(), StatusCode::OK);

    let res = submit(&client, &srv.base_url, owner, json!({ "path": "tapes", "quota_account_key": "acct-4" })).await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let completed = format!("compression:completed:{owner}");
    let mut seen = String::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !seen.contains(&completed) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(!remaining.is_zero(), "no completion event, got: {seen}");
        match tokio::time::timeout(remaining, stream.chunk()).await {
            Ok(Ok(Some(chunk))) => seen.push_str(&String::from_utf8_lossy(&chunk)),
            other => panic!("event stream ended early: {other:?}, got: {seen}"),
        }
    }

    assert!(seen.contains(&format!("compression:queued:{owner}")));
    assert!(seen.contains("downloadUrl"));
}

#[tokio::test]
async fn admin_workers_reports_pool_stats() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{}/admin/workers", srv.base_url))
        .header("x-owner-id", OwnerId::new().to_string())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["queue"], "compression");
    assert_eq!(body["queue_depth"], 0);
    assert_eq!(body["pools"]["compression"]["concurrency"], 1);
}
