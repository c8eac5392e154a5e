use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::{json, Value};

use storyforge_api::app::{build_app, services::AppServices};
use storyforge_infra::config::AppConfig;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod over an in-memory store, bound to an ephemeral port.
        let config = AppConfig {
            public_base_url: "https://api.storyforge.test".to_string(),
            ..AppConfig::default()
        };
        let services = Arc::new(AppServices::in_memory(config).expect("services"));
        let app = build_app(services);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn post(client: &reqwest::Client, url: String, body: Value) -> (StatusCode, Value) {
    let res = client.post(url).json(&body).send().await.unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

async fn create_job(client: &reqwest::Client, server: &TestServer, kind: &str, parameters: Value) -> String {
    let (status, body) = post(
        client,
        server.url("/jobs"),
        json!({"kind": kind, "parameters": parameters}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    body["jobId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_is_ok() {
    let server = TestServer::spawn().await;
    let res = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn image_job_end_to_end() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, created) = post(
        &client,
        server.url("/jobs"),
        json!({"kind": "image", "parameters": {"prompt": "a fox reading by candlelight"}}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(created["status"], "pending");
    assert!(created["estimatedCompletion"].is_string());
    let id = created["jobId"].as_str().unwrap().to_string();
    assert_eq!(
        created["pollingUrl"],
        format!("https://api.storyforge.test/jobs/{id}")
    );

    let res = client.get(server.url(&format!("/jobs/{id}"))).send().await.unwrap();
    assert_eq!(
        res.headers()["cache-control"],
        "no-store, no-cache, must-revalidate"
    );

    let (status, _) = post(&client, server.url(&format!("/jobs/{id}/claim")), json!({"workerId": "w1"})).await;
    assert_eq!(status, StatusCode::OK);

    for progress in [0, 30, 40] {
        let (status, body) = post(
            &client,
            server.url(&format!("/jobs/{id}/progress")),
            json!({"workerId": "w1", "progress": progress}),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
    }

    let res = client.get(server.url(&format!("/jobs/{id}"))).send().await.unwrap();
    let polled: Value = res.json().await.unwrap();
    assert_eq!(polled["status"], "processing");
    assert_eq!(polled["progress"], 40);
    assert_eq!(polled["currentPhase"], "Generating illustrations");
    assert!(polled["estimatedTimeRemaining"].as_u64().unwrap() >= 1);

    let (status, _) = post(
        &client,
        server.url(&format!("/jobs/{id}/progress")),
        json!({"workerId": "w1", "progress": 70}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, done) = post(
        &client,
        server.url(&format!("/jobs/{id}/complete")),
        json!({"workerId": "w1", "resultRef": "storybook/42"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done["progress"], 100);

    let res = client.get(server.url(&format!("/jobs/{id}"))).send().await.unwrap();
    assert_eq!(res.headers()["cache-control"], "public, max-age=3600");
    let finished: Value = res.json().await.unwrap();
    assert_eq!(finished["status"], "completed");
    assert_eq!(finished["result"]["resultRef"], "storybook/42");
    assert!(finished.get("estimatedTimeRemaining").is_none());
}

#[tokio::test]
async fn errors_use_the_json_error_body() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, body) = post(
        &client,
        server.url("/jobs"),
        json!({"kind": "image", "parameters": {"prompt": ""}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
    assert!(body["message"].as_str().unwrap().contains("prompt"));

    let (status, body) = post(&client, server.url("/jobs"), json!({"kind": "podcast"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let res = client
        .get(server.url("/jobs/0190c6a8-7d7e-7000-8000-000000000000"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client.get(server.url("/jobs/not-a-uuid")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let id = create_job(&client, &server, "scene", json!({"prompt": "harbor at dawn"})).await;
    let (status, body) = post(
        &client,
        server.url(&format!("/jobs/{id}/complete")),
        json!({"workerId": "w1", "resultRef": "too-early"}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");
}

#[tokio::test]
async fn malformed_bodies_get_the_json_error_body() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = create_job(&client, &server, "image", json!({"prompt": "a kite"})).await;
    post(&client, server.url(&format!("/jobs/{id}/claim")), json!({"workerId": "w1"})).await;

    let (status, body) = post(
        &client,
        server.url(&format!("/jobs/{id}/progress")),
        json!({"workerId": "w1", "progress": "half"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
    assert!(body["message"].is_string());

    let (status, body) = post(
        &client,
        server.url(&format!("/jobs/{id}/complete")),
        json!({"resultRef": "storybook/1"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let res = client
        .post(server.url("/jobs"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn late_result_from_a_replaced_worker_is_rejected() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = create_job(&client, &server, "story", json!({"prompt": "a lost mitten"})).await;

    post(&client, server.url(&format!("/jobs/{id}/claim")), json!({"workerId": "w1"})).await;
    let (_, body) = post(
        &client,
        server.url(&format!("/jobs/{id}/fail")),
        json!({"workerId": "w1", "error": "provider timeout"}),
    )
    .await;
    assert_eq!(body["decision"], "retry");
    let (status, _) = post(&client, server.url(&format!("/jobs/{id}/claim")), json!({"workerId": "w2"})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post(
        &client,
        server.url(&format!("/jobs/{id}/complete")),
        json!({"workerId": "w1", "resultRef": "storybook/stale"}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");

    let (status, _) = post(
        &client,
        server.url(&format!("/jobs/{id}/progress")),
        json!({"workerId": "w1", "progress": 90}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let current: Value = client
        .get(server.url(&format!("/jobs/{id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(current["status"], "processing");
    assert_eq!(current["progress"], 0);
    assert!(current.get("result").is_none());

    let (status, done) = post(
        &client,
        server.url(&format!("/jobs/{id}/complete")),
        json!({"workerId": "w2", "resultRef": "storybook/fresh"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done["result"]["resultRef"], "storybook/fresh");
}

#[tokio::test]
async fn second_claim_conflicts_and_foreign_progress_is_rejected() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = create_job(&client, &server, "story", json!({"prompt": "two friends and a kite"})).await;

    let (status, _) = post(&client, server.url(&format!("/jobs/{id}/claim")), json!({"workerId": "w1"})).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = post(&client, server.url(&format!("/jobs/{id}/claim")), json!({"workerId": "w2"})).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = post(
        &client,
        server.url(&format!("/jobs/{id}/progress")),
        json!({"workerId": "w2", "progress": 10}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = post(
        &client,
        server.url(&format!("/jobs/{id}/progress")),
        json!({"workerId": "w1", "progress": 100}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn processing_lock_follows_jobs_in_flight() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, lock) = post(
        &client,
        server.url("/processing-lock"),
        json!({"instanceId": "scheduler-1", "action": "acquire"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(lock["locked"], false);

    let id = create_job(&client, &server, "cartoonize", json!({"imageUrl": "https://img.test/cat.png"})).await;
    post(&client, server.url(&format!("/jobs/{id}/claim")), json!({"workerId": "w7"})).await;

    let (_, lock) = post(
        &client,
        server.url("/processing-lock"),
        json!({"instanceId": "scheduler-1", "action": "acquire"}),
    )
    .await;
    assert_eq!(lock["locked"], true);
    assert_eq!(lock["owner"], "w7");

    post(&client, server.url(&format!("/jobs/{id}/cancel")), json!({})).await;
    let (_, lock) = post(
        &client,
        server.url("/processing-lock"),
        json!({"instanceId": "scheduler-1", "action": "release"}),
    )
    .await;
    assert_eq!(lock["locked"], false);

    let (status, body) = post(
        &client,
        server.url("/processing-lock"),
        json!({"instanceId": "", "action": "acquire"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn failures_are_retried_until_exhausted() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = create_job(&client, &server, "auto-story", json!({"genre": "mystery"})).await;

    for _ in 0..2 {
        post(&client, server.url(&format!("/jobs/{id}/claim")), json!({"workerId": "w"})).await;
        let (status, body) = post(
            &client,
            server.url(&format!("/jobs/{id}/fail")),
            json!({"workerId": "w", "error": "model timeout"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["decision"], "retry");
        assert_eq!(body["job"]["status"], "pending");
        assert_eq!(body["job"]["progress"], 0);
    }

    post(&client, server.url(&format!("/jobs/{id}/claim")), json!({"workerId": "w"})).await;
    let (_, body) = post(
        &client,
        server.url(&format!("/jobs/{id}/fail")),
        json!({"workerId": "w", "error": "model timeout"}),
    )
    .await;
    assert_eq!(body["decision"], "exhaust");
    assert_eq!(body["job"]["status"], "failed");
    assert_eq!(body["job"]["failure"]["retriesExhausted"], true);
    assert_eq!(body["job"]["failure"]["retryCount"], 2);

    let res = client.get(server.url("/jobs/stats")).send().await.unwrap();
    let stats: Value = res.json().await.unwrap();
    assert_eq!(stats["failed"], 1);
    assert_eq!(stats["total"], 1);
}

#[tokio::test]
async fn permanent_failure_skips_the_retry_coordinator() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let id = create_job(&client, &server, "image", json!({"prompt": "a map"})).await;

    post(&client, server.url(&format!("/jobs/{id}/claim")), json!({"workerId": "w"})).await;
    let (status, body) = post(
        &client,
        server.url(&format!("/jobs/{id}/fail")),
        json!({"workerId": "w", "error": "content policy", "retryable": false}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("decision").is_none());
    assert_eq!(body["job"]["status"], "failed");

    let (status, body) = post(&client, server.url(&format!("/jobs/{id}/retry")), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"], "retry");
    assert_eq!(body["job"]["status"], "pending");
}
