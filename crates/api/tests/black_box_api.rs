//! Black-box API tests: the same router as production, bound to an
//! ephemeral port, driven over HTTP with in-memory wiring and fast ticks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode as AxStatusCode;
use axum::routing::post;
use axum::Router;
use reqwest::StatusCode;
use serde_json::{json, Value};

use conductor_api::{build_router, OrchestratorConfig, Services};
use conductor_core::OutboxStatus;
use conductor_store::{MemoryStore, Store};

struct TestServer {
    base_url: String,
    store: Arc<MemoryStore>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(config: OrchestratorConfig) -> Self {
        // Same router as prod, in-memory store, ephemeral port.
        let store = Arc::new(MemoryStore::new());
        let services = Services::build(store.clone(), config);
        services.spawn_loops();
        let app = build_router(services);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            store,
            handle,
        }
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

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        scheduler_tick: Duration::from_millis(20),
        sweeper_tick: Duration::from_millis(20),
        retry_base: Duration::ZERO,
        retry_cap: Duration::ZERO,
        outbox_retry_base: Duration::ZERO,
        outbox_retry_cap: Duration::ZERO,
        outbox_poll: Duration::from_millis(20),
        ..OrchestratorConfig::default()
    }
}

async fn submit(client: &reqwest::Client, srv: &TestServer, body: Value) -> Value {
    let res = client
        .post(srv.url("/training/jobs"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

async fn get_job(client: &reqwest::Client, srv: &TestServer, id: &str) -> Value {
    let res = client
        .get(srv.url(&format!("/training/jobs/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    res.json().await.unwrap()
}

/// Claim for `worker` from `queue`: Some(job) on 200, None on 204.
async fn claim(
    client: &reqwest::Client,
    srv: &TestServer,
    worker: &str,
    queue: &str,
) -> Option<Value> {
    let res = client
        .post(srv.url(&format!("/workers/{worker}/claim")))
        .json(&json!({"queue": queue}))
        .send()
        .await
        .unwrap();
    match res.status() {
        StatusCode::OK => Some(res.json().await.unwrap()),
        StatusCode::NO_CONTENT => None,
        other => panic!("unexpected claim status {other}"),
    }
}

async fn complete(client: &reqwest::Client, srv: &TestServer, id: &str, worker: &str) {
    let res = client
        .post(srv.url(&format!("/training/jobs/{id}/complete")))
        .json(&json!({"worker_id": worker}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

/// Poll until the job reaches `status`, panicking after the deadline.
async fn wait_for_status(client: &reqwest::Client, srv: &TestServer, id: &str, status: &str) {
    for _ in 0..200 {
        let job = get_job(client, srv, id).await;
        if job["status"] == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never reached status {status}");
}

#[tokio::test]
async fn submit_claim_progress_complete_end_to_end() {
    let srv = TestServer::spawn(fast_config()).await;
    let client = reqwest::Client::new();

    let job = submit(
        &client,
        &srv,
        json!({
            "kind": "train.llm",
            "queue": "training_queue",
            "priority": 0,
            "payload": {"dataset_id": "D1"},
        }),
    )
    .await;
    let id = job["id"].as_str().unwrap().to_string();
    assert_eq!(job["status"], "pending");

    let claimed = claim(&client, &srv, "w1", "training_queue").await.unwrap();
    assert_eq!(claimed["id"], job["id"]);
    assert_eq!(claimed["status"], "running");
    assert_eq!(claimed["attempts"], 1);
    assert_eq!(claimed["lease_owner"], "w1");

    let res = client
        .post(srv.url(&format!("/training/jobs/{id}/progress")))
        .json(&json!({"worker_id": "w1", "data": {"epoch": 1, "loss": 0.42}}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let beat: Value = res.json().await.unwrap();
    assert_eq!(beat["cancel_requested"], false);

    complete(&client, &srv, &id, "w1").await;

    let full = get_job(&client, &srv, &id).await;
    assert_eq!(full["status"], "done");
    let types: Vec<&str> = full["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event"]["type"].as_str().unwrap())
        .collect();
    assert_eq!(types, vec!["submitted", "claimed", "progress", "completed"]);

    // Dataset lock on D1 is released: a new job on D1 claims right away.
    let next = submit(
        &client,
        &srv,
        json!({"kind": "train.llm", "queue": "training_queue", "payload": {"dataset_id": "D1"}}),
    )
    .await;
    let claimed = claim(&client, &srv, "w2", "training_queue").await.unwrap();
    assert_eq!(claimed["id"], next["id"]);
}

#[tokio::test]
async fn same_dataset_jobs_never_run_together() {
    let srv = TestServer::spawn(fast_config()).await;
    let client = reqwest::Client::new();

    let j1 = submit(
        &client,
        &srv,
        json!({"kind": "kb.create", "payload": {"dataset_id": "D1"}}),
    )
    .await;
    let j2 = submit(
        &client,
        &srv,
        json!({"kind": "kb.index", "payload": {"dataset_id": "D1"}}),
    )
    .await;
    let id1 = j1["id"].as_str().unwrap();

    // One claim wins; the dataset blocks the second job even with capacity.
    let claimed = claim(&client, &srv, "w1", "default").await.unwrap();
    assert_eq!(claimed["id"], j1["id"]);
    assert!(claim(&client, &srv, "w2", "default").await.is_none());

    // Cancel J1; the worker observes the flag and acks with kind=cancelled.
    let res = client
        .post(srv.url(&format!("/training/jobs/{id1}/cancel")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .post(srv.url(&format!("/training/jobs/{id1}/progress")))
        .json(&json!({"worker_id": "w1"}))
        .send()
        .await
        .unwrap();
    let beat: Value = res.json().await.unwrap();
    assert_eq!(beat["cancel_requested"], true);

    let res = client
        .post(srv.url(&format!("/training/jobs/{id1}/fail")))
        .json(&json!({"worker_id": "w1", "error": "cancel requested", "kind": "cancelled"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(get_job(&client, &srv, id1).await["status"], "cancelled");

    // D1 freed: the second job claims now.
    let claimed = claim(&client, &srv, "w2", "default").await.unwrap();
    assert_eq!(claimed["id"], j2["id"]);
}

#[tokio::test]
async fn dead_worker_leases_expire_then_exhaust() {
    let config = OrchestratorConfig {
        lease: Duration::from_millis(30),
        max_attempts: 2,
        ..fast_config()
    };
    let srv = TestServer::spawn(config).await;
    let client = reqwest::Client::new();

    let job = submit(&client, &srv, json!({"kind": "agent.run"})).await;
    let id = job["id"].as_str().unwrap().to_string();

    // First claim; the worker dies (no heartbeats). The sweeper requeues
    // within LeaseDur + tick without costing the attempt back.
    claim(&client, &srv, "w1", "default").await.unwrap();
    wait_for_status(&client, &srv, &id, "pending").await;
    assert_eq!(get_job(&client, &srv, &id).await["attempts"], 1);

    // Second claim dies too; attempts hit the budget and the job fails.
    claim(&client, &srv, "w1", "default").await.unwrap();
    wait_for_status(&client, &srv, &id, "failed").await;
    let job = get_job(&client, &srv, &id).await;
    assert_eq!(job["error"], "lease_exhausted");
    let types: Vec<&str> = job["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event"]["type"].as_str().unwrap())
        .collect();
    assert_eq!(
        types,
        vec!["submitted", "claimed", "lease_expired", "claimed", "lease_expired"]
    );
}

struct FlakySubscriber {
    hits: AtomicUsize,
    fail_first: usize,
}

async fn flaky_hook(State(sub): State<Arc<FlakySubscriber>>) -> AxStatusCode {
    if sub.hits.fetch_add(1, Ordering::SeqCst) < sub.fail_first {
        AxStatusCode::INTERNAL_SERVER_ERROR
    } else {
        AxStatusCode::OK
    }
}

async fn spawn_flaky_subscriber(fail_first: usize) -> (String, Arc<FlakySubscriber>) {
    let sub = Arc::new(FlakySubscriber {
        hits: AtomicUsize::new(0),
        fail_first,
    });
    let app = Router::new()
        .route("/hook", post(flaky_hook))
        .with_state(sub.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (url, sub)
}

#[tokio::test]
async fn outbox_retries_5xx_until_the_subscriber_recovers() {
    let (hook_url, _sub) = spawn_flaky_subscriber(3).await;
    let config = OrchestratorConfig {
        webhook_urls: vec![hook_url],
        webhook_secret: "s3cret".into(),
        outbox_workers: 1,
        ..fast_config()
    };
    let srv = TestServer::spawn(config).await;
    let client = reqwest::Client::new();

    // One submission, one outbox row.
    let job = submit(&client, &srv, json!({"kind": "img.generate"})).await;
    let job_id: conductor_core::JobId = job["id"].as_str().unwrap().parse().unwrap();

    let mut delivered = None;
    for _ in 0..300 {
        let rows = srv.store.outbox_rows(job_id).await.unwrap();
        if rows[0].status == OutboxStatus::Delivered {
            delivered = Some(rows[0].clone());
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let row = delivered.expect("outbox row never delivered");
    assert_eq!(row.attempts, 3);
    assert!(row.delivered_at.is_some());
}

#[tokio::test]
async fn priority_bands_claim_in_order_under_cap() {
    let srv = TestServer::spawn(fast_config()).await;
    let client = reqwest::Client::new();

    let priorities = [0, 0, 5, 5, 5, 1, 1, 1, 1, 1];
    let mut ids = Vec::new();
    for (i, p) in priorities.iter().enumerate() {
        let job = submit(
            &client,
            &srv,
            json!({"kind": "img.generate", "queue": "gpu_queue", "priority": p, "payload": {"n": i}}),
        )
        .await;
        ids.push(job["id"].as_str().unwrap().to_string());
    }

    // Two claims fill the cap; the third gets nothing until a slot frees.
    let a = claim(&client, &srv, "w1", "gpu_queue").await.unwrap();
    let b = claim(&client, &srv, "w2", "gpu_queue").await.unwrap();
    assert_eq!(a["priority"], 5);
    assert_eq!(b["priority"], 5);
    assert!(claim(&client, &srv, "w3", "gpu_queue").await.is_none());

    complete(&client, &srv, a["id"].as_str().unwrap(), "w1").await;
    let c = claim(&client, &srv, "w3", "gpu_queue").await.unwrap();
    assert_eq!(c["priority"], 5);

    // Drain the rest one slot at a time, recording first-claim order.
    let mut order = vec![
        a["id"].as_str().unwrap().to_string(),
        b["id"].as_str().unwrap().to_string(),
        c["id"].as_str().unwrap().to_string(),
    ];
    complete(&client, &srv, b["id"].as_str().unwrap(), "w2").await;
    complete(&client, &srv, c["id"].as_str().unwrap(), "w3").await;
    while let Some(job) = claim(&client, &srv, "w1", "gpu_queue").await {
        order.push(job["id"].as_str().unwrap().to_string());
        complete(&client, &srv, job["id"].as_str().unwrap(), "w1").await;
    }

    // Priority 5 first, then priority 1 by submission age, then priority 0.
    let expected: Vec<String> = [2, 3, 4, 5, 6, 7, 8, 9, 0, 1]
        .iter()
        .map(|&i| ids[i].clone())
        .collect();
    assert_eq!(order, expected);
}

#[tokio::test]
async fn lifecycle_verbs_map_conflicts_and_idempotence() {
    let srv = TestServer::spawn(fast_config()).await;
    let client = reqwest::Client::new();

    let job = submit(&client, &srv, json!({"kind": "kb.create"})).await;
    let id = job["id"].as_str().unwrap().to_string();

    // Retry of a pending job is an illegal transition.
    let res = client
        .post(srv.url(&format!("/training/jobs/{id}/retry")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["kind"], "conflict");

    // Fail it permanently, then retry: pending again, attempts unchanged.
    claim(&client, &srv, "w1", "default").await.unwrap();
    let res = client
        .post(srv.url(&format!("/training/jobs/{id}/fail")))
        .json(&json!({"worker_id": "w1", "error": "bad dataset", "kind": "permanent"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .post(srv.url(&format!("/training/jobs/{id}/retry")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let retried: Value = res.json().await.unwrap();
    assert_eq!(retried["status"], "pending");
    assert_eq!(retried["attempts"], 1);
    assert_eq!(retried["error"], Value::Null);

    // Cancel pending is immediate; cancelling again is a 200 no-op.
    let res = client
        .post(srv.url(&format!("/training/jobs/{id}/cancel")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let res = client
        .post(srv.url(&format!("/training/jobs/{id}/cancel")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "cancelled");
}

#[tokio::test]
async fn pause_and_resume_round_trip() {
    let srv = TestServer::spawn(fast_config()).await;
    let client = reqwest::Client::new();

    let job = submit(&client, &srv, json!({"kind": "train.lora"})).await;
    let id = job["id"].as_str().unwrap().to_string();
    claim(&client, &srv, "w1", "default").await.unwrap();

    let res = client
        .post(srv.url(&format!("/training/jobs/{id}/pause")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let paused: Value = res.json().await.unwrap();
    assert_eq!(paused["status"], "paused");
    assert_eq!(paused["lease_owner"], "w1");

    // The lease heartbeat still works while paused.
    let res = client
        .post(srv.url(&format!("/training/jobs/{id}/lease")))
        .json(&json!({"worker_id": "w1"}))
        .send()
        .await
        .unwrap();
    let beat: Value = res.json().await.unwrap();
    assert_eq!(beat["renewed"], true);
    assert_eq!(beat["status"], "paused");

    let res = client
        .post(srv.url(&format!("/training/jobs/{id}/resume")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    complete(&client, &srv, &id, "w1").await;
}

#[tokio::test]
async fn error_bodies_carry_error_and_kind() {
    let srv = TestServer::spawn(fast_config()).await;
    let client = reqwest::Client::new();

    // 400: bad input shape.
    let res = client
        .post(srv.url("/training/jobs"))
        .json(&json!({"kind": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["kind"], "validation");
    assert!(body["error"].as_str().unwrap().contains("kind"));

    // 404: missing id.
    let missing = conductor_core::JobId::new();
    let res = client
        .get(srv.url(&format!("/training/jobs/{missing}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["kind"], "not_found");

    // 400: malformed id.
    let res = client
        .get(srv.url("/training/jobs/not-a-uuid"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn scheduler_snapshot_reflects_load_and_workers() {
    let srv = TestServer::spawn(fast_config()).await;
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/workers/w1/heartbeat"))
        .json(&json!({"hostname": "gpu-box-1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    submit(&client, &srv, json!({"kind": "a", "queue": "gpu_queue"})).await;
    submit(&client, &srv, json!({"kind": "b", "queue": "gpu_queue"})).await;
    claim(&client, &srv, "w1", "gpu_queue").await.unwrap();

    let res = client
        .get(srv.url("/training/scheduler"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let snap: Value = res.json().await.unwrap();
    assert_eq!(snap["running"], 1);
    assert_eq!(snap["pending"], 1);
    assert_eq!(snap["workers_active"], 1);
    assert_eq!(snap["queues"]["gpu_queue"]["running"], 1);
    assert_eq!(snap["queues"]["gpu_queue"]["pending"], 1);
    assert_eq!(snap["queues"]["gpu_queue"]["cap"], 2);
    assert!(snap["capacity_pct"].as_i64().unwrap() > 0);
}
