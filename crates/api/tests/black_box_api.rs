use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
use reqwest::StatusCode;
use serde_json::{json, Value};

use feedback_api::app::services::AppServices;
use feedback_core::{JobId, User, Username};
use feedback_infra::handlers;
use feedback_infra::jobs::{Broker, JobState, QueueName, RetryPolicy, WorkerConfig, WorkerHandle};
use feedback_infra::mail::HttpMailTransport;
use feedback_infra::users::UserStore;

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
    _workers: Vec<WorkerHandle>,
}

impl TestServer {
    async fn spawn(services: AppServices) -> Self {
        Self::spawn_with(services, true).await
    }

    async fn spawn_with(services: AppServices, run_workers: bool) -> Self {
        let services = Arc::new(services);
        let workers = if run_workers {
            services
                .spawn_workers(QueueName::ALL.map(|queue| {
                    WorkerConfig::new(queue).with_poll_interval(Duration::from_millis(10))
                }))
                .expect("registry covers every queue")
        } else {
            Vec::new()
        };

        // Same router as prod, bound to an ephemeral port.
        let app = feedback_api::app::build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            handle,
            _workers: workers,
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

fn fast_retries() -> RetryPolicy {
    RetryPolicy::fixed(3, Duration::from_millis(20))
}

async fn seed_user(services: &AppServices, name: &str, accepting: bool) -> Username {
    let username = Username::parse(name).unwrap();
    services
        .users
        .insert(User::new(username.clone(), format!("{name}@example.com")))
        .await
        .unwrap();
    services
        .users
        .set_accepting_messages(&username, accepting)
        .await
        .unwrap();
    username
}

async fn job_status(client: &reqwest::Client, srv: &TestServer, id: &str) -> (StatusCode, Value) {
    let res = client
        .get(srv.url(&format!("/api/job-status/{id}")))
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

async fn wait_for_state(
    client: &reqwest::Client,
    srv: &TestServer,
    id: &str,
    state: JobState,
) -> Value {
    // Workers run in the background; poll until the record settles.
    for _ in 0..250 {
        let (status, body) = job_status(client, srv, id).await;
        assert_eq!(status, StatusCode::OK);
        if body["state"] == state.as_str() {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {id} did not reach {state} within timeout");
}

async fn post_json(client: &reqwest::Client, url: String, body: Value) -> (StatusCode, Value) {
    let res = client.post(url).json(&body).send().await.unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

#[tokio::test]
async fn check_reports_running() {
    let srv = TestServer::spawn_with(AppServices::in_memory(), false).await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/api/check")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body, json!({"success": true, "message": "Queue server is running"}));

    let res = client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn send_otp_is_queued_and_completes() {
    let srv = TestServer::spawn(AppServices::in_memory()).await;
    let client = reqwest::Client::new();

    let (status, body) = post_json(
        &client,
        srv.url("/api/send-otp"),
        json!({"email": "alice@example.com", "username": "alice", "otp": "482913"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "OTP email has been queued");
    let id = body["jobId"].as_str().unwrap().to_string();

    let done = wait_for_state(&client, &srv, &id, JobState::Completed).await;
    assert_eq!(
        done,
        json!({
            "success": true,
            "jobId": id,
            "queueName": "email",
            "state": "completed",
            "progress": 100,
        })
    );

    let record = srv.services.queue.get_job(id.parse().unwrap()).await.unwrap();
    let message_id = record.result.unwrap()["messageId"].as_str().unwrap().to_string();
    assert!(message_id.ends_with("@feedback.local>"));
    assert_eq!(record.attempts, 1);
}

#[tokio::test]
async fn missing_fields_are_rejected() {
    let srv = TestServer::spawn_with(AppServices::in_memory(), false).await;
    let client = reqwest::Client::new();

    let (status, body) = post_json(
        &client,
        srv.url("/api/send-otp"),
        json!({"email": "alice@example.com", "username": "alice"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Email, username, and OTP are required");

    let (status, body) = post_json(
        &client,
        srv.url("/api/save-message"),
        json!({"username": "alice", "content": ""}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Username and content are required");

    // Not JSON at all.
    let res = client
        .post(srv.url("/api/save-message"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let counts = srv
        .services
        .broker()
        .counts(QueueName::MessagePersist)
        .await
        .unwrap();
    assert_eq!(counts.waiting, 0);
}

#[tokio::test]
async fn unknown_or_malformed_job_ids_are_not_found() {
    let srv = TestServer::spawn_with(AppServices::in_memory(), false).await;
    let client = reqwest::Client::new();

    for id in [JobId::new().to_string(), "not-a-job-id".to_string()] {
        let (status, body) = job_status(&client, &srv, &id).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Job not found");
    }
}

#[tokio::test]
async fn waiting_job_status_is_stable_across_reads() {
    let srv = TestServer::spawn_with(AppServices::in_memory(), false).await;
    let client = reqwest::Client::new();

    let (_, body) = post_json(
        &client,
        srv.url("/api/save-message"),
        json!({"username": "alice", "content": "hello"}),
    )
    .await;
    let id = body["jobId"].as_str().unwrap();

    let first = job_status(&client, &srv, id).await;
    let second = job_status(&client, &srv, id).await;
    assert_eq!(first, second);
    assert_eq!(first.1["state"], "waiting");
    assert_eq!(first.1["queueName"], "message-persist");
    assert_eq!(first.1["progress"], 0);
}

#[tokio::test]
async fn save_message_appends_to_user() {
    let services = AppServices::in_memory();
    let alice = seed_user(&services, "alice", true).await;
    let srv = TestServer::spawn(services).await;
    let client = reqwest::Client::new();

    let (status, body) = post_json(
        &client,
        srv.url("/api/save-message"),
        json!({"username": "Alice", "content": "great talk"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Message has been queued for saving");
    let id = body["jobId"].as_str().unwrap();

    wait_for_state(&client, &srv, id, JobState::Completed).await;

    let user = srv.services.users.find_by_username(&alice).await.unwrap().unwrap();
    assert_eq!(user.messages.len(), 1);
    assert_eq!(user.messages[0].content, "great talk");
}

#[tokio::test]
async fn save_message_for_closed_inbox_fails_after_all_attempts() {
    let services = AppServices::in_memory().with_retry_policy(fast_retries());
    let bob = seed_user(&services, "bob", false).await;
    let srv = TestServer::spawn(services).await;
    let client = reqwest::Client::new();

    let (_, body) = post_json(
        &client,
        srv.url("/api/save-message"),
        json!({"username": "bob", "content": "hi"}),
    )
    .await;
    let id = body["jobId"].as_str().unwrap();

    wait_for_state(&client, &srv, id, JobState::Failed).await;

    let record = srv.services.queue.get_job(id.parse().unwrap()).await.unwrap();
    assert_eq!(record.attempts, 3);
    assert_eq!(record.history.len(), 3);
    assert!(record
        .failure_reason
        .unwrap()
        .contains("not accepting messages"));

    let user = srv.services.users.find_by_username(&bob).await.unwrap().unwrap();
    assert!(user.messages.is_empty());
}

#[tokio::test]
async fn generic_enqueue_applies_overrides() {
    let srv = TestServer::spawn_with(AppServices::in_memory(), false).await;
    let client = reqwest::Client::new();

    let (status, body) = post_json(
        &client,
        srv.url("/api/queues/message-persist/jobs"),
        json!({
            "jobType": "save-message",
            "payload": {"username": "alice", "content": "hi"},
            "options": {"attempts": 5, "backoff": {"type": "fixed", "delayMs": 10}},
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id: JobId = body["jobId"].as_str().unwrap().parse().unwrap();
    let record = srv.services.queue.get_job(id).await.unwrap();
    assert_eq!(record.max_attempts, 5);

    // Job type on the wrong queue.
    let (status, _) = post_json(
        &client,
        srv.url("/api/queues/email/jobs"),
        json!({"jobType": "save-message", "payload": {"username": "alice", "content": "hi"}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        &client,
        srv.url("/api/queues/nope/jobs"),
        json!({"jobType": "save-message", "payload": {}}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_views_counts_jobs_and_workers() {
    let srv = TestServer::spawn(AppServices::in_memory()).await;
    let client = reqwest::Client::new();

    let (_, body) = post_json(
        &client,
        srv.url("/api/send-otp"),
        json!({"email": "a@b.com", "username": "alice", "otp": 111111}),
    )
    .await;
    let id = body["jobId"].as_str().unwrap().to_string();
    wait_for_state(&client, &srv, &id, JobState::Completed).await;

    let res = client.get(srv.url("/admin/queues")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let html = res.text().await.unwrap();
    assert!(html.contains("<h2>email</h2>"));
    assert!(html.contains("<h2>message-persist</h2>"));
    assert!(html.contains("email-worker"));

    let res = client
        .get(srv.url("/admin/queues/email/jobs?state=completed&limit=10"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["jobs"][0]["id"], id);
    assert_eq!(body["jobs"][0]["payload"]["otp"], "111111");

    let res = client
        .get(srv.url("/admin/queues/email/jobs?state=sleeping"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // Stats are bumped just after the record is acked.
    for _ in 0..100 {
        let res = client.get(srv.url("/admin/workers")).send().await.unwrap();
        let body: Value = res.json().await.unwrap();
        let workers = body["workers"].as_array().unwrap();
        assert_eq!(workers.len(), 2);
        let email = workers.iter().find(|w| w["queue"] == "email").unwrap();
        if email["jobs_succeeded"] == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("email worker never counted the completed job");
}

#[derive(Clone, Default)]
struct MailSink {
    received: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

async fn accept_mail(
    State(sink): State<MailSink>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    sink.received.lock().unwrap().push((auth, body));
    Json(json!({"id": "mail-42"}))
}

#[tokio::test]
async fn otp_mail_goes_through_http_transport() {
    let sink = MailSink::default();
    let mail_app = Router::new()
        .route("/emails", post(accept_mail))
        .with_state(sink.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mail_url = format!("http://{}/emails", listener.local_addr().unwrap());
    let mail_server = tokio::spawn(async move {
        axum::serve(listener, mail_app).await.unwrap();
    });

    let services = AppServices::in_memory();
    let registry = handlers::registry(
        Arc::new(HttpMailTransport::new(mail_url, "test-key", Duration::from_secs(5)).unwrap()),
        "Feedback <no-reply@example.com>",
        services.users.clone(),
    );
    let srv = TestServer::spawn(services.with_registry(registry)).await;
    let client = reqwest::Client::new();

    let (_, body) = post_json(
        &client,
        srv.url("/api/send-otp"),
        json!({"email": "carol@example.com", "username": "carol", "otp": "909090"}),
    )
    .await;
    let id = body["jobId"].as_str().unwrap().to_string();
    wait_for_state(&client, &srv, &id, JobState::Completed).await;

    let record = srv.services.queue.get_job(id.parse().unwrap()).await.unwrap();
    assert_eq!(record.result.unwrap()["messageId"], "mail-42");

    {
        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        let (auth, mail) = &received[0];
        assert_eq!(auth.as_deref(), Some("Bearer test-key"));
        assert_eq!(mail["to"], "carol@example.com");
        assert_eq!(mail["subject"], "Verification Code for Feedback App");
        assert!(mail["html"].as_str().unwrap().contains("909090"));
    }

    mail_server.abort();
}

async fn unresponsive_mail() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(5)).await;
    Json(json!({"id": "too-late"}))
}

#[tokio::test]
async fn hung_mail_api_times_out_and_fails_job() {
    let mail_app = Router::new().route("/emails", post(unresponsive_mail));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mail_url = format!("http://{}/emails", listener.local_addr().unwrap());
    let mail_server = tokio::spawn(async move {
        axum::serve(listener, mail_app).await.unwrap();
    });

    let services = AppServices::in_memory().with_retry_policy(fast_retries());
    let transport = HttpMailTransport::new(mail_url, "test-key", Duration::from_millis(200)).unwrap();
    let registry = handlers::registry(
        Arc::new(transport),
        "Feedback <no-reply@example.com>",
        services.users.clone(),
    );
    let srv = TestServer::spawn(services.with_registry(registry)).await;
    let client = reqwest::Client::new();

    let started = tokio::time::Instant::now();
    let (_, body) = post_json(
        &client,
        srv.url("/api/send-otp"),
        json!({"email": "dave@example.com", "username": "dave", "otp": "121212"}),
    )
    .await;
    let id = body["jobId"].as_str().unwrap().to_string();
    wait_for_state(&client, &srv, &id, JobState::Failed).await;
    assert!(started.elapsed() < Duration::from_secs(4));

    let record = srv.services.queue.get_job(id.parse().unwrap()).await.unwrap();
    assert_eq!(record.attempts, 3);
    let reason = record.failure_reason.unwrap();
    assert!(reason.starts_with("Failed to send email"), "{reason}");
    assert!(reason.contains("no response within 200ms"), "{reason}");

    mail_server.abort();
}
