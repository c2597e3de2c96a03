use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use contact_import_worker::{
    api::{router, ApiState},
    context::JobRegistry,
    health::HealthRegistry,
    job::{
        config::{ImportOptions, ImportRequest, SourceConfig},
        model::{ImportJob, JobStatus},
    },
    parse::fields::{ContactField, FieldMapping},
    progress::{ProgressPublisher, ProgressSnapshot},
    store::{memory::MemoryJobStore, JobStore},
};
use http_body_util::BodyExt;
use tower::ServiceExt;
use uuid::Uuid;

struct TestApp {
    router: Router,
    jobs: Arc<MemoryJobStore>,
    publisher: Arc<ProgressPublisher>,
    registry: JobRegistry,
    health: HealthRegistry,
}

fn app() -> TestApp {
    let jobs = Arc::new(MemoryJobStore::new());
    let publisher = Arc::new(ProgressPublisher::new());
    let registry = JobRegistry::new();
    let health = HealthRegistry::new("liveness");
    let state = ApiState {
        jobs: jobs.clone(),
        publisher: publisher.clone(),
        registry: registry.clone(),
    };
    TestApp {
        router: router(state, health.clone()),
        jobs,
        publisher,
        registry,
        health,
    }
}

fn job() -> ImportJob {
    ImportJob::new(ImportRequest {
        source_name: "contacts.csv".to_string(),
        source: SourceConfig::File {
            path: "/uploads/contacts.csv".into(),
        },
        field_mapping: FieldMapping::new([("Name", ContactField::FullName)]),
        options: ImportOptions::default(),
    })
}

fn get(uri: String) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn index_answers() {
    let app = app();
    let response = app.router.oneshot(get("/".to_string())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "contact import worker");
}

#[tokio::test]
async fn liveness_follows_the_health_registry() {
    let app = app();
    let response = app
        .router
        .clone()
        .oneshot(get("/_liveness".to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    app.health
        .register("worker".to_string(), Duration::from_secs(30))
        .report_healthy();
    let response = app
        .router
        .oneshot(get("/_liveness".to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn import_is_returned_as_json() {
    let app = app();
    let job = job();
    app.jobs.save_job(&job).await.unwrap();

    let response = app
        .router
        .oneshot(get(format!("/imports/{}", job.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body["id"], job.id.to_string());
    assert_eq!(body["status"], "pending");
    assert_eq!(body["processed_rows"], 0);
    assert_eq!(body["source"]["type"], "file");
}

#[tokio::test]
async fn unknown_import_is_not_found() {
    let app = app();
    let response = app
        .router
        .clone()
        .oneshot(get(format!("/imports/{}", Uuid::now_v7())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .router
        .oneshot(get("/imports/not-a-uuid".to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_only_reaches_jobs_running_here() {
    let app = app();
    let running = Uuid::now_v7();
    let signal = app.registry.register(running);

    let cancel = |id: Uuid| {
        Request::builder()
            .method("POST")
            .uri(format!("/imports/{id}/cancel"))
            .body(Body::empty())
            .unwrap()
    };

    let response = app
        .router
        .clone()
        .oneshot(cancel(Uuid::now_v7()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(!signal.is_cancelled());

    let response = app.router.oneshot(cancel(running)).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(signal.is_cancelled());
    assert_eq!(signal.reason(), "cancelled by user");
}

#[tokio::test]
async fn finished_import_streams_its_final_snapshot() {
    let app = app();
    let mut job = job();
    job.start().unwrap();
    job.complete().unwrap();
    app.jobs.save_job(&job).await.unwrap();

    let response = app
        .router
        .oneshot(get(format!("/imports/{}/progress", job.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_text(response).await;
    assert!(body.contains("event: completed"), "{body}");
    assert_eq!(body.matches("data:").count(), 1);
    assert_eq!(app.publisher.topic_count(), 0);
}

#[tokio::test]
async fn running_import_streams_until_terminal() {
    let app = app();
    let mut job = job();
    job.start().unwrap();
    app.jobs.save_job(&job).await.unwrap();
    let job_id = job.id;

    let publisher = app.publisher.clone();
    let producer = tokio::spawn(async move {
        // Publishing is not replayed, so wait for the request to subscribe
        while publisher.topic_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut snapshot = ProgressSnapshot {
            job_id,
            status: JobStatus::Processing,
            processed_rows: 2,
            successful_rows: 2,
            error_rows: 0,
            duplicate_rows: 0,
            total_rows: None,
        };
        publisher.publish(snapshot);
        tokio::time::sleep(Duration::from_millis(20)).await;
        snapshot.status = JobStatus::Completed;
        snapshot.total_rows = Some(2);
        publisher.publish(snapshot);
    });

    let response = app
        .router
        .oneshot(get(format!("/imports/{job_id}/progress")))
        .await
        .unwrap();
    let body = tokio::time::timeout(Duration::from_secs(5), body_text(response))
        .await
        .unwrap();
    producer.await.unwrap();

    // A slow reader may only see the latest snapshot, which is the terminal one
    assert!(body.contains("event: completed"), "{body}");
    assert!(body.trim_end().ends_with('}'), "{body}");
    assert!(body.contains("\"total_rows\":2"), "{body}");
    assert_eq!(app.publisher.topic_count(), 0);
}

#[tokio::test]
async fn progress_of_unknown_import_is_not_found() {
    let app = app();
    let response = app
        .router
        .oneshot(get(format!("/imports/{}/progress", Uuid::now_v7())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(app.publisher.topic_count(), 0);
}
