//! Operator REST endpoints: status, manual stop, enrolment, CSV roster
//! import and export.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use tracing::warn;

use crate::error::RosterError;
use crate::roster;
use crate::scheduler::{EnrollOutcome, ManualStopOutcome, Scheduler};
use crate::sequence::Attributes;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
}

/// Build the Axum router for operator endpoints.
pub fn operator_routes(scheduler: Arc<Scheduler>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/recipients", post(enroll_recipient))
        .route("/api/recipients.csv", get(export_roster).post(import_roster))
        .route("/api/recipients/{email}", get(get_recipient))
        .route("/api/recipients/{email}/stop", post(stop_recipient))
        .with_state(ApiState { scheduler })
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    warn!("Operator request failed: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": e.to_string()})),
    )
}

async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    match state.scheduler.status().await {
        Ok(report) => (StatusCode::OK, Json(serde_json::json!(report))),
        Err(e) => internal_error(e),
    }
}

async fn get_recipient(
    State(state): State<ApiState>,
    Path(email): Path<String>,
) -> impl IntoResponse {
    match state.scheduler.get(&email).await {
        Ok(Some(record)) => (StatusCode::OK, Json(serde_json::json!(record))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Recipient not found"})),
        ),
        Err(e) => internal_error(e),
    }
}

async fn stop_recipient(
    State(state): State<ApiState>,
    Path(email): Path<String>,
) -> impl IntoResponse {
    match state.scheduler.stop_recipient(&email).await {
        Ok(ManualStopOutcome::Stopped) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "stopped"})),
        ),
        Ok(ManualStopOutcome::AlreadyTerminal(stage)) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "already_terminal", "stage": stage})),
        ),
        Ok(ManualStopOutcome::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Recipient not found"})),
        ),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
struct EnrollRequest {
    email: String,
    #[serde(default)]
    attributes: Attributes,
}

async fn enroll_recipient(
    State(state): State<ApiState>,
    Json(body): Json<EnrollRequest>,
) -> impl IntoResponse {
    match state
        .scheduler
        .enroll(&body.email, body.attributes, Utc::now())
        .await
    {
        Ok(EnrollOutcome::Enrolled(record)) => (StatusCode::CREATED, Json(serde_json::json!(record))),
        Ok(EnrollOutcome::AlreadyEnrolled) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": "Recipient already enrolled"})),
        ),
        Ok(EnrollOutcome::InvalidAddress) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid email address"})),
        ),
        Err(e) => internal_error(e),
    }
}

async fn import_roster(State(state): State<ApiState>, body: String) -> impl IntoResponse {
    match roster::import_csv(&state.scheduler, body.as_bytes(), Utc::now()).await {
        Ok(report) => (StatusCode::OK, Json(serde_json::json!(report))),
        Err(e @ (RosterError::Csv(_) | RosterError::MissingColumn(_))) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
        Err(e) => internal_error(e),
    }
}

async fn export_roster(State(state): State<ApiState>) -> Response {
    let mut csv = Vec::new();
    match roster::export_csv(&state.scheduler, &mut csv).await {
        Ok(_) => ([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], csv).into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchOutcome, DispatchPipeline, RetryPolicy};
    use crate::error::RenderError;
    use crate::limiter::{LimiterConfig, RateLimiter};
    use crate::mail::{MailSender, RenderedEmail, TemplateRenderer};
    use crate::scheduler::SchedulerConfig;
    use crate::sequence::SequencePlan;
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct NullSender;

    #[async_trait]
    impl MailSender for NullSender {
        fn name(&self) -> &str {
            "null"
        }

        async fn send(&self, _: &str, _: &str, _: &str) -> DispatchOutcome {
            DispatchOutcome::Sent { message_id: None }
        }
    }

    struct NullRenderer;

    impl TemplateRenderer for NullRenderer {
        fn render(&self, _: u8, _: &Attributes) -> Result<RenderedEmail, RenderError> {
            Ok(RenderedEmail {
                subject: String::new(),
                body: String::new(),
            })
        }
    }

    async fn app() -> Router {
        let repo = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let pipeline = DispatchPipeline::new(
            Arc::new(NullSender),
            Arc::new(NullRenderer),
            Duration::from_secs(1),
        );
        let scheduler = Scheduler::new(
            repo,
            Arc::new(RateLimiter::new(LimiterConfig::default())),
            pipeline,
            SequencePlan::default(),
            RetryPolicy::default(),
            SchedulerConfig::default(),
        );
        operator_routes(Arc::new(scheduler))
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn enroll_then_stop() {
        let app = app().await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/recipients",
                serde_json::json!({"email": "ada@example.com", "attributes": {"first_name": "Ada"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(post_json("/api/recipients/ada@example.com/stop", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "stopped");

        let response = app
            .clone()
            .oneshot(post_json("/api/recipients/ada@example.com/stop", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "already_terminal");
        assert_eq!(body["stage"], "stopped");
    }

    #[tokio::test]
    async fn stop_unknown_is_not_found() {
        let response = app()
            .await
            .oneshot(post_json("/api/recipients/ghost@example.com/stop", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn duplicate_and_invalid_enrolment() {
        let app = app().await;
        let enroll = || post_json("/api/recipients", serde_json::json!({"email": "ada@example.com"}));

        assert_eq!(app.clone().oneshot(enroll()).await.unwrap().status(), StatusCode::CREATED);
        assert_eq!(app.clone().oneshot(enroll()).await.unwrap().status(), StatusCode::CONFLICT);

        let response = app
            .oneshot(post_json("/api/recipients", serde_json::json!({"email": "not-an-address"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn roster_import_then_export() {
        let app = app().await;
        let csv = "email,first_name,company\n\
                   ada@example.com,Ada,Acme\n\
                   ada@example.com,Ada,Acme\n\
                   not-an-address,Bob,Acme\n\
                   ,Carol,Acme\n";
        let response = app
            .clone()
            .oneshot(
                Request::post("/api/recipients.csv")
                    .header("content-type", "text/csv")
                    .body(Body::from(csv))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = json_body(response).await;
        assert_eq!(report["total"], 4);
        assert_eq!(report["enrolled"], 1);
        assert_eq!(report["already_enrolled"], 1);
        assert_eq!(report["rejected"].as_array().unwrap().len(), 2);
        assert_eq!(report["rejected"][0]["row"], 3);
        assert_eq!(report["rejected"][1]["reason"], "missing email");

        let response = app
            .clone()
            .oneshot(Request::get("/api/recipients/ada@example.com").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(response).await["attributes"]["company"], "Acme");

        let response = app
            .oneshot(Request::get("/api/recipients.csv").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/csv; charset=utf-8"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("email,stage,"));
        assert!(lines[0].ends_with(",company,first_name"));
        assert!(lines[1].starts_with("ada@example.com,not_started,"));
        assert!(lines[1].ends_with(",Acme,Ada"));
    }

    #[tokio::test]
    async fn roster_without_email_column_is_bad_request() {
        let response = app()
            .await
            .oneshot(
                Request::post("/api/recipients.csv")
                    .body(Body::from("name\nAda\n"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn status_reports_stage_counts_and_limiter() {
        let app = app().await;
        app.clone()
            .oneshot(post_json("/api/recipients", serde_json::json!({"email": "ada@example.com"})))
            .await
            .unwrap();

        let response = app
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["stages"]["not_started"], 1);
        assert_eq!(body["limiter"]["configured_per_minute"], 30);
    }
}
