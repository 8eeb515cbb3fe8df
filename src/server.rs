//! HTTP surface: start runs, stream their events as NDJSON, resolve
//! waitpoints, cancel.

use crate::agent::CodingAgent;
use crate::config::Config;
use crate::errors::GateError;
use crate::gate::GateBroker;
use crate::orchestrator::{RunOutcome, RunRequest, WorkflowRunner};
use crate::status::RunStreams;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::RunNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Gate(GateError::UnknownToken(_)) => StatusCode::NOT_FOUND,
            ApiError::Gate(GateError::BadCredential(_)) => StatusCode::FORBIDDEN,
            ApiError::Gate(GateError::AlreadyResolved(_)) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

struct RunHandle {
    streams: RunStreams,
    cancel: watch::Sender<bool>,
    outcome: Arc<tokio::sync::Mutex<Option<Result<RunOutcome, String>>>>,
}

#[derive(Clone)]
pub struct AppState {
    config: Config,
    agent: Arc<dyn CodingAgent>,
    gates: GateBroker,
    runs: Arc<Mutex<HashMap<String, Arc<RunHandle>>>>,
}

impl AppState {
    pub fn new(config: Config, agent: Arc<dyn CodingAgent>, gates: GateBroker) -> Self {
        Self {
            config,
            agent,
            gates,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn run(&self, id: &str) -> Result<Arc<RunHandle>, ApiError> {
        self.runs
            .lock()
            .expect("run table poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::RunNotFound(id.to_string()))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/runs", post(create_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runs/{id}/events", get(chat_events))
        .route("/api/runs/{id}/status", get(status_events))
        .route("/api/waitpoints/{id}", post(resolve_waitpoint))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn create_run(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !request.repo_url.starts_with("https://github.com/") {
        return Err(ApiError::BadRequest(
            "repo_url must be an https://github.com/ URL".to_string(),
        ));
    }
    if request.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".to_string()));
    }

    let run_id = Uuid::new_v4().simple().to_string();
    let streams = RunStreams::default();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let handle = Arc::new(RunHandle {
        streams: streams.clone(),
        cancel: cancel_tx,
        outcome: Arc::new(tokio::sync::Mutex::new(None)),
    });
    state
        .runs
        .lock()
        .expect("run table poisoned")
        .insert(run_id.clone(), handle.clone());

    let runner = WorkflowRunner::new(state.config.clone(), state.agent.clone(), state.gates.clone());
    let outcome_slot = handle.outcome.clone();
    tokio::spawn(async move {
        let result = runner.run(request, streams, cancel_rx).await;
        *outcome_slot.lock().await = Some(result.map_err(|err| err.user_message()));
    });

    Ok((StatusCode::CREATED, Json(json!({ "run_id": run_id }))))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.run(&id)?;
    let outcome = handle.outcome.lock().await;
    let body = match &*outcome {
        None => json!({ "run_id": id, "finished": false }),
        Some(Ok(outcome)) => json!({ "run_id": id, "finished": true, "outcome": outcome }),
        Some(Err(message)) => json!({ "run_id": id, "finished": true, "error": message }),
    };
    let finished = outcome.is_some();
    drop(outcome);
    // A finished run's outcome is delivered exactly once; evicting the
    // handle here keeps the run table from growing without bound and drops
    // the stream senders so event subscribers see end-of-stream.
    if finished {
        state
            .runs
            .lock()
            .expect("run table poisoned")
            .remove(&id);
    }
    Ok(Json(body))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.run(&id)?;
    let _ = handle.cancel.send(true);
    Ok(StatusCode::ACCEPTED)
}

async fn chat_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let handle = state.run(&id)?;
    Ok(ndjson_response(handle.streams.chat.subscribe()))
}

async fn status_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let handle = state.run(&id)?;
    Ok(ndjson_response(handle.streams.status.subscribe()))
}

/// Stream a broadcast channel as newline-delimited JSON. Lagged receivers
/// skip ahead; the stream ends when the run drops its sender.
fn ndjson_response(rx: broadcast::Receiver<String>) -> Response {
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(mut line) => {
                    line.push('\n');
                    return Some((Ok::<_, std::convert::Infallible>(line), rx));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    credential: String,
    answer: serde_json::Value,
}

async fn resolve_waitpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .gates
        .resolve(&id, &request.credential, request.answer)?;
    Ok(Json(json!({ "resolved": true })))
}

/// Bind and serve until ctrl-c.
pub async fn start_server(state: AppState, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| anyhow::anyhow!("Failed to bind {addr}: {err}"))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentEvent, AgentOutcome, AgentRequest};
    use async_trait::async_trait;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    struct IdleAgent;

    #[async_trait]
    impl CodingAgent for IdleAgent {
        async fn run(
            &self,
            _request: AgentRequest,
            _cancel: watch::Receiver<bool>,
            _events: mpsc::UnboundedSender<AgentEvent>,
        ) -> anyhow::Result<AgentOutcome> {
            Ok(AgentOutcome::default())
        }
    }

    fn test_state() -> AppState {
        AppState::new(Config::default(), Arc::new(IdleAgent), GateBroker::new())
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn create_run_rejects_non_github_urls() {
        let app = router(test_state());
        let request = Request::post("/api/runs")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"repo_url":"https://gitlab.com/a/b","prompt":"do things"}"#,
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_run_rejects_empty_prompt() {
        let app = router(test_state());
        let request = Request::post("/api/runs")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"repo_url":"https://github.com/a/b","prompt":"  "}"#,
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_run_is_404() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::get("/api/runs/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn waitpoint_resolution_maps_gate_errors() {
        let state = test_state();
        let token = state.gates.create(std::time::Duration::from_secs(60));
        let app = router(state.clone());

        // Wrong credential.
        let request = Request::post(format!("/api/waitpoints/{}", token.id))
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"credential":"wrong","answer":{"action":"continue"}}"#,
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // Correct credential.
        let body = format!(
            r#"{{"credential":"{}","answer":{{"action":"continue"}}}}"#,
            token.credential
        );
        let request = Request::post(format!("/api/waitpoints/{}", token.id))
            .header("content-type", "application/json")
            .body(Body::from(body.clone()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Second resolve conflicts.
        let request = Request::post(format!("/api/waitpoints/{}", token.id))
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // Unknown token.
        let request = Request::post("/api/waitpoints/missing")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"credential":"x","answer":{}}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_unknown_run_is_404_and_known_run_accepted() {
        let state = test_state();
        let streams = RunStreams::default();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        state.runs.lock().unwrap().insert(
            "r1".to_string(),
            Arc::new(RunHandle {
                streams,
                cancel: cancel_tx,
                outcome: Arc::new(tokio::sync::Mutex::new(None)),
            }),
        );
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/runs/r1/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(*cancel_rx.borrow_and_update());

        let response = app
            .oneshot(
                Request::post("/api/runs/missing/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn finished_run_is_evicted_after_its_outcome_is_read() {
        let state = test_state();
        let outcome = RunOutcome {
            success: true,
            stories_completed: 2,
            stories_failed: 0,
            branch_url: None,
            pr_url: None,
            usage: crate::prd::TokenUsage::default(),
        };
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        state.runs.lock().unwrap().insert(
            "r1".to_string(),
            Arc::new(RunHandle {
                streams: RunStreams::default(),
                cancel: cancel_tx,
                outcome: Arc::new(tokio::sync::Mutex::new(Some(Ok(outcome)))),
            }),
        );
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(Request::get("/api/runs/r1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["finished"], true);
        assert_eq!(body["outcome"]["stories_completed"], 2);
        assert!(state.runs.lock().unwrap().is_empty());

        let response = app
            .oneshot(Request::get("/api/runs/r1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unfinished_run_stays_in_the_run_table() {
        let state = test_state();
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        state.runs.lock().unwrap().insert(
            "r1".to_string(),
            Arc::new(RunHandle {
                streams: RunStreams::default(),
                cancel: cancel_tx,
                outcome: Arc::new(tokio::sync::Mutex::new(None)),
            }),
        );
        let app = router(state.clone());

        let response = app
            .oneshot(Request::get("/api/runs/r1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["finished"], false);
        assert!(state.runs.lock().unwrap().contains_key("r1"));
    }

    #[tokio::test]
    async fn event_streams_deliver_ndjson_lines() {
        let state = test_state();
        let streams = RunStreams::default();
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        state.runs.lock().unwrap().insert(
            "r1".to_string(),
            Arc::new(RunHandle {
                streams: streams.clone(),
                cancel: cancel_tx,
                outcome: Arc::new(tokio::sync::Mutex::new(None)),
            }),
        );
        let app = router(state.clone());

        let response = app
            .oneshot(
                Request::get("/api/runs/r1/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-ndjson"
        );

        streams.send_status(&crate::status::StatusEvent::Cloned);
        // Drop every sender so the stream terminates.
        state.runs.lock().unwrap().clear();
        drop(streams);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        let event: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(event["type"], "cloned");
    }
}
