//! HTTP front door for the controller (axum).
//!
//! - `POST /send-task`: JSON `{method, target, payload}` (legacy `url` / `body`
//!   accepted), answered with the worker's TaskResponse
//! - `GET /status`: ControllerStatus

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use courier_core::{Controller, DispatchError, TaskRequest};
use tracing::warn;

pub fn router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/send-task", post(send_task))
        .route("/status", get(status))
        .with_state(controller)
}

fn status_for(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::WorkerUnavailable { worker: None }
        | DispatchError::WorkerBusy(_)
        | DispatchError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::WorkerUnavailable { worker: Some(_) }
        | DispatchError::ConnectionLost(_)
        | DispatchError::Codec(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// The body is read as JSON whatever the `Content-Type`; `curl -d` sends
/// form-encoded headers.
async fn send_task(State(controller): State<Arc<Controller>>, body: Bytes) -> Response {
    let request: TaskRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("invalid request body: {err}")).into_response();
        }
    };

    match controller.submit(request).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            warn!(error = %err, "send-task failed");
            (status_for(&err), err.to_string()).into_response()
        }
    }
}

async fn status(State(controller): State<Arc<Controller>>) -> Response {
    Json(controller.status().await).into_response()
}
