use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use crate::AppState;
use crate::tools::{self, DispatchError};

// ═══════════════════════════════════════════════════════════════
//  REST: GET /api/tools
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_list_tools(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(tools::tool_specs(&state.prefix))
}

// ═══════════════════════════════════════════════════════════════
//  REST: POST /api/tools/{name}
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_call_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let args: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, "InvalidArguments", format!("body is not JSON: {e}"));
            }
        }
    };

    match tools::dispatch(&state.relay, &state.prefix, &name, args).await {
        Ok(response) => axum::Json(response).into_response(),
        Err(e @ DispatchError::UnknownTool(_)) => {
            error_response(StatusCode::NOT_FOUND, e.kind(), e.to_string())
        }
        Err(e @ DispatchError::InvalidArguments { .. }) => {
            error_response(StatusCode::BAD_REQUEST, e.kind(), e.to_string())
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  REST: GET /api/status
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.relay.status())
}

fn error_response(status: StatusCode, kind: &str, message: String) -> Response {
    let body = json!({
        "ok": false,
        "error": { "kind": kind, "message": message },
    });
    (status, axum::Json(body)).into_response()
}
