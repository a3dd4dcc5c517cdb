//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the dispatcher and the backend

use crate::{services::backend::Presence, state::AppState};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// Location probed by `/readyz`. Its presence does not matter, only that the
/// backend answers.
const READINESS_PROBE_LOCATION: &str = "/.readyz";

/// `GET /healthz`
///
/// Liveness probe. Always 200 and never touches the backend.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Checks the dispatcher still accepts records (shutdown not triggered).
/// 2. Runs an existence probe against the configured backend.
///
/// HTTP 200 when both pass, HTTP 503 otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let dispatcher_check = if state.shutdown.is_triggered() {
        (false, Some("shutting down".to_string()))
    } else {
        (true, None::<String>)
    };

    let backend_check = match state.backend.probe(READINESS_PROBE_LOCATION).await {
        Ok(Presence::Exists | Presence::NotFound) => (true, None::<String>),
        Err(e) => (false, Some(format!("error: {}", e))),
    };

    let overall_ok = dispatcher_check.0 && backend_check.0;

    let mut checks = HashMap::new();
    checks.insert(
        "dispatcher",
        CheckStatus {
            ok: dispatcher_check.0,
            error: dispatcher_check.1,
        },
    );
    checks.insert(
        "backend",
        CheckStatus {
            ok: backend_check.0,
            error: backend_check.1,
        },
    );

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        backend: state.backend.name(),
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    backend: &'static str,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
