//! The HTTP façade: a thin axum layer over the controller mailbox.
//!
//! Routes mirror the service contract: `/tuya/status` reads device state,
//! `/tuya/set` records a command, `/tuya/config` exports or replaces the
//! configuration blob.

use crate::runtime::ControllerHandle;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

type HttpError = (StatusCode, &'static str);

pub fn router(handle: ControllerHandle) -> Router {
    Router::new()
        .route("/tuya/status", get(status))
        .route("/tuya/set", get(set))
        .route("/tuya/config", get(get_config).post(put_config))
        .with_state(handle)
}

fn unavailable() -> HttpError {
    (StatusCode::SERVICE_UNAVAILABLE, "controller unavailable")
}

async fn status(State(handle): State<ControllerHandle>) -> Result<Json<Value>, HttpError> {
    handle.status().await.map(Json).map_err(|_| unavailable())
}

#[derive(Deserialize)]
struct SetParams {
    point: Option<String>,
    state: Option<String>,
    pulse: Option<String>,
    cause: Option<String>,
}

/// `on` and `1` switch on, `off` and `0` switch off.
fn parse_state(state: &str) -> Option<bool> {
    match state {
        "on" | "1" => Some(true),
        "off" | "0" => Some(false),
        _ => None,
    }
}

/// A non-negative number of seconds; zero means steady.
fn parse_pulse(pulse: Option<&str>) -> Option<u32> {
    match pulse {
        None => Some(0),
        Some(text) => text.parse::<u32>().ok(),
    }
}

async fn set(
    State(handle): State<ControllerHandle>,
    Query(params): Query<SetParams>,
) -> Result<Json<Value>, HttpError> {
    let Some(point) = params.point else {
        return Err((StatusCode::NOT_FOUND, "missing point name"));
    };
    let Some(state) = params.state.as_deref() else {
        return Err((StatusCode::BAD_REQUEST, "missing state value"));
    };
    let Some(state) = parse_state(state) else {
        return Err((StatusCode::BAD_REQUEST, "invalid state value"));
    };
    let Some(pulse) = parse_pulse(params.pulse.as_deref()) else {
        return Err((StatusCode::BAD_REQUEST, "invalid pulse value"));
    };

    let found = handle
        .set(&point, state, pulse, params.cause)
        .await
        .map_err(|_| unavailable())?;
    if !found {
        return Err((StatusCode::NOT_FOUND, "invalid point name"));
    }
    handle.status().await.map(Json).map_err(|_| unavailable())
}

async fn get_config(State(handle): State<ControllerHandle>) -> Result<Json<Value>, HttpError> {
    let config = handle.config().await.map_err(|_| unavailable())?;
    serde_json::to_value(config)
        .map(Json)
        .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "cannot export config"))
}

async fn put_config(
    State(handle): State<ControllerHandle>,
    body: String,
) -> Result<&'static str, HttpError> {
    handle
        .update_config(body)
        .await
        .map(|_| "")
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid configuration"))
}
