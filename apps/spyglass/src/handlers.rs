use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::filters::{self, SearchPayload};
use crate::query;
use crate::AppState;

/// Every discovery response rides the same `{"data": ...}` envelope.
fn respond(data: Value) -> Json<Value> {
    Json(json!({ "data": data }))
}

fn active_filter(payload: &SearchPayload) -> Option<&filters::FilterMap> {
    payload.has_filter().then_some(&payload.filter)
}

/// GET /health
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /sockets-list
pub async fn list_all(State(state): State<AppState>) -> Json<Value> {
    list_all_inner(&state, SearchPayload::default()).await
}

/// POST /sockets-list
pub async fn list_all_filtered(
    State(state): State<AppState>,
    Json(payload): Json<SearchPayload>,
) -> Json<Value> {
    list_all_inner(&state, payload).await
}

async fn list_all_inner(state: &AppState, payload: SearchPayload) -> Json<Value> {
    debug!("listing all available sessions");
    let sessions = query::sessions_by_project(&state.registry, active_filter(&payload)).await;
    respond(json!(sessions))
}

/// GET /sockets-list/:project_key
pub async fn list_for_project(
    State(state): State<AppState>,
    Path(project_key): Path<String>,
) -> Json<Value> {
    list_project_inner(&state, project_key, None, SearchPayload::default()).await
}

/// POST /sockets-list/:project_key
pub async fn list_for_project_filtered(
    State(state): State<AppState>,
    Path(project_key): Path<String>,
    Json(payload): Json<SearchPayload>,
) -> Json<Value> {
    list_project_inner(&state, project_key, None, payload).await
}

/// GET /sockets-list/:project_key/:session_id
pub async fn list_for_session(
    State(state): State<AppState>,
    Path((project_key, session_id)): Path<(String, String)>,
) -> Json<Value> {
    list_project_inner(&state, project_key, Some(session_id), SearchPayload::default()).await
}

async fn list_project_inner(
    state: &AppState,
    project_key: String,
    session_id: Option<String>,
    payload: SearchPayload,
) -> Json<Value> {
    debug!(%project_key, "listing available sessions for project");
    let sessions = query::sessions_for_project(
        &state.registry,
        &project_key,
        session_id.as_deref(),
        active_filter(&payload),
    )
    .await;

    match session_id {
        // "Is this one session live": first match or null.
        Some(_) => respond(sessions.into_iter().next().map(Value::String).unwrap_or(Value::Null)),
        None => {
            let items = sessions.into_iter().map(Value::String).collect();
            respond(Value::Array(filters::sort_paginate(items, &payload)))
        }
    }
}

/// GET /sockets-live
pub async fn live_all(State(state): State<AppState>) -> Json<Value> {
    live_all_inner(&state, SearchPayload::default()).await
}

/// POST /sockets-live
pub async fn live_all_filtered(
    State(state): State<AppState>,
    Json(payload): Json<SearchPayload>,
) -> Json<Value> {
    live_all_inner(&state, payload).await
}

async fn live_all_inner(state: &AppState, payload: SearchPayload) -> Json<Value> {
    debug!("listing all live sessions");
    let per_project =
        query::live_sessions_by_project(&state.registry, active_filter(&payload)).await;
    let data: Map<String, Value> = per_project
        .into_iter()
        .map(|(project, infos)| {
            (project, Value::Array(filters::sort_paginate(infos, &payload)))
        })
        .collect();
    respond(Value::Object(data))
}

/// GET /sockets-live/:project_key
pub async fn live_for_project(
    State(state): State<AppState>,
    Path(project_key): Path<String>,
) -> Json<Value> {
    live_project_inner(&state, project_key, None, SearchPayload::default()).await
}

/// POST /sockets-live/:project_key
pub async fn live_for_project_filtered(
    State(state): State<AppState>,
    Path(project_key): Path<String>,
    Json(payload): Json<SearchPayload>,
) -> Json<Value> {
    live_project_inner(&state, project_key, None, payload).await
}

/// GET /sockets-live/:project_key/:session_id
pub async fn live_for_session(
    State(state): State<AppState>,
    Path((project_key, session_id)): Path<(String, String)>,
) -> Json<Value> {
    live_project_inner(&state, project_key, Some(session_id), SearchPayload::default()).await
}

async fn live_project_inner(
    state: &AppState,
    project_key: String,
    session_id: Option<String>,
    payload: SearchPayload,
) -> Json<Value> {
    debug!(%project_key, "listing live sessions for project");
    let infos = query::live_sessions_for_project(
        &state.registry,
        &project_key,
        session_id.as_deref(),
        active_filter(&payload),
    )
    .await;

    match session_id {
        Some(_) => respond(infos.into_iter().next().unwrap_or(Value::Null)),
        None => respond(Value::Array(filters::sort_paginate(infos, &payload))),
    }
}

/// GET /sockets-list/:project_key/autocomplete (also mounted under
/// /sockets-live). The raw query string is the autocomplete query: attribute
/// name substrings to look for.
pub async fn autocomplete(
    State(state): State<AppState>,
    Path(project_key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    debug!(%project_key, "autocomplete");
    let payload = SearchPayload {
        query: params,
        ..SearchPayload::default()
    };
    let values = query::autocomplete(&state.registry, &project_key, &payload.query).await;
    respond(json!(values))
}
