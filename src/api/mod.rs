//! HTTP API
//!
//! Thin adapter over the replicated store: every local mutation is written
//! to the store and then queued for gossip with its write time.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::{
    mesh::{Cluster, MutationMessage, Node, ReplicatedStore, StoredValue},
    version::VersionResponse,
};

#[derive(Clone)]
pub struct AppState {
    pub store: ReplicatedStore,
    pub cluster: Arc<Cluster>,
}

impl AppState {
    pub fn new(store: ReplicatedStore, cluster: Arc<Cluster>) -> Self {
        Self { store, cluster }
    }
}

#[derive(Debug, Serialize)]
pub struct MembersResponse {
    pub local: Node,
    pub live_nodes: usize,
    pub members: Vec<Node>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/version", get(version))
        .route("/_cluster/members", get(members))
        .route("/_store/export", get(export))
        .route("/{key}", get(get_key).delete(delete_key))
        .route("/{key}/{value}", put(set_key))
        .with_state(state)
}

async fn set_key(
    State(state): State<AppState>,
    Path((key, value)): Path<(String, String)>,
) -> Json<BTreeMap<String, String>> {
    debug!(%key, "set");
    let at = state.store.set(key.clone(), value.clone());
    state
        .cluster
        .queue_broadcast(&MutationMessage::set(key.clone(), value.clone()).with_timestamp(at));
    Json(BTreeMap::from([(key, value)]))
}

async fn get_key(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    debug!(%key, "get");
    match state.store.get(&key) {
        Some(value) => Json(BTreeMap::from([(key, value)])).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn delete_key(State(state): State<AppState>, Path(key): Path<String>) -> StatusCode {
    debug!(%key, "delete");
    let at = Utc::now();
    state.store.delete_if_not_newer(&key, at);
    state
        .cluster
        .queue_broadcast(&MutationMessage::delete(key).with_timestamp(at));
    StatusCode::OK
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse::current())
}

async fn members(State(state): State<AppState>) -> Json<MembersResponse> {
    Json(MembersResponse {
        local: state.cluster.local_node().clone(),
        live_nodes: state.cluster.live_nodes(),
        members: state.cluster.members(),
    })
}

async fn export(State(state): State<AppState>) -> Json<BTreeMap<String, StoredValue>> {
    Json(state.store.export())
}
