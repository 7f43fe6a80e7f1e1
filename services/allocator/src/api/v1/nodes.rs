//! Node inventory endpoints and the node-scoped allocation alias.

use std::collections::BTreeSet;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{any, get},
    Json, Router,
};
use metalloc_events::ProvisionState;
use serde::Serialize;
use uuid::Uuid;

use super::allocations::{fail, AllocationResponse};
use crate::allocation::AllocationError;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::{NewNode, Node};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_nodes).post(enroll_node))
        .route("/{node}", get(get_node))
        .route(
            "/{node}/allocation",
            get(get_node_allocation)
                .delete(delete_node_allocation)
                .post(alias_not_allowed),
        )
        .route("/{node}/allocation/{ident}", any(alias_not_allowed))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct NodeResponse {
    pub uuid: Uuid,
    pub name: Option<String>,
    pub resource_class: String,
    pub traits: BTreeSet<String>,
    pub maintenance: bool,
    pub provision_state: ProvisionState,
    pub reservation_holder: Option<Uuid>,
    pub task_lock: Option<String>,
}

impl From<Node> for NodeResponse {
    fn from(node: Node) -> Self {
        Self {
            uuid: node.uuid,
            name: node.name,
            resource_class: node.resource_class,
            traits: node.traits,
            maintenance: node.maintenance,
            provision_state: node.provision_state,
            reservation_holder: node.reservation_holder,
            task_lock: node.task_lock,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListNodesResponse {
    pub nodes: Vec<NodeResponse>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn enroll_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    payload: Result<Json<NewNode>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(new) = payload.map_err(|e| {
        ApiError::bad_request("invalid_request", e.body_text())
            .with_request_id(ctx.request_id.to_string())
    })?;

    let node = state
        .service()
        .enroll_node(new)
        .await
        .map_err(|e| fail(e, &ctx))?;

    let location = format!("/v1/nodes/{}", node.uuid);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(NodeResponse::from(node)),
    ))
}

async fn list_nodes(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<ListNodesResponse>, ApiError> {
    let nodes = state
        .service()
        .list_nodes()
        .await
        .map_err(|e| fail(e, &ctx))?;

    Ok(Json(ListNodesResponse {
        nodes: nodes.into_iter().map(NodeResponse::from).collect(),
    }))
}

async fn get_node(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(node): Path<String>,
) -> Result<Json<NodeResponse>, ApiError> {
    let node = state
        .service()
        .get_node(&node)
        .await
        .map_err(|e| fail(e, &ctx))?;
    Ok(Json(node.into()))
}

async fn get_node_allocation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(node): Path<String>,
) -> Result<Json<AllocationResponse>, ApiError> {
    let view = state
        .service()
        .get_by_node(&node)
        .await
        .map_err(|e| fail(e, &ctx))?;
    Ok(Json(view.into()))
}

async fn delete_node_allocation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(node): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .service()
        .delete_by_node(&node, ctx.id())
        .await
        .map_err(|e| fail(e, &ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

/// The node alias is read/delete only and never addresses a specific
/// allocation.
async fn alias_not_allowed(ctx: RequestContext) -> ApiError {
    fail(
        AllocationError::MethodNotAllowed(
            "the node allocation alias only supports GET and DELETE without an allocation identity"
                .to_string(),
        ),
        &ctx,
    )
}
