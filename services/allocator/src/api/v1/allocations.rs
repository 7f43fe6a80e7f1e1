//! Allocation API endpoints.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use metalloc_events::AllocationState;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::allocation::AllocationError;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::model::{AllocationRequest, AllocationView, ListQuery};
use crate::state::AppState;

/// Fields clients may read but never set.
const SERVER_MANAGED_FIELDS: &[&str] = &[
    "id",
    "node_id",
    "node_uuid",
    "state",
    "last_error",
    "created_at",
    "updated_at",
];

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_allocations).post(create_allocation))
        .route(
            "/{ident}",
            get(get_allocation)
                .delete(delete_allocation)
                .patch(update_allocation),
        )
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// An allocation as returned to clients.
///
/// The numeric node id stays internal; clients see the node UUID.
#[derive(Debug, Serialize)]
pub struct AllocationResponse {
    pub uuid: Uuid,
    pub name: Option<String>,
    pub state: AllocationState,
    pub node_uuid: Option<Uuid>,
    pub resource_class: String,
    pub traits: Vec<String>,
    pub candidate_nodes: Vec<Uuid>,
    pub extra: Map<String, Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<AllocationView> for AllocationResponse {
    fn from(view: AllocationView) -> Self {
        let a = view.allocation;
        Self {
            uuid: a.uuid,
            name: a.name,
            state: a.state,
            node_uuid: view.node_uuid,
            resource_class: a.resource_class,
            traits: a.traits,
            candidate_nodes: a.candidate_nodes,
            extra: a.extra,
            last_error: a.last_error,
            created_at: a.created_at,
            updated_at: a.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListAllocationsResponse {
    pub allocations: Vec<AllocationResponse>,
}

/// Parses a create body, naming any server-managed field it sets.
fn parse_create_body(body: Value) -> Result<AllocationRequest, ApiError> {
    let Value::Object(fields) = &body else {
        return Err(ApiError::bad_request(
            "invalid_request",
            "request body must be a JSON object",
        ));
    };

    let managed: Vec<&str> = fields
        .keys()
        .map(String::as_str)
        .filter(|k| SERVER_MANAGED_FIELDS.contains(k))
        .collect();
    if !managed.is_empty() {
        return Err(ApiError::bad_request(
            "invalid_request",
            format!(
                "Cannot create an allocation with server-managed field(s): {}",
                managed.join(", ")
            ),
        ));
    }

    serde_json::from_value(body).map_err(|e| ApiError::bad_request("invalid_request", e.to_string()))
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_allocation(
    State(state): State<AppState>,
    ctx: RequestContext,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id.to_string();

    let Json(body) = payload.map_err(|e| {
        ApiError::bad_request("invalid_json", e.body_text()).with_request_id(request_id.clone())
    })?;
    let request = parse_create_body(body).map_err(|e| e.with_request_id(request_id.clone()))?;

    let view = state
        .service()
        .create(request, ctx.id())
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id))?;

    let location = format!("/v1/allocations/{}", view.allocation.uuid);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(AllocationResponse::from(view)),
    ))
}

async fn list_allocations(
    State(state): State<AppState>,
    ctx: RequestContext,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<ListAllocationsResponse>, ApiError> {
    let request_id = ctx.request_id.to_string();
    let Query(query) = query.map_err(|e| {
        ApiError::bad_request("invalid_query", e.body_text()).with_request_id(request_id.clone())
    })?;

    let views = state
        .service()
        .list(query)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id))?;

    Ok(Json(ListAllocationsResponse {
        allocations: views.into_iter().map(AllocationResponse::from).collect(),
    }))
}

async fn get_allocation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(ident): Path<String>,
) -> Result<Json<AllocationResponse>, ApiError> {
    let view = state
        .service()
        .get(&ident)
        .await
        .map_err(|e| fail(e, &ctx))?;
    Ok(Json(view.into()))
}

async fn delete_allocation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(ident): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .service()
        .delete(&ident, ctx.id())
        .await
        .map_err(|e| fail(e, &ctx))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_allocation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(ident): Path<String>,
) -> Result<Json<AllocationResponse>, ApiError> {
    let view = state
        .service()
        .update(&ident)
        .map_err(|e| fail(e, &ctx))?;
    Ok(Json(view.into()))
}

pub(super) fn fail(err: AllocationError, ctx: &RequestContext) -> ApiError {
    ApiError::from(err).with_request_id(ctx.request_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_managed_fields_are_named() {
        let err = parse_create_body(json!({
            "resource_class": "baremetal",
            "node_uuid": "1a1a1a1a-2b2b-3c3c-4d4d-5e5e5e5e5e5e",
        }))
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.problem.detail.contains("node_uuid"));
    }

    #[test]
    fn test_non_object_body() {
        let err = parse_create_body(json!(["baremetal"])).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = parse_create_body(json!({"resource_class": "x", "colour": "red"})).unwrap_err();
        assert!(err.problem.detail.contains("colour"));
    }

    #[test]
    fn test_valid_body() {
        let request = parse_create_body(json!({
            "resource_class": "baremetal",
            "traits": ["CUSTOM_GPU"],
            "extra": {"owner": "ops"},
        }))
        .unwrap();
        assert_eq!(request.resource_class.as_deref(), Some("baremetal"));
        assert_eq!(request.extra["owner"], "ops");
    }
}
