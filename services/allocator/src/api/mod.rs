//! HTTP API handlers and routing.

pub mod error;
mod health;
pub mod request_context;
mod v1;

use axum::{
    http::{header, HeaderName, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::PropagateRequestIdLayer,
    trace::TraceLayer,
};

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(request_context::REQUEST_ID_HEADER),
        ])
        .allow_origin(Any);

    Router::new()
        .merge(health::routes())
        .nest("/v1", v1::routes())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::allocation::{AllocationService, DispatcherConfig};
    use crate::notify::NullNotifier;
    use crate::store::Storage;

    fn router() -> Router {
        let storage = Storage::memory();
        let service = AllocationService::new(
            &storage,
            Arc::new(NullNotifier),
            DispatcherConfig::default(),
        );
        create_router(AppState::new(Arc::new(service), storage))
    }

    #[tokio::test]
    async fn test_patch_is_method_not_allowed() {
        let response = router()
            .oneshot(
                Request::patch("/v1/allocations/alloc-1")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("[]"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/problem+json"
        );
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let request_id = metalloc_id::RequestId::new().to_string();
        let response = router()
            .oneshot(
                Request::get("/v1/allocations/missing")
                    .header(request_context::REQUEST_ID_HEADER, &request_id)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[request_context::REQUEST_ID_HEADER],
            request_id.as_str()
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let problem: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(problem["request_id"], request_id.as_str());
        assert_eq!(problem["code"], "not_found");
    }
}
