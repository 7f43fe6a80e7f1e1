use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::allocation::AllocationError;

/// RFC 7807 problem document.
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://metalloc.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn method_not_allowed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::METHOD_NOT_ALLOWED, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    pub fn retryable(mut self) -> Self {
        self.problem.retryable = true;
        self
    }
}

impl From<AllocationError> for ApiError {
    fn from(err: AllocationError) -> Self {
        let message = err.to_string();
        match err {
            AllocationError::InvalidIdentity { .. } => {
                ApiError::bad_request("invalid_identity", message)
            }
            AllocationError::NotFound { .. } => ApiError::not_found("not_found", message),
            AllocationError::BadRequest(_) => ApiError::bad_request("invalid_request", message),
            AllocationError::Duplicate(_) => ApiError::conflict("duplicate", message),
            AllocationError::NodeLocked { .. } => {
                ApiError::conflict("node_locked", message).retryable()
            }
            AllocationError::MethodNotAllowed(_) => {
                ApiError::method_not_allowed("method_not_allowed", message)
            }
            // Matching errors land on the record; seeing one here is a bug.
            AllocationError::NoValidNode { .. }
            | AllocationError::ResourceClassNotFound(_)
            | AllocationError::Internal(_) => {
                tracing::error!(error = %message, "Internal error");
                ApiError::internal("internal_error", message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use uuid::Uuid;

    #[rstest]
    #[case(AllocationError::BadRequest("x".into()), StatusCode::BAD_REQUEST)]
    #[case(AllocationError::not_found("allocation", "a1"), StatusCode::NOT_FOUND)]
    #[case(AllocationError::Duplicate("x".into()), StatusCode::CONFLICT)]
    #[case(AllocationError::MethodNotAllowed("x".into()), StatusCode::METHOD_NOT_ALLOWED)]
    #[case(AllocationError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR)]
    fn test_status_mapping(#[case] err: AllocationError, #[case] status: StatusCode) {
        assert_eq!(ApiError::from(err).status, status);
    }

    #[test]
    fn test_node_locked_is_retryable_conflict() {
        let err = ApiError::from(AllocationError::NodeLocked {
            node: Uuid::nil(),
            lock: "deploy".into(),
        });
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert!(err.problem.retryable);
    }

    #[test]
    fn test_problem_content_type() {
        let response = ApiError::bad_request("invalid_request", "nope")
            .with_request_id("req_1")
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }
}
