use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::{ErrorKind, NimbusError};

use super::ErrorResponse;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a REST handler.
pub type ApiResult<T> = Result<T, ApiError>;

/// A [`NimbusError`] on its way out of a REST handler.
#[derive(Debug)]
pub struct ApiError(pub NimbusError);

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The HTTP status an error kind is reported with.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::QuotaExceeded | ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::NotEnoughSpace => StatusCode::INSUFFICIENT_STORAGE,
        ErrorKind::CommandExit | ErrorKind::TemplateBuild => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn details_for(error: &NimbusError) -> Option<serde_json::Value> {
    match error {
        NimbusError::CommandExit {
            exit_code,
            stdout,
            stderr,
        } => Some(json!({ "exit_code": exit_code, "stdout": stdout, "stderr": stderr })),
        NimbusError::QuotaExceeded {
            resource,
            requested,
            available,
        } => Some(json!({ "resource": resource, "requested": requested, "available": available })),
        NimbusError::NotEnoughSpace { needed, available } => {
            Some(json!({ "needed": needed, "available": available }))
        }
        NimbusError::TemplateBuildFailed { logs, .. } => Some(json!({ "logs": logs })),
        NimbusError::VolumeInUse { sandboxes, .. } => Some(json!({ "sandboxes": sandboxes })),
        NimbusError::RateLimited { retry_after_ms } => {
            Some(json!({ "retry_after_ms": retry_after_ms }))
        }
        _ => None,
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<E> From<E> for ApiError
where
    E: Into<NimbusError>,
{
    fn from(error: E) -> Self {
        ApiError(error.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);

        let mut body = ErrorResponse::new(status.as_u16(), self.0.to_string(), kind);
        if status.is_server_error() && kind == ErrorKind::Internal {
            tracing::error!(error = %self.0, "request failed");
            body.message = "internal server error".to_string();
        } else if let Some(details) = details_for(&self.0) {
            body = body.with_details(details);
        }

        let mut response = (status, Json(body)).into_response();
        if let NimbusError::RateLimited { retry_after_ms } = &self.0 {
            let secs = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
