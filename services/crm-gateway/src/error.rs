//! Client-facing error responses
//!
//! Every failure becomes `{"error": <code>}` plus, where it is safe, a
//! `message`. Credential and OAuth failures only ever report their code: the
//! detail is logged where the error arises. Rate limiting adds `Retry-After`.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

#[derive(Debug)]
pub enum ApiError {
    Access(tenant_access::Error),
    Operation(operations::Error),
    BadRequest(String),
}

impl From<tenant_access::Error> for ApiError {
    fn from(err: tenant_access::Error) -> Self {
        ApiError::Access(err)
    }
}

impl From<operations::Error> for ApiError {
    fn from(err: operations::Error) -> Self {
        ApiError::Operation(err)
    }
}

impl From<tenant_store::Error> for ApiError {
    fn from(err: tenant_store::Error) -> Self {
        ApiError::Access(err.into())
    }
}

struct Rendered {
    status: StatusCode,
    code: &'static str,
    message: Option<String>,
    retry_after: Option<u64>,
}

impl ApiError {
    fn render(&self) -> Rendered {
        use operations::Error as Op;
        use tenant_access::Error as Access;

        let mut out = Rendered {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: None,
            retry_after: None,
        };
        match self {
            ApiError::Access(err) => {
                out.code = err.reason();
                out.status = match err {
                    Access::MalformedKey | Access::InvalidKey => StatusCode::UNAUTHORIZED,
                    Access::QuotaExceeded => StatusCode::PAYMENT_REQUIRED,
                    Access::RateLimited { retry_after_secs } => {
                        out.retry_after = Some(*retry_after_secs);
                        out.message = Some(err.to_string());
                        StatusCode::TOO_MANY_REQUESTS
                    }
                    Access::CredentialUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                    Access::OAuthRejected(_) => StatusCode::BAD_REQUEST,
                    Access::ExchangeFailed(_) => StatusCode::BAD_GATEWAY,
                    Access::InstallFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    Access::InvalidRequest(msg) => {
                        out.message = Some(msg.clone());
                        StatusCode::BAD_REQUEST
                    }
                    Access::NotFound(_) => StatusCode::NOT_FOUND,
                    Access::Conflict(_) => {
                        out.message = Some("resource already exists".into());
                        StatusCode::CONFLICT
                    }
                    Access::Store(msg) => {
                        error!(error = %msg, "store failure");
                        out.code = "internal_error";
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
            }
            ApiError::Operation(err) => {
                out.status = StatusCode::from_u16(err.status_code())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                out.code = match err {
                    Op::UnknownOperation(_) => "unknown_operation",
                    Op::PermissionDenied { .. } => "permission_denied",
                    Op::InvalidParams(_) => "invalid_params",
                    Op::Upstream { .. } => "upstream_error",
                    Op::Transport(_) if out.status == StatusCode::GATEWAY_TIMEOUT => {
                        "upstream_timeout"
                    }
                    Op::Transport(_) => "upstream_unavailable",
                    Op::Catalog(_) => "internal_error",
                };
                out.message = match err {
                    Op::UnknownOperation(_) | Op::PermissionDenied { .. } | Op::InvalidParams(_) => {
                        Some(err.to_string())
                    }
                    // The CRM's own rejection of the tenant's input.
                    Op::Upstream { status, body } if (400..500).contains(status) => {
                        Some(body.clone())
                    }
                    _ => None,
                };
            }
            ApiError::BadRequest(msg) => {
                out.status = StatusCode::BAD_REQUEST;
                out.code = "invalid_request";
                out.message = Some(msg.clone());
            }
        }
        out
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let rendered = self.render();
        let mut body = json!({ "error": rendered.code });
        if let Some(message) = rendered.message {
            body["message"] = json!(message);
        }
        if let Some(secs) = rendered.retry_after {
            body["retry_after_secs"] = json!(secs);
        }

        let mut response = (rendered.status, Json(body)).into_response();
        if let Some(secs) = rendered.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
