//! Error types for llm-bridge.
//!
//! Every failure a client can observe is rendered through [`Error`]'s
//! `IntoResponse` impl as an OpenAI-style `{"error": {...}}` body. Upstream
//! failures carry an [`ErrorClassification`] whose message is already masked;
//! raw provider text never reaches the response body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::proxy::classify::ErrorClassification;

/// Result type alias for llm-bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Client-visible failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    AuthenticationError,
    RateLimitError,
    TimeoutError,
    ServiceUnavailable,
    ModelNotFound,
    ConfigurationError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::AuthenticationError => "authentication_error",
            ErrorKind::RateLimitError => "rate_limit_error",
            ErrorKind::TimeoutError => "timeout_error",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::ModelNotFound => "model_not_found",
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::InternalError => "internal_error",
        }
    }

    /// HTTP status used when this kind is returned to a client.
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::AuthenticationError => StatusCode::UNAUTHORIZED,
            ErrorKind::RateLimitError => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::TimeoutError => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::ModelNotFound => StatusCode::NOT_FOUND,
            ErrorKind::ConfigurationError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for llm-bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A feature the request needs is not set up on this instance.
    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Model '{model}' not found")]
    UnknownModel { model: String },

    #[error("Model '{model}' is not available on endpoint '{endpoint}'")]
    EndpointUnavailable {
        model: String,
        endpoint: String,
        alternatives: Vec<String>,
    },

    #[error("Service {service} is temporarily unavailable")]
    CircuitOpen {
        service: String,
        model: String,
        consecutive_failures: u32,
        last_error: Option<String>,
    },

    #[error("Upstream {service} request failed for model '{model}'")]
    Upstream {
        classification: ErrorClassification,
        service: String,
        model: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotConfigured(_) => ErrorKind::ConfigurationError,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::UnknownModel { .. } => ErrorKind::InvalidRequest,
            Error::EndpointUnavailable { .. } => ErrorKind::InvalidRequest,
            Error::CircuitOpen { .. } => ErrorKind::ServiceUnavailable,
            Error::Upstream { classification, .. } => classification.kind,
            Error::Internal(_) => ErrorKind::InternalError,
            Error::Database(_) => ErrorKind::InternalError,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::Upstream { classification, .. } => {
                StatusCode::from_u16(classification.http_status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            other => other.kind().status(),
        }
    }

    /// Message safe to show a client.
    fn client_message(&self) -> String {
        match self {
            Error::NotConfigured(_) => {
                "Service configuration error. Please contact the administrator.".to_string()
            }
            Error::InvalidRequest(msg) => msg.clone(),
            Error::UnknownModel { model } => format!(
                "Model '{}' not found. Use GET /v1/models to list available models.",
                model
            ),
            Error::EndpointUnavailable {
                model,
                alternatives,
                ..
            } => {
                if alternatives.is_empty() {
                    format!("Model '{}' is not available on this endpoint.", model)
                } else {
                    format!(
                        "Model '{}' is not available on this endpoint. Please use the {} endpoint instead.",
                        model,
                        alternatives.join(" or ")
                    )
                }
            }
            Error::CircuitOpen { service, .. } => format!(
                "Service temporarily unavailable: {}. Please try again later.",
                service
            ),
            Error::Upstream { classification, .. } => classification.client_message.clone(),
            Error::Internal(_) | Error::Database(_) => "Internal server error occurred.".to_string(),
        }
    }
}

fn error_body(
    kind: ErrorKind,
    status: StatusCode,
    message: &str,
    service: Option<&str>,
    model: Option<&str>,
) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "message": message,
            "type": kind.as_str(),
            "code": status.as_u16(),
            "service": service,
            "model": model,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }
    })
}

impl Error {
    /// OpenAI-style `{"error": {...}}` body, shared by HTTP responses and
    /// SSE error frames.
    pub fn body(&self) -> serde_json::Value {
        let (service, model) = match self {
            Error::UnknownModel { model } => (None, Some(model.as_str())),
            Error::EndpointUnavailable { model, .. } => (None, Some(model.as_str())),
            Error::CircuitOpen { service, model, .. } | Error::Upstream { service, model, .. } => {
                (Some(service.as_str()), Some(model.as_str()))
            }
            _ => (None, None),
        };

        let mut body = error_body(
            self.kind(),
            self.status(),
            &self.client_message(),
            service,
            model,
        );

        match self {
            Error::CircuitOpen {
                consecutive_failures,
                last_error,
                ..
            } => {
                body["error"]["details"] = serde_json::json!({
                    "consecutive_failures": consecutive_failures,
                    "last_error": last_error,
                });
            }
            Error::EndpointUnavailable {
                endpoint,
                alternatives,
                ..
            } => {
                body["error"]["details"] = serde_json::json!({
                    "endpoint": endpoint,
                    "available_endpoints": alternatives,
                });
            }
            _ => {}
        }

        body
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::NotConfigured(what) => tracing::error!(%what, "Configuration error"),
            Error::Internal(e) => tracing::error!(error = %e, "Internal error"),
            Error::Database(e) => tracing::error!(error = %e, "Database error"),
            _ => {}
        }

        (self.status(), axum::Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_internal_error_is_masked() {
        let response = Error::Internal("db password is hunter2".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "internal_error");
        assert_eq!(body["error"]["message"], "Internal server error occurred.");
        assert!(!body.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn test_circuit_open_carries_details() {
        let response = Error::CircuitOpen {
            service: "openai".to_string(),
            model: "gpt-4o".to_string(),
            consecutive_failures: 5,
            last_error: Some("rate_limit_error".to_string()),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "service_unavailable");
        assert_eq!(body["error"]["service"], "openai");
        assert_eq!(body["error"]["model"], "gpt-4o");
        assert_eq!(body["error"]["details"]["consecutive_failures"], 5);
        assert_eq!(body["error"]["details"]["last_error"], "rate_limit_error");
    }

    #[tokio::test]
    async fn test_endpoint_unavailable_names_alternatives() {
        let response = Error::EndpointUnavailable {
            model: "coder".to_string(),
            endpoint: "general".to_string(),
            alternatives: vec!["code".to_string()],
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "invalid_request");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("use the code endpoint"));
    }

    #[tokio::test]
    async fn test_unattributed_error_has_null_service_and_model() {
        let body = body_json(Error::InvalidRequest("bad json".to_string()).into_response()).await;
        let error = body["error"].as_object().unwrap();
        assert_eq!(error["service"], serde_json::Value::Null);
        assert_eq!(error["model"], serde_json::Value::Null);
        assert_eq!(error["message"], "bad json");

        let body = body_json(
            Error::UnknownModel {
                model: "gpt-5".to_string(),
            }
            .into_response(),
        )
        .await;
        assert!(body["error"]["service"].is_null());
        assert_eq!(body["error"]["model"], "gpt-5");
    }

    #[tokio::test]
    async fn test_not_configured_is_configuration_error() {
        let response = Error::NotConfigured("usage database".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "configuration_error");
        assert!(!body.to_string().contains("usage database"));
    }

    #[test]
    fn test_kind_statuses() {
        assert_eq!(ErrorKind::AuthenticationError.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::RateLimitError.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorKind::TimeoutError.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ErrorKind::ModelNotFound.status(), StatusCode::NOT_FOUND);
    }
}
