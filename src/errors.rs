use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Engine error taxonomy.
///
/// Record-level failures (`InvalidInput`, `JobTimeout`, `SchemaDrift`,
/// exhausted `TransientProvider`) are captured on output rows and never
/// escape the batch boundary. Pipeline-level failures (`Permission`,
/// `Config`) propagate to the caller as a single failure.
#[derive(Debug)]
pub enum EngineError {
    /// Malformed address/name combination; record excluded from submission.
    InvalidInput(String),
    /// 5xx / 429 / network failure; retried with backoff before surfacing.
    TransientProvider(String),
    /// 401/403-class response; systemic misconfiguration, never retried.
    Permission(String),
    /// Job exceeded its poll budget.
    JobTimeout { job_id: String, attempts: u32 },
    /// Provider response shape did not match the expected nested structure.
    SchemaDrift(String),
    /// Non-retryable provider error outside the classes above.
    ExternalApi(String),
    /// Fatal configuration error.
    Config(String),
    /// Caller-requested cancellation observed between chunks or polls.
    Cancelled,
    /// Internal invariant violation.
    Internal(String),
    /// Error with context chain for better debugging.
    WithContext {
        source: Box<EngineError>,
        context: String,
    },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            EngineError::TransientProvider(msg) => write!(f, "Transient provider error: {}", msg),
            EngineError::Permission(msg) => write!(f, "Permission error: {}", msg),
            EngineError::JobTimeout { job_id, attempts } => {
                write!(f, "Job {} timed out after {} poll attempts", job_id, attempts)
            }
            EngineError::SchemaDrift(msg) => write!(f, "Schema drift: {}", msg),
            EngineError::ExternalApi(msg) => write!(f, "External API error: {}", msg),
            EngineError::Config(msg) => write!(f, "Config error: {}", msg),
            EngineError::Cancelled => f.write_str("Cancelled by caller"),
            EngineError::Internal(msg) => write!(f, "Internal error: {}", msg),
            EngineError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Whether the error class warrants another attempt with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::TransientProvider(_) => true,
            EngineError::WithContext { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Whether the error represents a provider response whose shape did
    /// not decode, as opposed to a legitimate empty or failed lookup.
    pub fn is_schema_drift(&self) -> bool {
        match self {
            EngineError::SchemaDrift(_) => true,
            EngineError::WithContext { source, .. } => source.is_schema_drift(),
            _ => false,
        }
    }

    /// Whether the error must stop submission of further chunks.
    pub fn is_pipeline_fatal(&self) -> bool {
        match self {
            EngineError::Permission(_) | EngineError::Config(_) => true,
            EngineError::WithContext { source, .. } => source.is_pipeline_fatal(),
            _ => false,
        }
    }
}

impl IntoResponse for EngineError {
    /// Maps each variant onto the webhook receiver's HTTP surface.
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            EngineError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            EngineError::SchemaDrift(msg) => {
                tracing::warn!("Schema drift in delivery payload: {}", msg);
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone())
            }
            EngineError::Permission(msg) => {
                tracing::warn!("Unauthorized delivery: {}", msg);
                (StatusCode::UNAUTHORIZED, "Unauthorized".to_string())
            }
            EngineError::WithContext { source, context } => {
                tracing::error!("Error with context: {} -> {}", context, source);
                return source.clone().into_response();
            }
            other => {
                tracing::error!("Internal error on webhook surface: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl Clone for EngineError {
    fn clone(&self) -> Self {
        match self {
            EngineError::InvalidInput(msg) => EngineError::InvalidInput(msg.clone()),
            EngineError::TransientProvider(msg) => EngineError::TransientProvider(msg.clone()),
            EngineError::Permission(msg) => EngineError::Permission(msg.clone()),
            EngineError::JobTimeout { job_id, attempts } => EngineError::JobTimeout {
                job_id: job_id.clone(),
                attempts: *attempts,
            },
            EngineError::SchemaDrift(msg) => EngineError::SchemaDrift(msg.clone()),
            EngineError::ExternalApi(msg) => EngineError::ExternalApi(msg.clone()),
            EngineError::Config(msg) => EngineError::Config(msg.clone()),
            EngineError::Cancelled => EngineError::Cancelled,
            EngineError::Internal(msg) => EngineError::Internal(msg.clone()),
            EngineError::WithContext { source, context } => EngineError::WithContext {
                source: source.clone(),
                context: context.clone(),
            },
        }
    }
}

impl From<reqwest::Error> for EngineError {
    /// Network-level failures are transient by classification; the caller
    /// inspects HTTP statuses separately before bodies are decoded.
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            EngineError::TransientProvider(err.to_string())
        } else {
            EngineError::ExternalApi(err.to_string())
        }
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `EngineError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, EngineError>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F>(self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, EngineError> {
    fn context(self, context: impl Into<String>) -> Result<T, EngineError> {
        self.map_err(|e| EngineError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| EngineError::WithContext {
            source: Box::new(e),
            context: f(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(EngineError::TransientProvider("503".into()).is_retryable());
        assert!(!EngineError::Permission("403".into()).is_retryable());
        assert!(!EngineError::SchemaDrift("bad shape".into()).is_retryable());

        let wrapped: Result<(), _> =
            Err::<(), _>(EngineError::TransientProvider("429".into())).context("submitting chunk");
        assert!(wrapped.unwrap_err().is_retryable());
    }

    #[test]
    fn pipeline_fatal_classification() {
        assert!(EngineError::Permission("401".into()).is_pipeline_fatal());
        assert!(EngineError::Config("missing key".into()).is_pipeline_fatal());
        assert!(!EngineError::TransientProvider("502".into()).is_pipeline_fatal());
        assert!(!EngineError::JobTimeout {
            job_id: "j1".into(),
            attempts: 5
        }
        .is_pipeline_fatal());
    }

    #[test]
    fn display_includes_context_chain() {
        let err: Result<(), _> =
            Err::<(), _>(EngineError::ExternalApi("boom".into())).context("retrieving job");
        let display = format!("{}", err.unwrap_err());
        assert!(display.contains("retrieving job"));
        assert!(display.contains("boom"));
    }
}
