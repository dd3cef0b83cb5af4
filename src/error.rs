use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the Warden pool
#[derive(Error, Debug)]
pub enum WardenError {
    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database connection failed: {0}")]
    DatabaseConnection(String),

    // Probe errors
    #[error("TCP connect failed: {0}")]
    TcpConnectFailure(String),

    #[error("HTTP request through proxy timed out")]
    HttpTimeout,

    #[error("Proxy protocol error: {0}")]
    ProxyProtocolError(String),

    // Assignment errors
    #[error("No available proxy matches the requested constraints")]
    AssignmentExhausted,

    #[error("Account {account_id} holds no proxy assignment")]
    NotAssigned { account_id: String },

    #[error("Proxy {key} was modified concurrently")]
    ConcurrentModification { key: String },

    // Registry errors
    #[error("Proxy not found: {key}")]
    ProxyNotFound { key: String },

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

impl WardenError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            WardenError::InvalidRequest(_)
            | WardenError::InvalidProxyAddress(_)
            | WardenError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 404 Not Found
            WardenError::ProxyNotFound { .. } | WardenError::NotAssigned { .. } => {
                StatusCode::NOT_FOUND
            }

            // 409 Conflict
            WardenError::ConcurrentModification { .. } => StatusCode::CONFLICT,

            // 502 Bad Gateway
            WardenError::TcpConnectFailure(_)
            | WardenError::ProxyProtocolError(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            WardenError::AssignmentExhausted | WardenError::DatabaseConnection(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // 504 Gateway Timeout
            WardenError::HttpTimeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            WardenError::Database(_)
            | WardenError::Io(_)
            | WardenError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The store could not be reached, as opposed to rejecting a statement
    pub fn is_connection_error(&self) -> bool {
        match self {
            WardenError::DatabaseConnection(_) => true,
            WardenError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl IntoResponse for WardenError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

impl From<reqwest::Error> for WardenError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WardenError::HttpTimeout
        } else {
            WardenError::ProxyProtocolError(err.to_string())
        }
    }
}

impl From<url::ParseError> for WardenError {
    fn from(err: url::ParseError) -> Self {
        WardenError::InvalidConfig(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            WardenError::InvalidRequest("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            WardenError::InvalidProxyAddress("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            WardenError::ProxyNotFound {
                key: "1.2.3.4:80".to_string()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            WardenError::ConcurrentModification {
                key: "1.2.3.4:80".to_string()
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            WardenError::AssignmentExhausted.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            WardenError::HttpTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            WardenError::TcpConnectFailure("refused".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_client_server_helpers() {
        assert!(WardenError::InvalidRequest("bad".to_string()).is_client_error());
        assert!(!WardenError::InvalidRequest("bad".to_string()).is_server_error());

        assert!(WardenError::AssignmentExhausted.is_server_error());
        assert!(!WardenError::AssignmentExhausted.is_client_error());
    }

    #[test]
    fn test_connection_errors_are_told_apart_from_rejections() {
        assert!(WardenError::DatabaseConnection("down".to_string()).is_connection_error());
        assert!(WardenError::Database(sqlx::Error::PoolTimedOut).is_connection_error());
        assert!(!WardenError::Database(sqlx::Error::Protocol("value too long".to_string()))
            .is_connection_error());
        assert!(!WardenError::InvalidRequest("bad".to_string()).is_connection_error());
    }
}
