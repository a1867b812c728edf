use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KinveyErrorCode {
    InvalidArgument,
    Internal,
    Network,
    NotFound,
    PermissionDenied,
    Unauthenticated,
    UnsupportedQuery,
    NotRegistered,
    CacheCorruption,
    OperationInProgress,
    Cancelled,
}

impl KinveyErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            KinveyErrorCode::InvalidArgument => "kinvey/invalid-argument",
            KinveyErrorCode::Internal => "kinvey/internal",
            KinveyErrorCode::Network => "kinvey/network",
            KinveyErrorCode::NotFound => "kinvey/not-found",
            KinveyErrorCode::PermissionDenied => "kinvey/permission-denied",
            KinveyErrorCode::Unauthenticated => "kinvey/unauthenticated",
            KinveyErrorCode::UnsupportedQuery => "kinvey/unsupported-query",
            KinveyErrorCode::NotRegistered => "kinvey/not-registered",
            KinveyErrorCode::CacheCorruption => "kinvey/cache-corruption",
            KinveyErrorCode::OperationInProgress => "kinvey/operation-in-progress",
            KinveyErrorCode::Cancelled => "kinvey/cancelled",
        }
    }
}

/// Error returned by every fallible operation of the SDK.
///
/// `status` carries the HTTP status when the failure came back from the backend, and
/// `reason` the backend's machine-readable error name (for example
/// `ParameterValueOutOfRange`) when the response body provided one.
#[derive(Clone, Debug)]
pub struct KinveyError {
    pub code: KinveyErrorCode,
    message: String,
    status: Option<u16>,
    reason: Option<String>,
}

impl KinveyError {
    pub fn new(code: KinveyErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
            reason: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

impl Display for KinveyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for KinveyError {}

impl From<serde_json::Error> for KinveyError {
    fn from(err: serde_json::Error) -> Self {
        invalid_argument(format!("JSON conversion failed: {err}"))
    }
}

pub type KinveyResult<T> = Result<T, KinveyError>;

pub fn invalid_argument(message: impl Into<String>) -> KinveyError {
    KinveyError::new(KinveyErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> KinveyError {
    KinveyError::new(KinveyErrorCode::Internal, message)
}

pub fn network_error(message: impl Into<String>) -> KinveyError {
    KinveyError::new(KinveyErrorCode::Network, message)
}

pub fn not_found(message: impl Into<String>) -> KinveyError {
    KinveyError::new(KinveyErrorCode::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> KinveyError {
    KinveyError::new(KinveyErrorCode::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> KinveyError {
    KinveyError::new(KinveyErrorCode::Unauthenticated, message)
}

pub fn unsupported_query(message: impl Into<String>) -> KinveyError {
    KinveyError::new(KinveyErrorCode::UnsupportedQuery, message)
}

pub fn not_registered(message: impl Into<String>) -> KinveyError {
    KinveyError::new(KinveyErrorCode::NotRegistered, message)
}

pub fn cache_corruption(message: impl Into<String>) -> KinveyError {
    KinveyError::new(KinveyErrorCode::CacheCorruption, message)
}

pub fn operation_in_progress(message: impl Into<String>) -> KinveyError {
    KinveyError::new(KinveyErrorCode::OperationInProgress, message)
}

pub fn cancelled(message: impl Into<String>) -> KinveyError {
    KinveyError::new(KinveyErrorCode::Cancelled, message)
}

/// Maps an HTTP status returned by the backend onto the SDK error taxonomy.
pub fn from_http_status(status: u16, reason: Option<String>, description: Option<String>) -> KinveyError {
    let message = description
        .clone()
        .or_else(|| reason.clone())
        .unwrap_or_else(|| format!("request failed with status {status}"));
    let error = match status {
        400 | 422 => invalid_argument(message),
        401 | 403 => permission_denied(message),
        404 => not_found(message),
        _ => network_error(message),
    }
    .with_status(status);
    match reason {
        Some(reason) => error.with_reason(reason),
        None => error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code() {
        let err = not_registered("Active user not registered for realtime");
        assert_eq!(
            err.to_string(),
            "Active user not registered for realtime (kinvey/not-registered)"
        );
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(
            from_http_status(403, None, None).code,
            KinveyErrorCode::PermissionDenied
        );
        assert_eq!(from_http_status(404, None, None).code, KinveyErrorCode::NotFound);
        let err = from_http_status(
            400,
            Some("ParameterValueOutOfRange".into()),
            Some("since is too old".into()),
        );
        assert_eq!(err.code, KinveyErrorCode::InvalidArgument);
        assert_eq!(err.status(), Some(400));
        assert_eq!(err.reason(), Some("ParameterValueOutOfRange"));
        assert_eq!(err.message(), "since is too old");
        assert_eq!(from_http_status(503, None, None).code, KinveyErrorCode::Network);
    }
}
