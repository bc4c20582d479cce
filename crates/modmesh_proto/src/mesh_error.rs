use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ErrDecode,
    ErrStaleRequest,
    ErrAuthentication,
    ErrAuthorization,
    ErrDispatch,
    ErrNotFound,
    ErrUnsupportedType,
    ErrBusy,
    ErrInternal,
}

impl ErrorCode {
    pub fn retryable(self) -> bool {
        matches!(self, ErrorCode::ErrBusy | ErrorCode::ErrStaleRequest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    /// Function, module name or type tag the error is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_staleness_ms: Option<i64>,
}

impl ErrorResponse {
    pub fn from_code(code: ErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.retryable();
        Self {
            code,
            message: message.into(),
            retryable,
            subject: None,
            candidates: Vec::new(),
            age_ms: None,
            max_staleness_ms: None,
        }
    }

    fn with_subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    Decode {
        reason: String,
    },
    StaleRequest {
        age_ms: i64,
        max_staleness_ms: i64,
    },
    Authentication {
        reason: String,
    },
    Authorization {
        reason: String,
    },
    Dispatch {
        function: String,
        reason: String,
    },
    Transport {
        address: String,
        reason: String,
    },
    Timeout {
        address: String,
        timeout_ms: u64,
    },
    Storage {
        key: String,
        reason: String,
    },
    UnsupportedType {
        tag: String,
    },
    NotFound {
        name: String,
    },
    AmbiguousName {
        name: String,
        candidates: Vec<String>,
    },
    Busy {
        reason: String,
    },
    InvalidConfig {
        reason: String,
    },
    /// An error answered by a remote server whose code has no local variant.
    Remote {
        code: ErrorCode,
        message: String,
    },
}

impl MeshError {
    /// Wire representation sent back to a caller.
    pub fn to_response(&self) -> ErrorResponse {
        let code = match self {
            MeshError::Decode { .. } => ErrorCode::ErrDecode,
            MeshError::StaleRequest { .. } => ErrorCode::ErrStaleRequest,
            MeshError::Authentication { .. } => ErrorCode::ErrAuthentication,
            MeshError::Authorization { .. } => ErrorCode::ErrAuthorization,
            MeshError::Dispatch { .. } => ErrorCode::ErrDispatch,
            MeshError::NotFound { .. } | MeshError::AmbiguousName { .. } => ErrorCode::ErrNotFound,
            MeshError::UnsupportedType { .. } => ErrorCode::ErrUnsupportedType,
            MeshError::Busy { .. } => ErrorCode::ErrBusy,
            MeshError::Remote { code, .. } => *code,
            MeshError::Transport { .. }
            | MeshError::Timeout { .. }
            | MeshError::Storage { .. }
            | MeshError::InvalidConfig { .. } => ErrorCode::ErrInternal,
        };
        let message = match self {
            MeshError::Decode { reason }
            | MeshError::Authentication { reason }
            | MeshError::Authorization { reason }
            | MeshError::Dispatch { reason, .. }
            | MeshError::Busy { reason } => reason.clone(),
            MeshError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        let response = ErrorResponse::from_code(code, message);
        match self {
            MeshError::StaleRequest {
                age_ms,
                max_staleness_ms,
            } => ErrorResponse {
                age_ms: Some(*age_ms),
                max_staleness_ms: Some(*max_staleness_ms),
                ..response
            },
            MeshError::Dispatch { function, .. } => response.with_subject(function),
            MeshError::NotFound { name } => response.with_subject(name),
            MeshError::AmbiguousName { name, candidates } => ErrorResponse {
                candidates: candidates.clone(),
                ..response.with_subject(name)
            },
            MeshError::UnsupportedType { tag } => response.with_subject(tag),
            _ => response,
        }
    }

    /// Maps a remote error back onto the local taxonomy. Errors that only
    /// exist on the caller's side (`ErrInternal`) stay `Remote`.
    pub fn from_response(response: ErrorResponse) -> Self {
        let ErrorResponse {
            code,
            message,
            subject,
            candidates,
            age_ms,
            max_staleness_ms,
            ..
        } = response;
        match code {
            ErrorCode::ErrDecode => MeshError::Decode { reason: message },
            ErrorCode::ErrStaleRequest => MeshError::StaleRequest {
                age_ms: age_ms.unwrap_or_default(),
                max_staleness_ms: max_staleness_ms.unwrap_or_default(),
            },
            ErrorCode::ErrAuthentication => MeshError::Authentication { reason: message },
            ErrorCode::ErrAuthorization => MeshError::Authorization { reason: message },
            ErrorCode::ErrBusy => MeshError::Busy { reason: message },
            ErrorCode::ErrDispatch => MeshError::Dispatch {
                function: subject.unwrap_or_default(),
                reason: message,
            },
            ErrorCode::ErrNotFound if !candidates.is_empty() => MeshError::AmbiguousName {
                name: subject.unwrap_or(message),
                candidates,
            },
            ErrorCode::ErrNotFound => MeshError::NotFound {
                name: subject.unwrap_or(message),
            },
            ErrorCode::ErrUnsupportedType => MeshError::UnsupportedType {
                tag: subject.unwrap_or(message),
            },
            ErrorCode::ErrInternal => MeshError::Remote { code, message },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            MeshError::Timeout { .. }
            | MeshError::Transport { .. }
            | MeshError::Busy { .. }
            | MeshError::StaleRequest { .. } => true,
            MeshError::Remote { code, .. } => code.retryable(),
            _ => false,
        }
    }
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshError::Decode { reason } => write!(f, "decode error: {}", reason),
            MeshError::StaleRequest {
                age_ms,
                max_staleness_ms,
            } => write!(
                f,
                "stale request: {}ms old > max staleness {}ms",
                age_ms, max_staleness_ms
            ),
            MeshError::Authentication { reason } => {
                write!(f, "authentication failed: {}", reason)
            }
            MeshError::Authorization { reason } => write!(f, "authorization denied: {}", reason),
            MeshError::Dispatch { function, reason } => {
                if function.is_empty() {
                    write!(f, "dispatch failed: {}", reason)
                } else {
                    write!(f, "dispatch of {} failed: {}", function, reason)
                }
            }
            MeshError::Transport { address, reason } => {
                write!(f, "transport error to {}: {}", address, reason)
            }
            MeshError::Timeout {
                address,
                timeout_ms,
            } => write!(f, "call to {} timed out after {}ms", address, timeout_ms),
            MeshError::Storage { key, reason } => {
                write!(f, "storage error at {}: {}", key, reason)
            }
            MeshError::UnsupportedType { tag } => write!(f, "unsupported payload type: {}", tag),
            MeshError::NotFound { name } => write!(f, "module not found: {}", name),
            MeshError::AmbiguousName { name, candidates } => write!(
                f,
                "ambiguous module name {}: matches [{}]",
                name,
                candidates.join(", ")
            ),
            MeshError::Busy { reason } => write!(f, "server busy: {}", reason),
            MeshError::InvalidConfig { reason } => write!(f, "invalid config: {}", reason),
            MeshError::Remote { code, message } => {
                write!(f, "remote error {:?}: {}", code, message)
            }
        }
    }
}

impl std::error::Error for MeshError {}

impl From<serde_cbor::Error> for MeshError {
    fn from(error: serde_cbor::Error) -> Self {
        MeshError::Decode {
            reason: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(error: serde_json::Error) -> Self {
        MeshError::Decode {
            reason: error.to_string(),
        }
    }
}

impl From<io::Error> for MeshError {
    fn from(error: io::Error) -> Self {
        MeshError::Storage {
            key: String::new(),
            reason: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_sets_retryable_from_code() {
        let response = ErrorResponse::from_code(ErrorCode::ErrBusy, "busy");
        assert!(response.retryable);
        let response = ErrorResponse::from_code(ErrorCode::ErrAuthorization, "denied");
        assert!(!response.retryable);
    }

    #[test]
    fn authorization_reason_survives_the_wire_verbatim() {
        let error = MeshError::Authorization {
            reason: "Function cmd is blacklisted".to_string(),
        };
        let response = error.to_response();
        assert_eq!(response.code, ErrorCode::ErrAuthorization);
        assert_eq!(response.message, "Function cmd is blacklisted");
        assert_eq!(MeshError::from_response(response), error);
    }

    #[test]
    fn typed_errors_come_back_as_their_own_variants() {
        let errors = vec![
            MeshError::StaleRequest {
                age_ms: 90_000,
                max_staleness_ms: 60_000,
            },
            MeshError::NotFound {
                name: "model.gpt".to_string(),
            },
            MeshError::AmbiguousName {
                name: "model".to_string(),
                candidates: vec!["model.a".to_string(), "model.b".to_string()],
            },
            MeshError::UnsupportedType {
                tag: "pickle".to_string(),
            },
            MeshError::Dispatch {
                function: "add".to_string(),
                reason: "missing positional argument 1".to_string(),
            },
            MeshError::Decode {
                reason: "truncated frame".to_string(),
            },
        ];
        for error in errors {
            assert_eq!(MeshError::from_response(error.to_response()), error);
        }
        assert!(MeshError::StaleRequest {
            age_ms: 1,
            max_staleness_ms: 0
        }
        .is_retryable());
    }

    #[test]
    fn local_only_errors_stay_remote() {
        let error = MeshError::Storage {
            key: "namespace/local".to_string(),
            reason: "disk full".to_string(),
        };
        let mapped = MeshError::from_response(error.to_response());
        assert!(matches!(
            mapped,
            MeshError::Remote {
                code: ErrorCode::ErrInternal,
                ..
            }
        ));
    }
}
