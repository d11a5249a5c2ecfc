//! Service errors shared by every resource operation.

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const ERROR_CODE_PREFIX: &str = "FLEET-MGR";
pub const ERROR_HREF: &str = "/api/fleet-manager/v1/errors/";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ServiceErrorCode {
    Forbidden = 4,
    Conflict = 6,
    NotFound = 7,
    Validation = 8,
    General = 9,
    NotImplemented = 10,
    Unauthorized = 11,
    Unauthenticated = 15,
    MalformedRequest = 17,
    BadRequest = 21,
    FailedToParseSearch = 23,
    SyncActionNotSupported = 103,
}

const ALL_CODES: [ServiceErrorCode; 12] = [
    ServiceErrorCode::Forbidden,
    ServiceErrorCode::Conflict,
    ServiceErrorCode::NotFound,
    ServiceErrorCode::Validation,
    ServiceErrorCode::General,
    ServiceErrorCode::NotImplemented,
    ServiceErrorCode::Unauthorized,
    ServiceErrorCode::Unauthenticated,
    ServiceErrorCode::MalformedRequest,
    ServiceErrorCode::BadRequest,
    ServiceErrorCode::FailedToParseSearch,
    ServiceErrorCode::SyncActionNotSupported,
];

impl ServiceErrorCode {
    pub fn from_i32(code: i32) -> Option<Self> {
        ALL_CODES.iter().copied().find(|c| *c as i32 == code)
    }

    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn default_reason(&self) -> &'static str {
        match self {
            ServiceErrorCode::Forbidden => "Forbidden to perform this action",
            ServiceErrorCode::Conflict => "An entity with the specified unique values already exists",
            ServiceErrorCode::NotFound => "Resource not found",
            ServiceErrorCode::Validation => "General validation failure",
            ServiceErrorCode::General => "Unspecified error",
            ServiceErrorCode::NotImplemented => "HTTP Method not implemented for this endpoint",
            ServiceErrorCode::Unauthorized => "Account is unauthorized to perform this action",
            ServiceErrorCode::Unauthenticated => "Account authentication could not be verified",
            ServiceErrorCode::MalformedRequest => "Unable to read request body",
            ServiceErrorCode::BadRequest => "Bad request",
            ServiceErrorCode::FailedToParseSearch => "Failed to parse search query",
            ServiceErrorCode::SyncActionNotSupported => "Synchronous action is not supported",
        }
    }

    pub fn http_code(&self) -> u16 {
        match self {
            ServiceErrorCode::Forbidden | ServiceErrorCode::Unauthorized => 403,
            ServiceErrorCode::Conflict => 409,
            ServiceErrorCode::NotFound => 404,
            ServiceErrorCode::General => 500,
            ServiceErrorCode::NotImplemented => 405,
            ServiceErrorCode::Unauthenticated => 401,
            ServiceErrorCode::Validation
            | ServiceErrorCode::MalformedRequest
            | ServiceErrorCode::BadRequest
            | ServiceErrorCode::FailedToParseSearch
            | ServiceErrorCode::SyncActionNotSupported => 400,
        }
    }

    /// e.g. `FLEET-MGR-7`
    pub fn code_str(&self) -> String {
        format!("{}-{}", ERROR_CODE_PREFIX, self.as_i32())
    }

    pub fn href(&self) -> String {
        format!("{}{}", ERROR_HREF, self.as_i32())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{}: {reason}", .code.code_str())]
pub struct ServiceError {
    pub code: ServiceErrorCode,
    pub reason: String,
    pub http_code: u16,
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Error body returned to API clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicError {
    pub id: String,
    pub kind: String,
    pub href: String,
    pub code: String,
    pub reason: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub operation_id: String,
}

impl ServiceError {
    pub fn new(code: ServiceErrorCode, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let reason = if reason.is_empty() { code.default_reason().to_string() } else { reason };
        Self { code, reason, http_code: code.http_code() }
    }

    /// Build from a raw numeric code; unknown codes become a general error.
    pub fn from_code(code: i32, reason: impl Into<String>) -> Self {
        match ServiceErrorCode::from_i32(code) {
            Some(c) => Self::new(c, reason),
            None => {
                warn!(code, "undefined service error code used; falling back to general error");
                Self::new(ServiceErrorCode::General, reason)
            }
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self { Self::new(ServiceErrorCode::NotFound, reason) }
    pub fn general(reason: impl Into<String>) -> Self { Self::new(ServiceErrorCode::General, reason) }
    pub fn conflict(reason: impl Into<String>) -> Self { Self::new(ServiceErrorCode::Conflict, reason) }
    pub fn validation(reason: impl Into<String>) -> Self { Self::new(ServiceErrorCode::Validation, reason) }
    pub fn forbidden(reason: impl Into<String>) -> Self { Self::new(ServiceErrorCode::Forbidden, reason) }
    pub fn bad_request(reason: impl Into<String>) -> Self { Self::new(ServiceErrorCode::BadRequest, reason) }

    pub fn is_not_found(&self) -> bool { self.code == ServiceErrorCode::NotFound }
    pub fn is_conflict(&self) -> bool { self.code == ServiceErrorCode::Conflict }
    pub fn is_forbidden(&self) -> bool { self.code == ServiceErrorCode::Forbidden }

    pub fn as_public_error(&self, operation_id: &str) -> PublicError {
        PublicError {
            id: self.code.as_i32().to_string(),
            kind: "Error".to_string(),
            href: self.code.href(),
            code: self.code.code_str(),
            reason: self.reason.clone(),
            operation_id: operation_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_code_falls_back_to_general() {
        let e = ServiceError::from_code(4242, "boom");
        assert_eq!(e.code, ServiceErrorCode::General);
        assert_eq!(e.http_code, 500);
        assert_eq!(e.reason, "boom");
    }

    #[test]
    fn empty_reason_uses_default() {
        let e = ServiceError::from_code(7, "");
        assert!(e.is_not_found());
        assert_eq!(e.reason, "Resource not found");
        assert_eq!(e.http_code, 404);
    }

    #[test]
    fn display_and_public_form() {
        let e = ServiceError::conflict("name taken");
        assert_eq!(e.to_string(), "FLEET-MGR-6: name taken");
        let p = e.as_public_error("createResource");
        assert_eq!(p.id, "6");
        assert_eq!(p.kind, "Error");
        assert_eq!(p.href, "/api/fleet-manager/v1/errors/6");
        assert_eq!(p.code, "FLEET-MGR-6");
        assert_eq!(p.operation_id, "createResource");
    }
}
