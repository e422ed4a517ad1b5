//! Error types and oneM2M response status codes.
//!
//! Errors are structured values that cross subsystem boundaries as
//! `Result<_, CseError>`. Every error carries a [`ResponseStatusCode`]
//! and an optional debug string that is echoed to the originator in the
//! response primitive.

use std::fmt;

/// oneM2M response status codes (TS-0004 subset used by this CSE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatusCode {
    Ok,
    Created,
    Deleted,
    Updated,
    BadRequest,
    NotFound,
    OperationNotAllowed,
    RequestTimeout,
    ReleaseVersionNotSupported,
    SubscriptionCreatorHasNoPrivilege,
    ContentsUnacceptable,
    OriginatorHasNoPrivilege,
    Conflict,
    SecurityAssociationRequired,
    InvalidChildResourceType,
    GroupMemberTypeInconsistent,
    OriginatorHasAlreadyRegistered,
    InternalServerError,
    NotImplemented,
    TargetNotReachable,
    ReceiverHasNoPrivileges,
    AlreadyExists,
    TargetNotSubscribable,
    SubscriptionVerificationInitiationFailed,
    NotAcceptable,
    InvalidArguments,
    InsufficientArguments,
}

impl ResponseStatusCode {
    /// The numeric protocol value carried in `X-M2M-RSC`.
    pub fn numeric(&self) -> u32 {
        use ResponseStatusCode::*;
        match self {
            Ok => 2000,
            Created => 2001,
            Deleted => 2002,
            Updated => 2004,
            BadRequest => 4000,
            NotFound => 4004,
            OperationNotAllowed => 4005,
            RequestTimeout => 4008,
            ReleaseVersionNotSupported => 4018,
            SubscriptionCreatorHasNoPrivilege => 4101,
            ContentsUnacceptable => 4102,
            OriginatorHasNoPrivilege => 4103,
            Conflict => 4105,
            SecurityAssociationRequired => 4107,
            InvalidChildResourceType => 4108,
            GroupMemberTypeInconsistent => 4110,
            OriginatorHasAlreadyRegistered => 4117,
            InternalServerError => 5000,
            NotImplemented => 5001,
            TargetNotReachable => 5103,
            ReceiverHasNoPrivileges => 5105,
            AlreadyExists => 5106,
            TargetNotSubscribable => 5203,
            SubscriptionVerificationInitiationFailed => 5204,
            NotAcceptable => 5207,
            InvalidArguments => 6023,
            InsufficientArguments => 6024,
        }
    }

    /// Resolve a numeric value received from a remote CSE.
    pub fn from_numeric(value: u32) -> Option<Self> {
        use ResponseStatusCode::*;
        let rsc = match value {
            2000 => Ok,
            2001 => Created,
            2002 => Deleted,
            2004 => Updated,
            4000 => BadRequest,
            4004 => NotFound,
            4005 => OperationNotAllowed,
            4008 => RequestTimeout,
            4018 => ReleaseVersionNotSupported,
            4101 => SubscriptionCreatorHasNoPrivilege,
            4102 => ContentsUnacceptable,
            4103 => OriginatorHasNoPrivilege,
            4105 => Conflict,
            4107 => SecurityAssociationRequired,
            4108 => InvalidChildResourceType,
            4110 => GroupMemberTypeInconsistent,
            4117 => OriginatorHasAlreadyRegistered,
            5000 => InternalServerError,
            5001 => NotImplemented,
            5103 => TargetNotReachable,
            5105 => ReceiverHasNoPrivileges,
            5106 => AlreadyExists,
            5203 => TargetNotSubscribable,
            5204 => SubscriptionVerificationInitiationFailed,
            5207 => NotAcceptable,
            6023 => InvalidArguments,
            6024 => InsufficientArguments,
            _ => return None,
        };
        Some(rsc)
    }

    /// HTTP status code used by the HTTP binding for this RSC.
    pub fn http_status(&self) -> u16 {
        use ResponseStatusCode::*;
        match self {
            Ok | Deleted | Updated => 200,
            Created => 201,
            BadRequest
            | ContentsUnacceptable
            | GroupMemberTypeInconsistent
            | ReleaseVersionNotSupported
            | InvalidArguments
            | InsufficientArguments => 400,
            OriginatorHasNoPrivilege
            | SubscriptionCreatorHasNoPrivilege
            | SecurityAssociationRequired
            | ReceiverHasNoPrivileges
            | TargetNotSubscribable
            | TargetNotReachable => 403,
            NotFound => 404,
            OperationNotAllowed | InvalidChildResourceType => 405,
            NotAcceptable => 406,
            RequestTimeout => 408,
            Conflict | AlreadyExists | OriginatorHasAlreadyRegistered => 409,
            InternalServerError | SubscriptionVerificationInitiationFailed => 500,
            NotImplemented => 501,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ResponseStatusCode::Ok
                | ResponseStatusCode::Created
                | ResponseStatusCode::Deleted
                | ResponseStatusCode::Updated
        )
    }
}

impl fmt::Display for ResponseStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.numeric())
    }
}

/// Structured operation error: a response status code plus an optional
/// debug string surfaced to the originator.
#[derive(Debug, Clone, thiserror::Error)]
#[error("rsc {rsc}: {}", debug.as_deref().unwrap_or("-"))]
pub struct CseError {
    pub rsc: ResponseStatusCode,
    pub debug: Option<String>,
}

impl CseError {
    pub fn new(rsc: ResponseStatusCode) -> Self {
        Self { rsc, debug: None }
    }

    pub fn with_debug(rsc: ResponseStatusCode, debug: impl Into<String>) -> Self {
        Self {
            rsc,
            debug: Some(debug.into()),
        }
    }

    pub fn bad_request(debug: impl Into<String>) -> Self {
        Self::with_debug(ResponseStatusCode::BadRequest, debug)
    }

    pub fn not_found(debug: impl Into<String>) -> Self {
        Self::with_debug(ResponseStatusCode::NotFound, debug)
    }

    pub fn conflict(debug: impl Into<String>) -> Self {
        Self::with_debug(ResponseStatusCode::Conflict, debug)
    }

    pub fn no_privilege(debug: impl Into<String>) -> Self {
        Self::with_debug(ResponseStatusCode::OriginatorHasNoPrivilege, debug)
    }

    pub fn operation_not_allowed(debug: impl Into<String>) -> Self {
        Self::with_debug(ResponseStatusCode::OperationNotAllowed, debug)
    }

    pub fn internal(debug: impl Into<String>) -> Self {
        Self::with_debug(ResponseStatusCode::InternalServerError, debug)
    }
}

pub type CseResult<T> = Result<T, CseError>;

/// Violations raised by the attribute-policy validator.
///
/// Converted into a `badRequest` [`CseError`] at the dispatcher boundary;
/// the variant message becomes the debug string.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    /// Attribute not defined for this resource type
    #[error("unknown attribute '{attribute}' for resource type {ty}")]
    UnknownAttribute { attribute: String, ty: String },

    /// Mandatory-on-create attribute missing from the payload
    #[error("missing mandatory attribute '{attribute}'")]
    MissingMandatoryAttribute { attribute: String },

    /// Attribute not allowed in this request (read-only or server-managed)
    #[error("attribute '{attribute}' must not be present in the request")]
    AttributeNotAllowed { attribute: String },

    /// Value does not match the declared attribute type
    #[error("attribute '{attribute}' has invalid type, expected {expected}")]
    InvalidAttributeType {
        attribute: String,
        expected: &'static str,
    },

    /// Value outside the allowed enumeration or range
    #[error("attribute '{attribute}' has invalid value: {message}")]
    InvalidAttributeValue { attribute: String, message: String },

    /// Per-resource custom rule violated
    #[error("{message}")]
    Custom { message: String },
}

impl ValidationError {
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom {
            message: message.into(),
        }
    }
}

impl From<ValidationError> for CseError {
    fn from(err: ValidationError) -> Self {
        CseError::bad_request(err.to_string())
    }
}
