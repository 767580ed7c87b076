//! Errors returned by the data object operations.
use std::fmt;

use crate::provider::{AttributeKind, ProviderError};
use crate::session::TokenId;

//------------ Result Aliases ------------------------------------------------

pub type DataResult<T> = std::result::Result<T, Error>;

//------------ Error ---------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// The data context was terminated.
    NotInitialized,

    /// No session is known for the token.
    TokenUnknown(TokenId),

    /// The session died between resolution and use. The session must be
    /// resolved again before trying again.
    SessionInvalid,

    /// The filter matched zero objects.
    ObjectNotFound,

    /// The caller supplied buffer cannot hold the value.
    BufferTooSmall { required: usize },

    /// The credentials were rejected, also after logging in again.
    AuthenticationFailed(String),

    /// Memory for a value or list entry could not be obtained.
    AllocationFailed,

    /// The provider reported that the object has no such attribute, or
    /// that it cannot be revealed.
    AttributeUnavailable(AttributeKind),

    /// The provider returned a different length when filling a value than
    /// it announced when asked for the length.
    AttributeLengthMismatch {
        kind: AttributeKind,
        announced: usize,
        returned: usize,
    },

    /// Any other failure reported by the provider.
    Provider(ProviderError),
}

impl Error {
    pub fn authentication_failed(reason: impl fmt::Display) -> Self {
        Error::AuthenticationFailed(reason.to_string())
    }

    /// Can logging in and trying once more cure this error?
    ///
    /// Some providers overload their generic failure codes for permission
    /// problems, so every provider failure qualifies. Errors that say
    /// something definite about the object, the buffer, the session or
    /// memory never do.
    pub fn is_login_retry_candidate(&self) -> bool {
        matches!(self, Error::Provider(_) | Error::AttributeUnavailable(_))
    }

    /// The error to report when the retried attempt failed as well.
    pub(crate) fn into_terminal(self) -> Self {
        match self {
            Error::Provider(err) if err.rv().is_credential_failure() => {
                Error::AuthenticationFailed(err.to_string())
            }
            other => other,
        }
    }

    /// The required buffer size, if this is a [`Error::BufferTooSmall`].
    pub fn required_size(&self) -> Option<usize> {
        match self {
            Error::BufferTooSmall { required } => Some(*required),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotInitialized => {
                write!(f, "Data context is not initialized")
            }
            Error::TokenUnknown(token) => {
                write!(f, "No session available for token '{}'", token)
            }
            Error::SessionInvalid => write!(f, "Token session is no longer valid"),
            Error::ObjectNotFound => write!(f, "Could not find data object"),
            Error::BufferTooSmall { required } => {
                write!(f, "Buffer too small, {} bytes required", required)
            }
            Error::AuthenticationFailed(reason) => {
                write!(f, "Authentication failed: {}", reason)
            }
            Error::AllocationFailed => write!(f, "Memory allocation failed"),
            Error::AttributeUnavailable(kind) => {
                write!(f, "Attribute {} is not available", kind)
            }
            Error::AttributeLengthMismatch {
                kind,
                announced,
                returned,
            } => write!(
                f,
                "Provider error: attribute {} announced {} bytes but returned {}",
                kind, announced, returned
            ),
            Error::Provider(err) => write!(f, "Provider error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Provider(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        Error::Provider(err)
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::AllocationFailed
    }
}

//------------ Tests ---------------------------------------------------------
