//! Error types for the upload manager.
//!
//! Every configuration and validation failure maps to HTTP 400 so an
//! application can hand the error straight back to its client.  Adapter
//! failures (SDK, transport, guard errors) are carried through unchanged
//! inside [`AppError::Adapter`].

use http::StatusCode;
use thiserror::Error;

use crate::types::CloudProvider;

/// Coarse error category, mirroring how the surrounding application
/// classifies failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Auth,
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Auth => "AUTH",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

/// Errors raised by [`UploadManager`](crate::UploadManager).
#[derive(Debug, Error)]
pub enum AppError {
    /// No provider on the call and no global default.
    #[error("Cloud provider is not specified and no global default is configured.")]
    ProviderNotSpecified,

    /// No credentials on the call and none configured globally.
    #[error(
        "Credentials for provider {provider} are not specified and no global default is configured."
    )]
    CredentialsNotSpecified { provider: CloudProvider },

    /// Credentials tagged for one provider used with another.
    #[error(
        "Mismatched credentials: provided credentials are for {credentials} but resolved provider is {resolved}."
    )]
    MismatchedCredentials {
        credentials: CloudProvider,
        resolved: CloudProvider,
    },

    /// A provider name outside `aws | gcp | azure`.
    #[error("Unsupported cloud provider: {name}")]
    UnsupportedProvider { name: String },

    /// `is_required` was set and the payload was empty.
    #[error("File is required")]
    FileRequired,

    /// Failure reported by a cloud adapter, passed through as-is.
    #[error(transparent)]
    Adapter(#[from] anyhow::Error),
}

impl AppError {
    /// HTTP-like status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ProviderNotSpecified
            | AppError::CredentialsNotSpecified { .. }
            | AppError::MismatchedCredentials { .. }
            | AppError::UnsupportedProvider { .. }
            | AppError::FileRequired => StatusCode::BAD_REQUEST,
            AppError::Adapter(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Adapter(_) => ErrorKind::Internal,
            _ => ErrorKind::Validation,
        }
    }

    /// True for errors raised before any adapter was called.
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

pub type AppResult<T> = Result<T, AppError>;
