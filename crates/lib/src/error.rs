//! Errors returned by the control surface.

use thiserror::Error;

/// Result type for control-surface operations.
pub type InstallResult<T> = std::result::Result<T, InstallError>;

/// Stable numeric codes handed back to callers.
///
/// The first four values are shared with older clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
#[repr(i32)]
pub enum ErrorCode {
    /// Success.
    Ok = 0,
    /// I/O, metadata or device-mapper failure.
    InternalError = 1,
    /// Not enough free space for the requested sizes.
    InsufficientSpace = 2,
    /// Free space is too low a fraction of the filesystem, or too fragmented.
    FileSystemCluttered = 3,
    /// Bad sizes, paths, or a call in the wrong state.
    InvalidParameter = 4,
    /// Something is present that must not be.
    AlreadyExists = 5,
    /// Something is absent that must be present.
    DoesNotExist = 6,
    /// The caller is not allowed to perform the operation.
    AccessDenied = 7,
    /// The operation is turned off by configuration.
    OperationDisabled = 8,
    /// The operation was cancelled.
    Cancelled = 9,
}

/// An error from a control-surface operation.
#[derive(Debug, Error)]
pub enum InstallError {
    /// Bad sizes, paths, or a call made in the wrong state.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The filesystem cannot hold the requested images.
    #[error("Not enough free space (only {available} bytes available, {required} required)")]
    InsufficientSpace {
        /// Free bytes on the filesystem.
        available: u64,
        /// Bytes the install needs.
        required: u64,
    },

    /// The filesystem is too full or too fragmented.
    #[error("Filesystem too cluttered: {0}")]
    FileSystemCluttered(String),

    /// Something is present that must not be.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Something is absent that must be present.
    #[error("Does not exist: {0}")]
    DoesNotExist(String),

    /// The caller may not perform this operation.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Turned off by configuration.
    #[error("Operation disabled: {0}")]
    OperationDisabled(String),

    /// Cancelled by a concurrent request.
    #[error("Operation cancelled")]
    Cancelled,

    /// Anything else; the cause chain is logged.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl InstallError {
    /// The numeric code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            InstallError::InvalidParameter(_) => ErrorCode::InvalidParameter,
            InstallError::InsufficientSpace { .. } => ErrorCode::InsufficientSpace,
            InstallError::FileSystemCluttered(_) => ErrorCode::FileSystemCluttered,
            InstallError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            InstallError::DoesNotExist(_) => ErrorCode::DoesNotExist,
            InstallError::AccessDenied(_) => ErrorCode::AccessDenied,
            InstallError::OperationDisabled(_) => ErrorCode::OperationDisabled,
            InstallError::Cancelled => ErrorCode::Cancelled,
            InstallError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Log this error with its full cause chain; used wherever an
    /// error leaves the service.
    pub(crate) fn log(&self, op: &str) {
        match self {
            InstallError::Internal(e) => tracing::error!("{op}: {e:#}"),
            InstallError::Cancelled => tracing::info!("{op}: {self}"),
            e => tracing::error!("{op}: {e}"),
        }
    }
}

impl<T> From<&InstallResult<T>> for ErrorCode {
    fn from(r: &InstallResult<T>) -> Self {
        match r {
            Ok(_) => ErrorCode::Ok,
            Err(e) => e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(ErrorCode::Ok as i32, 0);
        assert_eq!(ErrorCode::InternalError as i32, 1);
        assert_eq!(ErrorCode::InsufficientSpace as i32, 2);
        assert_eq!(ErrorCode::FileSystemCluttered as i32, 3);
        let e: InstallError = anyhow::anyhow!("boom").into();
        assert_eq!(e.code(), ErrorCode::InternalError);
        let r: InstallResult<()> = Err(InstallError::Cancelled);
        assert_eq!(ErrorCode::from(&r), ErrorCode::Cancelled);
        assert_eq!(ErrorCode::from(&InstallResult::Ok(())), ErrorCode::Ok);
    }
}
