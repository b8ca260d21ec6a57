use std::io;
use std::path::{Path, PathBuf};

use refdeploy_domain::{DeployError, VariantError};

/// Errors surfaced by the content store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("[FD800] object {checksum}.{kind} is missing")]
    MissingObject { checksum: String, kind: &'static str },
    #[error("[FD800] object {checksum}.{kind} is corrupt (found {actual})")]
    ChecksumMismatch {
        checksum: String,
        kind: &'static str,
        actual: String,
    },
    #[error("[FD801] object {checksum} could not be decoded: {source}")]
    Decode {
        checksum: String,
        #[source]
        source: VariantError,
    },
    #[error("[FD802] ref '{0}' not found")]
    RefNotFound(String),
    #[error("[FD803] {0} not found")]
    NotFound(String),
    #[error("[FD804] remote '{0}' is not configured in this repo")]
    UnknownRemote(String),
    #[error("[FD805] no transaction is active")]
    NoTransaction,
    #[error("[FD805] a transaction is already active")]
    TransactionActive,
    #[error("[FD806] refusing to write: {0}")]
    OutOfSpace(String),
    #[error("[FD807] operation cancelled")]
    Cancelled,
    #[error("[FD808] fetching {url} failed: {message}")]
    Fetch { url: String, message: String },
    #[error("[FD809] unsupported URI '{0}'")]
    UnsupportedUri(String),
    #[error("[FD810] signature verification failed: {0}")]
    Signature(String),
    #[error("[FD811] checkout target {} already exists", .0.display())]
    CheckoutExists(PathBuf),
    #[error("[FD812] {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("[FD813] repo config is invalid: {0}")]
    Config(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        if is_storage_full(&source) {
            return Self::OutOfSpace(context.into());
        }
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn io_path(action: &str, path: &Path, source: io::Error) -> Self {
        Self::io(format!("failed to {action} {}", path.display()), source)
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::MissingObject { .. } | Self::RefNotFound(_) | Self::NotFound(_) => true,
            Self::Io { source, .. } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, Self::OutOfSpace(_))
    }
}

fn is_storage_full(err: &io::Error) -> bool {
    // ENOSPC and EDQUOT
    err.kind() == io::ErrorKind::StorageFull || matches!(err.raw_os_error(), Some(28 | 122))
}

impl From<StoreError> for DeployError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OutOfSpace(_) => DeployError::OutOfSpace,
            StoreError::Cancelled => DeployError::Cancelled,
            StoreError::ChecksumMismatch { .. } | StoreError::Decode { .. } => {
                DeployError::InvalidData(err.to_string())
            }
            StoreError::Signature(message) => DeployError::Untrusted(message),
            other => DeployError::InvalidData(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refdeploy_domain::ErrorKind;

    #[test]
    fn enospc_becomes_out_of_space() {
        let err = StoreError::io("writing object", io::Error::from_raw_os_error(28));
        assert!(err.is_out_of_space());
        assert_eq!(DeployError::from(err).kind(), ErrorKind::OutOfSpace);
    }

    #[test]
    fn not_found_is_detected_through_io() {
        let err = StoreError::io("reading", io::Error::from(io::ErrorKind::NotFound));
        assert!(err.is_not_found());
        assert!(!err.is_out_of_space());
    }
}
