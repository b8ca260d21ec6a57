use std::fmt;

/// Whether an `AlreadyInstalled` refusal concerns the exact same commit or a
/// different deployment of the same ref.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstalledContext {
    SameCommit,
    OtherCommit,
}

impl fmt::Display for InstalledContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SameCommit => f.write_str("this commit is already deployed"),
            Self::OtherCommit => f.write_str("another commit is deployed"),
        }
    }
}

/// Programmatic discriminant of [`DeployError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    RefNotFound,
    AlreadyInstalled,
    NotInstalled,
    Downgrade,
    InvalidData,
    InvalidRef,
    Untrusted,
    OutOfSpace,
    NotCached,
    RemoteNotFound,
    RemoteUsed,
    RuntimeUsed,
    PermissionDenied,
    NoSignature,
    Cancelled,
}

/// Failures surfaced by the deployment engine.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DeployError {
    #[error("[FD100] ref {reference} not found{}", remote_suffix(.remote))]
    RefNotFound {
        reference: String,
        remote: Option<String>,
    },
    #[error("[FD101] {reference} is already installed ({context})")]
    AlreadyInstalled {
        reference: String,
        context: InstalledContext,
    },
    #[error("[FD102] {0} is not installed")]
    NotInstalled(String),
    #[error("[FD103] refusing to downgrade {reference} from {old} to {new}")]
    Downgrade {
        reference: String,
        old: String,
        new: String,
    },
    #[error("[FD104] invalid data: {0}")]
    InvalidData(String),
    #[error("[FD105] invalid ref '{value}': {reason}")]
    InvalidRef { value: String, reason: String },
    #[error("[FD106] {0}")]
    Untrusted(String),
    #[error("[FD107] not enough disk space to complete this operation")]
    OutOfSpace,
    #[error("[FD108] {0} is not cached")]
    NotCached(String),
    #[error("[FD109] remote '{0}' not found")]
    RemoteNotFound(String),
    #[error("[FD110] remote '{remote}' is used by installed refs: {}", .refs.join(", "))]
    RemoteUsed { remote: String, refs: Vec<String> },
    #[error("[FD111] runtime {runtime} is needed by: {}", .used_by.join(", "))]
    RuntimeUsed {
        runtime: String,
        used_by: Vec<String>,
    },
    #[error("[FD112] permission denied: {0}")]
    PermissionDenied(String),
    #[error("[FD113] no signatures found for {0}")]
    NoSignature(String),
    #[error("[FD114] operation cancelled")]
    Cancelled,
}

fn remote_suffix(remote: &Option<String>) -> String {
    match remote {
        Some(remote) => format!(" in remote '{remote}'"),
        None => String::new(),
    }
}

impl DeployError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RefNotFound { .. } => ErrorKind::RefNotFound,
            Self::AlreadyInstalled { .. } => ErrorKind::AlreadyInstalled,
            Self::NotInstalled(_) => ErrorKind::NotInstalled,
            Self::Downgrade { .. } => ErrorKind::Downgrade,
            Self::InvalidData(_) => ErrorKind::InvalidData,
            Self::InvalidRef { .. } => ErrorKind::InvalidRef,
            Self::Untrusted(_) => ErrorKind::Untrusted,
            Self::OutOfSpace => ErrorKind::OutOfSpace,
            Self::NotCached(_) => ErrorKind::NotCached,
            Self::RemoteNotFound(_) => ErrorKind::RemoteNotFound,
            Self::RemoteUsed { .. } => ErrorKind::RemoteUsed,
            Self::RuntimeUsed { .. } => ErrorKind::RuntimeUsed,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::NoSignature(_) => ErrorKind::NoSignature,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Stable diagnostic code, matching the bracketed prefix of the message.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::RefNotFound => "FD100",
            ErrorKind::AlreadyInstalled => "FD101",
            ErrorKind::NotInstalled => "FD102",
            ErrorKind::Downgrade => "FD103",
            ErrorKind::InvalidData => "FD104",
            ErrorKind::InvalidRef => "FD105",
            ErrorKind::Untrusted => "FD106",
            ErrorKind::OutOfSpace => "FD107",
            ErrorKind::NotCached => "FD108",
            ErrorKind::RemoteNotFound => "FD109",
            ErrorKind::RemoteUsed => "FD110",
            ErrorKind::RuntimeUsed => "FD111",
            ErrorKind::PermissionDenied => "FD112",
            ErrorKind::NoSignature => "FD113",
            ErrorKind::Cancelled => "FD114",
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }
}

/// Recover the first [`DeployError`] in an `anyhow` chain.
#[must_use]
pub fn find_deploy_error(err: &anyhow::Error) -> Option<&DeployError> {
    err.chain().find_map(|cause| cause.downcast_ref::<DeployError>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_codes() {
        let err = DeployError::RuntimeUsed {
            runtime: "runtime/org.test.Platform/x86_64/1".into(),
            used_by: vec!["app/org.test.App/x86_64/stable".into()],
        };
        let text = err.to_string();
        assert!(text.starts_with(&format!("[{}]", err.code())));
        assert!(text.contains("app/org.test.App/x86_64/stable"));
        assert_eq!(err.kind(), ErrorKind::RuntimeUsed);
    }

    #[test]
    fn ref_not_found_names_remote() {
        let err = DeployError::RefNotFound {
            reference: "app/org.a.B/x86_64/stable".into(),
            remote: Some("origin".into()),
        };
        assert!(err.to_string().contains("in remote 'origin'"));
    }

    #[test]
    fn recovers_typed_error_through_context() {
        let err = anyhow::Error::new(DeployError::OutOfSpace).context("pulling objects");
        assert_eq!(
            find_deploy_error(&err).map(DeployError::kind),
            Some(ErrorKind::OutOfSpace)
        );
    }
}
