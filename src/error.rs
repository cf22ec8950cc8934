use crate::client::ClientError;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// A local precondition failed. No remote call was made.
    #[error("invalid configuration: {0}")]
    Validation(String),
    #[error("{action} failed for '{identity}': {source}")]
    Remote {
        action: String,
        identity: String,
        #[source]
        source: ClientError,
    },
    #[error("{action}: '{identity}' not found")]
    NotFound { action: String, identity: String },
    #[error("{action} on '{identity}' did not converge within {}{}", format_elapsed(.elapsed), last_error_suffix(.last_error))]
    Timeout {
        action: String,
        identity: String,
        elapsed: Duration,
        last_error: Option<String>,
    },
    #[error("malformed identity '{id}': {reason}")]
    MalformedIdentity { id: String, reason: String },
}

fn format_elapsed(elapsed: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*elapsed)
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(err) => format!(" (last error: {err})"),
        None => String::new(),
    }
}

impl ReconcileError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn remote(action: &str, identity: impl ToString, source: ClientError) -> Self {
        Self::Remote {
            action: action.to_string(),
            identity: identity.to_string(),
            source,
        }
    }

    pub fn malformed<R: Into<String>>(id: &str, reason: R) -> Self {
        Self::MalformedIdentity {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// The vendor error code carried by a remote failure.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Remote { source, .. } => source.code(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
