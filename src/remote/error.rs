//! Errors returned by the remote collaborators.
//!
//! The kind decides what the caller does with a failure:
//!
//! - **NotFound**: the repository, branch, PR or file does not exist. Callers
//!   short-circuit and report failure instead of erroring the work item.
//! - **Transient**: transport failure, 5xx or rate limit. Safe to retry.
//! - **Permanent**: anything else that needs a human (auth, validation).
//! - **NotMergeable**: a merge request was rejected by the host.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    NotFound,
    Transient,
    Permanent,
    NotMergeable,
}

impl RemoteErrorKind {
    pub fn is_retriable(&self) -> bool {
        matches!(self, RemoteErrorKind::Transient)
    }
}

#[derive(Debug, Error)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,

    /// The HTTP status code, if the failure came from an HTTP response.
    pub status_code: Option<u16>,

    pub message: String,

    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "remote error (HTTP {}): {}", code, self.message),
            None => write!(f, "remote error: {}", self.message),
        }
    }
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Permanent, message)
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == RemoteErrorKind::NotFound
    }

    /// Classifies a failed HTTP response by status code and message text.
    pub fn from_status(status_code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = if is_transient_message(&message) {
            RemoteErrorKind::Transient
        } else {
            match status_code {
                404 => RemoteErrorKind::NotFound,
                405 if message.to_lowercase().contains("not mergeable") => {
                    RemoteErrorKind::NotMergeable
                }
                429 => RemoteErrorKind::Transient,
                403 if is_rate_limit_error(&message) => RemoteErrorKind::Transient,
                code if (500..600).contains(&code) => RemoteErrorKind::Transient,
                _ => RemoteErrorKind::Permanent,
            }
        };
        Self {
            kind,
            status_code: Some(status_code),
            message,
            source: None,
        }
    }

    /// Classifies a failure that carries no status code.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = if is_network_error(&message) || is_transient_message(&message) {
            RemoteErrorKind::Transient
        } else {
            RemoteErrorKind::Permanent
        };
        Self::new(kind, message)
    }
}

/// Messages the hosts return for conditions that clear up on retry.
pub(crate) fn is_transient_message(message: &str) -> bool {
    let message_lower = message.to_lowercase();

    if message_lower.contains("base branch was modified") {
        return true;
    }

    message_lower.contains("try again")
}

pub(crate) fn is_rate_limit_error(message: &str) -> bool {
    let message_lower = message.to_lowercase();
    message_lower.contains("rate limit")
        || message_lower.contains("api rate")
        || message_lower.contains("secondary rate")
        || message_lower.contains("abuse detection")
}

pub(crate) fn is_network_error(message: &str) -> bool {
    let message_lower = message.to_lowercase();
    message_lower.contains("timeout")
        || message_lower.contains("connection")
        || message_lower.contains("network")
        || message_lower.contains("dns")
        || message_lower.contains("timed out")
}
