//! Share requests and their status.
//!
//! A [`ShareInfo`] is one file the caller wants pushed. It is shared between
//! the caller, the queue and the session as a [`ShareHandle`]; identity is by
//! handle, so two requests for the same path are still two shares.

pub mod queue;

pub use queue::ShareQueue;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};
use crate::obex::ResponseCode;

/// Shared handle to a share request.
pub type ShareHandle = Arc<ShareInfo>;

/// Local-side failure of a share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientErrorKind {
    /// Source could not be opened or read
    FileError,
    /// PUT could not be started
    DataError,
    /// Link failed or no response could be obtained
    ConnectionError,
}

/// Remote-side refusal of a share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerErrorKind {
    /// Remote refused the object
    Forbidden,
    /// Remote cannot accept the object
    NotAcceptable,
    /// Remote does not handle the content type
    UnsupportedType,
    /// Any other response code
    Unhandled(u8),
}

impl ServerErrorKind {
    /// Map a refusing response code to its kind.
    pub const fn from_response(code: ResponseCode) -> Self {
        match code {
            ResponseCode::Forbidden => Self::Forbidden,
            ResponseCode::NotAcceptable => Self::NotAcceptable,
            ResponseCode::UnsupportedType => Self::UnsupportedType,
            other => Self::Unhandled(other.to_byte()),
        }
    }

    /// Whether a retry of the same object may succeed later.
    pub const fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::UnsupportedType | Self::Unhandled(ResponseCode::SERVICE_UNAVAILABLE)
        )
    }
}

/// Status of a share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "status", content = "kind", rename_all = "snake_case")]
pub enum ShareStatus {
    /// Waiting in the queue
    Pending,
    /// Being sent
    Running,
    /// Delivered and acknowledged
    Success,
    /// Failed locally
    ClientError(ClientErrorKind),
    /// Refused by the remote
    ServerError(ServerErrorKind),
    /// Stopped before completion
    Canceled,
    /// Failed for a reason nobody recorded
    UnknownError,
}

impl ShareStatus {
    /// Whether the share has left the active states.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether the share completed successfully.
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Whether this failure ends the whole session rather than one share.
    pub const fn is_session_fatal(self) -> bool {
        matches!(self, Self::ClientError(ClientErrorKind::ConnectionError))
    }

    /// Final status of a share whose send failed with an error of `kind`.
    pub const fn from_error_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::FileAccess => Self::ClientError(ClientErrorKind::FileError),
            ErrorKind::Protocol => Self::ClientError(ClientErrorKind::DataError),
            ErrorKind::Interrupted => Self::Canceled,
            ErrorKind::Transport | ErrorKind::Timeout => {
                Self::ClientError(ClientErrorKind::ConnectionError)
            }
            ErrorKind::Config | ErrorKind::Usage => Self::UnknownError,
        }
    }

    /// Numeric code, HTTP style (1xx active, 2xx success, 4xx failure).
    pub const fn code(self) -> u16 {
        match self {
            Self::Pending => 190,
            Self::Running => 192,
            Self::Success => 200,
            Self::ServerError(ServerErrorKind::Forbidden) => 403,
            Self::ServerError(ServerErrorKind::NotAcceptable | ServerErrorKind::UnsupportedType) => 406,
            Self::Canceled => 490,
            Self::UnknownError => 491,
            Self::ClientError(ClientErrorKind::FileError) => 492,
            Self::ServerError(ServerErrorKind::Unhandled(_)) => 495,
            Self::ClientError(ClientErrorKind::DataError) => 496,
            Self::ClientError(ClientErrorKind::ConnectionError) => 497,
        }
    }
}

impl fmt::Display for ShareStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::ClientError(ClientErrorKind::FileError) => write!(f, "file error"),
            Self::ClientError(ClientErrorKind::DataError) => write!(f, "data error"),
            Self::ClientError(ClientErrorKind::ConnectionError) => write!(f, "connection error"),
            Self::ServerError(ServerErrorKind::Forbidden) => write!(f, "forbidden by remote"),
            Self::ServerError(ServerErrorKind::NotAcceptable) => {
                write!(f, "not acceptable to remote")
            }
            Self::ServerError(ServerErrorKind::UnsupportedType) => {
                write!(f, "unsupported type")
            }
            Self::ServerError(ServerErrorKind::Unhandled(code)) => {
                write!(f, "unhandled response {code:#04X}")
            }
            Self::Canceled => write!(f, "canceled"),
            Self::UnknownError => write!(f, "unknown error"),
        }
    }
}

/// One requested file push.
#[derive(Debug)]
pub struct ShareInfo {
    id: Uuid,
    path: PathBuf,
    name: Option<String>,
    content_type: Option<String>,
    destination: String,
    status: Mutex<ShareStatus>,
}

impl ShareInfo {
    /// Create a pending share for the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
            name: None,
            content_type: None,
            destination: String::new(),
            status: Mutex::new(ShareStatus::Pending),
        }
    }

    /// Override the name sent to the remote.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Override the content type sent to the remote.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set the destination address.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    /// Wrap in a shared handle.
    pub fn into_handle(self) -> ShareHandle {
        Arc::new(self)
    }

    /// Random id used to tell shares apart in logs.
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Source path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name override, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Content type override, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Destination address.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Name shown to users: the override, else the source file name.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.path
                .file_name()
                .map_or_else(|| self.path.display().to_string(), |n| n.to_string_lossy().into_owned())
        })
    }

    /// Current status.
    pub fn status(&self) -> ShareStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next`.
    ///
    /// Setting the current status again is a no-op. Terminal statuses never
    /// change, and nothing moves back to `Pending`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatusTransition`] for any other change; the
    /// status is left untouched.
    pub fn set_status(&self, next: ShareStatus) -> Result<()> {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        let current = *status;
        if current == next {
            return Ok(());
        }

        let allowed = match current {
            ShareStatus::Pending => next != ShareStatus::Pending,
            ShareStatus::Running => next.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(Error::InvalidStatusTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }

        *status = next;
        Ok(())
    }

    /// Put a refused share back to `Pending` so it can be sent again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatusTransition`] unless the share was refused
    /// with a recoverable server code.
    pub fn mark_for_retry(&self) -> Result<()> {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        match *status {
            ShareStatus::ServerError(kind) if kind.is_recoverable() => {
                *status = ShareStatus::Pending;
                Ok(())
            }
            current => Err(Error::InvalidStatusTransition {
                from: current.to_string(),
                to: ShareStatus::Pending.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_share_is_pending() {
        let share = ShareInfo::new("/tmp/photo.jpg");
        assert_eq!(share.status(), ShareStatus::Pending);
        assert_eq!(share.display_name(), "photo.jpg");
        assert!(share.name().is_none());
    }

    #[test]
    fn test_name_override() {
        let share = ShareInfo::new("/tmp/photo.jpg").with_name("holiday.jpg");
        assert_eq!(share.display_name(), "holiday.jpg");
    }

    #[test]
    fn test_forward_transitions() {
        let share = ShareInfo::new("a.txt");
        share.set_status(ShareStatus::Running).unwrap();
        share.set_status(ShareStatus::Running).unwrap();
        share.set_status(ShareStatus::Success).unwrap();
        assert_eq!(share.status(), ShareStatus::Success);
    }

    #[test]
    fn test_success_is_final() {
        let share = ShareInfo::new("a.txt");
        share.set_status(ShareStatus::Running).unwrap();
        share.set_status(ShareStatus::Success).unwrap();

        let err = share.set_status(ShareStatus::Canceled).unwrap_err();
        assert!(matches!(err, Error::InvalidStatusTransition { .. }));
        assert_eq!(share.status(), ShareStatus::Success);
        assert!(share.mark_for_retry().is_err());
    }

    #[test]
    fn test_no_return_to_pending() {
        let share = ShareInfo::new("a.txt");
        share.set_status(ShareStatus::Running).unwrap();
        assert!(share.set_status(ShareStatus::Pending).is_err());
        assert_eq!(share.status(), ShareStatus::Running);
    }

    #[test]
    fn test_pending_can_fail_directly() {
        let share = ShareInfo::new("missing.txt");
        share
            .set_status(ShareStatus::ClientError(ClientErrorKind::FileError))
            .unwrap();
        assert!(share.status().is_terminal());
    }

    #[test]
    fn test_retry_only_for_recoverable_codes() {
        let share = ShareInfo::new("a.apk");
        share.set_status(ShareStatus::Running).unwrap();
        share
            .set_status(ShareStatus::ServerError(ServerErrorKind::UnsupportedType))
            .unwrap();
        share.mark_for_retry().unwrap();
        assert_eq!(share.status(), ShareStatus::Pending);

        let busy = ShareInfo::new("b.txt");
        busy.set_status(ShareStatus::ServerError(ServerErrorKind::Unhandled(0xD3)))
            .unwrap();
        busy.mark_for_retry().unwrap();

        let refused = ShareInfo::new("c.txt");
        refused
            .set_status(ShareStatus::ServerError(ServerErrorKind::Forbidden))
            .unwrap();
        assert!(refused.mark_for_retry().is_err());
        assert_eq!(
            refused.status(),
            ShareStatus::ServerError(ServerErrorKind::Forbidden)
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ShareStatus::Pending.code(), 190);
        assert_eq!(ShareStatus::Success.code(), 200);
        assert_eq!(
            ShareStatus::ClientError(ClientErrorKind::ConnectionError).code(),
            497
        );
        assert_eq!(
            ShareStatus::ServerError(ServerErrorKind::UnsupportedType).code(),
            406
        );
    }

    #[test]
    fn test_status_from_error_kind() {
        let status = |err: Error| ShareStatus::from_error_kind(err.kind());
        assert_eq!(
            status(Error::file_access("/tmp/a", "gone")),
            ShareStatus::ClientError(ClientErrorKind::FileError)
        );
        assert_eq!(
            status(Error::ProtocolError("short packet".to_string())),
            ShareStatus::ClientError(ClientErrorKind::DataError)
        );
        assert_eq!(status(Error::Interrupted), ShareStatus::Canceled);
        assert!(status(Error::ConnectionClosed).is_session_fatal());
        assert!(status(Error::Timeout(50)).is_session_fatal());
        assert_eq!(status(Error::NotStarted), ShareStatus::UnknownError);
    }

    #[test]
    fn test_server_kind_from_response() {
        assert_eq!(
            ServerErrorKind::from_response(ResponseCode::Forbidden),
            ServerErrorKind::Forbidden
        );
        assert_eq!(
            ServerErrorKind::from_response(ResponseCode::Other(0xD3)),
            ServerErrorKind::Unhandled(0xD3)
        );
    }

    #[test]
    fn test_status_serializes_with_kind() {
        let json = serde_json::to_string(&ShareStatus::ClientError(ClientErrorKind::FileError))
            .unwrap();
        assert_eq!(json, r#"{"status":"client_error","kind":"file_error"}"#);
        let json = serde_json::to_string(&ShareStatus::Success).unwrap();
        assert_eq!(json, r#"{"status":"success"}"#);
    }
}
