use std::path::PathBuf;

use snafu::Snafu;
use tokio::sync::watch;

use super::BoxFuture;
use super::ids::UserId;

mod session;

pub use session::{LocalSessionProvider, SESSION_DIRECTORY_NAME, SESSION_FILE_NAME};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
    pub email: String,
}

/// Who the backend currently considers signed in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Identity {
    #[default]
    Anonymous,
    Authenticated(AuthenticatedUser),
}

impl Identity {
    pub fn user(&self) -> Option<&AuthenticatedUser> {
        match self {
            Self::Anonymous => None,
            Self::Authenticated(user) => Some(user),
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user().map(|user| user.user_id)
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }
}

/// Change notifications for the current identity.
///
/// Dropping the watch, or calling [`IdentityWatch::unsubscribe`], ends it.
#[derive(Debug)]
pub struct IdentityWatch {
    receiver: Option<watch::Receiver<Identity>>,
}

impl IdentityWatch {
    pub fn new(receiver: watch::Receiver<Identity>) -> Self {
        Self {
            receiver: Some(receiver),
        }
    }

    /// Identity as of the last observed change.
    pub fn current(&self) -> Identity {
        self.receiver
            .as_ref()
            .map(|receiver| receiver.borrow().clone())
            .unwrap_or_default()
    }

    /// Waits for the next identity change; `None` once the watch has ended.
    pub async fn changed(&mut self) -> Option<Identity> {
        let changed = match self.receiver.as_mut() {
            Some(receiver) => receiver.changed().await.is_ok(),
            None => return None,
        };

        if !changed {
            self.receiver = None;
            return None;
        }

        self.receiver
            .as_mut()
            .map(|receiver| receiver.borrow_and_update().clone())
    }

    pub fn unsubscribe(&mut self) -> bool {
        self.receiver.take().is_some()
    }
}

pub trait IdentityProvider: Send + Sync {
    /// Resolves the identity of the active session.
    fn current_identity(&self) -> BoxFuture<'_, Identity>;

    fn watch(&self) -> IdentityWatch;
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AuthError {
    #[snafu(display("'{email}' is not a usable e-mail address"))]
    InvalidEmail { stage: &'static str, email: String },
    #[snafu(display("failed to create session directory at {path:?}"))]
    CreateSessionDirectory {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize session"))]
    SerializeSession {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write session file to {path:?}"))]
    WriteSessionFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to remove session file at {path:?}"))]
    RemoveSessionFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type AuthResult<T> = Result<T, AuthError>;
