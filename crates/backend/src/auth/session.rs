use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::sync::watch;

use super::{
    AuthResult, AuthenticatedUser, CreateSessionDirectorySnafu, Identity, IdentityProvider,
    IdentityWatch, InvalidEmailSnafu, RemoveSessionFileSnafu, SerializeSessionSnafu,
    WriteSessionFileSnafu,
};
use crate::BoxFuture;
use crate::ids::UserId;

pub const SESSION_DIRECTORY_NAME: &str = "adhikari";
pub const SESSION_FILE_NAME: &str = "session.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSession {
    user_id: String,
    email: String,
}

/// Identity provider backed by an in-process session, optionally persisted to disk.
pub struct LocalSessionProvider {
    identity: watch::Sender<Identity>,
    session_path: Option<PathBuf>,
}

impl LocalSessionProvider {
    pub fn default_session_path() -> PathBuf {
        dirs::data_dir()
            .map(|path| path.join(SESSION_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".adhikari"))
            .join(SESSION_FILE_NAME)
    }

    /// Session that lives only as long as the process.
    pub fn in_memory() -> Self {
        let (identity, _) = watch::channel(Identity::Anonymous);
        Self {
            identity,
            session_path: None,
        }
    }

    /// Session persisted at `session_path`, restoring any previous sign-in.
    pub fn with_session_file(session_path: PathBuf) -> Self {
        let restored = load_session(&session_path);
        let (identity, _) = watch::channel(restored);
        Self {
            identity,
            session_path: Some(session_path),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity.borrow().clone()
    }

    pub fn sign_in(&self, email: &str) -> AuthResult<AuthenticatedUser> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') {
            return InvalidEmailSnafu {
                stage: "sign-in-validate-email",
                email: email.to_string(),
            }
            .fail();
        }

        let user = AuthenticatedUser {
            user_id: UserId::from_email(email),
            email: email.to_string(),
        };

        if let Some(path) = &self.session_path {
            persist_session(path, &user)?;
        }

        self.publish(Identity::Authenticated(user.clone()));
        tracing::info!(user_id = %user.user_id, "signed in");
        Ok(user)
    }

    pub fn sign_out(&self) -> AuthResult<()> {
        if let Some(path) = &self.session_path
            && path.exists()
        {
            std::fs::remove_file(path).context(RemoveSessionFileSnafu {
                stage: "sign-out-remove-session-file",
                path: path.clone(),
            })?;
        }

        self.publish(Identity::Anonymous);
        tracing::info!("signed out");
        Ok(())
    }

    fn publish(&self, next: Identity) {
        self.identity.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

impl IdentityProvider for LocalSessionProvider {
    fn current_identity(&self) -> BoxFuture<'_, Identity> {
        let identity = self.identity();
        Box::pin(async move { identity })
    }

    fn watch(&self) -> IdentityWatch {
        IdentityWatch::new(self.identity.subscribe())
    }
}

fn load_session(path: &Path) -> Identity {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Identity::Anonymous,
        Err(error) => {
            tracing::warn!("failed to read session file {:?}: {}. starting signed out", path, error);
            return Identity::Anonymous;
        }
    };

    let stored = match serde_json::from_str::<StoredSession>(&content) {
        Ok(stored) => stored,
        Err(error) => {
            tracing::warn!("failed to parse session file {:?}: {}. starting signed out", path, error);
            return Identity::Anonymous;
        }
    };

    match UserId::parse(&stored.user_id) {
        Ok(user_id) => Identity::Authenticated(AuthenticatedUser {
            user_id,
            email: stored.email,
        }),
        Err(error) => {
            tracing::warn!("session file {:?} has an invalid user id: {}", path, error);
            Identity::Anonymous
        }
    }
}

fn persist_session(path: &Path, user: &AuthenticatedUser) -> AuthResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSessionDirectorySnafu {
            stage: "create-session-directory",
            path: parent.to_path_buf(),
        })?;
    }

    let content = serde_json::to_string_pretty(&StoredSession {
        user_id: user.user_id.to_string(),
        email: user.email.clone(),
    })
    .context(SerializeSessionSnafu {
        stage: "serialize-session-json",
    })?;

    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, content).context(WriteSessionFileSnafu {
        stage: "write-temporary-session-file",
        path: temp_path.clone(),
    })?;
    std::fs::rename(&temp_path, path).context(WriteSessionFileSnafu {
        stage: "rename-temporary-session-file",
        path: path.to_path_buf(),
    })?;

    Ok(())
}
