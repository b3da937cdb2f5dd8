use std::fmt;
use std::str::FromStr;

use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

/// UUID newtype stored as text; `parse` is the only way in from the database.
macro_rules! define_backend_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(Uuid);

        impl $name {
            pub fn parse(raw: &str) -> StorageResult<Self> {
                Uuid::parse_str(raw.trim())
                    .map(Self)
                    .context(InvalidIdSnafu {
                        stage: concat!("parse-", $id_type),
                        id_type: $id_type,
                        raw: raw.to_string(),
                    })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self.0.as_hyphenated(), formatter)
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_backend_id!(MessageId, "message-id");
define_backend_id!(UserId, "user-id");

impl MessageId {
    /// Time-ordered id for a freshly written row.
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }
}

impl UserId {
    /// Derives the stable account id for an e-mail address.
    ///
    /// The address is trimmed and lower-cased first, so `Ada@Example.com ` and
    /// `ada@example.com` resolve to the same account.
    pub fn from_email(email: &str) -> Self {
        let normalized = email.trim().to_ascii_lowercase();
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("mailto:{normalized}").as_bytes()))
    }
}
