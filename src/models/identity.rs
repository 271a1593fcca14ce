//! Caller identities and the ordered role model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};

/// Permission level attached to a credential.
///
/// Declaration order is the authorization order: a role satisfies a
/// requirement iff it compares greater than or equal to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    None,
    ReadWriteSelf,
    ReadWriteAll,
    Administrator,
}

impl Role {
    /// Integer stored in the `users.permissions` column.
    pub fn level(self) -> i64 {
        match self {
            Role::None => 0,
            Role::ReadWriteSelf => 1,
            Role::ReadWriteAll => 2,
            Role::Administrator => 3,
        }
    }

    /// True if this role meets `required`.
    pub fn satisfies(self, required: Role) -> bool {
        self >= required
    }

    /// True if this role may see and delete other users' files.
    pub fn spans_all_files(self) -> bool {
        self.satisfies(Role::ReadWriteAll)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::None => "none",
            Role::ReadWriteSelf => "read-write-self",
            Role::ReadWriteAll => "read-write-all",
            Role::Administrator => "administrator",
        }
    }
}

impl From<i64> for Role {
    /// Unknown levels collapse to `None`.
    fn from(level: i64) -> Self {
        match level {
            1 => Role::ReadWriteSelf,
            2 => Role::ReadWriteAll,
            3 => Role::Administrator,
            0 => Role::None,
            other => {
                tracing::warn!("unknown permission level {} treated as none", other);
                Role::None
            }
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    /// Accepts the kebab-case name or the numeric level.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(Role::None),
            "read-write-self" | "1" => Ok(Role::ReadWriteSelf),
            "read-write-all" | "2" => Ok(Role::ReadWriteAll),
            "administrator" | "admin" | "3" => Ok(Role::Administrator),
            other => Err(format!(
                "unknown role `{}` (expected none, read-write-self, read-write-all or administrator)",
                other
            )),
        }
    }
}

/// A row of the `users` table: one bearer token bound to one username.
#[derive(Clone, FromRow, PartialEq, Eq)]
pub struct Identity {
    #[sqlx(rename = "api_key")]
    pub token: String,

    pub username: String,

    #[sqlx(rename = "permissions", try_from = "i64")]
    pub role: Role,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("token", &"<redacted>")
            .field("username", &self.username)
            .field("role", &self.role)
            .finish()
    }
}
