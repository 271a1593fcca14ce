//! Bearer-token authentication and role checks.
//!
//! The guard resolves the raw `Authorization` header value against the
//! catalog's identity table and compares the stored role with what the
//! operation requires. It never writes.

use crate::{
    models::{file_record::FileRecord, identity::Role},
    services::catalog::{Catalog, CatalogError},
};
use rand::{Rng, distr::Alphanumeric};
use thiserror::Error;
use tracing::debug;

/// Prefix stripped from the header value to obtain the token.
pub const BEARER_PREFIX: &str = "Bearer ";

const GENERATED_TOKEN_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("invalid API key")]
    Unauthenticated,
    #[error("insufficient permissions")]
    Unauthorized,
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// The resolved identity attached to an authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub username: String,
    pub role: Role,
}

impl Caller {
    /// Ownership rule for list and delete: roles below `ReadWriteAll` may
    /// only act on their own records.
    pub fn ensure_can_modify(&self, record: &FileRecord) -> Result<(), AccessError> {
        if self.role.spans_all_files() || record.creator == self.username {
            Ok(())
        } else {
            Err(AccessError::Unauthorized)
        }
    }
}

#[derive(Clone)]
pub struct AccessGuard {
    catalog: Catalog,
}

impl AccessGuard {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    /// Resolve `header` to a caller holding at least `required`.
    pub async fn authorize(
        &self,
        header: Option<&str>,
        required: Role,
    ) -> Result<Caller, AccessError> {
        let token = extract_token(header.unwrap_or_default());
        if token.is_empty() {
            debug!("rejecting request without credentials");
            return Err(AccessError::Unauthenticated);
        }

        let identity = self
            .catalog
            .find_identity_by_token(token)
            .await?
            .ok_or(AccessError::Unauthenticated)?;

        if !identity.role.satisfies(required) {
            debug!(
                "{} holds {} but {} is required",
                identity.username, identity.role, required
            );
            return Err(AccessError::Unauthorized);
        }

        Ok(Caller {
            username: identity.username,
            role: identity.role,
        })
    }
}

/// Strip the bearer prefix if present; other values are used verbatim.
pub fn extract_token(header: &str) -> &str {
    header.strip_prefix(BEARER_PREFIX).unwrap_or(header)
}

/// Fresh random API key for a newly provisioned identity.
pub fn generate_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_TOKEN_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::identity::Identity, services::catalog::tests::open_catalog};
    use chrono::Utc;
    use tempfile::TempDir;

    async fn guard_with_users(dir: &TempDir) -> AccessGuard {
        let catalog = open_catalog(dir).await;
        for (token, username, role) in [
            ("nobody-key", "nobody", Role::None),
            ("alice-key", "alice", Role::ReadWriteSelf),
            ("auditor-key", "auditor", Role::ReadWriteAll),
        ] {
            catalog
                .replace_identity(&Identity {
                    token: token.into(),
                    username: username.into(),
                    role,
                })
                .await
                .unwrap();
        }
        AccessGuard::new(catalog)
    }

    #[tokio::test]
    async fn resolves_bearer_tokens() {
        let dir = TempDir::new().unwrap();
        let guard = guard_with_users(&dir).await;

        let caller = guard
            .authorize(Some("Bearer alice-key"), Role::ReadWriteSelf)
            .await
            .unwrap();
        assert_eq!(
            caller,
            Caller {
                username: "alice".into(),
                role: Role::ReadWriteSelf
            }
        );

        // A bare token without the prefix is looked up as-is.
        let caller = guard
            .authorize(Some("auditor-key"), Role::ReadWriteSelf)
            .await
            .unwrap();
        assert_eq!(caller.username, "auditor");
    }

    #[tokio::test]
    async fn unknown_or_missing_tokens_are_unauthenticated() {
        let dir = TempDir::new().unwrap();
        let guard = guard_with_users(&dir).await;

        for header in [None, Some(""), Some("Bearer "), Some("Bearer wrong-key")] {
            let err = guard.authorize(header, Role::ReadWriteSelf).await.unwrap_err();
            assert!(matches!(err, AccessError::Unauthenticated), "{:?}", header);
        }
    }

    #[tokio::test]
    async fn insufficient_roles_are_unauthorized() {
        let dir = TempDir::new().unwrap();
        let guard = guard_with_users(&dir).await;

        let err = guard
            .authorize(Some("Bearer nobody-key"), Role::ReadWriteSelf)
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::Unauthorized));

        let err = guard
            .authorize(Some("Bearer alice-key"), Role::Administrator)
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::Unauthorized));
    }

    #[test]
    fn ownership_applies_below_read_write_all() {
        let record = FileRecord {
            id: "abcd1234".into(),
            name: "a.txt".into(),
            uploaded_at: Utc::now(),
            creator: "alice".into(),
        };
        let owner = Caller {
            username: "alice".into(),
            role: Role::ReadWriteSelf,
        };
        let stranger = Caller {
            username: "bob".into(),
            role: Role::ReadWriteSelf,
        };
        let auditor = Caller {
            username: "auditor".into(),
            role: Role::ReadWriteAll,
        };

        assert!(owner.ensure_can_modify(&record).is_ok());
        assert!(matches!(
            stranger.ensure_can_modify(&record),
            Err(AccessError::Unauthorized)
        ));
        assert!(auditor.ensure_can_modify(&record).is_ok());
    }

    #[test]
    fn token_helpers() {
        assert_eq!(extract_token("Bearer abc"), "abc");
        assert_eq!(extract_token("abc"), "abc");
        assert_eq!(extract_token(""), "");

        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.bytes().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(token, generate_token());
    }
}
