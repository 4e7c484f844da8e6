//! Authentication (C12): static bearer keys, a dynamic per-path-key store
//! trait, and public-access bypass.
//!
//! The real dynamic key store (and the admin HTTP surface that manages it)
//! is an external collaborator; the core only ships the trait boundary and
//! an in-memory implementation for tests, matching the "URL-path-prefix
//! carries the key" contract.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Resolved identity for an authenticated request: which backend group it
/// is allowed to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedGroup(pub String);

#[async_trait]
pub trait AuthStore: Send + Sync {
    async fn get_group_for_key(&self, key: &str) -> Option<AuthorizedGroup>;
}

#[derive(Debug, Default)]
pub struct InMemoryAuthStore {
    keys: RwLock<HashMap<String, AuthorizedGroup>>,
}

impl InMemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, group: impl Into<String>) {
        self.keys
            .write()
            .unwrap()
            .insert(key.into(), AuthorizedGroup(group.into()));
    }
}

#[async_trait]
impl AuthStore for InMemoryAuthStore {
    async fn get_group_for_key(&self, key: &str) -> Option<AuthorizedGroup> {
        self.keys.read().unwrap().get(key).cloned()
    }
}

pub struct Authenticator {
    static_keys: HashSet<String>,
    dynamic: bool,
    public_access: bool,
    admin_bearer: Option<String>,
    dynamic_store: Option<Box<dyn AuthStore>>,
    default_group: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Allowed(String),
    Unauthorized,
}

impl Authenticator {
    pub fn new(
        static_keys: impl IntoIterator<Item = String>,
        dynamic: bool,
        public_access: bool,
        admin_bearer: Option<String>,
        dynamic_store: Option<Box<dyn AuthStore>>,
        default_group: impl Into<String>,
    ) -> Self {
        Self {
            static_keys: static_keys.into_iter().collect(),
            dynamic,
            public_access,
            admin_bearer,
            dynamic_store,
            default_group: default_group.into(),
        }
    }

    /// `path_key` is whatever followed `/` in the request path (the bearer
    /// header, if present, is checked first).
    pub async fn authorize(
        &self,
        bearer: Option<&str>,
        path_key: Option<&str>,
    ) -> AuthOutcome {
        let candidate = bearer.or(path_key);

        if !self.static_keys.is_empty() {
            return match candidate {
                Some(key) if self.static_keys.contains(key) => {
                    AuthOutcome::Allowed(self.default_group.clone())
                }
                _ => AuthOutcome::Unauthorized,
            };
        }

        if self.dynamic {
            if let Some(key) = candidate {
                if let Some(store) = &self.dynamic_store {
                    if let Some(group) = store.get_group_for_key(key).await {
                        return AuthOutcome::Allowed(group.0);
                    }
                }
            }

            // missing path key + public access: observed behavior is allow
            if path_key.is_none() && self.public_access {
                return AuthOutcome::Allowed(self.default_group.clone());
            }

            return AuthOutcome::Unauthorized;
        }

        if self.public_access {
            return AuthOutcome::Allowed(self.default_group.clone());
        }

        AuthOutcome::Unauthorized
    }

    /// The admin surface always needs its own bearer, independent of
    /// public-access mode.
    pub fn authorize_admin(&self, bearer: Option<&str>) -> bool {
        match (&self.admin_bearer, bearer) {
            (Some(expected), Some(got)) => expected == got,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_key_allows_known_key() {
        let auth = Authenticator::new(
            ["abc".to_string()],
            false,
            false,
            None,
            None,
            "main",
        );
        assert_eq!(
            auth.authorize(Some("abc"), None).await,
            AuthOutcome::Allowed("main".to_string())
        );
        assert_eq!(auth.authorize(Some("nope"), None).await, AuthOutcome::Unauthorized);
    }

    #[tokio::test]
    async fn public_access_with_missing_path_key_and_dynamic_auth_allows() {
        let auth = Authenticator::new(Vec::new(), true, true, None, None, "main");
        assert_eq!(
            auth.authorize(None, None).await,
            AuthOutcome::Allowed("main".to_string())
        );
    }

    #[tokio::test]
    async fn dynamic_auth_rejects_unknown_key_without_public_access() {
        let store = InMemoryAuthStore::new();
        store.insert("known", "grpA");
        let auth = Authenticator::new(Vec::new(), true, false, None, Some(Box::new(store)), "main");

        assert_eq!(
            auth.authorize(None, Some("known")).await,
            AuthOutcome::Allowed("grpA".to_string())
        );
        assert_eq!(auth.authorize(None, Some("unknown")).await, AuthOutcome::Unauthorized);
    }

    #[test]
    fn admin_requires_matching_bearer_regardless_of_public_access() {
        let auth = Authenticator::new(Vec::new(), false, true, Some("secret".to_string()), None, "main");
        assert!(auth.authorize_admin(Some("secret")));
        assert!(!auth.authorize_admin(Some("wrong")));
        assert!(!auth.authorize_admin(None));
    }
}
