//! Identity glue.
//!
//! Sign-in itself belongs to an external identity provider. This module
//! consumes what it reports, keeps a local user record per identity, and
//! resolves the admin flag from the stored role once per sign-in. Any failure
//! while resolving the role yields the least-privileged role rather than a
//! failed sign-in.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::models::{Role, UserIdentity};
use super::store::ContentStore;
use crate::config::IdentityConfig;

/// Abstraction over the external identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in(&self) -> Result<UserIdentity>;

    async fn sign_out(&self) -> Result<()>;

    /// Fires with the current identity, or `None` once signed out.
    fn subscribe(&self) -> watch::Receiver<Option<UserIdentity>>;
}

/// Provider for local tooling: signs in as a fixed identity.
pub struct LocalIdentityProvider {
    identity: UserIdentity,
    tx: watch::Sender<Option<UserIdentity>>,
}

impl LocalIdentityProvider {
    pub fn new(identity: UserIdentity) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { identity, tx }
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn sign_in(&self) -> Result<UserIdentity> {
        self.tx.send_replace(Some(self.identity.clone()));
        Ok(self.identity.clone())
    }

    async fn sign_out(&self) -> Result<()> {
        self.tx.send_replace(None);
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<Option<UserIdentity>> {
        self.tx.subscribe()
    }
}

/// Signed-in identity plus its resolved role.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuthState {
    pub identity: Option<UserIdentity>,
    pub role: Role,
}

impl AuthState {
    pub fn is_admin(&self) -> bool {
        self.identity.is_some() && self.role.is_admin()
    }

    pub fn uid(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.uid.as_str())
    }
}

/// Record the identity in the store and resolve its role.
pub async fn resolve_identity<S: ContentStore + ?Sized>(
    store: &S,
    identity: Option<UserIdentity>,
) -> AuthState {
    let Some(identity) = identity else {
        tracing::info!("user signed out");
        return AuthState::default();
    };

    let role = match store.upsert_user(&identity).await {
        Ok(_) => match store.get_user_role(&identity.uid).await {
            Ok(role) => role,
            Err(e) => {
                tracing::warn!(uid = %identity.uid, error = %e, "failed to fetch user role");
                Role::User
            }
        },
        Err(e) => {
            tracing::warn!(uid = %identity.uid, error = %e, "failed to record user");
            Role::User
        }
    };
    tracing::info!(uid = %identity.uid, role = %role, "user signed in");
    AuthState {
        identity: Some(identity),
        role,
    }
}

/// Resolve the role of an already-known identity without recording a
/// sign-in. Unknown users and lookup failures get the least-privileged role.
pub async fn lookup_identity<S: ContentStore + ?Sized>(
    store: &S,
    identity: Option<UserIdentity>,
) -> AuthState {
    let Some(identity) = identity else {
        return AuthState::default();
    };
    let role = match store.get_user_role(&identity.uid).await {
        Ok(role) => role,
        Err(e) => {
            tracing::warn!(uid = %identity.uid, error = %e, "failed to fetch user role");
            Role::User
        }
    };
    AuthState {
        identity: Some(identity),
        role,
    }
}

/// Follow a provider's identity changes, resolving the role on each change.
pub fn follow_identity<S>(
    provider: &dyn IdentityProvider,
    store: Arc<S>,
) -> (watch::Receiver<AuthState>, JoinHandle<()>)
where
    S: ContentStore + ?Sized + 'static,
{
    let mut identities = provider.subscribe();
    let (tx, rx) = watch::channel(AuthState::default());
    let handle = tokio::spawn(async move {
        while identities.changed().await.is_ok() {
            let identity = identities.borrow_and_update().clone();
            let state = resolve_identity(store.as_ref(), identity).await;
            if tx.send(state).is_err() {
                break;
            }
        }
    });
    (rx, handle)
}

/// Read the identity forwarded by the fronting identity provider.
/// Returns `None` when the user header is absent or blank, or when a proxy
/// secret is configured and the request doesn't carry it.
pub fn identity_from_headers(headers: &HeaderMap, config: &IdentityConfig) -> Option<UserIdentity> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let uid = header(&config.user_header)?;
    if let Some(secret) = &config.trusted_proxy_secret {
        let presented = header(&config.secret_header);
        if !presented.is_some_and(|p| secrets_match(&p, secret)) {
            tracing::warn!(%uid, "ignoring identity headers without a valid proxy secret");
            return None;
        }
    }
    Some(UserIdentity {
        uid,
        email: header(&config.email_header),
        name: header(&config.name_header),
        photo_url: header(&config.photo_header),
    })
}

/// Compare without short-circuiting on the first differing byte.
fn secrets_match(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::store::testing::RecordingStore;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn test_new_identity_resolves_to_user() {
        let store = RecordingStore::new();
        let auth = resolve_identity(&store, Some(UserIdentity::new("u1"))).await;
        assert_eq!(auth.role, Role::User);
        assert!(!auth.is_admin());
        assert_eq!(auth.uid(), Some("u1"));
    }

    #[tokio::test]
    async fn test_admin_identity_resolves_to_admin() {
        let store = RecordingStore::new();
        store.set_user_role("boss", Role::Admin).await.unwrap();
        let auth = resolve_identity(&store, Some(UserIdentity::new("boss"))).await;
        assert!(auth.is_admin());
    }

    #[tokio::test]
    async fn test_store_failure_defaults_to_least_privilege() {
        let store = RecordingStore::new();
        store.set_user_role("boss", Role::Admin).await.unwrap();
        store.set_failing(true);
        let auth = resolve_identity(&store, Some(UserIdentity::new("boss"))).await;
        assert_eq!(auth.role, Role::User);
        assert!(auth.identity.is_some());
    }

    #[tokio::test]
    async fn test_sign_out_clears_state() {
        let store = RecordingStore::new();
        let auth = resolve_identity(&store, None).await;
        assert_eq!(auth, AuthState::default());
        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test]
    async fn test_follow_identity_tracks_sign_in_and_out() {
        let store = Arc::new(RecordingStore::new());
        store.set_user_role("ed", Role::Admin).await.unwrap();
        let provider = LocalIdentityProvider::new(UserIdentity::new("ed"));
        let (mut auth_rx, _handle) = follow_identity(&provider, store.clone());

        provider.sign_in().await.unwrap();
        let signed_in = auth_rx
            .wait_for(|a| a.identity.is_some())
            .await
            .unwrap()
            .clone();
        assert!(signed_in.is_admin());

        provider.sign_out().await.unwrap();
        let signed_out = auth_rx
            .wait_for(|a| a.identity.is_none())
            .await
            .unwrap()
            .clone();
        assert!(!signed_out.is_admin());
    }

    #[test]
    fn test_identity_from_headers() {
        let config = IdentityConfig::default();
        let mut headers = HeaderMap::new();
        assert!(identity_from_headers(&headers, &config).is_none());

        headers.insert("x-auth-user", HeaderValue::from_static("  "));
        assert!(identity_from_headers(&headers, &config).is_none());

        headers.insert("x-auth-user", HeaderValue::from_static("uid-9"));
        headers.insert("x-auth-email", HeaderValue::from_static("nine@example.com"));
        let identity = identity_from_headers(&headers, &config).unwrap();
        assert_eq!(identity.uid, "uid-9");
        assert_eq!(identity.email.as_deref(), Some("nine@example.com"));
        assert!(identity.name.is_none());
    }

    #[test]
    fn test_identity_headers_require_proxy_secret_when_configured() {
        let config = IdentityConfig {
            trusted_proxy_secret: Some("s3cret".into()),
            ..IdentityConfig::default()
        };
        let mut headers = HeaderMap::new();
        headers.insert("x-auth-user", HeaderValue::from_static("boss"));
        assert!(identity_from_headers(&headers, &config).is_none());

        headers.insert("x-pagewise-proxy-secret", HeaderValue::from_static("s3creT"));
        assert!(identity_from_headers(&headers, &config).is_none());

        headers.insert("x-pagewise-proxy-secret", HeaderValue::from_static("s3cret"));
        assert_eq!(identity_from_headers(&headers, &config).unwrap().uid, "boss");
    }

    #[tokio::test]
    async fn test_lookup_identity_does_not_record_user() {
        let store = RecordingStore::new();
        store.set_user_role("boss", Role::Admin).await.unwrap();

        let auth = lookup_identity(&store, Some(UserIdentity::new("boss"))).await;
        assert!(auth.is_admin());
        let auth = lookup_identity(&store, Some(UserIdentity::new("stranger"))).await;
        assert_eq!(auth.role, Role::User);
        assert!(store.db.lock_sync().unwrap().get_user("stranger").unwrap().is_none());
        assert!(!store.log.lock().unwrap().iter().any(|op| op == "upsert_user"));

        store.set_failing(true);
        let auth = lookup_identity(&store, Some(UserIdentity::new("boss"))).await;
        assert_eq!(auth.role, Role::User);
    }
}
