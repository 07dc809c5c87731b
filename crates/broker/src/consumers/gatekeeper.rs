//! Consumer authentication.
//!
//! The authenticator contract is pluggable; the broker ships a pre-shared
//! token implementation with constant-time comparison.  Without any
//! authenticator configured, consumers get anonymous participant identities
//! minted from the session's monotonic counter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use bc_domain::consumer::{ConsumerIdentity, ConsumerRole};
use bc_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a connecting consumer presented.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub session_id: String,
    pub token: Option<String>,
    pub role_hint: Option<ConsumerRole>,
    pub remote_addr: Option<String>,
}

/// Pluggable consumer authenticator.
///
/// `Ok(None)` means "no identity assigned" (the caller falls back to an
/// anonymous identity); `Err` rejects the connection.
#[async_trait]
pub trait ConsumerAuthenticator: Send + Sync {
    async fn authenticate(&self, ctx: &AuthContext) -> Result<Option<ConsumerIdentity>>;
}

/// Race the authenticator against the configured timeout.
pub async fn authenticate_with_timeout(
    authenticator: Option<&Arc<dyn ConsumerAuthenticator>>,
    ctx: &AuthContext,
    timeout: Duration,
) -> Result<Option<ConsumerIdentity>> {
    let Some(authenticator) = authenticator else {
        return Ok(None);
    };
    match tokio::time::timeout(timeout, authenticator.authenticate(ctx)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Authentication(format!(
            "authentication timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Mint an anonymous participant identity from the session counter.
pub fn anonymous_identity(session_id: &str, counter: u64) -> ConsumerIdentity {
    ConsumerIdentity {
        user_id: format!("anon-{counter}"),
        display_name: format!("Anonymous {counter}"),
        role: ConsumerRole::Participant,
        session_id: session_id.to_owned(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pre-shared token authenticator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Constant-time token comparison via SHA-256 digest.
/// Hashing normalizes lengths so ct_eq always compares 32 bytes.
fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

/// Accepts consumers presenting the configured pre-shared token; the role
/// comes from the connection's role hint (observer must be requested).
pub struct TokenAuthenticator {
    token: String,
}

impl TokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl ConsumerAuthenticator for TokenAuthenticator {
    async fn authenticate(&self, ctx: &AuthContext) -> Result<Option<ConsumerIdentity>> {
        let provided = ctx.token.as_deref().unwrap_or("");
        if !token_eq(provided, &self.token) {
            return Err(Error::Authentication(
                "invalid or missing consumer token".into(),
            ));
        }
        let user_id = uuid::Uuid::new_v4().to_string();
        Ok(Some(ConsumerIdentity {
            display_name: format!("consumer-{}", &user_id[..8]),
            user_id,
            role: ctx.role_hint.unwrap_or(ConsumerRole::Participant),
            session_id: ctx.session_id.clone(),
        }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_eq_constant_time_compare() {
        assert!(token_eq("secret", "secret"));
        assert!(!token_eq("secret", "Secret"));
        assert!(!token_eq("secret", ""));
        assert!(!token_eq("short", "a-much-longer-token"));
    }

    #[test]
    fn anonymous_identities_are_participants() {
        let identity = anonymous_identity("s1", 3);
        assert_eq!(identity.user_id, "anon-3");
        assert_eq!(identity.display_name, "Anonymous 3");
        assert_eq!(identity.role, ConsumerRole::Participant);
    }

    #[tokio::test]
    async fn no_authenticator_yields_none() {
        let result = authenticate_with_timeout(None, &AuthContext::default(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn token_authenticator_accepts_and_rejects() {
        let auth: Arc<dyn ConsumerAuthenticator> = Arc::new(TokenAuthenticator::new("hunter2"));
        let ctx = AuthContext {
            session_id: "s1".into(),
            token: Some("hunter2".into()),
            role_hint: Some(ConsumerRole::Observer),
            remote_addr: None,
        };
        let identity = authenticate_with_timeout(Some(&auth), &ctx, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(identity.role, ConsumerRole::Observer);
        assert_eq!(identity.session_id, "s1");

        let bad = AuthContext {
            token: Some("wrong".into()),
            ..ctx
        };
        let err = authenticate_with_timeout(Some(&auth), &bad, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test]
    async fn slow_authenticator_times_out() {
        struct SlowAuth;
        #[async_trait]
        impl ConsumerAuthenticator for SlowAuth {
            async fn authenticate(&self, _ctx: &AuthContext) -> Result<Option<ConsumerIdentity>> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(None)
            }
        }
        let auth: Arc<dyn ConsumerAuthenticator> = Arc::new(SlowAuth);
        let err = authenticate_with_timeout(
            Some(&auth),
            &AuthContext::default(),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }
}
