//! Bearer token verification for user-facing routes.

pub mod jwt;

pub use jwt::Hs256Verifier;

/// Why a bearer token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("unsupported token algorithm {0:?}")]
    UnsupportedAlgorithm(String),
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token has no user id claim")]
    MissingUserId,
    #[error("token verification is not configured")]
    NotConfigured,
}

/// Maps a bearer token to the user id it was issued for.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<String, AuthError>;
}

/// Verifier used when no secret is configured: every token is rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledVerifier;

impl TokenVerifier for DisabledVerifier {
    fn verify(&self, _token: &str) -> Result<String, AuthError> {
        Err(AuthError::NotConfigured)
    }
}

/// Build the verifier for `[auth]`.
pub fn create_verifier(config: &crate::config::AuthConfig) -> std::sync::Arc<dyn TokenVerifier> {
    match config.jwt_secret.as_deref() {
        Some(secret) if !secret.is_empty() => std::sync::Arc::new(Hs256Verifier::new(secret)),
        _ => {
            tracing::warn!("auth.jwt_secret is not set; authenticated routes will reject all requests");
            std::sync::Arc::new(DisabledVerifier)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;

    #[test]
    fn unset_secret_rejects_everything() {
        let verifier = create_verifier(&AuthConfig::default());
        assert_eq!(verifier.verify("a.b.c"), Err(AuthError::NotConfigured));
    }

    #[test]
    fn configured_secret_verifies_tokens() {
        let verifier = create_verifier(&AuthConfig {
            jwt_secret: Some("s3cret".into()),
        });
        let token = Hs256Verifier::new("s3cret").sign(&serde_json::json!({"id": "user-9"}))
            .unwrap();
        assert_eq!(verifier.verify(&token).unwrap(), "user-9");
    }
}
