//! Minimal HS256 JSON Web Token verification.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use super::{AuthError, TokenVerifier};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    exp: Option<i64>,
}

/// Verifies HS256 tokens signed with a shared secret. The user id is read from
/// the `id` claim (string or integer); `exp`, when present, is enforced.
pub struct Hs256Verifier {
    secret: Vec<u8>,
}

impl Hs256Verifier {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        <HmacSha256 as Mac>::new_from_slice(&self.secret).map_err(|_| AuthError::NotConfigured)
    }

    /// Issue a token for `claims`. Used by tests and tooling.
    pub fn sign(&self, claims: &serde_json::Value) -> Result<String, AuthError> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        let signing_input = format!("{header}.{payload}");
        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{signing_input}.{signature}"))
    }
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str, what: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::Malformed(format!("{what}: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| AuthError::Malformed(format!("{what}: {e}")))
}

impl TokenVerifier for Hs256Verifier {
    fn verify(&self, token: &str) -> Result<String, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let mut parts = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed("expected three segments".into()));
        };

        let header: Header = decode_segment(header_b64, "header")?;
        if header.alg != "HS256" {
            return Err(AuthError::UnsupportedAlgorithm(header.alg));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|e| AuthError::Malformed(format!("signature: {e}")))?;
        let mut mac = self.mac()?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let claims: Claims = decode_segment(payload_b64, "payload")?;
        if let Some(exp) = claims.exp {
            if chrono::Utc::now().timestamp() >= exp {
                return Err(AuthError::Expired);
            }
        }

        match claims.id {
            Some(serde_json::Value::String(id)) if !id.is_empty() => Ok(id),
            Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
            _ => Err(AuthError::MissingUserId),
        }
    }
}
