//! Access tokens signed with HMAC-SHA256.
//!
//! ## Token Format
//!
//! - 2 bytes: identity length (big-endian)
//! - N bytes: user identity (UTF-8)
//! - 8 bytes: issue time (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 signature over everything before it
//!
//! The whole token is base64url-encoded for transport.

use crate::error::{ServerError, ServerResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_LEN: usize = 32;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token lifetime.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a configuration with a one hour token lifetime.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            token_expiry: Duration::from_secs(60 * 60),
        }
    }

    /// Sets the token lifetime.
    #[must_use]
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Issues and checks access tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("token_expiry", &self.config.token_expiry)
            .finish_non_exhaustive()
    }
}

impl TokenValidator {
    /// Creates a validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Issues a token for `identity`, valid from now.
    pub fn create_token(&self, identity: &str) -> String {
        self.create_token_at(identity, now_millis())
    }

    /// Issues a token for `identity` as if issued at `issued_at` (Unix
    /// millis).
    pub fn create_token_at(&self, identity: &str, issued_at: u64) -> String {
        let identity = &identity.as_bytes()[..identity.len().min(usize::from(u16::MAX))];
        let mut data = Vec::with_capacity(2 + identity.len() + 8 + SIGNATURE_LEN);
        data.extend_from_slice(&(identity.len() as u16).to_be_bytes());
        data.extend_from_slice(identity);
        data.extend_from_slice(&issued_at.to_be_bytes());
        let signature = self.sign(&data);
        data.extend_from_slice(&signature);
        URL_SAFE_NO_PAD.encode(data)
    }

    /// Checks a token and returns the identity it was issued to.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotAuthorized`] for malformed or forged tokens
    /// and [`ServerError::TokenExpired`] for expired ones.
    pub fn validate(&self, token: &str) -> ServerResult<String> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| ServerError::NotAuthorized("token is not base64".into()))?;
        if bytes.len() < 2 + 8 + SIGNATURE_LEN {
            return Err(ServerError::NotAuthorized("token too short".into()));
        }
        let identity_len = usize::from(u16::from_be_bytes([bytes[0], bytes[1]]));
        let signed_len = 2 + identity_len + 8;
        if bytes.len() != signed_len + SIGNATURE_LEN {
            return Err(ServerError::NotAuthorized("invalid token length".into()));
        }

        let mut mac = self.mac();
        mac.update(&bytes[..signed_len]);
        mac.verify_slice(&bytes[signed_len..])
            .map_err(|_| ServerError::NotAuthorized("invalid signature".into()))?;

        let identity = std::str::from_utf8(&bytes[2..2 + identity_len])
            .map_err(|_| ServerError::NotAuthorized("identity is not UTF-8".into()))?
            .to_owned();
        let mut issued = [0u8; 8];
        issued.copy_from_slice(&bytes[2 + identity_len..signed_len]);
        let issued_at = u64::from_be_bytes(issued);
        let expiry = u64::try_from(self.config.token_expiry.as_millis()).unwrap_or(u64::MAX);
        if now_millis() > issued_at.saturating_add(expiry) {
            return Err(ServerError::TokenExpired);
        }
        Ok(identity)
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.config.secret).expect("HMAC can take key of any size")
    }

    fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_LEN] {
        let mut mac = self.mac();
        mac.update(data);
        mac.finalize().into_bytes().into()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TokenValidator {
        TokenValidator::new(AuthConfig::new(b"test-secret-key".to_vec()))
    }

    #[test]
    fn create_and_validate_token() {
        let validator = validator();
        let token = validator.create_token("alice");
        assert_eq!(validator.validate(&token).unwrap(), "alice");
    }

    #[test]
    fn reject_tampered_token() {
        let validator = validator();
        let token = validator.create_token("alice");
        let mut bytes = URL_SAFE_NO_PAD.decode(&token).unwrap();
        bytes[3] ^= 1;
        let forged = URL_SAFE_NO_PAD.encode(bytes);
        assert!(matches!(validator.validate(&forged), Err(ServerError::NotAuthorized(_))));
        assert!(matches!(validator.validate("%%%"), Err(ServerError::NotAuthorized(_))));
    }

    #[test]
    fn reject_other_secret() {
        let token = validator().create_token("alice");
        let other = TokenValidator::new(AuthConfig::new(b"another-secret".to_vec()));
        assert!(other.validate(&token).is_err());
    }

    #[test]
    fn reject_expired_token() {
        let validator = TokenValidator::new(
            AuthConfig::new(b"test-secret-key".to_vec()).with_expiry(Duration::from_secs(1)),
        );
        let token = validator.create_token_at("alice", now_millis() - 5_000);
        assert!(matches!(validator.validate(&token), Err(ServerError::TokenExpired)));
    }
}
