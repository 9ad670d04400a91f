//! Bearer token issuance and verification.
//!
//! The gateway mints a token when email validation succeeds and the client
//! presents it on `/app/submit-csr`. The envelope is a JWT signed with
//! HMAC-SHA-256; the claims bind the registry `user_id` to the enrolment
//! `request_id` so the signer dispatch can correlate the two. Tokens are
//! never stored; validation is purely stateless.

use std::io::Write;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Issuer claim on every minted token.
pub const ISSUER: &str = "certM3";
/// Audience claim on every minted token.
pub const AUDIENCE: &str = "certM3-app";

/// Token lifetime: 24 hours.
const TOKEN_LIFETIME_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token signing failed: {0}")]
    Signing(String),
    #[error("token secret unavailable: {0}")]
    Secret(#[from] std::io::Error),
}

/// Claims carried by the bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub request_id: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// Mints and validates bearer tokens with a process-wide symmetric secret.
#[derive(Clone)]
pub struct TokenManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
}

impl TokenManager {
    pub fn new(secret: &str, issuer: &str, audience: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.to_string(),
            audience: audience.to_string(),
        }
    }

    /// Mints a token binding `(user_id, request_id)`, valid for 24 hours.
    pub fn mint(&self, user_id: &str, request_id: &str) -> Result<String, TokenError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            user_id: user_id.to_string(),
            request_id: request_id.to_string(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now,
            exp: now + TOKEN_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Validates a token: HS256 only, issuer and audience must match, the
    /// expiry must be in the future, and both identity claims must be
    /// non-empty.
    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        let claims = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e.to_string()),
            })?;

        if claims.user_id.is_empty() {
            return Err(TokenError::Invalid("missing user_id claim".into()));
        }
        if claims.request_id.is_empty() {
            return Err(TokenError::Invalid("missing request_id claim".into()));
        }
        Ok(claims)
    }
}

/// Loads the token-signing secret from `path`, generating it on first run.
///
/// The secret is one base64 line; the file is created with owner-only
/// permissions and read back after writing so every startup path goes
/// through the same read-and-trim.
pub fn load_or_generate_secret(path: impl AsRef<Path>) -> Result<String, TokenError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if !path.exists() {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        let encoded = STANDARD.encode(secret);

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(encoded.as_bytes())?;
        file.write_all(b"\n")?;
    }

    let contents = std::fs::read_to_string(path)?;
    Ok(contents.trim().to_string())
}
