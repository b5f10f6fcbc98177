//! Authentication for hub connections and event ingestion.
//!
//! Browser clients authenticate the WebSocket upgrade with the same HS256 JWT
//! the REST backend hands out at login, passed as the `token` query
//! parameter. Backend services publishing over `POST /events` present a
//! shared service token instead, compared in constant time.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use unilink_hub::auth::{Claims, TokenValidator};
//!
//! let validator = TokenValidator::new("campus-secret");
//! let token = validator
//!     .issue(&Claims::new(42, 7, "student@uni.edu", "student"), Duration::from_secs(60))
//!     .unwrap();
//!
//! let claims = validator.validate(&token).unwrap();
//! assert_eq!(claims.user_id, 42);
//! assert_eq!(claims.college_id, 7);
//! ```

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

use crate::types::{CollegeId, UserId};

/// Issuer stamped on tokens minted by the platform backend.
pub const TOKEN_ISSUER: &str = "unilink-backend";

/// Errors raised while authenticating a connection or a publisher.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No token was supplied.
    #[error("missing authentication token")]
    MissingToken,

    /// The token failed signature or structural validation.
    #[error("invalid authentication token")]
    InvalidToken,

    /// The token was valid but has expired.
    #[error("authentication token expired")]
    Expired,

    /// A token could not be minted.
    #[error("failed to encode token: {0}")]
    Encoding(String),
}

impl AuthError {
    /// Stable code for JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::InvalidToken => "invalid_token",
            Self::Expired => "token_expired",
            Self::Encoding(_) => "token_encoding",
        }
    }
}

/// Claims carried by platform JWTs.
///
/// Field names match the tokens the REST backend already issues, so the same
/// login token authenticates both surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userID")]
    pub user_id: UserId,

    #[serde(default)]
    pub email: String,

    #[serde(default)]
    pub role: String,

    #[serde(rename = "collegeID")]
    pub college_id: CollegeId,

    #[serde(rename = "collegeCode", default)]
    pub college_code: String,

    #[serde(rename = "collegeLogoUrl", default)]
    pub college_logo_url: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub iss: String,

    #[serde(default)]
    pub sub: String,

    pub exp: i64,

    #[serde(default)]
    pub iat: i64,
}

impl Claims {
    /// Claims for a user with the registered fields left for [`TokenValidator::issue`].
    pub fn new(
        user_id: UserId,
        college_id: CollegeId,
        email: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            email: email.into(),
            role: role.into(),
            college_id,
            college_code: String::new(),
            college_logo_url: String::new(),
            name: String::new(),
            iss: String::new(),
            sub: String::new(),
            exp: 0,
            iat: 0,
        }
    }
}

/// Validates and mints HS256 platform tokens.
#[derive(Clone)]
pub struct TokenValidator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    /// Creates a validator for the shared HMAC secret.
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Validates a token and returns its claims.
    ///
    /// # Errors
    ///
    /// - [`AuthError::MissingToken`] if `token` is empty
    /// - [`AuthError::Expired`] if the `exp` claim is in the past
    /// - [`AuthError::InvalidToken`] for any other failure, including a
    ///   signature made with a different secret or algorithm
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| {
                debug!(reason = %err, "Token rejected");
                match err.kind() {
                    ErrorKind::ExpiredSignature => AuthError::Expired,
                    _ => AuthError::InvalidToken,
                }
            })
    }

    /// Signs `claims` with a fresh issue time and the given lifetime.
    pub fn issue(&self, claims: &Claims, ttl: Duration) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

        let mut claims = claims.clone();
        claims.iss = TOKEN_ISSUER.to_string();
        claims.sub = claims.user_id.to_string();
        claims.iat = now;
        claims.exp = now.saturating_add(ttl);

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| AuthError::Encoding(err.to_string()))
    }
}

impl fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenValidator")
            .field("algorithm", &Algorithm::HS256)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Checks a publisher's bearer token against the configured service token.
///
/// The comparison runs in constant time with respect to the token contents.
pub fn verify_service_token(provided: &str, expected: &str) -> Result<(), AuthError> {
    if provided.is_empty() {
        return Err(AuthError::MissingToken);
    }

    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(AuthError::InvalidToken)
    }
}
