//! Request authentication.
//!
//! Signed requests carry `Authorization: Bearer <jwt>`, an HS512 token over
//! `{access_key, nonce, query_hash, query_hash_alg}`. The query hash is the
//! hex SHA-512 of the unencoded query string.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::error::{RestError, RestResult};

type HmacSha512 = Hmac<Sha512>;

/// Environment variable holding the access key.
pub const ACCESS_KEY_ENV: &str = "UPBIT_ACCESS_KEY";
/// Environment variable holding the secret key.
pub const SECRET_KEY_ENV: &str = "UPBIT_SECRET_KEY";

/// API key pair.
///
/// The secret is zeroized on drop and never printed.
#[derive(Clone)]
pub struct Credentials {
    access_key: String,
    secret_key: Zeroizing<String>,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: Zeroizing::new(secret_key.into()),
        }
    }

    /// Load from `UPBIT_ACCESS_KEY` / `UPBIT_SECRET_KEY`.
    pub fn from_env() -> RestResult<Self> {
        let access_key = std::env::var(ACCESS_KEY_ENV)
            .map_err(|_| RestError::MissingCredentials(ACCESS_KEY_ENV.to_string()))?;
        let secret_key = std::env::var(SECRET_KEY_ENV)
            .map_err(|_| RestError::MissingCredentials(SECRET_KEY_ENV.to_string()))?;
        Ok(Self::new(access_key.trim(), secret_key.trim()))
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"****")
            .finish()
    }
}

#[derive(Serialize)]
struct JwtHeader {
    alg: &'static str,
    typ: &'static str,
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    access_key: &'a str,
    nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash_alg: Option<&'static str>,
}

/// Builds bearer tokens for signed requests.
#[derive(Debug, Clone)]
pub struct JwtSigner {
    credentials: Credentials,
}

impl JwtSigner {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    /// Bearer token for one request.
    ///
    /// `query` is the unencoded query string; `None` or empty omits the hash.
    pub fn token(&self, nonce: u64, query: Option<&str>) -> RestResult<String> {
        let header = JwtHeader {
            alg: "HS512",
            typ: "JWT",
        };
        let query_hash = query.filter(|q| !q.is_empty()).map(query_hash);
        let claims = JwtClaims {
            access_key: self.credentials.access_key(),
            nonce: nonce.to_string(),
            query_hash_alg: query_hash.as_ref().map(|_| "SHA512"),
            query_hash,
        };

        let header = B64URL.encode(serde_json::to_vec(&header).map_err(sign_err)?);
        let claims = B64URL.encode(serde_json::to_vec(&claims).map_err(sign_err)?);
        let signing_input = format!("{header}.{claims}");

        let mut mac = HmacSha512::new_from_slice(self.credentials.secret_key.as_bytes())
            .map_err(|e| RestError::Signing(format!("HMAC init failed: {e}")))?;
        mac.update(signing_input.as_bytes());
        let signature = B64URL.encode(mac.finalize().into_bytes());

        Ok(format!("{signing_input}.{signature}"))
    }

    /// `Authorization` header value.
    pub fn authorization(&self, nonce: u64, query: Option<&str>) -> RestResult<String> {
        Ok(format!("Bearer {}", self.token(nonce, query)?))
    }
}

fn sign_err(e: serde_json::Error) -> RestError {
    RestError::Signing(e.to_string())
}

/// Hex SHA-512 of the unencoded query string.
pub fn query_hash(query: &str) -> String {
    hex::encode(Sha512::digest(query.as_bytes()))
}

/// Mask a bearer token for logs: `Bearer ****<last 8>`.
pub fn mask_bearer(value: &str) -> String {
    match value.strip_prefix("Bearer ") {
        Some("") => "Bearer ****".to_string(),
        Some(token) => {
            let tail: String = token
                .chars()
                .rev()
                .take(8)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            format!("Bearer ****{tail}")
        }
        None => "****".to_string(),
    }
}
