//! Signed assertions (RS256 JWTs).
//!
//! Assertions attest that a protocol step succeeded, most importantly that a
//! user just passed PIN verification. They are short-lived bearer tokens:
//! validity is purely a function of the signature and the `exp` claim.
//!
//! ## Claims
//!
//! - `iss`: configured issuer string
//! - `sub`: user or session identifier
//! - `iat` / `exp`: Unix seconds; `exp` is always set
//! - `jti`: random token identifier
//! - `kind`: `pin` or `commitment_proof`
//!
//! The JOSE header carries `kid`, the configured signing key identifier, so a
//! verifier holding several public keys across a rotation can pick the
//! matching one.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{KeyshareError, KeyshareResult};

/// Default issuer claim.
pub const DEFAULT_ISSUER: &str = "keyshare_server";

/// Default assertion lifetime (5 minutes).
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// Claim names managed by the issuer; callers cannot override them.
const RESERVED_CLAIMS: [&str; 8] = ["iss", "sub", "aud", "iat", "nbf", "exp", "jti", "kind"];

/// What an assertion attests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssertionKind {
    /// The subject passed PIN verification.
    Pin,
    /// The keyshare contributed commitments for a proof session.
    CommitmentProof,
}

/// Claims contained in an assertion JWT.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssertionClaims {
    /// Issuer
    pub iss: String,
    /// Subject (user or session identifier)
    pub sub: String,
    /// Issued at timestamp (Unix seconds)
    pub iat: i64,
    /// Expiration timestamp (Unix seconds)
    pub exp: i64,
    /// Token identifier
    pub jti: String,
    /// Assertion kind
    pub kind: AssertionKind,
    /// Additional caller-supplied claims
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Signs assertions with the configured RSA key.
pub struct AssertionIssuer {
    key_id: u32,
    issuer: String,
    default_expiry: Duration,
    encoding_key: EncodingKey,
}

impl AssertionIssuer {
    /// Build an issuer from a PEM encoded RSA private key.
    ///
    /// Performs a test signature so a malformed key fails at startup rather
    /// than on the first request.
    pub fn from_pem(
        pem: &[u8],
        key_id: u32,
        issuer: impl Into<String>,
        default_expiry: Duration,
    ) -> KeyshareResult<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(pem).map_err(|e| {
            KeyshareError::InvalidKeyMaterial(format!("invalid JWT signing key: {e}"))
        })?;

        if default_expiry.is_zero() {
            return Err(KeyshareError::Config(
                "assertion expiry must be greater than zero".to_string(),
            ));
        }

        let issuer = Self {
            key_id,
            issuer: issuer.into(),
            default_expiry,
            encoding_key,
        };

        issuer
            .issue(
                "startup-check",
                AssertionKind::Pin,
                Map::new(),
                Some(Duration::from_secs(1)),
            )
            .map_err(|e| {
                KeyshareError::InvalidKeyMaterial(format!("JWT signing key unusable: {e}"))
            })?;

        Ok(issuer)
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Sign an assertion valid from now.
    pub fn issue(
        &self,
        subject: &str,
        kind: AssertionKind,
        extra: Map<String, Value>,
        expiry: Option<Duration>,
    ) -> KeyshareResult<String> {
        self.issue_at(subject, kind, extra, expiry, Utc::now())
    }

    /// Sign an assertion with an explicit issuance time.
    pub fn issue_at(
        &self,
        subject: &str,
        kind: AssertionKind,
        mut extra: Map<String, Value>,
        expiry: Option<Duration>,
        now: DateTime<Utc>,
    ) -> KeyshareResult<String> {
        for claim in RESERVED_CLAIMS {
            extra.remove(claim);
        }

        let lifetime = expiry
            .filter(|d| !d.is_zero())
            .unwrap_or(self.default_expiry);
        let lifetime_secs = i64::try_from(lifetime.as_secs())
            .map_err(|_| KeyshareError::InvalidInput("assertion expiry too large".to_string()))?;
        let iat = now.timestamp();

        let claims = AssertionClaims {
            iss: self.issuer.clone(),
            sub: subject.to_string(),
            iat,
            exp: iat.saturating_add(lifetime_secs),
            jti: Uuid::new_v4().to_string(),
            kind,
            extra,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.key_id.to_string());

        encode(&header, &claims, &self.encoding_key)
            .map_err(|e| KeyshareError::Signing(e.to_string()))
    }
}

/// Verifies assertions against one or more known public keys.
///
/// Used by downstream consumers of the assertions and by tests.
pub struct AssertionVerifier {
    issuer: String,
    keys: HashMap<String, DecodingKey>,
}

impl AssertionVerifier {
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            keys: HashMap::new(),
        }
    }

    /// Register the public key for a signing key identifier.
    pub fn add_public_key_pem(&mut self, key_id: u32, pem: &[u8]) -> KeyshareResult<()> {
        let key = DecodingKey::from_rsa_pem(pem).map_err(|e| {
            KeyshareError::InvalidKeyMaterial(format!("invalid JWT public key: {e}"))
        })?;
        self.keys.insert(key_id.to_string(), key);
        Ok(())
    }

    /// Verify an assertion at the current time.
    pub fn verify(&self, token: &str) -> KeyshareResult<AssertionClaims> {
        self.verify_at(token, Utc::now())
    }

    /// Verify signature, issuer and expiry relative to `now`.
    ///
    /// The token is accepted while `now < exp`.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> KeyshareResult<AssertionClaims> {
        let header = decode_header(token)?;
        let kid = header.kid.ok_or_else(|| {
            KeyshareError::InvalidAssertion("Missing key ID in JWT header".to_string())
        })?;
        let key = self
            .keys
            .get(&kid)
            .ok_or_else(|| KeyshareError::InvalidAssertion(format!("Key not found: {kid}")))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_required_spec_claims(&["exp", "iat", "iss", "sub"]);
        validation.set_issuer(&[self.issuer.as_str()]);
        // Expiry is checked below against the caller's clock.
        validation.validate_exp = false;

        let claims = decode::<AssertionClaims>(token, key, &validation)?.claims;

        if now.timestamp() >= claims.exp {
            return Err(KeyshareError::AssertionExpired);
        }

        Ok(claims)
    }
}
