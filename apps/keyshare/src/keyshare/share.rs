//! Plaintext secret share payload.
//!
//! A [`UserSecretShare`] only ever lives inside an authenticated request.
//! Its bytes are zeroized when the value is dropped, which covers normal
//! return, early `?` exits and unwinding panics alike. `Debug` is redacted so
//! the share cannot end up in logs by accident.
//!
//! ## Payload layout (inside the secure container)
//!
//! ```text
//! version (1) || created_at unix seconds (i64 LE) || secret bytes
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{KeyshareError, KeyshareResult};

/// Current payload format version.
pub const SHARE_VERSION: u8 = 1;

const PAYLOAD_HEADER_LEN: usize = 1 + 8;

/// The server's contribution to a user's credential secret.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct UserSecretShare {
    #[zeroize(skip)]
    version: u8,
    #[zeroize(skip)]
    created_at: DateTime<Utc>,
    secret: Vec<u8>,
}

impl UserSecretShare {
    /// Wrap freshly generated or imported secret bytes.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            version: SHARE_VERSION,
            created_at: Utc::now(),
            secret,
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Borrow the secret bytes for immediate consumption.
    pub fn expose_secret(&self) -> &[u8] {
        &self.secret
    }

    /// Encode into the plaintext payload sealed by the container codec.
    pub fn to_payload(&self) -> Zeroizing<Vec<u8>> {
        let mut payload = Zeroizing::new(Vec::with_capacity(PAYLOAD_HEADER_LEN + self.secret.len()));
        payload.push(self.version);
        payload.extend_from_slice(&self.created_at.timestamp().to_le_bytes());
        payload.extend_from_slice(&self.secret);
        payload
    }

    /// Decode a payload produced by [`Self::to_payload`].
    ///
    /// The input buffer is zeroized before returning.
    pub fn from_payload(payload: Vec<u8>) -> KeyshareResult<Self> {
        let payload = Zeroizing::new(payload);

        if payload.len() < PAYLOAD_HEADER_LEN {
            return Err(KeyshareError::MalformedContainer(
                "secret share payload truncated".to_string(),
            ));
        }
        if payload[0] != SHARE_VERSION {
            return Err(KeyshareError::MalformedContainer(format!(
                "unsupported secret share version {}",
                payload[0]
            )));
        }

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&payload[1..PAYLOAD_HEADER_LEN]);
        let created_at = DateTime::from_timestamp(i64::from_le_bytes(ts), 0).ok_or_else(|| {
            KeyshareError::MalformedContainer("secret share timestamp out of range".to_string())
        })?;

        Ok(Self {
            version: payload[0],
            created_at,
            secret: payload[PAYLOAD_HEADER_LEN..].to_vec(),
        })
    }
}

impl fmt::Debug for UserSecretShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSecretShare")
            .field("version", &self.version)
            .field("created_at", &self.created_at)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}
