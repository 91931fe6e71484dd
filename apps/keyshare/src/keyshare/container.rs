//! Secure container codec.
//!
//! A secure container is the encrypted-at-rest form of a user's secret share.
//! Containers are sealed with AES-256-GCM under the registry's primary key
//! and tagged with that key's identifier so they can still be opened after a
//! rotation, as long as the old key is registered as a fallback.
//!
//! ## Wire format
//!
//! ```text
//! version (1) || key_id (u32 LE) || nonce (12) || ciphertext || tag (16)
//! ```
//!
//! The 5-byte header is bound as associated data, so rewriting the key id or
//! version is detected as tampering.

use std::fmt;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{KeyshareError, KeyshareResult};
use crate::keyshare::keys::{KeyId, KeyRegistry};

/// Current container format version.
pub const CONTAINER_VERSION: u8 = 1;

const HEADER_LEN: usize = 1 + 4;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encrypted, key-tagged secret share.
#[derive(Clone, PartialEq, Eq)]
pub struct SecureContainer {
    key_id: KeyId,
    nonce: [u8; NONCE_LEN],
    /// Ciphertext with the GCM tag appended.
    ciphertext: Vec<u8>,
}

impl SecureContainer {
    /// Identifier of the storage key this container was sealed with.
    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    fn header(key_id: KeyId) -> [u8; HEADER_LEN] {
        let id = key_id.to_le_bytes();
        [CONTAINER_VERSION, id[0], id[1], id[2], id[3]]
    }

    /// Serialize to the binary wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + NONCE_LEN + self.ciphertext.len());
        bytes.extend_from_slice(&Self::header(self.key_id));
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Parse the binary wire format. Structural problems are integrity errors.
    pub fn from_bytes(bytes: &[u8]) -> KeyshareResult<Self> {
        if bytes.len() < HEADER_LEN + NONCE_LEN + TAG_LEN {
            return Err(KeyshareError::MalformedContainer(format!(
                "container too short: {} bytes",
                bytes.len()
            )));
        }

        if bytes[0] != CONTAINER_VERSION {
            return Err(KeyshareError::MalformedContainer(format!(
                "unsupported container version {}",
                bytes[0]
            )));
        }

        let key_id = KeyId::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[HEADER_LEN..HEADER_LEN + NONCE_LEN]);

        Ok(Self {
            key_id,
            nonce,
            ciphertext: bytes[HEADER_LEN + NONCE_LEN..].to_vec(),
        })
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> KeyshareResult<Self> {
        let bytes = BASE64.decode(encoded).map_err(|e| {
            KeyshareError::MalformedContainer(format!("invalid base64 container: {e}"))
        })?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for SecureContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureContainer")
            .field("key_id", &self.key_id)
            .field("len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

impl Serialize for SecureContainer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for SecureContainer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Encrypt a plaintext under the registry's primary key.
///
/// A fresh random nonce is drawn from the OS RNG on every call.
pub fn seal(registry: &KeyRegistry, plaintext: &[u8]) -> KeyshareResult<SecureContainer> {
    let (key_id, key) = registry.primary();
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let header = SecureContainer::header(key_id);

    let ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: &header,
            },
        )
        .map_err(|e| KeyshareError::Internal(format!("container encryption failed: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(nonce.as_slice());

    Ok(SecureContainer {
        key_id,
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Decrypt a container with whichever registered key it names.
///
/// Never re-encrypts: opening under a fallback key leaves the container as is.
pub fn open(registry: &KeyRegistry, container: &SecureContainer) -> KeyshareResult<Vec<u8>> {
    let key = registry.lookup(container.key_id)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let header = SecureContainer::header(container.key_id);

    cipher
        .decrypt(
            Nonce::from_slice(&container.nonce),
            Payload {
                msg: &container.ciphertext,
                aad: &header,
            },
        )
        .map_err(|_| KeyshareError::ContainerTampered)
}
