//! Storage key registry.
//!
//! Holds the primary AES-256 key used for every new secure container plus
//! any number of decrypt-only fallback keys. The registry is assembled once at
//! startup and then shared read-only (behind `Arc`) for the process lifetime.
//!
//! ## Key file layout
//!
//! Each key file is exactly 36 bytes: a little-endian `u32` key identifier
//! followed by the 32-byte key.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{KeyshareError, KeyshareResult};

/// Length of a raw storage key in bytes.
pub const STORAGE_KEY_LEN: usize = 32;

/// Length of a key file on disk (id + key).
pub const KEY_FILE_LEN: usize = 4 + STORAGE_KEY_LEN;

/// Identifier of a storage key, embedded in every secure container.
pub type KeyId = u32;

/// A symmetric storage key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StorageKey([u8; STORAGE_KEY_LEN]);

impl StorageKey {
    pub fn from_bytes(bytes: [u8; STORAGE_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; STORAGE_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StorageKey([REDACTED])")
    }
}

/// Parse the binary key file layout.
pub fn parse_key_file(data: &[u8]) -> KeyshareResult<(KeyId, StorageKey)> {
    if data.len() != KEY_FILE_LEN {
        return Err(KeyshareError::InvalidKeyMaterial(format!(
            "storage key must be {KEY_FILE_LEN} bytes, got {}",
            data.len()
        )));
    }

    let id = KeyId::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let mut key = [0u8; STORAGE_KEY_LEN];
    key.copy_from_slice(&data[4..]);
    let parsed = StorageKey::from_bytes(key);
    key.zeroize();

    Ok((id, parsed))
}

/// Read a key file from disk.
pub fn read_key_file(path: &Path) -> KeyshareResult<(KeyId, StorageKey)> {
    let mut data = std::fs::read(path).map_err(|e| {
        KeyshareError::InvalidKeyMaterial(format!(
            "failed to read storage key {}: {e}",
            path.display()
        ))
    })?;
    let parsed = parse_key_file(&data).map_err(|e| match e {
        KeyshareError::InvalidKeyMaterial(msg) => {
            KeyshareError::InvalidKeyMaterial(format!("{}: {msg}", path.display()))
        }
        other => other,
    });
    data.zeroize();
    parsed
}

/// Primary + fallback storage keys.
#[derive(Debug)]
pub struct KeyRegistry {
    primary_id: KeyId,
    keys: BTreeMap<KeyId, StorageKey>,
}

impl KeyRegistry {
    /// Create a registry with a single primary key.
    pub fn new(primary_id: KeyId, primary: StorageKey) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(primary_id, primary);
        Self { primary_id, keys }
    }

    /// Load the primary key file and every fallback key file.
    ///
    /// Any unreadable or malformed file is a fatal configuration error.
    pub fn from_files<P: AsRef<Path>>(primary: &Path, fallbacks: &[P]) -> KeyshareResult<Self> {
        let (id, key) = read_key_file(primary)?;
        let mut registry = Self::new(id, key);

        for path in fallbacks {
            let (id, key) = read_key_file(path.as_ref())?;
            registry.dangerous_add_fallback(id, key)?;
        }

        tracing::info!(
            primary_key_id = registry.primary_id,
            fallback_keys = registry.keys.len() - 1,
            "Loaded storage key registry"
        );

        Ok(registry)
    }

    /// Register a decrypt-only fallback key.
    ///
    /// DANGEROUS: this is the only way to accept containers sealed under a key
    /// other than the primary. Only call it while assembling the registry for
    /// a deliberate rotation window; a registry that has been shared with the
    /// keyshare core can no longer be mutated.
    pub fn dangerous_add_fallback(&mut self, id: KeyId, key: StorageKey) -> KeyshareResult<()> {
        if self.keys.contains_key(&id) {
            return Err(KeyshareError::InvalidKeyMaterial(format!(
                "storage key id {id} registered twice"
            )));
        }
        self.keys.insert(id, key);
        tracing::warn!(key_id = id, "Added fallback storage key");
        Ok(())
    }

    /// The key used for all new encryptions.
    pub fn primary(&self) -> (KeyId, &StorageKey) {
        // The primary is inserted on construction and keys are never removed.
        let key = &self.keys[&self.primary_id];
        (self.primary_id, key)
    }

    pub fn primary_id(&self) -> KeyId {
        self.primary_id
    }

    /// Resolve a key by identifier.
    pub fn lookup(&self, id: KeyId) -> KeyshareResult<&StorageKey> {
        self.keys
            .get(&id)
            .ok_or(KeyshareError::UnknownStorageKey(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn key_file_bytes(id: KeyId, fill: u8) -> Vec<u8> {
        let mut data = id.to_le_bytes().to_vec();
        data.extend_from_slice(&[fill; STORAGE_KEY_LEN]);
        data
    }

    #[test]
    fn test_parse_key_file() {
        let (id, key) = parse_key_file(&key_file_bytes(0x0102_0304, 7)).unwrap();
        assert_eq!(id, 0x0102_0304);
        assert_eq!(key.as_bytes(), &[7u8; STORAGE_KEY_LEN]);
    }

    #[test]
    fn test_parse_key_file_rejects_wrong_length() {
        let mut data = key_file_bytes(1, 1);
        data.push(0);
        assert!(matches!(
            parse_key_file(&data),
            Err(KeyshareError::InvalidKeyMaterial(_))
        ));
        assert!(matches!(
            parse_key_file(&data[..20]),
            Err(KeyshareError::InvalidKeyMaterial(_))
        ));
    }

    #[test]
    fn test_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("primary.key");
        let fallback = dir.path().join("fallback.key");
        std::fs::File::create(&primary)
            .unwrap()
            .write_all(&key_file_bytes(2, 2))
            .unwrap();
        std::fs::File::create(&fallback)
            .unwrap()
            .write_all(&key_file_bytes(1, 1))
            .unwrap();

        let registry = KeyRegistry::from_files(&primary, &[&fallback]).unwrap();
        assert_eq!(registry.primary_id(), 2);
        assert_eq!(registry.lookup(2).unwrap().as_bytes(), &[2u8; 32]);
        assert_eq!(registry.lookup(1).unwrap().as_bytes(), &[1u8; 32]);
    }

    #[test]
    fn test_from_files_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.key");
        let result = KeyRegistry::from_files::<&Path>(&missing, &[]);
        assert!(matches!(result, Err(KeyshareError::InvalidKeyMaterial(_))));
    }

    #[test]
    fn test_lookup_unknown_key() {
        let registry = KeyRegistry::new(1, StorageKey::from_bytes([1; 32]));
        assert!(matches!(
            registry.lookup(99),
            Err(KeyshareError::UnknownStorageKey(99))
        ));
    }

    #[test]
    fn test_fallback_id_reuse_rejected() {
        let mut registry = KeyRegistry::new(1, StorageKey::from_bytes([1; 32]));
        let result = registry.dangerous_add_fallback(1, StorageKey::from_bytes([2; 32]));
        assert!(result.is_err());
        // Primary untouched
        assert_eq!(registry.primary().1.as_bytes(), &[1u8; 32]);
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = StorageKey::from_bytes([0xAB; 32]);
        assert_eq!(format!("{key:?}"), "StorageKey([REDACTED])");
    }
}
