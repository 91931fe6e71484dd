//! PIN verifiers.
//!
//! PINs are never stored. Registration hashes the PIN with Argon2id into a
//! PHC string; verification recomputes the hash with the parameters embedded
//! in that string and compares in constant time.

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use zeroize::Zeroizing;

use crate::error::{KeyshareError, KeyshareResult};

/// Maximum accepted PIN length in bytes.
///
/// Clients may send a pre-hashed, base64 encoded PIN, hence the headroom.
pub const MAX_PIN_LENGTH: usize = 64;

/// Argon2id hasher for PIN verifiers.
#[derive(Clone, Debug)]
pub struct PinHasher {
    params: Params,
}

impl Default for PinHasher {
    fn default() -> Self {
        Self {
            params: Params::default(),
        }
    }
}

impl PinHasher {
    pub fn new(params: Params) -> Self {
        Self { params }
    }

    /// Minimal-cost parameters. Only for tests.
    pub fn insecure_for_tests() -> Self {
        let params = Params::new(Params::MIN_M_COST, 1, 1, None)
            .expect("minimum Argon2 parameters are valid");
        Self { params }
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Reject empty or oversized PINs before they reach the hasher.
    pub fn validate(pin: &str) -> KeyshareResult<()> {
        if pin.is_empty() {
            return Err(KeyshareError::InvalidPin("PIN must not be empty".to_string()));
        }
        if pin.len() > MAX_PIN_LENGTH {
            return Err(KeyshareError::InvalidPin(format!(
                "PIN must be at most {MAX_PIN_LENGTH} bytes"
            )));
        }
        Ok(())
    }

    /// Hash a PIN into a PHC-formatted verifier string.
    pub fn hash(&self, pin: &str) -> KeyshareResult<String> {
        Self::validate(pin)?;

        let salt = SaltString::generate(&mut OsRng);
        let pin_bytes = Zeroizing::new(pin.as_bytes().to_vec());

        self.argon2()
            .hash_password(&pin_bytes, &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| KeyshareError::Internal(format!("failed to hash PIN: {e}")))
    }

    /// Check a PIN against a stored verifier.
    ///
    /// Returns `Ok(false)` on mismatch. A verifier that cannot be parsed is an
    /// integrity problem with the stored record, not a wrong PIN.
    pub fn verify(&self, pin: &str, verifier: &str) -> KeyshareResult<bool> {
        let parsed = PasswordHash::new(verifier).map_err(|e| {
            KeyshareError::MalformedContainer(format!("unparseable PIN verifier: {e}"))
        })?;
        let pin_bytes = Zeroizing::new(pin.as_bytes().to_vec());

        match self.argon2().verify_password(&pin_bytes, &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(KeyshareError::Internal(format!(
                "PIN verification failed: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hasher = PinHasher::insecure_for_tests();
        let verifier = hasher.hash("1234").unwrap();

        assert!(verifier.starts_with("$argon2id$"));
        assert!(!verifier.contains("1234"));
        assert!(hasher.verify("1234", &verifier).unwrap());
        assert!(!hasher.verify("0000", &verifier).unwrap());
        assert!(!hasher.verify("12345", &verifier).unwrap());
    }

    #[test]
    fn test_salts_differ() {
        let hasher = PinHasher::insecure_for_tests();
        assert_ne!(hasher.hash("1234").unwrap(), hasher.hash("1234").unwrap());
    }

    #[test]
    fn test_verify_uses_params_from_verifier() {
        // A verifier produced with other parameters still verifies.
        let strong = PinHasher::new(Params::new(16 * 1024, 2, 1, None).unwrap());
        let verifier = strong.hash("2468").unwrap();
        assert!(PinHasher::insecure_for_tests().verify("2468", &verifier).unwrap());
    }

    #[test]
    fn test_validate() {
        assert!(PinHasher::validate("").is_err());
        assert!(PinHasher::validate(&"9".repeat(MAX_PIN_LENGTH + 1)).is_err());
        assert!(PinHasher::validate("0000").is_ok());
    }

    #[test]
    fn test_malformed_verifier() {
        let hasher = PinHasher::insecure_for_tests();
        assert!(matches!(
            hasher.verify("1234", "not-a-phc-string"),
            Err(KeyshareError::MalformedContainer(_))
        ));
    }
}
