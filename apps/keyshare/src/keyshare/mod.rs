//! Keyshare cryptographic core.
//!
//! Modules, leaves first:
//!
//! - [`keys`]: primary and fallback storage keys
//! - [`container`]: AES-256-GCM secure containers
//! - [`share`]: plaintext secret share payload
//! - [`pin`]: Argon2id PIN verifiers
//! - [`lockout`]: exponential lockout policy
//! - [`assertion`]: RS256 assertion issuer and verifier
//! - [`core`](self::core): the PIN-gated release protocol tying them together

pub mod assertion;
pub mod container;
pub mod core;
pub mod keys;
pub mod lockout;
pub mod pin;
pub mod share;

pub use assertion::{AssertionClaims, AssertionIssuer, AssertionKind, AssertionVerifier};
pub use container::{SecureContainer, open, seal};
pub use self::core::{CoreOptions, KeyshareCore, MigrationReport, PinVerified};
pub use keys::{KeyId, KeyRegistry, StorageKey};
pub use lockout::LockoutPolicy;
pub use pin::PinHasher;
pub use share::UserSecretShare;
