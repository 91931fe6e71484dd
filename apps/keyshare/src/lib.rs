// Crate-level lint configuration
// Allow noisy pedantic/cargo lints that aren't worth fixing individually
#![allow(clippy::multiple_crate_versions)] // Transitive deps, can't easily fix
#![allow(clippy::missing_errors_doc)] // Would require extensive doc changes
#![allow(clippy::missing_panics_doc)] // Would require extensive doc changes
#![allow(clippy::must_use_candidate)] // Too many false positives for internal APIs
#![allow(clippy::module_name_repetitions)] // Acceptable for clarity (e.g., KeyshareError in error mod)
#![allow(clippy::doc_markdown)] // Too strict about backticks in docs
#![allow(clippy::missing_const_for_fn)] // Often debatable, runtime doesn't benefit

//! Keyshare Server
//!
//! Holds, for each registered user, the server's share of the secret behind
//! their attribute-based credentials. The share is released only after the
//! user proves knowledge of their PIN, and every successful verification is
//! attested by a short-lived signed assertion for the session layer.
//!
//! ## Architecture
//!
//! - **Key registry**: one primary AES-256 storage key plus decrypt-only
//!   fallbacks, loaded once at startup
//! - **Secure containers**: AES-256-GCM sealed shares tagged with their key id
//! - **User store**: in-memory or ReDB backend behind the `UserStore` trait
//! - **PIN protocol**: Argon2id verifiers, exponential lockout, optimistic
//!   compare-and-set on the attempt counter
//! - **Assertions**: RS256 JWTs with a `kid` header
//!
//! ## Security Model
//!
//! - The full credential secret is never reconstructed here
//! - Shares are encrypted at rest and zeroized after use
//! - A decryption failure is an integrity fault, never a wrong PIN
//! - Callers authenticate with `INTERNAL_SERVICE_TOKEN`
//! - The listener serves TLS when a certificate and key are configured

pub mod app;
pub mod config;
pub mod error;
pub mod keyshare;
pub mod middleware;
pub mod routes;
pub mod storage;
pub mod telemetry;
pub mod tls;

// Re-export commonly used types
pub use app::AppCore;
pub use config::{DbType, Settings};
pub use error::{KeyshareError, KeyshareResult};
pub use keyshare::KeyshareCore;
