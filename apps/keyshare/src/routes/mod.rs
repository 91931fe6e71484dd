//! HTTP routes for the keyshare server.
//!
//! Routes are organized by functionality:
//! - `health`: Health check and build info (public)
//! - `users`: Registration, PIN verification and PIN change
//! - `assertions`: Commitment-proof assertions
//! - `admin`: Maintenance (storage key migration)

pub mod admin;
pub mod assertions;
pub mod health;
pub mod users;

pub use health::{build_info, health};
