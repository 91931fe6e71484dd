//! Service configuration derived from environment variables.
//!
//! Configuration is loaded once at startup and validated before the service
//! starts. Any problem with key material is fatal.
//!
//! ## Environment Variables
//!
//! ### Server
//! - `KEYSHARE_PORT`: HTTP port (default: 8080)
//! - `KEYSHARE_HOST`: Bind address (default: :: for dual-stack IPv4/IPv6)
//! - `KEYSHARE_REQUEST_TIMEOUT_MS`: Client request timeout
//! - `KEYSHARE_BODY_LIMIT_KB`: JSON body limit
//! - `INTERNAL_SERVICE_TOKEN`: Shared secret for the session layer
//! - `INTERNAL_SERVICE_TOKEN_REQUIRED`: Enforce the token outside production
//! - `RUST_LOG`: Log level filter
//!
//! ### Storage
//! - `KEYSHARE_DB_TYPE`: "memory" or "redb" (default: redb)
//! - `KEYSHARE_DB_PATH`: Path to ReDB database file
//! - `KEYSHARE_STORE_TIMEOUT_MS`: Bound on a single store call
//! - `KEYSHARE_CAS_RETRIES`: Compare-and-set retries per PIN attempt
//!
//! ### Keys
//! - `KEYSHARE_STORAGE_PRIMARY_KEYFILE`: Primary storage key (required)
//! - `KEYSHARE_STORAGE_FALLBACK_KEYFILES`: Comma-separated fallback key files
//! - `KEYSHARE_JWT_PRIVKEY` / `KEYSHARE_JWT_PRIVKEY_FILE`: RSA signing key PEM
//! - `KEYSHARE_JWT_KEY_ID`: Signing key identifier (`kid`)
//! - `KEYSHARE_JWT_ISSUER`: Issuer claim (default: keyshare_server)
//! - `KEYSHARE_JWT_PIN_EXPIRY_SECS`: Assertion lifetime (default: 300)
//!
//! ### TLS
//! - `KEYSHARE_TLS_CERT` / `KEYSHARE_TLS_CERT_FILE`: Server certificate chain PEM
//! - `KEYSHARE_TLS_PRIVKEY` / `KEYSHARE_TLS_PRIVKEY_FILE`: Server private key PEM
//! - `KEYSHARE_NO_TLS`: Serve plain HTTP in production (TLS terminated upstream)
//!
//! ### PIN policy
//! - `KEYSHARE_PIN_MAX_ATTEMPTS`: Failures before lockout (default: 3)
//! - `KEYSHARE_PIN_BACKOFF_BASE_SECS` / `KEYSHARE_PIN_BACKOFF_MAX_SECS`

use std::env;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::keyshare::lockout::{
    DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_MAX_ATTEMPTS, LockoutPolicy,
};
use crate::keyshare::{assertion, core as protocol};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DB_PATH: &str = "./.data/keyshare.redb";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_BODY_LIMIT_KB: usize = 64;

/// Helper to get a trimmed variable or empty string.
fn var_trim(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> String {
    lookup(name).unwrap_or_default().trim().to_string()
}

/// Helper to get a lowercase variable.
fn var_lower(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> String {
    var_trim(lookup, name).to_lowercase()
}

/// Helper to get a non-empty variable.
fn var_opt(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    Some(var_trim(lookup, name)).filter(|v| !v.is_empty())
}

/// Parse a numeric variable, falling back to the default when unset.
fn var_parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, String> {
    let raw = var_trim(lookup, name);
    if raw.is_empty() {
        return Ok(default);
    }
    raw.parse::<T>()
        .map_err(|_| format!("{name} has an invalid value '{raw}'"))
}

/// Check if a string value is truthy.
fn is_truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "yes")
}

/// User store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    /// Non-durable, development and tests only.
    Memory,
    /// ReDB embedded database.
    #[default]
    Redb,
}

impl FromStr for DbType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redb" => Ok(Self::Redb),
            other => Err(format!(
                "Invalid db type '{other}'. Must be 'memory' or 'redb'."
            )),
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redb => write!(f, "redb"),
        }
    }
}

/// PEM material given inline or as a file path.
#[derive(Clone)]
pub enum PemSource {
    Inline(Zeroizing<String>),
    File(PathBuf),
}

impl PemSource {
    /// Read the PEM bytes. `what` names the material in error messages.
    pub fn read(&self, what: &str) -> Result<Zeroizing<Vec<u8>>, String> {
        match self {
            Self::Inline(pem) => Ok(Zeroizing::new(pem.as_bytes().to_vec())),
            Self::File(path) => std::fs::read(path)
                .map(Zeroizing::new)
                .map_err(|e| format!("Failed to read {what} {}: {e}", path.display())),
        }
    }
}

impl fmt::Debug for PemSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline(_) => f.write_str("Inline([REDACTED])"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

/// Read an inline-or-file PEM pair of variables (`NAME` / `NAME_FILE`).
fn pem_source(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<PemSource>, String> {
    let file_name = format!("{name}_FILE");
    match (var_opt(lookup, name), var_opt(lookup, &file_name)) {
        (Some(_), Some(_)) => Err(format!("Set only one of {name} and {file_name}.")),
        (Some(pem), None) => Ok(Some(PemSource::Inline(Zeroizing::new(pem)))),
        (None, Some(path)) => Ok(Some(PemSource::File(PathBuf::from(path)))),
        (None, None) => Ok(None),
    }
}

/// TLS certificate chain and key as read from configuration.
pub struct TlsMaterial {
    pub cert_chain: Zeroizing<Vec<u8>>,
    pub private_key: Zeroizing<Vec<u8>>,
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    // Server
    port: u16,
    host: IpAddr,
    production: bool,
    internal_token: Option<String>,
    internal_token_required: bool,
    request_timeout_ms: u64,
    body_limit_bytes: usize,

    // Storage
    db_type: DbType,
    db_path: PathBuf,
    store_timeout_ms: u64,
    cas_retries: u32,

    // Keys
    primary_keyfile: Option<PathBuf>,
    fallback_keyfiles: Vec<PathBuf>,
    jwt_key: Option<PemSource>,
    jwt_key_id: u32,
    jwt_issuer: String,
    jwt_pin_expiry_secs: u64,

    // TLS
    tls_cert: Option<PemSource>,
    tls_privkey: Option<PemSource>,
    no_tls: bool,

    // PIN policy
    pin_max_attempts: u32,
    pin_backoff_base_secs: u64,
    pin_backoff_max_secs: u64,
}

impl Settings {
    /// Load settings from environment variables.
    ///
    /// Unparseable values are reported rather than replaced by defaults.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load settings from an arbitrary variable source.
    #[allow(clippy::too_many_lines)]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let lookup = &lookup;

        let port = var_parse(lookup, "KEYSHARE_PORT", DEFAULT_PORT)?;

        // Default to IPv6 unspecified (::) for dual-stack support.
        let host = var_parse(lookup, "KEYSHARE_HOST", IpAddr::V6(Ipv6Addr::UNSPECIFIED))?;

        let app_env = var_lower(lookup, "APP_ENV");
        let rust_env = var_lower(lookup, "RUST_ENV");
        let production = app_env == "production"
            || rust_env == "production"
            || is_truthy(&var_lower(lookup, "KEYSHARE_PRODUCTION"));

        let internal_token = var_opt(lookup, "INTERNAL_SERVICE_TOKEN");
        let internal_token_required =
            production || is_truthy(&var_lower(lookup, "INTERNAL_SERVICE_TOKEN_REQUIRED"));

        let request_timeout_ms = var_parse(
            lookup,
            "KEYSHARE_REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
        )?;
        let body_limit_kb = var_parse(lookup, "KEYSHARE_BODY_LIMIT_KB", DEFAULT_BODY_LIMIT_KB)?;
        let body_limit_bytes = body_limit_kb.saturating_mul(1024);

        let db_type = var_opt(lookup, "KEYSHARE_DB_TYPE")
            .map(|v| v.parse::<DbType>())
            .transpose()?
            .unwrap_or_default();
        let db_path = var_opt(lookup, "KEYSHARE_DB_PATH")
            .map_or_else(|| PathBuf::from(DEFAULT_DB_PATH), PathBuf::from);

        let store_timeout_ms = var_parse(
            lookup,
            "KEYSHARE_STORE_TIMEOUT_MS",
            u64::try_from(protocol::DEFAULT_STORE_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
        )?;
        let cas_retries = var_parse(lookup, "KEYSHARE_CAS_RETRIES", protocol::DEFAULT_CAS_RETRIES)?;

        let primary_keyfile = var_opt(lookup, "KEYSHARE_STORAGE_PRIMARY_KEYFILE").map(PathBuf::from);
        let fallback_keyfiles: Vec<PathBuf> = var_trim(lookup, "KEYSHARE_STORAGE_FALLBACK_KEYFILES")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();

        let jwt_key = pem_source(lookup, "KEYSHARE_JWT_PRIVKEY")?;
        let jwt_key_id = var_parse(lookup, "KEYSHARE_JWT_KEY_ID", 0u32)?;
        let jwt_issuer = var_opt(lookup, "KEYSHARE_JWT_ISSUER")
            .unwrap_or_else(|| assertion::DEFAULT_ISSUER.to_string());
        let jwt_pin_expiry_secs = var_parse(
            lookup,
            "KEYSHARE_JWT_PIN_EXPIRY_SECS",
            assertion::DEFAULT_EXPIRY.as_secs(),
        )?;

        let pin_max_attempts =
            var_parse(lookup, "KEYSHARE_PIN_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        let pin_backoff_base_secs = var_parse(
            lookup,
            "KEYSHARE_PIN_BACKOFF_BASE_SECS",
            DEFAULT_BACKOFF_BASE.as_secs(),
        )?;
        let pin_backoff_max_secs = var_parse(
            lookup,
            "KEYSHARE_PIN_BACKOFF_MAX_SECS",
            DEFAULT_BACKOFF_MAX.as_secs(),
        )?;

        let tls_cert = pem_source(lookup, "KEYSHARE_TLS_CERT")?;
        let tls_privkey = pem_source(lookup, "KEYSHARE_TLS_PRIVKEY")?;
        let no_tls = is_truthy(&var_lower(lookup, "KEYSHARE_NO_TLS"));

        Ok(Self {
            port,
            host,
            production,
            internal_token,
            internal_token_required,
            request_timeout_ms,
            body_limit_bytes,
            db_type,
            db_path,
            store_timeout_ms,
            cas_retries,
            primary_keyfile,
            fallback_keyfiles,
            jwt_key,
            jwt_key_id,
            jwt_issuer,
            jwt_pin_expiry_secs,
            pin_max_attempts,
            pin_backoff_base_secs,
            pin_backoff_max_secs,
            tls_cert,
            tls_privkey,
            no_tls,
        })
    }

    /// Create settings for tests: memory backend, no key files.
    pub fn for_tests() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            production: false,
            internal_token: None,
            internal_token_required: false,
            request_timeout_ms: 60_000,
            body_limit_bytes: DEFAULT_BODY_LIMIT_KB * 1024,
            db_type: DbType::Memory,
            db_path: PathBuf::from("./.data/test-keyshare.redb"),
            store_timeout_ms: 5_000,
            cas_retries: protocol::DEFAULT_CAS_RETRIES,
            primary_keyfile: None,
            fallback_keyfiles: vec![],
            jwt_key: None,
            jwt_key_id: 0,
            jwt_issuer: assertion::DEFAULT_ISSUER.to_string(),
            jwt_pin_expiry_secs: assertion::DEFAULT_EXPIRY.as_secs(),
            pin_max_attempts: DEFAULT_MAX_ATTEMPTS,
            pin_backoff_base_secs: DEFAULT_BACKOFF_BASE.as_secs(),
            pin_backoff_max_secs: DEFAULT_BACKOFF_MAX.as_secs(),
            tls_cert: None,
            tls_privkey: None,
            no_tls: false,
        }
    }

    /// Validate settings before the service starts.
    ///
    /// Returns an error message if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.internal_token_required && self.internal_token.is_none() {
            return Err("INTERNAL_SERVICE_TOKEN is required in production. \
                 Set INTERNAL_SERVICE_TOKEN or INTERNAL_SERVICE_TOKEN_REQUIRED=0."
                .to_string());
        }

        if self.production && self.db_type == DbType::Memory {
            return Err("KEYSHARE_DB_TYPE=memory is not allowed in production. \
                 Use KEYSHARE_DB_TYPE=redb."
                .to_string());
        }

        if self.primary_keyfile.is_none() {
            return Err("KEYSHARE_STORAGE_PRIMARY_KEYFILE is required.".to_string());
        }

        if self.jwt_key.is_none() {
            return Err("KEYSHARE_JWT_PRIVKEY or KEYSHARE_JWT_PRIVKEY_FILE is required.".to_string());
        }

        if self.jwt_issuer.is_empty() {
            return Err("KEYSHARE_JWT_ISSUER must not be empty.".to_string());
        }

        if self.jwt_pin_expiry_secs == 0 {
            return Err("KEYSHARE_JWT_PIN_EXPIRY_SECS must be greater than zero.".to_string());
        }

        if self.pin_max_attempts == 0 {
            return Err("KEYSHARE_PIN_MAX_ATTEMPTS must be at least 1.".to_string());
        }

        if self.pin_backoff_base_secs == 0 || self.pin_backoff_max_secs < self.pin_backoff_base_secs
        {
            return Err("PIN backoff must satisfy 0 < KEYSHARE_PIN_BACKOFF_BASE_SECS \
                 <= KEYSHARE_PIN_BACKOFF_MAX_SECS."
                .to_string());
        }

        if self.store_timeout_ms == 0 {
            return Err("KEYSHARE_STORE_TIMEOUT_MS must be greater than zero.".to_string());
        }

        if self.tls_cert.is_some() != self.tls_privkey.is_some() {
            return Err("KEYSHARE_TLS_CERT(_FILE) and KEYSHARE_TLS_PRIVKEY(_FILE) \
                 must be set together."
                .to_string());
        }

        if self.production && !self.tls_enabled() && !self.no_tls {
            return Err("TLS is required in production. Set KEYSHARE_TLS_CERT(_FILE) and \
                 KEYSHARE_TLS_PRIVKEY(_FILE), or KEYSHARE_NO_TLS=1 if TLS ends upstream."
                .to_string());
        }

        Ok(())
    }

    /// Read the JWT signing key PEM.
    pub fn load_jwt_private_key(&self) -> Result<Zeroizing<Vec<u8>>, String> {
        match &self.jwt_key {
            Some(source) => source.read("JWT key"),
            None => Err("No JWT signing key configured".to_string()),
        }
    }

    /// Read the TLS certificate chain and private key, if TLS is configured.
    pub fn load_tls_material(&self) -> Result<Option<TlsMaterial>, String> {
        match (&self.tls_cert, &self.tls_privkey) {
            (Some(cert), Some(key)) => Ok(Some(TlsMaterial {
                cert_chain: cert.read("TLS certificate")?,
                private_key: key.read("TLS private key")?,
            })),
            _ => Ok(None),
        }
    }

    // Getters

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn is_production(&self) -> bool {
        self.production
    }

    pub fn internal_token(&self) -> Option<&str> {
        self.internal_token.as_deref()
    }

    pub fn internal_token_required(&self) -> bool {
        self.internal_token_required
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn body_limit_bytes(&self) -> usize {
        self.body_limit_bytes
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn cas_retries(&self) -> u32 {
        self.cas_retries
    }

    pub fn primary_keyfile(&self) -> Option<&Path> {
        self.primary_keyfile.as_deref()
    }

    pub fn fallback_keyfiles(&self) -> &[PathBuf] {
        &self.fallback_keyfiles
    }

    pub fn jwt_key_id(&self) -> u32 {
        self.jwt_key_id
    }

    pub fn jwt_issuer(&self) -> &str {
        &self.jwt_issuer
    }

    pub fn jwt_pin_expiry(&self) -> Duration {
        Duration::from_secs(self.jwt_pin_expiry_secs)
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_privkey.is_some()
    }

    pub fn tls_privkey(&self) -> Option<&PemSource> {
        self.tls_privkey.as_ref()
    }

    pub fn lockout_policy(&self) -> LockoutPolicy {
        LockoutPolicy::new(
            self.pin_max_attempts,
            Duration::from_secs(self.pin_backoff_base_secs),
            Duration::from_secs(self.pin_backoff_max_secs),
        )
    }
}
