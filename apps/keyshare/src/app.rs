//! Startup wiring: settings to a ready [`AppCore`].
//!
//! Every failure here is fatal. The binary reports it and exits before
//! binding a socket.

use std::sync::Arc;

use crate::config::{DbType, PemSource, Settings};
use crate::error::{KeyshareError, KeyshareResult};
use crate::keyshare::{AssertionIssuer, CoreOptions, KeyRegistry, KeyshareCore, PinHasher};
use crate::storage::{MemoryStore, RedbStore, UserStoreBackend};
use crate::tls;

/// The core as served over HTTP.
pub type AppCore = KeyshareCore<UserStoreBackend>;

/// Open the configured user store backend.
pub fn open_store(settings: &Settings) -> KeyshareResult<UserStoreBackend> {
    match settings.db_type() {
        DbType::Memory => {
            tracing::warn!("Using in-memory user store, data is lost on restart");
            Ok(UserStoreBackend::Memory(MemoryStore::new()))
        }
        DbType::Redb => RedbStore::open(settings.db_path()).map(UserStoreBackend::Redb),
    }
}

/// Load the storage key registry from the configured key files.
pub fn load_registry(settings: &Settings) -> KeyshareResult<KeyRegistry> {
    let primary = settings.primary_keyfile().ok_or_else(|| {
        KeyshareError::Config("KEYSHARE_STORAGE_PRIMARY_KEYFILE is required".to_string())
    })?;
    KeyRegistry::from_files(primary, settings.fallback_keyfiles())
}

/// Build the assertion issuer from the configured signing key.
pub fn load_issuer(settings: &Settings) -> KeyshareResult<AssertionIssuer> {
    let pem = settings
        .load_jwt_private_key()
        .map_err(KeyshareError::Config)?;
    AssertionIssuer::from_pem(
        &pem,
        settings.jwt_key_id(),
        settings.jwt_issuer(),
        settings.jwt_pin_expiry(),
    )
}

/// Assemble the core with production Argon2 parameters.
pub fn build_core(settings: &Settings) -> KeyshareResult<AppCore> {
    build_core_with_hasher(settings, PinHasher::default())
}

/// Assemble the core with an explicit PIN hasher.
pub fn build_core_with_hasher(settings: &Settings, hasher: PinHasher) -> KeyshareResult<AppCore> {
    let registry = load_registry(settings)?;
    let issuer = load_issuer(settings)?;
    let store = open_store(settings)?;

    let options = CoreOptions {
        lockout: settings.lockout_policy(),
        hasher,
        store_timeout: settings.store_timeout(),
        cas_retries: settings.cas_retries(),
    };

    tracing::info!(
        db_type = store.name(),
        primary_key_id = registry.primary_id(),
        jwt_key_id = issuer.key_id(),
        jwt_issuer = issuer.issuer(),
        max_attempts = options.lockout.threshold,
        "Keyshare core ready"
    );

    Ok(KeyshareCore::new(Arc::new(registry), issuer, store, options))
}

/// Build the listener TLS configuration, or `None` for plain HTTP.
pub fn load_tls(settings: &Settings) -> KeyshareResult<Option<rustls::ServerConfig>> {
    let Some(material) = settings
        .load_tls_material()
        .map_err(KeyshareError::TlsConfig)?
    else {
        return Ok(None);
    };

    if let Some(PemSource::File(path)) = settings.tls_privkey() {
        tls::check_key_permissions(path);
    }

    tls::load_server_config(&material).map(Some)
}
