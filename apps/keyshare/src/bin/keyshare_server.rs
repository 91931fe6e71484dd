//! Keyshare Server
//!
//! Custodian of the server-side share of each user's credential secret.
//!
//! ## Responsibilities
//!
//! - Register users with a PIN and an encrypted secret share
//! - Verify PINs with attempt limiting and exponential lockout
//! - Issue signed assertions for the session layer
//! - Re-seal containers after a storage key rotation
//!
//! ## Security
//!
//! - Authenticates the session layer via `INTERNAL_SERVICE_TOKEN`
//! - Refuses to start with missing or malformed key material
//! - Serves over TLS when `KEYSHARE_TLS_CERT` / `KEYSHARE_TLS_PRIVKEY` are set
//! - Rate limits PIN endpoints per forwarded client address

use actix_web::{App, HttpServer, middleware, web};
use keyshare_server::{
    app,
    config::Settings,
    middleware::{InternalAuth, RateLimitConfig, RateLimiters},
    routes, telemetry,
};
use tracing_actix_web::TracingLogger;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize tracing first
    telemetry::init_tracing();

    // Load and validate settings
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(message) => {
            tracing::error!("{message}");
            std::process::exit(1);
        }
    };

    if let Err(message) = settings.validate() {
        tracing::error!("{message}");
        std::process::exit(1);
    }

    // Keys, issuer and store; any failure is fatal
    let core = match app::build_core(&settings) {
        Ok(core) => core,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize keyshare core");
            std::process::exit(1);
        }
    };

    // Listener TLS; a malformed certificate or key is fatal
    let tls_config = match app::load_tls(&settings) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load TLS configuration");
            std::process::exit(1);
        }
    };

    let addr = settings.socket_addr();

    // Load rate limit configuration from environment
    let rate_config = RateLimitConfig::from_env();
    tracing::info!(
        pin_per_minute = rate_config.pin_per_minute,
        pin_burst = rate_config.pin_burst,
        "Rate limiting enabled"
    );
    // Built once so every worker shares the same buckets
    let rate_limiters = RateLimiters::new(&rate_config);

    tracing::info!(
        addr = %addr,
        db_type = %settings.db_type(),
        production = settings.is_production(),
        internal_token_required = settings.internal_token_required(),
        tls = settings.tls_enabled(),
        "Starting keyshare server"
    );

    let auth = InternalAuth::new(&settings);
    let json_config = web::JsonConfig::default().limit(settings.body_limit_bytes());
    let request_timeout = settings.request_timeout();
    let settings_data = web::Data::new(settings);
    let core_data = web::Data::new(core);

    let server = HttpServer::new(move || {
        let rate_limiters = rate_limiters.clone();
        App::new()
            // Rate limiting, after the token check has vetted forwarded headers
            .wrap(rate_limiters.general())
            // Internal token check
            .wrap(auth.clone())
            // Request tracing
            .wrap(TracingLogger::default())
            // Default headers
            .wrap(middleware::DefaultHeaders::new().add(("X-Service", "keyshare-server")))
            // Shared state
            .app_data(json_config.clone())
            .app_data(settings_data.clone())
            .app_data(core_data.clone())
            // Routes
            .configure(routes::health::configure)
            .configure(move |cfg| routes::users::configure(cfg, &rate_limiters))
            .configure(routes::assertions::configure)
            .configure(routes::admin::configure)
    })
    .client_request_timeout(request_timeout);

    if let Some(tls_config) = tls_config {
        tracing::info!("TLS enabled");
        server.bind_rustls_0_23(addr, tls_config)?.run().await?;
    } else {
        tracing::warn!("TLS disabled; the listener accepts plain HTTP");
        server.bind(addr)?.run().await?;
    }

    // Shutdown tracing
    telemetry::shutdown_tracing();

    Ok(())
}
