//! Rate limiting for keyshare endpoints.
//!
//! PIN endpoints get their own, tighter limiter on top of the per-account
//! lockout: the lockout protects a single account, the limiter slows down
//! one client spraying guesses across many accounts.
//!
//! The service is reached through the session layer, so the peer address is
//! the same for every end user. Limits are keyed on the client address the
//! session layer forwards (`Forwarded` or `X-Forwarded-For`), falling back to
//! the peer address. These headers are trusted only because
//! [`InternalAuth`](super::InternalAuth) runs before the limiters.
//!
//! Governor configs own the token buckets. [`RateLimiters`] is built once at
//! startup and every worker wraps its routes with middleware created from the
//! same configs, so all workers and both PIN routes draw from one budget.

use std::net::{IpAddr, SocketAddr};

use actix_governor::{
    Governor, GovernorConfig, GovernorConfigBuilder, KeyExtractor, SimpleKeyExtractionError,
};
use actix_web::dev::ServiceRequest;
use governor::middleware::NoOpMiddleware;

const DEFAULT_PIN_PER_MINUTE: u32 = 30;
const DEFAULT_PIN_BURST: u32 = 10;
const DEFAULT_GENERAL_PER_SECOND: u32 = 1;
const DEFAULT_GENERAL_BURST: u32 = 50;

/// Configuration for rate limiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Sustained PIN verification / change requests per minute per client.
    pub pin_per_minute: u32,
    /// Burst size for PIN requests.
    pub pin_burst: u32,
    /// Sustained requests per second per client on every endpoint.
    pub general_per_second: u32,
    /// Burst size for all endpoints.
    pub general_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            pin_per_minute: DEFAULT_PIN_PER_MINUTE,
            pin_burst: DEFAULT_PIN_BURST,
            general_per_second: DEFAULT_GENERAL_PER_SECOND,
            general_burst: DEFAULT_GENERAL_BURST,
        }
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl RateLimitConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            pin_per_minute: env_u32("RATE_LIMIT_PIN_PER_MINUTE", DEFAULT_PIN_PER_MINUTE),
            pin_burst: env_u32("RATE_LIMIT_PIN_BURST", DEFAULT_PIN_BURST),
            general_per_second: env_u32("RATE_LIMIT_GENERAL_PER_SECOND", DEFAULT_GENERAL_PER_SECOND),
            general_burst: env_u32("RATE_LIMIT_GENERAL_BURST", DEFAULT_GENERAL_BURST),
        }
    }

    /// Replenish interval for one PIN request.
    fn pin_interval_ms(&self) -> u64 {
        60_000 / u64::from(self.pin_per_minute.max(1))
    }

    /// Replenish interval for one request on any endpoint.
    fn general_interval_ms(&self) -> u64 {
        1_000 / u64::from(self.general_per_second.max(1))
    }
}

/// Keys requests on the client address forwarded by the session layer.
///
/// IPv6 addresses are reduced to their /56 prefix, like
/// [`PeerIpKeyExtractor`](actix_governor::PeerIpKeyExtractor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardedClientKeyExtractor;

/// Parse `addr`, `ip:port` or `[ipv6]:port`.
fn parse_client_ip(value: &str) -> Option<IpAddr> {
    let value = value.trim();
    value
        .parse::<IpAddr>()
        .ok()
        .or_else(|| value.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

fn mask_ipv6(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(ipv6) => {
            let mut octets = ipv6.octets();
            octets[7..16].fill(0);
            IpAddr::V6(octets.into())
        }
        v4 => v4,
    }
}

impl KeyExtractor for ForwardedClientKeyExtractor {
    type Key = IpAddr;
    type KeyExtractionError = SimpleKeyExtractionError<&'static str>;

    fn extract(&self, req: &ServiceRequest) -> Result<Self::Key, Self::KeyExtractionError> {
        // Unparseable forwarded values (e.g. obfuscated identifiers) fall back to the peer
        let forwarded = req
            .connection_info()
            .realip_remote_addr()
            .and_then(parse_client_ip);

        forwarded
            .or_else(|| req.peer_addr().map(|socket| socket.ip()))
            .map(mask_ipv6)
            .ok_or_else(|| {
                SimpleKeyExtractionError::new("Could not extract client IP address from request")
            })
    }
}

/// Governor config keyed on the forwarded client address.
pub type LimiterConfig = GovernorConfig<ForwardedClientKeyExtractor, NoOpMiddleware>;

/// Type alias for the Governor middleware.
pub type RateLimiter = Governor<ForwardedClientKeyExtractor, NoOpMiddleware>;

fn limiter_config(interval_ms: u64, burst: u32) -> LimiterConfig {
    GovernorConfigBuilder::default()
        .key_extractor(ForwardedClientKeyExtractor)
        .milliseconds_per_request(interval_ms.max(1))
        .burst_size(burst.max(1))
        .finish()
        .expect("rate limiter parameters are clamped to non-zero")
}

/// Shared limiter state for the whole process.
#[derive(Clone)]
pub struct RateLimiters {
    pin: LimiterConfig,
    general: LimiterConfig,
}

impl RateLimiters {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            pin: limiter_config(config.pin_interval_ms(), config.pin_burst),
            general: limiter_config(config.general_interval_ms(), config.general_burst),
        }
    }

    /// Middleware for PIN endpoints. Every instance shares one bucket set.
    pub fn pin(&self) -> RateLimiter {
        Governor::new(&self.pin)
    }

    /// Middleware for all endpoints. Every instance shares one bucket set.
    pub fn general(&self) -> RateLimiter {
        Governor::new(&self.general)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::dev::{ServiceFactory, ServiceRequest, ServiceResponse};
    use actix_web::{App, HttpResponse, http::StatusCode, test, web};

    const PEER: &str = "10.0.0.2:40000";

    fn tight() -> RateLimitConfig {
        RateLimitConfig {
            pin_per_minute: 1,
            pin_burst: 2,
            ..RateLimitConfig::default()
        }
    }

    fn request(uri: &str, client: &str) -> test::TestRequest {
        test::TestRequest::post()
            .uri(uri)
            .peer_addr(PEER.parse().unwrap())
            .insert_header(("x-forwarded-for", client))
    }

    /// Status of a call, whether the limiter answers with a response or an error.
    fn status<B>(result: Result<ServiceResponse<B>, actix_web::Error>) -> StatusCode {
        match result {
            Ok(resp) => resp.status(),
            Err(e) => e.as_response_error().status_code(),
        }
    }

    fn pin_app(
        limiters: &RateLimiters,
    ) -> App<
        impl ServiceFactory<
            ServiceRequest,
            Config = (),
            Response = ServiceResponse,
            Error = actix_web::Error,
            InitError = (),
        > + use<>,
    > {
        App::new()
            .service(
                web::resource("/verify")
                    .wrap(limiters.pin())
                    .route(web::post().to(|| async { HttpResponse::Ok().finish() })),
            )
            .service(
                web::resource("/change")
                    .wrap(limiters.pin())
                    .route(web::post().to(|| async { HttpResponse::Ok().finish() })),
            )
    }

    #[::core::prelude::v1::test]
    fn test_default_config() {
        let config = RateLimitConfig::default();
        assert_eq!(config.pin_per_minute, 30);
        assert_eq!(config.pin_burst, 10);
        assert_eq!(config.pin_interval_ms(), 2_000);
        assert_eq!(config.general_interval_ms(), 1_000);
    }

    #[::core::prelude::v1::test]
    fn test_forwarded_client_key() {
        let key = |header: Option<(&str, &str)>| {
            let mut req = test::TestRequest::default().peer_addr(PEER.parse().unwrap());
            if let Some(header) = header {
                req = req.insert_header(header);
            }
            ForwardedClientKeyExtractor
                .extract(&req.to_srv_request())
                .unwrap()
        };
        let ip = |s: &str| s.parse::<IpAddr>().unwrap();

        assert_eq!(key(None), ip("10.0.0.2"));
        assert_eq!(
            key(Some(("x-forwarded-for", "198.51.100.7, 10.0.0.2"))),
            ip("198.51.100.7")
        );
        assert_eq!(
            key(Some(("forwarded", "for=\"203.0.113.5:4711\""))),
            ip("203.0.113.5")
        );
        assert_eq!(key(Some(("forwarded", "for=_hidden"))), ip("10.0.0.2"));

        // Same /56 prefix, same bucket
        assert_eq!(
            key(Some(("x-forwarded-for", "2001:db8:0:12::1"))),
            key(Some(("x-forwarded-for", "2001:db8:0:34::1")))
        );
    }

    #[::core::prelude::v1::test]
    fn test_degenerate_config_still_builds() {
        let config = RateLimitConfig {
            pin_per_minute: 0,
            pin_burst: 0,
            general_per_second: 0,
            general_burst: 0,
        };
        assert_eq!(config.pin_interval_ms(), 60_000);
        let limiters = RateLimiters::new(&config);
        let _ = limiters.pin();
        let _ = limiters.general();

        let fast = RateLimitConfig {
            pin_per_minute: 1_000_000,
            general_per_second: 1_000_000,
            ..RateLimitConfig::default()
        };
        let _ = RateLimiters::new(&fast).pin();
    }

    #[actix_rt::test]
    async fn test_pin_routes_share_one_budget_per_client() {
        let limiters = RateLimiters::new(&tight());
        let app = test::init_service(pin_app(&limiters)).await;

        for _ in 0..2 {
            let req = request("/verify", "198.51.100.7").to_request();
            assert_eq!(status(test::try_call_service(&app, req).await), StatusCode::OK);
        }

        // The other PIN route draws from the same bucket
        let req = request("/change", "198.51.100.7").to_request();
        assert_eq!(
            status(test::try_call_service(&app, req).await),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[actix_rt::test]
    async fn test_clients_behind_one_peer_are_limited_separately() {
        let limiters = RateLimiters::new(&tight());
        let app = test::init_service(pin_app(&limiters)).await;

        for i in 0..12 {
            let client = format!("198.51.100.{}", i + 1);
            let req = request("/verify", &client).to_request();
            assert_eq!(status(test::try_call_service(&app, req).await), StatusCode::OK);
        }
    }

    #[actix_rt::test]
    async fn test_budget_is_shared_across_workers() {
        let limiters = RateLimiters::new(&tight());
        // Two apps built from the same limiters, as two workers would be
        let first = test::init_service(pin_app(&limiters)).await;
        let second = test::init_service(pin_app(&limiters)).await;

        let req = request("/verify", "203.0.113.9").to_request();
        assert_eq!(status(test::try_call_service(&first, req).await), StatusCode::OK);
        let req = request("/verify", "203.0.113.9").to_request();
        assert_eq!(status(test::try_call_service(&second, req).await), StatusCode::OK);

        let req = request("/change", "203.0.113.9").to_request();
        assert_eq!(
            status(test::try_call_service(&second, req).await),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
