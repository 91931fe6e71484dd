//! User endpoints: registration, PIN verification and PIN change.
//!
//! PIN endpoints answer with a status envelope rather than HTTP errors for
//! the expected outcomes, so the session layer can relay them to the client:
//!
//! | status    | message                          |
//! |-----------|----------------------------------|
//! | `success` | assertion JWT (empty for change) |
//! | `failure` | remaining attempts               |
//! | `error`   | lockout seconds                  |
//!
//! Everything else (unknown user, storage trouble, integrity faults) is a
//! regular error response.

use actix_web::{HttpResponse, ResponseError, web};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::AppCore;
use crate::error::{KeyshareError, KeyshareResult};
use crate::keyshare::UserSecretShare;
use crate::middleware::RateLimiters;

/// Registration request.
#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub pin: String,
    /// Base64 encoded secret share.
    pub share: String,
}

/// Registration response.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct RegisterResponse {
    pub username: String,
}

/// PIN verification request.
#[derive(Deserialize)]
pub struct PinRequest {
    pub username: String,
    pub pin: String,
}

/// PIN change request.
#[derive(Deserialize)]
pub struct ChangePinRequest {
    pub username: String,
    pub old_pin: String,
    pub new_pin: String,
}

/// Outcome of a PIN attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PinOutcome {
    Success,
    Failure,
    Error,
}

/// PIN status envelope.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct PinStatus {
    pub status: PinOutcome,
    pub message: String,
}

impl PinStatus {
    fn new(status: PinOutcome, message: impl ToString) -> Self {
        Self {
            status,
            message: message.to_string(),
        }
    }
}

/// Render a PIN attempt result as a status envelope or error response.
fn pin_response(result: KeyshareResult<String>) -> HttpResponse {
    let status = match result {
        Ok(message) => PinStatus::new(PinOutcome::Success, message),
        Err(KeyshareError::PinIncorrect {
            locked: true,
            lockout_secs,
            ..
        }) => PinStatus::new(PinOutcome::Error, lockout_secs),
        Err(KeyshareError::PinIncorrect {
            remaining_attempts, ..
        }) => PinStatus::new(PinOutcome::Failure, remaining_attempts),
        Err(KeyshareError::PinLocked { retry_after_secs }) => {
            PinStatus::new(PinOutcome::Error, retry_after_secs)
        }
        Err(e) => {
            if e.is_integrity_fault() {
                tracing::error!(error = %e, "PIN request hit an integrity fault");
            } else {
                tracing::warn!(error = %e, "PIN request failed");
            }
            return e.error_response();
        }
    };

    HttpResponse::Ok().json(status)
}

/// POST /users/register
#[tracing::instrument(skip(core, request), fields(username = %request.username))]
pub async fn register(core: web::Data<AppCore>, request: web::Json<RegisterRequest>) -> HttpResponse {
    let request = request.into_inner();
    let pin = Zeroizing::new(request.pin);

    let result = match BASE64.decode(request.share.as_bytes()) {
        Ok(secret) => {
            core.register_user(&request.username, &pin, UserSecretShare::new(secret))
                .await
        }
        Err(e) => Err(KeyshareError::InvalidInput(format!("share is not valid base64: {e}"))),
    };

    match result {
        Ok(()) => HttpResponse::Created().json(RegisterResponse {
            username: request.username,
        }),
        Err(e) => {
            if e.is_integrity_fault() {
                tracing::error!(error = %e, "Registration hit an integrity fault");
            } else {
                tracing::warn!(error = %e, "Registration failed");
            }
            e.error_response()
        }
    }
}

/// POST /users/verify/pin
///
/// The released share is not used here: this endpoint only proves the PIN.
#[tracing::instrument(skip(core, request), fields(username = %request.username))]
pub async fn verify_pin(core: web::Data<AppCore>, request: web::Json<PinRequest>) -> HttpResponse {
    let request = request.into_inner();
    let pin = Zeroizing::new(request.pin);

    let result = core
        .verify_pin(&request.username, &pin, |_| ())
        .await
        .map(|verified| verified.assertion);

    pin_response(result)
}

/// POST /users/change/pin
#[tracing::instrument(skip(core, request), fields(username = %request.username))]
pub async fn change_pin(
    core: web::Data<AppCore>,
    request: web::Json<ChangePinRequest>,
) -> HttpResponse {
    let request = request.into_inner();
    let old_pin = Zeroizing::new(request.old_pin);
    let new_pin = Zeroizing::new(request.new_pin);

    let result = core
        .change_pin(&request.username, &old_pin, &new_pin)
        .await
        .map(|()| String::new());

    pin_response(result)
}

/// Configure user routes. Both PIN endpoints draw from one PIN rate limit.
pub fn configure(cfg: &mut web::ServiceConfig, rate_limiters: &RateLimiters) {
    cfg.service(
        web::scope("/users")
            .route("/register", web::post().to(register))
            .service(
                web::resource("/verify/pin")
                    .wrap(rate_limiters.pin())
                    .route(web::post().to(verify_pin)),
            )
            .service(
                web::resource("/change/pin")
                    .wrap(rate_limiters.pin())
                    .route(web::post().to(change_pin)),
            ),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    use crate::middleware::RateLimitConfig;
    use crate::routes::test_support::{PEER, test_core};
    use actix_web::dev::{ServiceFactory, ServiceRequest, ServiceResponse};
    use actix_web::{App, http::StatusCode, test};
    use serde_json::json;

    fn test_app(
        core: AppCore,
    ) -> App<
        impl ServiceFactory<
            ServiceRequest,
            Config = (),
            Response = ServiceResponse,
            Error = actix_web::Error,
            InitError = (),
        >,
    > {
        let limiters = RateLimiters::new(&RateLimitConfig::default());
        App::new()
            .app_data(web::Data::new(core))
            .configure(move |cfg| configure(cfg, &limiters))
    }

    fn post(uri: &str, body: serde_json::Value) -> test::TestRequest {
        test::TestRequest::post()
            .uri(uri)
            .peer_addr(PEER.parse().unwrap())
            .set_json(body)
    }

    /// A request relayed by the session layer on behalf of `client`.
    fn post_for(uri: &str, body: serde_json::Value, client: &str) -> test::TestRequest {
        post(uri, body).insert_header(("x-forwarded-for", client))
    }

    /// Log sink for asserting on emitted events.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn register_body(username: &str) -> serde_json::Value {
        json!({ "username": username, "pin": "1234", "share": "c2hhcmU=" })
    }

    fn pin_body(username: &str, pin: &str) -> serde_json::Value {
        json!({ "username": username, "pin": pin })
    }

    #[actix_rt::test]
    async fn test_register_and_verify_statuses() {
        let app = test::init_service(test_app(test_core())).await;

        let req = post("/users/register", register_body("alice")).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let req = post("/users/verify/pin", pin_body("alice", "0000")).to_request();
        let body: PinStatus = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, PinStatus::new(PinOutcome::Failure, 2));

        let req = post("/users/verify/pin", pin_body("alice", "1234")).to_request();
        let body: PinStatus = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.status, PinOutcome::Success);
        assert_eq!(body.message.split('.').count(), 3);
    }

    #[actix_rt::test]
    async fn test_lockout_reported_as_error_status() {
        let app = test::init_service(test_app(test_core())).await;

        let req = post("/users/register", register_body("bob")).to_request();
        test::call_service(&app, req).await;

        for _ in 0..2 {
            let req = post("/users/verify/pin", pin_body("bob", "0000")).to_request();
            test::call_service(&app, req).await;
        }
        let req = post("/users/verify/pin", pin_body("bob", "0000")).to_request();
        let body: PinStatus = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, PinStatus::new(PinOutcome::Error, 60));

        // The right PIN is still refused during the lockout
        let req = post("/users/verify/pin", pin_body("bob", "1234")).to_request();
        let body: PinStatus = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.status, PinOutcome::Error);
    }

    #[actix_rt::test]
    async fn test_change_pin_route() {
        let app = test::init_service(test_app(test_core())).await;

        let req = post("/users/register", register_body("carol")).to_request();
        test::call_service(&app, req).await;

        let req = post(
            "/users/change/pin",
            json!({ "username": "carol", "old_pin": "1234", "new_pin": "4321" }),
        )
        .to_request();
        let body: PinStatus = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, PinStatus::new(PinOutcome::Success, ""));

        let req = post("/users/verify/pin", pin_body("carol", "4321")).to_request();
        let body: PinStatus = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.status, PinOutcome::Success);
    }

    #[actix_rt::test]
    async fn test_error_responses() {
        let app = test::init_service(test_app(test_core())).await;

        let req = post("/users/verify/pin", pin_body("nobody", "1234")).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = post(
            "/users/register",
            json!({ "username": "dave", "pin": "1234", "share": "%%%" }),
        )
        .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = post("/users/register", register_body("dave")).to_request();
        test::call_service(&app, req).await;
        let req = post("/users/register", register_body("dave")).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[actix_rt::test]
    async fn test_users_behind_session_layer_are_not_throttled_together() {
        let app = test::init_service(test_app(test_core())).await;

        // More users than the PIN burst, all relayed through one peer
        for i in 0..12 {
            let username = format!("user{i}");
            let client = format!("203.0.113.{}", i + 1);

            let req = post_for("/users/register", register_body(&username), &client).to_request();
            assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);

            let req = post_for("/users/verify/pin", pin_body(&username, "1234"), &client).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::OK, "{username} was throttled");
        }
    }

    #[actix_rt::test]
    async fn test_verify_and_change_share_one_client_budget() {
        let app = test::init_service(test_app(test_core())).await;
        let client = "203.0.113.200";

        let req = post_for("/users/register", register_body("erin"), client).to_request();
        test::call_service(&app, req).await;

        // Exhaust the burst on verify; correct PINs keep the lockout out of the picture
        for _ in 0..RateLimitConfig::default().pin_burst {
            let req = post_for("/users/verify/pin", pin_body("erin", "1234"), client).to_request();
            assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        }

        let req = post_for(
            "/users/change/pin",
            json!({ "username": "erin", "old_pin": "1234", "new_pin": "4321" }),
            client,
        )
        .to_request();
        let status = match test::try_call_service(&app, req).await {
            Ok(resp) => resp.status(),
            Err(e) => e.as_response_error().status_code(),
        };
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[actix_rt::test]
    async fn test_client_registration_errors_logged_as_warnings() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let app = test::init_service(test_app(test_core())).await;

        let req = post("/users/register", register_body("frank")).to_request();
        test::call_service(&app, req).await;
        let req = post("/users/register", register_body("frank")).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let output = logs.contents();
        assert!(output.contains("Registration failed"), "{output}");
        assert!(output.contains("WARN"), "{output}");
        assert!(!output.contains("ERROR"), "{output}");
    }
}
