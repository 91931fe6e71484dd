//! Internal authentication middleware.
//!
//! The keyshare server is only reachable by the session layer. Requests must
//! carry `INTERNAL_SERVICE_TOKEN` when it is required (production); outside
//! production a configured token is still checked when one is sent. Health
//! and build-info stay public for probes.

use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready};
use actix_web::{Error, ResponseError};
use futures_util::future::{LocalBoxFuture, Ready, ready};

use crate::config::Settings;
use crate::error::KeyshareError;

const PUBLIC_PATHS: [&str; 2] = ["/health", "/build-info"];

/// Middleware enforcing internal service token authentication.
#[derive(Clone)]
pub struct InternalAuth {
    required: bool,
    token: Option<String>,
}

impl InternalAuth {
    /// Build from service settings.
    pub fn new(settings: &Settings) -> Self {
        Self::from_config(
            settings.internal_token_required(),
            settings.internal_token().map(ToString::to_string),
        )
    }

    /// Build directly from config (used for tests).
    pub fn from_config(required: bool, token: Option<String>) -> Self {
        Self { required, token }
    }

    fn extract_token(req: &ServiceRequest) -> Option<String> {
        let headers = req.headers();

        // Prefer Authorization: Bearer <token>
        if let Some(value) = headers.get("authorization")
            && let Ok(value) = value.to_str()
            && let Some(token) = value.strip_prefix("Bearer ")
        {
            return Some(token.trim().to_string());
        }

        // Fallback: X-Internal-Token header
        if let Some(value) = headers.get("x-internal-token")
            && let Ok(value) = value.to_str()
        {
            return Some(value.trim().to_string());
        }

        None
    }

    fn authorize(&self, path: &str, provided: Option<&str>) -> bool {
        if PUBLIC_PATHS.contains(&path) {
            return true;
        }

        match (self.token.as_deref(), provided) {
            (Some(expected), Some(provided)) => provided == expected,
            // Required but unset is rejected by settings validation; fail closed anyway.
            (_, None) | (None, Some(_)) => !self.required,
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for InternalAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = InternalAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(InternalAuthMiddleware {
            service,
            auth: self.clone(),
        }))
    }
}

pub struct InternalAuthMiddleware<S> {
    service: S,
    auth: InternalAuth,
}

impl<S, B> Service<ServiceRequest> for InternalAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let provided = InternalAuth::extract_token(&req);

        if !self.auth.authorize(req.path(), provided.as_deref()) {
            tracing::warn!(path = %req.path(), "Rejected request without valid internal token");
            let (req, _pl) = req.into_parts();
            let response = KeyshareError::Unauthorized.error_response();
            return Box::pin(async move {
                Ok(ServiceResponse::new(req, response.map_into_right_body()))
            });
        }

        let fut = self.service.call(req);
        Box::pin(async move { fut.await.map(ServiceResponse::map_into_left_body) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{App, HttpResponse, http::StatusCode, test, web};

    async fn status_for(auth: InternalAuth, uri: &str, header: Option<(&str, &str)>) -> StatusCode {
        let app = test::init_service(
            App::new()
                .wrap(auth)
                .route("/health", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route("/users/verify/pin", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let mut req = test::TestRequest::get().uri(uri);
        if let Some(header) = header {
            req = req.insert_header(header);
        }
        test::call_service(&app, req.to_request()).await.status()
    }

    fn required() -> InternalAuth {
        InternalAuth::from_config(true, Some("secret".to_string()))
    }

    #[actix_rt::test]
    async fn allows_public_routes_without_token() {
        assert_eq!(status_for(required(), "/health", None).await, StatusCode::OK);
    }

    #[actix_rt::test]
    async fn rejects_missing_token_when_required() {
        assert_eq!(
            status_for(required(), "/users/verify/pin", None).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[actix_rt::test]
    async fn accepts_bearer_and_header_tokens() {
        assert_eq!(
            status_for(required(), "/users/verify/pin", Some(("authorization", "Bearer secret"))).await,
            StatusCode::OK
        );
        assert_eq!(
            status_for(required(), "/users/verify/pin", Some(("x-internal-token", "secret"))).await,
            StatusCode::OK
        );
    }

    #[actix_rt::test]
    async fn rejects_wrong_token_even_when_optional() {
        let optional = InternalAuth::from_config(false, Some("secret".to_string()));
        assert_eq!(
            status_for(optional.clone(), "/users/verify/pin", Some(("authorization", "Bearer nope"))).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status_for(optional, "/users/verify/pin", None).await, StatusCode::OK);
    }

    #[::core::prelude::v1::test]
    fn required_without_configured_token_fails_closed() {
        let auth = InternalAuth::from_config(true, None);
        assert!(!auth.authorize("/users/verify/pin", Some("anything")));
        assert!(auth.authorize("/build-info", None));
    }
}
