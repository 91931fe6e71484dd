//! Commitment-proof assertion endpoint.

use actix_web::{HttpResponse, ResponseError, web};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::AppCore;

/// Assertion request.
#[derive(Deserialize)]
pub struct AssertionRequest {
    pub subject: String,
    #[serde(default)]
    pub claims: Map<String, Value>,
}

/// Assertion response.
#[derive(Serialize, Deserialize, Debug)]
pub struct AssertionResponse {
    pub assertion: String,
}

/// POST /assertions
///
/// Sign a `commitment_proof` assertion for the session layer.
#[tracing::instrument(skip(core, request), fields(subject = %request.subject))]
pub async fn issue(core: web::Data<AppCore>, request: web::Json<AssertionRequest>) -> HttpResponse {
    let request = request.into_inner();

    match core.issue_assertion(&request.subject, request.claims) {
        Ok(assertion) => HttpResponse::Ok().json(AssertionResponse { assertion }),
        Err(e) => {
            tracing::error!(error = %e, "Assertion issuance failed");
            e.error_response()
        }
    }
}

/// Configure assertion routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/assertions", web::post().to(issue));
}
