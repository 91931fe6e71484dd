//! Maintenance endpoints.

use actix_web::{HttpResponse, ResponseError, web};

use crate::AppCore;

/// POST /admin/migrate
///
/// Re-seal every container not yet under the current primary storage key.
/// Safe to repeat.
#[tracing::instrument(skip(core))]
pub async fn migrate(core: web::Data<AppCore>) -> HttpResponse {
    match core.migrate_all_containers().await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => {
            tracing::error!(error = %e, "Container migration failed");
            e.error_response()
        }
    }
}

/// Configure admin routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::scope("/admin").route("/migrate", web::post().to(migrate)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyshare::UserSecretShare;
    use crate::routes::test_support::test_core;
    use actix_web::{App, test};
    use serde_json::{Value, json};

    #[actix_rt::test]
    async fn test_migrate_reports_counts() {
        let core = web::Data::new(test_core());
        core.register_user("alice", "1234", UserSecretShare::new(vec![1]))
            .await
            .unwrap();

        let app = test::init_service(App::new().app_data(core.clone()).configure(configure)).await;
        let req = test::TestRequest::post().uri("/admin/migrate").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body, json!({ "migrated": 0, "already_current": 1, "failed": 0 }));
    }
}
