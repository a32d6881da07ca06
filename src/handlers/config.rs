use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/config`: the effective configuration after all layers.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = serde_json::to_value(state.get_config())
        .map_err(|e| AppError::Internal(format!("Failed to serialize config: {}", e)))?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_get_config_returns_effective_values() {
        let harness = test_state().await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(harness.state.clone()))
                .route("/api/v1/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["config"]["server"]["port"], 8080);
        assert_eq!(body["config"]["audio"]["output_format"], "wav");
        assert_eq!(body["config"]["worker"]["queue_capacity"], 50);
        assert_eq!(body["config"]["rate_limit"]["max_requests_per_hour"], 10);
        harness.state.pool.stop().await;
    }
}
