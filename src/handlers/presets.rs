use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/presets`
pub async fn list_presets(state: web::Data<AppState>) -> HttpResponse {
    let catalog = state.catalog();

    HttpResponse::Ok().json(json!({
        "default": catalog.default_preset().id,
        "presets": catalog.list()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_list_presets() {
        let harness = test_state().await;
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(harness.state.clone()))
                .route("/api/v1/presets", web::get().to(list_presets)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/presets").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["default"], "cinema");
        let presets = body["presets"].as_array().unwrap();
        assert_eq!(presets.len(), 7);
        assert!(presets.iter().any(|p| p["id"] == "club"));
        assert_eq!(presets[0]["eq_bands"].as_array().unwrap().len(), 9);
        harness.state.pool.stop().await;
    }
}
