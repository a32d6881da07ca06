use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// `GET /api/v1/cache`
pub async fn cache_stats(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.cache.stats().await)
}

/// `DELETE /api/v1/cache`: drop every cached result.
pub async fn clear_cache(state: web::Data<AppState>) -> HttpResponse {
    let removed = state.cache.clear().await;
    info!(removed, "Cache cleared via API");

    HttpResponse::Ok().json(json!({
        "status": "success",
        "removed_entries": removed,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};
    use crate::state::testing::test_state;

    #[actix_web::test]
    async fn test_clear_cache_removes_entries() {
        let harness = test_state().await;
        let result = harness.dir.path().join("result.wav");
        std::fs::write(&result, b"encoded output").unwrap();
        assert!(
            harness
                .state
                .cache
                .store(b"input", "cinema", &result, serde_json::Map::new())
                .await
        );

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(harness.state.clone()))
                .route("/api/v1/cache", web::get().to(cache_stats))
                .route("/api/v1/cache", web::delete().to(clear_cache)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/cache").to_request();
        let stats: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(stats["entries"], 1);

        let req = test::TestRequest::delete().uri("/api/v1/cache").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["removed_entries"], 1);
        assert!(harness.state.cache.lookup(b"input", "cinema").await.is_none());
        harness.state.pool.stop().await;
    }
}
