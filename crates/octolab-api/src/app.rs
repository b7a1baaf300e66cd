use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use octolab_config::Settings;
use octolab_domain::RecipeLookup;
use octolab_driver::DriverRegistry;
use octolab_store::LabStore;
use tower_http::trace::TraceLayer;

use crate::auth::require_bearer_token;
use crate::handlers;
use crate::state::AppState;

pub fn build_app(
    store: Arc<dyn LabStore>,
    drivers: Arc<DriverRegistry>,
    recipes: Arc<dyn RecipeLookup>,
    settings: Arc<Settings>,
) -> Router {
    let state = AppState { store, drivers, recipes, settings };

    Router::new()
        // Health
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        // Labs
        .route("/labs", post(handlers::create_lab).get(handlers::list_labs))
        .route("/labs/deploy-from-dockerfile", post(handlers::deploy_from_dockerfile))
        .route("/labs/:id", get(handlers::get_lab).delete(handlers::end_lab))
        .route("/labs/:id/end", post(handlers::end_lab))
        .route(
            "/labs/:id/connect",
            post(handlers::connect_lab).get(handlers::connect_lab_redirect),
        )
        .route("/labs/:id/evidence/status", get(handlers::evidence_status))
        .route("/labs/:id/evidence/bundle.zip", get(handlers::evidence_bundle))
        .route("/labs/:id/evidence/verified-bundle.zip", get(handlers::evidence_verified_bundle))
        .route("/labs/:id/evidence/preview", get(handlers::evidence_preview))
        // Auth middleware applies to every route above — no public endpoints.
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use octolab_domain::{LabIntent, Recipe, RecipeId};
    use octolab_store::InMemoryLabStore;
    use tower::util::ServiceExt;
    use uuid::Uuid;

    const TEST_TOKEN: &str = "test-token";

    struct EmptyRecipes;
    impl RecipeLookup for EmptyRecipes {
        fn get(&self, _id: RecipeId) -> Option<Recipe> {
            None
        }
        fn find_for_intent(&self, _intent: &LabIntent) -> Option<Recipe> {
            None
        }
    }

    fn test_settings() -> Settings {
        crate::test_support::test_settings(TEST_TOKEN)
    }

    fn test_app() -> Router {
        let store: Arc<dyn LabStore> = Arc::new(InMemoryLabStore::new());
        let drivers = Arc::new(DriverRegistry::new());
        let recipes: Arc<dyn RecipeLookup> = Arc::new(EmptyRecipes);
        let settings = Arc::new(test_settings());
        build_app(store, drivers, recipes, settings)
    }

    fn authed(req: axum::http::request::Builder) -> axum::http::request::Builder {
        req.header("Authorization", format!("Bearer {}", TEST_TOKEN))
            .header("X-Octolab-Owner", Uuid::new_v4().to_string())
    }

    #[tokio::test]
    async fn unauthenticated_request_returns_401() {
        let app = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_returns_401() {
        let app = test_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("Authorization", "Bearer wrong-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_returns_200() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri("/health")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_returns_200_with_empty_store() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri("/ready")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn labs_empty_list() {
        let app = test_app();
        let resp = app
            .oneshot(authed(Request::builder().uri("/labs")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_owner_header_on_list_is_bad_request() {
        let app = test_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/labs")
                    .header("Authorization", format!("Bearer {}", TEST_TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn lab_not_found_returns_404_not_403() {
        let app = test_app();
        let resp = app
            .oneshot(
                authed(Request::builder().uri(format!("/labs/{}", Uuid::new_v4())))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_lab_with_no_matching_recipe_is_bad_request() {
        let app = test_app();
        let body = serde_json::json!({ "software": "nonexistent" });
        let resp = app
            .oneshot(
                authed(
                    Request::builder()
                        .method("POST")
                        .uri("/labs")
                        .header("content-type", "application/json"),
                )
                .body(Body::from(body.to_string()))
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
