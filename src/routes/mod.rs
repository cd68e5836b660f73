pub mod api;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::docs::ApiDoc;
use crate::state::AppState;
use crate::websocket::websocket_handler;

pub use api::create_api_routes;

/// The full relay router: JSON API, WebSocket relay and Swagger UI.
pub fn build_router(app_state: Arc<AppState>) -> Router {
    let ws_routes = Router::<Arc<AppState>>::new()
        .route("/ws/:doc_id", get(websocket_handler))
        .with_state(app_state.clone());

    Router::new()
        // Mount API routes
        .nest("/api", create_api_routes(app_state))
        .merge(ws_routes)
        // Mount Swagger UI
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        // Add tracing layer
        .layer(TraceLayer::new_for_http())
}
