pub mod actions;
pub mod error;
pub mod routes;
pub mod state;

use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use actions::Actions;
pub use error::{ApiError, ApiResult};
pub use state::AppState;

/// Build the Axum application router.
pub fn build_router(actions: Actions) -> Router {
    let app_state = Arc::new(AppState::new(actions));

    Router::new()
        .nest("/api", routes::api_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Start the API server and run until Ctrl-C.
pub async fn start_server(actions: Actions, bind_addr: &str) -> anyhow::Result<()> {
    let app = build_router(actions);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("API server listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
