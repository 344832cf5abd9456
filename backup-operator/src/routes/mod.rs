pub mod backups;
pub mod health;
pub mod restores;
pub mod schedules;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/health", health::router(state.clone()))
        .nest("/api/backups", backups::router(state.clone()))
        .nest("/api/restores", restores::router(state.clone()))
        .nest("/api/schedules", schedules::router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
