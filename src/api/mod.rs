/// API routes and handlers
pub mod chat;
pub mod devices;
pub mod health;
pub mod middleware;
pub mod photos;

use crate::context::AppContext;
use axum::Router;

/// Build API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .merge(health::routes())
        .merge(chat::routes())
        .merge(photos::routes())
        .merge(devices::routes())
}
