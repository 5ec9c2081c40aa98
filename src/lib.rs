pub mod appresult;
pub mod auth;
pub mod chat;
pub mod config;
pub mod db;
pub mod events;
pub mod groups;
pub mod notifications;

use axum::{Router, extract::FromRef, middleware, routing::get};
use sqlx::SqlitePool;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use appresult::{AppError, AppResult};
pub use config::Config;
pub use groups::Groups;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub groups: Groups,
    pub config: Config,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ws/chat/{room_id}", get(chat::ws::chat_ws))
        .route("/ws/notifications", get(notifications::ws::notifications_ws))
        .nest("/api/chat", chat::router())
        .merge(notifications::router())
        .layer(middleware::from_fn_with_state(state.clone(), auth::gate))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
