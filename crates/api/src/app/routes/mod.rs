use axum::{Router, routing::get};

pub mod admin;
pub mod downloads;
pub mod event_stream;
pub mod quota;
pub mod system;

/// Router for every owner-scoped endpoint.
pub fn router() -> Router {
    Router::new()
        .nest("/downloads", downloads::router())
        .route("/quota/:owner_key", get(quota::get_quota))
        .route("/events", get(event_stream::stream_events))
        .nest("/admin", admin::router())
}
