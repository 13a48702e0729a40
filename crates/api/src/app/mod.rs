//! Axum router and service wiring.
//!
//! - `services.rs`: stores, queue, realtime channel and worker pools
//! - `routes/`: handlers, one file per area
//! - `dto.rs`: request/response bodies and parsing helpers
//! - `errors.rs`: service errors mapped onto JSON error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router around already-built services.
pub fn build_app(services: Arc<AppServices>) -> Router {
    let protected = routes::router()
        .layer(Extension(services))
        .layer(axum::middleware::from_fn(middleware::owner_middleware));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(ServiceBuilder::new())
}

pub use services::{ApiConfig, AppServices, StartupError, build_services};
