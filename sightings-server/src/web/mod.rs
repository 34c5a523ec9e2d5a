//! Web server: axum JSON API for next-pass lookups.
//!
//! Shared state is the resolver (markers, feed cache, element store) and the
//! geolocator used when a caller sends no coordinates.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::geoip::GeoLocator;
use crate::resolver::Resolver;

pub mod routes;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub resolver: Arc<Resolver>,
    pub geo: Arc<dyn GeoLocator>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/marker", get(routes::api_marker))
        .route("/sightings", get(routes::api_sightings))
        .route("/hours", get(routes::api_hours))
        .route("/geoip", get(routes::api_geoip))
        .route("/iss", get(routes::api_iss))
        .route("/passes", get(routes::api_passes))
        .with_state(state)
        .layer(cors)
}

/// Start the web server and run until the listener fails.
pub async fn serve(state: Arc<AppState>, host: &str, port: u16) -> std::io::Result<()> {
    let app = build_router(state);
    let addr = format!("{host}:{port}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Sightings server listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}
