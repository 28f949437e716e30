//! CORS configuration
//!
//! Polling clients are browser dashboards on other origins.

use tower_http::cors::CorsLayer;

/// Permissive CORS: any origin, method and header
pub fn cors_layer() -> CorsLayer {
    CorsLayer::permissive()
}
