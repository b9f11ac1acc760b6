//! API layer -- axum routes, handlers, and middleware.

mod error;
mod routes;
pub mod state;

pub use self::error::ApiError;
pub use self::routes::OPERATOR_HEADER;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use self::state::AppState;
use crate::enforce::gate::require_admission;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    // Forward-auth style check: 204 when the caller described by the
    // request headers may proceed, 423/429/503 otherwise.
    let admission = Router::<AppState>::new()
        .route("/admission", get(|| async { StatusCode::NO_CONTENT }))
        .layer(axum::middleware::from_fn_with_state(
            state.guardian.gate.clone(),
            require_admission,
        ));

    Router::new()
        .nest("/api/v1", routes::api_routes().merge(admission))
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}
