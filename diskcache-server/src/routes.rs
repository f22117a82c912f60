use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers::{data, management};
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/-/flushall/", post(management::flushall))
        .route("/-/healthcheck/", get(management::healthcheck))
        .route("/-/metrics/", get(management::metrics));

    if state.cache.config().debug {
        router = router.route("/-/debug/pprof/", get(management::debug_pprof));
    }

    router
        .route(
            "/{*name}",
            get(data::get).put(data::put).delete(data::delete),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
