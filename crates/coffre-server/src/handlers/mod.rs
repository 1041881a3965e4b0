pub mod resources;

#[cfg(test)]
pub(crate) mod test_helpers;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(resources::open_repository))
        .route("/resources/{resource}", get(resources::list_resource))
        .route(
            "/resources/{resource}/{mac}",
            get(resources::get_resource)
                .put(resources::put_resource)
                .delete(resources::delete_resource),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
