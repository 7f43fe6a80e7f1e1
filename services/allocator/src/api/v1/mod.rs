//! API v1 routes.

mod allocations;
mod nodes;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/allocations", allocations::routes())
        // Node inventory plus the node-scoped allocation alias.
        .nest("/nodes", nodes::routes())
}
