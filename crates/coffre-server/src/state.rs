use std::sync::Arc;

use coffre_core::storage::Store;

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub no_delete: bool,
}

impl AppState {
    pub fn new(store: Box<dyn Store>, no_delete: bool) -> AppState {
        AppState {
            store: Arc::from(store),
            no_delete,
        }
    }
}
