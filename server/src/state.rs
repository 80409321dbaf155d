//! # Server State
//!
//! Shared application state handed to every axum handler. The domain
//! registrar is the only global table; per-connection stream state lives in
//! each agent's [`crate::session::Session`].

use std::sync::Arc;

use crate::registrar::Registrar;

#[derive(Clone)]
pub struct AppState {
    pub registrar: Arc<Registrar>,
}

impl AppState {
    pub fn new(api_keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            registrar: Arc::new(Registrar::new(api_keys)),
        }
    }
}
