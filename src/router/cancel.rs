//! Registry of cancellable operations, addressed by client-chosen ids

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Default)]
pub struct CancelFuncs {
    funcs: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelFuncs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `token` cancellable under `id`, replacing any previous entry
    pub fn add(&self, id: impl Into<String>, token: CancellationToken) {
        self.funcs.lock().insert(id.into(), token);
    }

    pub fn remove(&self, id: &str) {
        self.funcs.lock().remove(id);
    }

    /// Cancel and forget the operation registered under `id`.
    /// Returns whether there was one.
    pub fn call(&self, id: &str) -> bool {
        let token = self.funcs.lock().remove(id);
        match token {
            Some(token) => {
                debug!("Cancelling operation {}", id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.funcs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
