//! Per-task cancellation tokens.
//!
//! The scheduler registers a token when a task starts executing; the API's
//! cancel endpoint trips it. Kernels check the token between steps, so a
//! step already in flight completes and is recorded before the loop exits.

use std::collections::HashMap;

use parking_lot::Mutex;
use uuid::Uuid;

use fg_kernel::CancelToken;

#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<Uuid, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a fresh token for a task run.
    pub fn register(&self, task_id: Uuid) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(task_id, token.clone());
        token
    }

    /// Trip a task's token. Returns true if a token was registered.
    pub fn cancel(&self, task_id: &Uuid) -> bool {
        match self.tokens.lock().get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, task_id: &Uuid) {
        self.tokens.lock().remove(task_id);
    }

    pub fn is_registered(&self, task_id: &Uuid) -> bool {
        self.tokens.lock().contains_key(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_cancel_remove() {
        let map = CancelMap::new();
        let id = Uuid::new_v4();
        let token = map.register(id);
        assert!(map.is_registered(&id));
        assert!(!token.is_cancelled());

        assert!(map.cancel(&id));
        assert!(token.is_cancelled());
        // Idempotent.
        assert!(map.cancel(&id));

        map.remove(&id);
        assert!(!map.cancel(&id));
    }
}
