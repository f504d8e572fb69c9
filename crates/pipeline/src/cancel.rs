//! Cooperative cancellation registry
//!
//! One token per in-flight job, held worker-locally. The stage driver checks
//! the token at stage and frame boundaries; tripping it turns the job into
//! `failed` with error `"cancelled"` and removes partial artifacts.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Registry of per-job cancellation tokens
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancellationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for a job entering processing
    pub fn register(&self, video_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock().insert(video_id.to_string(), token.clone());
        token
    }

    /// Trip a job's token. Returns false when the job is not in flight here.
    pub fn cancel(&self, video_id: &str) -> bool {
        match self.lock().get(video_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the token once the job reaches a terminal state
    pub fn remove(&self, video_id: &str) {
        self.lock().remove(video_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_cancel_remove() {
        let registry = CancellationRegistry::new();
        let token = registry.register("ab12cd34");
        assert!(!token.is_cancelled());

        assert!(registry.cancel("ab12cd34"));
        assert!(token.is_cancelled());

        registry.remove("ab12cd34");
        assert!(!registry.cancel("ab12cd34"));
    }

    #[test]
    fn test_cancel_unknown_job() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel("deadbeef"));
    }
}
