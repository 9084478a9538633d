//! Tracks which stream ids have a generation in flight.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Set of in-flight stream ids, shared across transports.
#[derive(Clone, Default)]
pub struct GenerationRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl GenerationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for a new generation. `None` if one is already running.
    pub fn claim(&self, id: &str) -> Option<GenerationClaim> {
        if !self.lock().insert(id.to_string()) {
            return None;
        }
        Some(GenerationClaim {
            id: id.to_string(),
            active: self.active.clone(),
        })
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases its stream id when dropped.
pub struct GenerationClaim {
    id: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl GenerationClaim {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for GenerationClaim {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

impl std::fmt::Debug for GenerationClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationClaim").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive_until_dropped() {
        let registry = GenerationRegistry::new();
        let claim = registry.claim("abc").unwrap();
        assert_eq!(claim.id(), "abc");
        assert!(registry.is_active("abc"));
        assert!(registry.claim("abc").is_none());

        drop(claim);
        assert!(!registry.is_active("abc"));
        assert!(registry.claim("abc").is_some());
    }

    #[test]
    fn clones_share_state() {
        let registry = GenerationRegistry::new();
        let other = registry.clone();
        let _a = registry.claim("a").unwrap();
        let _b = other.claim("b").unwrap();
        assert_eq!(registry.active_count(), 2);
        assert!(other.is_active("a"));
    }
}
