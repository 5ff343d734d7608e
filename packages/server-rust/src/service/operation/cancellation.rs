use dashmap::DashMap;
use forrst_core::OperationId;
use tokio_util::sync::CancellationToken;

/// Cancellation tokens of running operations.
///
/// Shared by the worker, which registers a token per job, and by
/// `forrst.operation.cancel`, which fires it. Cancellation is cooperative:
/// firing a token only tells the function to stop.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: DashMap<OperationId, CancellationToken>,
}

impl CancellationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token for `id`, creating it on first use.
    pub fn register(&self, id: &OperationId) -> CancellationToken {
        self.tokens.entry(id.clone()).or_default().clone()
    }

    /// Fires and forgets the token for `id`. Returns whether one existed.
    pub fn cancel(&self, id: &OperationId) -> bool {
        match self.tokens.remove(id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forgets the token for `id` without firing it.
    pub fn remove(&self, id: &OperationId) {
        self.tokens.remove(id);
    }

    /// Fires every registered token.
    pub fn cancel_all(&self) {
        for entry in self.tokens.iter() {
            entry.value().cancel();
        }
        self.tokens.clear();
    }

    #[must_use]
    pub fn contains(&self, id: &OperationId) -> bool {
        self.tokens.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_fires_registered_token() {
        let registry = CancellationRegistry::new();
        let id = OperationId::generate();
        let token = registry.register(&id);
        assert!(registry.contains(&id));
        assert!(registry.cancel(&id));
        assert!(token.is_cancelled());
        assert!(!registry.contains(&id));
        assert!(!registry.cancel(&id));
    }

    #[test]
    fn register_is_idempotent() {
        let registry = CancellationRegistry::new();
        let id = OperationId::generate();
        let a = registry.register(&id);
        let b = registry.register(&id);
        registry.cancel(&id);
        assert!(a.is_cancelled() && b.is_cancelled());
    }

    #[test]
    fn cancel_all_fires_everything() {
        let registry = CancellationRegistry::new();
        let tokens: Vec<_> = (0..3)
            .map(|_| registry.register(&OperationId::generate()))
            .collect();
        registry.cancel_all();
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
        assert!(registry.is_empty());
    }
}
