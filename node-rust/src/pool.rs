use evonet_protocol::{MigrantSink, Migrant, NodeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Immigrants waiting to be folded into the local population
#[derive(Clone, Default)]
pub struct MigrantPool {
    inner: Arc<Mutex<PoolState>>,
}

#[derive(Default)]
struct PoolState {
    waiting: Vec<Migrant>,
    received_from: HashMap<NodeId, usize>,
}

impl MigrantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every waiting migrant
    pub fn drain(&self) -> Vec<Migrant> {
        match self.inner.lock() {
            Ok(mut state) => std::mem::take(&mut state.waiting),
            Err(poisoned) => std::mem::take(&mut poisoned.into_inner().waiting),
        }
    }

    pub fn waiting(&self) -> usize {
        self.inner.lock().map(|s| s.waiting.len()).unwrap_or(0)
    }

    /// Migrants received so far, per sending node
    pub fn received_from(&self) -> HashMap<NodeId, usize> {
        self.inner.lock().map(|s| s.received_from.clone()).unwrap_or_default()
    }
}

impl MigrantSink for MigrantPool {
    fn accept_migrants(&mut self, from: &NodeId, migrants: Vec<Migrant>) {
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        *state.received_from.entry(from.clone()).or_default() += migrants.len();
        state.waiting.extend(migrants);
        tracing::debug!(from = %from, waiting = state.waiting.len(), "Migrants pooled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_collects_and_drains() {
        let pool = MigrantPool::new();
        let mut sink = pool.clone();
        sink.accept_migrants(&"a:1".to_string(), vec![Migrant(vec![1]), Migrant(vec![2])]);
        sink.accept_migrants(&"b:1".to_string(), vec![Migrant(vec![3])]);
        sink.accept_migrants(&"a:1".to_string(), vec![]);

        assert_eq!(pool.waiting(), 3);
        assert_eq!(pool.received_from()["a:1"], 2);
        assert_eq!(pool.received_from()["b:1"], 1);

        let drained = pool.drain();
        assert_eq!(drained, vec![Migrant(vec![1]), Migrant(vec![2]), Migrant(vec![3])]);
        assert_eq!(pool.waiting(), 0);
    }
}
