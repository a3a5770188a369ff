//! Chain adapter registry.
//!
//! One adapter per `(blockchain, chain_id)`, constructed once at startup
//! and handed around by reference.  There is deliberately no global
//! accessor: the orchestrator, scheduler and verifier all receive the
//! registry via their constructors so tests can drop in a mock adapter.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use coursepay_shared::ChainKey;

use crate::adapter::EscrowChain;
use crate::error::{ChainError, Result};

/// Immutable map of chain adapters, built at startup.
pub struct ChainRegistry {
    chains: HashMap<ChainKey, Arc<dyn EscrowChain>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self {
            chains: HashMap::new(),
        }
    }

    /// Register an adapter.  Replacing an existing key is a programmer
    /// error during startup wiring, so it panics in debug builds.
    pub fn register(&mut self, chain: Arc<dyn EscrowChain>) {
        let key = chain.key();
        info!(chain = %key, "registered chain adapter");
        let previous = self.chains.insert(key, chain);
        debug_assert!(previous.is_none(), "duplicate chain adapter for {key}");
    }

    pub fn get(&self, key: &ChainKey) -> Result<Arc<dyn EscrowChain>> {
        self.chains
            .get(key)
            .cloned()
            .ok_or(ChainError::UnknownChain(*key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &ChainKey> {
        self.chains.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

impl Default for ChainRegistry {
    fn default() -> Self {
        Self::new()
    }
}
