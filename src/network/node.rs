use std::sync::{PoisonError, RwLock};

/// Known peer addresses in the order they were learned. The first entry is
/// the seed every node reports to on startup.
pub struct Nodes {
    inner: RwLock<Vec<String>>,
}

impl Default for Nodes {
    fn default() -> Self {
        Self::new()
    }
}

impl Nodes {
    pub fn new() -> Nodes {
        Nodes {
            inner: RwLock::new(vec![]),
        }
    }

    pub fn with_seeds(seeds: &[String]) -> Nodes {
        let nodes = Nodes::new();
        for seed in seeds {
            nodes.add_node(seed);
        }
        nodes
    }

    /// Appends `addr` unless it is already known; returns whether it was added.
    pub fn add_node(&self, addr: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.iter().any(|x| x == addr) {
            return false;
        }
        inner.push(addr.to_string());
        true
    }

    pub fn evict_node(&self, addr: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(idx) = inner.iter().position(|x| x == addr) {
            inner.remove(idx);
        }
    }

    pub fn get_nodes(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub fn node_is_known(&self, addr: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|x| x == addr)
    }
}
