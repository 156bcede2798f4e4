use xxhash_rust::xxh3::xxh3_64;

/// Consistent hash ring over backend ids
///
/// Each backend contributes `virtual_nodes` points to the ring. Lookup
/// walks clockwise from a key's hash to the first vnode at or after it,
/// wrapping around. Ties between vnodes landing on the same hash are
/// broken by the lexicographic order of `(hash, backend_id)`, matching
/// a preference for deterministic, string-keyed tie-breaks
/// in `registry.rs`'s lookup helpers.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    // Sorted by (hash, backend_id) for deterministic tie-breaking.
    vnodes: Vec<(u64, String)>,
    virtual_nodes: u32,
}

impl HashRing {
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            vnodes: Vec::new(),
            virtual_nodes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vnodes.is_empty()
    }

    pub fn len_backends(&self) -> usize {
        let mut ids: Vec<&str> = self.vnodes.iter().map(|(_, id)| id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// Add all virtual nodes for `backend_id`. Idempotent: replaces any
    /// existing vnodes for that id first.
    pub fn add_backend(&mut self, backend_id: &str) {
        self.remove_backend(backend_id);
        for vnode_index in 0..self.virtual_nodes {
            let hash = vnode_hash(backend_id, vnode_index);
            self.vnodes.push((hash, backend_id.to_string()));
        }
        self.vnodes.sort_unstable();
    }

    pub fn remove_backend(&mut self, backend_id: &str) {
        self.vnodes.retain(|(_, id)| id != backend_id);
    }

    /// Look up the primary backend id for a routing key :
    /// binary search for the first vnode hash >= key hash, wrapping to
    /// the start of the ring if none found.
    pub fn lookup(&self, key: &str) -> Option<&str> {
        if self.vnodes.is_empty() {
            return None;
        }
        let key_hash = xxh3_64(key.as_bytes());
        let idx = self
            .vnodes
            .partition_point(|(hash, _)| *hash < key_hash);
        let idx = if idx == self.vnodes.len() { 0 } else { idx };
        Some(self.vnodes[idx].1.as_str())
    }

    /// All backend ids currently on the ring, deduplicated, in
    /// insertion-independent (sorted) order.
    pub fn backend_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.vnodes.iter().map(|(_, id)| id.clone()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

fn vnode_hash(backend_id: &str, vnode_index: u32) -> u64 {
    let mut buf = Vec::with_capacity(backend_id.len() + 5);
    buf.extend_from_slice(backend_id.as_bytes());
    buf.push(b'#');
    buf.extend_from_slice(&vnode_index.to_le_bytes());
    xxh3_64(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ring_returns_none() {
        let ring = HashRing::new(160);
        assert_eq!(ring.lookup("tools/call:echo"), None);
    }

    #[test]
    fn single_backend_always_wins() {
        let mut ring = HashRing::new(160);
        ring.add_backend("only");
        for key in ["a", "b", "tools/call:echo", "resources/list"] {
            assert_eq!(ring.lookup(key), Some("only"));
        }
    }

    #[test]
    fn lookup_is_deterministic_across_calls() {
        let mut ring = HashRing::new(160);
        ring.add_backend("a");
        ring.add_backend("b");
        ring.add_backend("c");
        let first = ring.lookup("tools/call:search").map(str::to_string);
        let second = ring.lookup("tools/call:search").map(str::to_string);
        assert_eq!(first, second);
    }

    #[test]
    fn removing_a_backend_only_reassigns_its_own_keys() {
        let mut ring = HashRing::new(160);
        ring.add_backend("a");
        ring.add_backend("b");
        ring.add_backend("c");

        let keys: Vec<String> = (0..500).map(|i| format!("tool-{i}")).collect();
        let before: Vec<Option<String>> = keys
            .iter()
            .map(|k| ring.lookup(k).map(str::to_string))
            .collect();

        ring.remove_backend("b");
        let after: Vec<Option<String>> = keys
            .iter()
            .map(|k| ring.lookup(k).map(str::to_string))
            .collect();

        for (b, a) in before.iter().zip(after.iter()) {
            if b.as_deref() != Some("b") {
                assert_eq!(b, a, "key not owned by removed backend must not move");
            } else {
                assert_ne!(a.as_deref(), Some("b"));
            }
        }
    }

    #[test]
    fn add_backend_is_idempotent() {
        let mut ring = HashRing::new(160);
        ring.add_backend("a");
        let count_once = ring.vnodes.len();
        ring.add_backend("a");
        assert_eq!(ring.vnodes.len(), count_once);
    }

    #[test]
    fn backend_ids_deduplicated_and_sorted() {
        let mut ring = HashRing::new(160);
        ring.add_backend("z");
        ring.add_backend("a");
        assert_eq!(ring.backend_ids(), vec!["a".to_string(), "z".to_string()]);
    }
}
