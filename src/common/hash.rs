//! Hashing utilities for miniweed
//!
//! - BLAKE3 for content checksums (shard acks, etags)
//! - HRW (Highest Random Weight) for deterministic spread of placements

use blake3::Hasher;

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// Compute BLAKE3 hash incrementally (for streaming)
pub struct Blake3Hasher {
    hasher: Hasher,
}

impl Blake3Hasher {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(&self) -> String {
        let hash = self.hasher.finalize();
        format!("{}", hash)
    }
}

impl Default for Blake3Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// HRW weight of `node` for `key`.
pub fn hrw_weight(key: &str, node: &str) -> u64 {
    let mut hasher = Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(b"/");
    hasher.update(node.as_bytes());
    let hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(bytes)
}

/// HRW (Highest Random Weight) hashing
///
/// Given a key and a set of nodes, returns nodes sorted by their weight
/// (deterministic based on key). This keeps placement stable as the
/// cluster changes.
pub fn hrw_hash(key: &str, nodes: &[String]) -> Vec<String> {
    let mut weights: Vec<(String, u64)> = nodes
        .iter()
        .map(|node| (node.clone(), hrw_weight(key, node)))
        .collect();

    // Sort by weight (descending)
    weights.sort_by(|a, b| b.1.cmp(&a.1));

    weights.into_iter().map(|(node, _)| node).collect()
}

/// Select N nodes using HRW hashing
pub fn select_replicas(key: &str, nodes: &[String], n: usize) -> Vec<String> {
    let sorted = hrw_hash(key, nodes);
    sorted.into_iter().take(n).collect()
}
