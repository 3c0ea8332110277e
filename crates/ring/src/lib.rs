//! SHA-256 virtual-node consistent hash ring (spec.md §4.7).
//!
//! A sorted sequence of `(token, owner)` pairs, `vnodes` per physical node.
//! Both node tokens and key tokens are the upper 64 bits of a SHA-256 digest,
//! so `owners_for_key` and the anti-entropy layer's `token_for_key` always
//! agree on where a key falls.

use std::collections::{BTreeMap, HashSet};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

pub struct HashRing {
    tokens: RwLock<BTreeMap<u64, String>>,
    vnodes_per_node: usize,
}

impl HashRing {
    /// Build a ring over `nodes`, each contributing `vnodes_per_node`
    /// virtual positions. Identical `(nodes, vnodes_per_node)` always
    /// produce an identical ring (the hash is a pure function of its input).
    #[must_use]
    pub fn new(nodes: &[String], vnodes_per_node: usize) -> Self {
        let mut tokens = BTreeMap::new();
        for node in nodes {
            for i in 0..vnodes_per_node {
                tokens.insert(token_for_vnode(node, i), node.clone());
            }
        }
        Self {
            tokens: RwLock::new(tokens),
            vnodes_per_node,
        }
    }

    #[must_use]
    pub const fn vnodes_per_node(&self) -> usize {
        self.vnodes_per_node
    }

    /// The token a key hashes to; shared by `owners_for_key` and the
    /// anti-entropy layer so both place keys on the same token axis.
    #[must_use]
    pub fn token_for_key(key: &str) -> u64 {
        upper64(&Sha256::digest(key.as_bytes()))
    }

    /// Distinct physical node ids currently on the ring.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.tokens.read().values().collect::<HashSet<_>>().len()
    }

    /// Up to `n` distinct physical node ids owning `key`, found by walking
    /// clockwise from the lower bound of `key`'s token (wrapping once at the
    /// end of the ring) and skipping repeat visits to the same physical node.
    #[must_use]
    pub fn owners_for_key(&self, key: &str, n: usize) -> Vec<String> {
        let token = Self::token_for_key(key);
        let tokens = self.tokens.read();

        let distinct = tokens.values().collect::<HashSet<_>>().len();
        let target = n.min(distinct);
        if target == 0 {
            return Vec::new();
        }

        let mut owners = Vec::with_capacity(target);
        let mut seen = HashSet::with_capacity(target);

        let clockwise = tokens.range(token..).chain(tokens.range(..token));
        for (_, owner) in clockwise {
            if seen.insert(owner.as_str()) {
                owners.push(owner.clone());
                if owners.len() == target {
                    break;
                }
            }
        }
        owners
    }
}

fn token_for_vnode(node_id: &str, i: usize) -> u64 {
    upper64(&Sha256::digest(format!("{node_id}#{i}").as_bytes()))
}

fn upper64(digest: &[u8]) -> u64 {
    u64::from_be_bytes(digest[0..8].try_into().expect("SHA-256 digest is 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn nodes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("node-{i}")).collect()
    }

    #[test]
    fn identical_inputs_produce_identical_rings() {
        let a = HashRing::new(&nodes(4), 8);
        let b = HashRing::new(&nodes(4), 8);
        for key in ["k1", "k2", "alpha", "beta-gamma"] {
            assert_eq!(a.owners_for_key(key, 3), b.owners_for_key(key, 3));
        }
    }

    #[test]
    fn owners_are_distinct_physical_nodes() {
        let ring = HashRing::new(&nodes(5), 8);
        let owners = ring.owners_for_key("some-key", 3);
        assert_eq!(owners.len(), 3);
        let unique: HashSet<_> = owners.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn requesting_more_than_node_count_caps_at_distinct_node_count() {
        let ring = HashRing::new(&nodes(2), 4);
        let owners = ring.owners_for_key("k", 10);
        assert_eq!(owners.len(), 2);
    }

    #[test]
    fn single_node_ring_returns_that_node() {
        let ring = HashRing::new(&nodes(1), 16);
        assert_eq!(ring.owners_for_key("anything", 3), vec!["node-0".to_owned()]);
    }

    #[test]
    fn adding_a_node_moves_roughly_one_over_n_of_the_keyspace() {
        let base = nodes(4);
        let before = HashRing::new(&base, 16);

        let mut with_fifth = base.clone();
        with_fifth.push("node-4".to_owned());
        let after = HashRing::new(&with_fifth, 16);

        let keys: Vec<String> = (0..500).map(|i| format!("key-{i}")).collect();
        let moved = keys
            .iter()
            .filter(|k| before.owners_for_key(k, 1) != after.owners_for_key(k, 1))
            .count();

        // Expect close to 1/5 of primary ownership to move to the new node;
        // allow a generous band since vnode placement is randomized by hash.
        let fraction = moved as f64 / keys.len() as f64;
        assert!(fraction > 0.05 && fraction < 0.45, "fraction moved = {fraction}");
    }

    proptest! {
        #[test]
        fn owners_for_key_is_deterministic_across_rebuilds(
            node_count in 1usize..8,
            vnodes in 1usize..16,
            key in "[a-z]{1,12}",
        ) {
            let node_names = nodes(node_count);
            let a = HashRing::new(&node_names, vnodes);
            let b = HashRing::new(&node_names, vnodes);
            prop_assert_eq!(a.owners_for_key(&key, node_count), b.owners_for_key(&key, node_count));
        }
    }
}
