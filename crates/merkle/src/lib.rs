//! Fixed-leaf Merkle tree over `(token, digest)` pairs, and leaf-level diff
//! between two trees of matching shape (spec.md §3, §4.8).
//!
//! Tokens are distributed to leaves by their top `log2(leaf_count)` bits, so
//! a leaf's manifest is exactly the keys anti-entropy needs to reconcile
//! when that leaf's hash disagrees between two nodes.

use sha2::{Digest as _, Sha256};
use thiserror::Error;

pub type Digest = [u8; 32];

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MerkleError {
    #[error("leaf count {0} is not a power of two")]
    LeafCountNotPowerOfTwo(usize),

    #[error("cannot diff trees with different leaf counts: {a} vs {b}")]
    LeafCountMismatch { a: usize, b: usize },
}

#[must_use]
pub fn hash(data: &[u8]) -> Digest {
    Sha256::digest(data).into()
}

/// One leaf's sorted manifest: `(token, digest)` pairs whose token maps to
/// this leaf, ordered by token.
pub type Manifest = Vec<(u64, Digest)>;

pub struct MerkleTree {
    leaf_count: usize,
    /// Complete binary tree stored as a flat array; root is index 0,
    /// children of `n` are `2n+1`/`2n+2`, leaves start at `leaf_count - 1`.
    nodes: Vec<Digest>,
    leaf_manifests: Vec<Manifest>,
}

impl MerkleTree {
    /// Build a tree with `leaf_count` leaves (must be a power of two) over
    /// `entries`, distributing each by the top `log2(leaf_count)` bits of
    /// its token.
    pub fn build(
        leaf_count: usize,
        entries: impl IntoIterator<Item = (u64, Digest)>,
    ) -> Result<Self, MerkleError> {
        if leaf_count == 0 || !leaf_count.is_power_of_two() {
            return Err(MerkleError::LeafCountNotPowerOfTwo(leaf_count));
        }
        let shift_bits = 64 - leaf_count.trailing_zeros();

        let mut buckets: Vec<Manifest> = vec![Vec::new(); leaf_count];
        for (token, digest) in entries {
            let leaf_index = if shift_bits == 64 {
                0
            } else {
                (token >> shift_bits) as usize
            };
            buckets[leaf_index].push((token, digest));
        }
        for bucket in &mut buckets {
            bucket.sort_by_key(|(token, _)| *token);
        }

        let leaves_start = leaf_count - 1;
        let mut nodes = vec![[0u8; 32]; 2 * leaf_count - 1];
        for (i, bucket) in buckets.iter().enumerate() {
            nodes[leaves_start + i] = leaf_hash(bucket);
        }
        for n in (0..leaves_start).rev() {
            let mut combined = Vec::with_capacity(64);
            combined.extend_from_slice(&nodes[2 * n + 1]);
            combined.extend_from_slice(&nodes[2 * n + 2]);
            nodes[n] = hash(&combined);
        }

        Ok(Self {
            leaf_count,
            nodes,
            leaf_manifests: buckets,
        })
    }

    #[must_use]
    pub const fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    #[must_use]
    pub fn root(&self) -> Digest {
        self.nodes[0]
    }

    #[must_use]
    pub fn leaf_manifest(&self, leaf_id: usize) -> &Manifest {
        &self.leaf_manifests[leaf_id]
    }

    const fn leaves_start(&self) -> usize {
        self.leaf_count - 1
    }
}

/// A leaf whose hash disagreed between two trees, with each side's manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafDiff {
    pub leaf_id: usize,
    pub local: Manifest,
    pub remote: Manifest,
}

/// Diff two trees of identical shape. Equal subtrees are skipped entirely;
/// only leaves whose hashes actually disagree are visited and reported.
pub fn diff(local: &MerkleTree, remote: &MerkleTree) -> Result<Vec<LeafDiff>, MerkleError> {
    if local.leaf_count != remote.leaf_count {
        return Err(MerkleError::LeafCountMismatch {
            a: local.leaf_count,
            b: remote.leaf_count,
        });
    }

    let mut out = Vec::new();
    if local.root() != remote.root() {
        descend(local, remote, 0, &mut out);
    }
    Ok(out)
}

fn descend(local: &MerkleTree, remote: &MerkleTree, node: usize, out: &mut Vec<LeafDiff>) {
    if local.nodes[node] == remote.nodes[node] {
        return;
    }
    if node >= local.leaves_start() {
        let leaf_id = node - local.leaves_start();
        out.push(LeafDiff {
            leaf_id,
            local: local.leaf_manifests[leaf_id].clone(),
            remote: remote.leaf_manifests[leaf_id].clone(),
        });
        return;
    }
    descend(local, remote, 2 * node + 1, out);
    descend(local, remote, 2 * node + 2, out);
}

fn leaf_hash(bucket: &[(u64, Digest)]) -> Digest {
    let mut buf = Vec::with_capacity(bucket.len() * 40);
    for (token, digest) in bucket {
        buf.extend_from_slice(&token.to_be_bytes());
        buf.extend_from_slice(digest);
    }
    hash(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(token: u64, tag: u8) -> (u64, Digest) {
        let mut digest = [0u8; 32];
        digest[0] = tag;
        (token, digest)
    }

    #[test]
    fn rejects_non_power_of_two_leaf_count() {
        assert!(matches!(
            MerkleTree::build(3, []),
            Err(MerkleError::LeafCountNotPowerOfTwo(3))
        ));
    }

    #[test]
    fn identical_trees_diff_to_empty() {
        let entries = vec![entry(1, 1), entry(u64::MAX / 2, 2), entry(u64::MAX - 1, 3)];
        let a = MerkleTree::build(4, entries.clone()).unwrap();
        let b = MerkleTree::build(4, entries).unwrap();
        assert_eq!(a.root(), b.root());
        assert!(diff(&a, &b).unwrap().is_empty());
    }

    #[test]
    fn a_single_differing_entry_surfaces_exactly_one_leaf() {
        let shared = entry(1, 1);
        let a = MerkleTree::build(4, vec![shared, entry(u64::MAX, 9)]).unwrap();
        let b = MerkleTree::build(4, vec![shared, entry(u64::MAX, 10)]).unwrap();

        let leaves = diff(&a, &b).unwrap();
        assert_eq!(leaves.len(), 1);
        assert_ne!(leaves[0].local, leaves[0].remote);
    }

    #[test]
    fn token_is_placed_by_its_top_bits() {
        // With 4 leaves, the top 2 bits select the bucket.
        let low = entry(0, 1);
        let high = entry(u64::MAX, 2);
        let tree = MerkleTree::build(4, vec![low, high]).unwrap();
        assert_eq!(tree.leaf_manifest(0), &vec![low]);
        assert_eq!(tree.leaf_manifest(3), &vec![high]);
        assert!(tree.leaf_manifest(1).is_empty());
        assert!(tree.leaf_manifest(2).is_empty());
    }

    #[test]
    fn diff_rejects_mismatched_leaf_counts() {
        let a = MerkleTree::build(4, []).unwrap();
        let b = MerkleTree::build(8, []).unwrap();
        assert!(matches!(
            diff(&a, &b),
            Err(MerkleError::LeafCountMismatch { a: 4, b: 8 })
        ));
    }

    #[test]
    fn empty_trees_of_matching_shape_are_in_sync() {
        let a = MerkleTree::build(8, []).unwrap();
        let b = MerkleTree::build(8, []).unwrap();
        assert_eq!(a.root(), b.root());
        assert!(diff(&a, &b).unwrap().is_empty());
    }
}
