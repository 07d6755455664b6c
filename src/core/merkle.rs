use crate::error::{BlockchainError, Result};
use crate::utils::sha256_digest;

/// Binary Merkle tree over serialized transactions.
///
/// Leaves are `SHA-256(data)`; every parent is `SHA-256(left || right)`. When a
/// level has an odd number of nodes the last one is paired with itself, which
/// also applies to a single leaf.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    root: MerkleNode,
    leaf_count: usize,
}

#[derive(Debug, Clone)]
struct MerkleNode {
    hash: Vec<u8>,
    left: Option<Box<MerkleNode>>,
    right: Option<Box<MerkleNode>>,
}

impl MerkleNode {
    fn leaf(data: &[u8]) -> MerkleNode {
        MerkleNode {
            hash: sha256_digest(data),
            left: None,
            right: None,
        }
    }

    fn parent(left: MerkleNode, right: MerkleNode) -> MerkleNode {
        MerkleNode {
            hash: hash_pair(&left.hash, &right.hash),
            left: Some(Box::new(left)),
            right: Some(Box::new(right)),
        }
    }
}

impl MerkleTree {
    /// Build the tree from raw leaf data (one serialized transaction per entry)
    pub fn new(data: &[Vec<u8>]) -> Result<MerkleTree> {
        if data.is_empty() {
            return Err(BlockchainError::InvalidBlock(
                "Cannot build a Merkle tree without transactions".to_string(),
            ));
        }

        let mut level: Vec<MerkleNode> = data.iter().map(|d| MerkleNode::leaf(d)).collect();

        loop {
            if level.len() % 2 != 0 {
                if let Some(last) = level.last().cloned() {
                    level.push(last);
                }
            }

            let mut next_level = Vec::with_capacity(level.len() / 2);
            let mut nodes = level.into_iter();
            while let (Some(left), Some(right)) = (nodes.next(), nodes.next()) {
                next_level.push(MerkleNode::parent(left, right));
            }
            level = next_level;

            if level.len() <= 1 {
                break;
            }
        }

        let root = level.pop().ok_or_else(|| {
            BlockchainError::InvalidBlock("Failed to build Merkle tree".to_string())
        })?;

        Ok(MerkleTree {
            root,
            leaf_count: data.len(),
        })
    }

    pub fn root_hash(&self) -> &[u8] {
        self.root.hash.as_slice()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Height of the tree above the leaves
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut node = &self.root;
        while let Some(left) = &node.left {
            depth += 1;
            node = left;
        }
        depth
    }
}

fn hash_pair(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut combined = Vec::with_capacity(left.len() + right.len());
    combined.extend_from_slice(left);
    combined.extend_from_slice(right);
    sha256_digest(&combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(items: &[&[u8]]) -> Vec<Vec<u8>> {
        items.iter().map(|d| d.to_vec()).collect()
    }

    #[test]
    fn test_single_leaf_is_paired_with_itself() {
        let tree = MerkleTree::new(&leaves(&[b"coinbase"])).unwrap();
        let leaf = sha256_digest(b"coinbase");

        assert_eq!(tree.root_hash(), hash_pair(&leaf, &leaf).as_slice());
        assert_eq!(tree.leaf_count(), 1);
        assert_eq!(tree.depth(), 1);
    }

    #[test]
    fn test_two_leaves() {
        let tree = MerkleTree::new(&leaves(&[b"a", b"b"])).unwrap();
        let expected = hash_pair(&sha256_digest(b"a"), &sha256_digest(b"b"));
        assert_eq!(tree.root_hash(), expected.as_slice());
    }

    #[test]
    fn test_odd_level_duplicates_last_node() {
        let tree = MerkleTree::new(&leaves(&[b"a", b"b", b"c"])).unwrap();

        let (a, b, c) = (sha256_digest(b"a"), sha256_digest(b"b"), sha256_digest(b"c"));
        let expected = hash_pair(&hash_pair(&a, &b), &hash_pair(&c, &c));

        assert_eq!(tree.root_hash(), expected.as_slice());
        assert_eq!(tree.depth(), 2);
    }

    #[test]
    fn test_order_matters() {
        let forward = MerkleTree::new(&leaves(&[b"tx1", b"tx2", b"tx3"])).unwrap();
        let swapped = MerkleTree::new(&leaves(&[b"tx2", b"tx1", b"tx3"])).unwrap();
        let rotated = MerkleTree::new(&leaves(&[b"tx3", b"tx1", b"tx2"])).unwrap();

        assert_ne!(forward.root_hash(), swapped.root_hash());
        assert_ne!(forward.root_hash(), rotated.root_hash());
    }

    #[test]
    fn test_empty_input_is_rejected() {
        assert!(MerkleTree::new(&[]).is_err());
    }
}
