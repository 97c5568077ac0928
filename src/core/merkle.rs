use crate::core::Transaction;
use crate::error::Result;
use crate::utils::{serialize, sha256_digest};

/// Binary hash tree over an ordered list of leaf payloads.
///
/// Leaves are `sha256(data)`, parents are `sha256(left ‖ right)`. A level
/// with an odd number of nodes pairs its last node with itself, so a single
/// leaf still gets one parent above it.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    root: MerkleNode,
    leaf_count: usize,
}

#[derive(Debug, Clone)]
pub struct MerkleNode {
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

    pub fn get_hash(&self) -> &[u8] {
        self.hash.as_slice()
    }

    pub fn get_left(&self) -> Option<&MerkleNode> {
        self.left.as_deref()
    }

    pub fn get_right(&self) -> Option<&MerkleNode> {
        self.right.as_deref()
    }

    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

impl MerkleTree {
    /// Builds the tree bottom-up from raw leaf payloads.
    ///
    /// An empty list yields a lone node holding `sha256("")`.
    pub fn new(leaves: &[Vec<u8>]) -> MerkleTree {
        let mut current_level: Vec<MerkleNode> =
            leaves.iter().map(|data| MerkleNode::leaf(data)).collect();

        if current_level.is_empty() {
            return MerkleTree {
                root: MerkleNode::leaf(&[]),
                leaf_count: 0,
            };
        }

        loop {
            if current_level.len() % 2 != 0 {
                if let Some(last) = current_level.last().cloned() {
                    current_level.push(last);
                }
            }

            let mut next_level = Vec::with_capacity(current_level.len() / 2);
            let mut nodes = current_level.into_iter();
            while let (Some(left), Some(right)) = (nodes.next(), nodes.next()) {
                next_level.push(MerkleNode::parent(left, right));
            }
            current_level = next_level;

            if current_level.len() == 1 {
                break;
            }
        }

        let root = current_level.remove(0);
        MerkleTree {
            root,
            leaf_count: leaves.len(),
        }
    }

    /// Tree over the serialized transactions of a block, in block order.
    pub fn from_transactions(transactions: &[Transaction]) -> Result<MerkleTree> {
        let leaves = transactions
            .iter()
            .map(serialize)
            .collect::<Result<Vec<Vec<u8>>>>()?;
        Ok(MerkleTree::new(&leaves))
    }

    pub fn get_root(&self) -> &MerkleNode {
        &self.root
    }

    pub fn get_root_hash(&self) -> Vec<u8> {
        self.root.hash.clone()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_count == 0
    }
}

fn hash_pair(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut combined = Vec::with_capacity(left.len() + right.len());
    combined.extend_from_slice(left);
    combined.extend_from_slice(right);
    sha256_digest(&combined)
}
