use thiserror::Error;

use super::{Bitfield, ChunkIndex};
use crate::hash::{HashEngine, HexDigest};

type NodeIndex = usize;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TreeError {
    #[error("descriptor supplies {supplied} internal hashes but the chunks need {required}")]
    ShapeMismatch { required: usize, supplied: usize },

    #[error("hash {0} is not a node of the package tree")]
    HashNotFound(String),
}

/// digests of a single chunk: what the descriptor says and what the data on disk hashes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafDigests {
    pub expected: HexDigest,
    pub computed: HexDigest,
}

#[derive(Debug, Clone, Copy)]
enum NodeKind {
    Leaf(ChunkIndex),
    Internal { left: NodeIndex, right: NodeIndex },
}

#[derive(Debug, Clone)]
struct TreeNode {
    kind: NodeKind,
    expected: HexDigest,
    computed: HexDigest,
    parent: Option<NodeIndex>,
}

/// binary hash tree over the chunks of a package.
///
/// nodes live in a single arena. the first `leaf_count` slots are the leaves in chunk order, the
/// rest are internal nodes in the order they were created, level by level from the leaves up. an
/// unpaired node at the end of a level is carried to the next level as is, so a tree over `n`
/// leaves always has `n - 1` internal nodes and every child sits before its parent in the arena.
#[derive(Debug, Clone)]
pub struct IntegrityTree {
    nodes: Vec<TreeNode>,
    leaf_count: usize,
    root: Option<NodeIndex>,
    completed: Bitfield,
}

fn combine(left: &str, right: &str) -> HexDigest {
    let mut engine = HashEngine::new();
    engine.update(left);
    engine.update(right);
    HashEngine::to_hex(&engine.finalize())
}

impl IntegrityTree {
    pub fn build(leaves: &[LeafDigests], internal_hashes: &[HexDigest]) -> Result<Self, TreeError> {
        let leaf_count = leaves.len();
        let required = leaf_count.saturating_sub(1);
        if internal_hashes.len() < required {
            return Err(TreeError::ShapeMismatch {
                required,
                supplied: internal_hashes.len(),
            });
        }

        let mut nodes = Vec::with_capacity(leaf_count + required);
        nodes.extend(leaves.iter().enumerate().map(|(chunk, leaf)| TreeNode {
            kind: NodeKind::Leaf(chunk),
            expected: leaf.expected.clone(),
            computed: leaf.computed.clone(),
            parent: None,
        }));

        let mut level: Vec<NodeIndex> = (0..leaf_count).collect();
        while level.len() > 1 {
            let mut next_level = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                let &[left, right] = pair else {
                    // odd one out goes up a level untouched
                    next_level.extend_from_slice(pair);
                    continue;
                };
                let index = nodes.len();
                let computed = combine(&nodes[left].computed, &nodes[right].computed);
                nodes[left].parent = Some(index);
                nodes[right].parent = Some(index);
                nodes.push(TreeNode {
                    kind: NodeKind::Internal { left, right },
                    expected: internal_hashes[index - leaf_count].clone(),
                    computed,
                    parent: None,
                });
                next_level.push(index);
            }
            level = next_level;
        }

        Ok(Self {
            root: level.first().copied(),
            nodes,
            leaf_count,
            completed: Bitfield::repeat(false, leaf_count),
        })
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn internal_count(&self) -> usize {
        self.nodes.len() - self.leaf_count
    }

    /// computed digest of the root, `None` for a package without chunks.
    pub fn root_hash(&self) -> Option<&str> {
        self.root.map(|root| self.nodes[root].computed.as_str())
    }

    /// number of edges on the longest leaf to root path.
    pub fn depth(&self) -> usize {
        (0..self.leaf_count)
            .map(|leaf| {
                std::iter::successors(self.nodes[leaf].parent, |&node| self.nodes[node].parent)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    pub fn is_completed(&self, chunk: ChunkIndex) -> bool {
        self.completed.get(chunk).is_some_and(|bit| *bit)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.count_ones()
    }

    pub fn is_complete(&self) -> bool {
        self.completed.all()
    }

    /// flags a verified chunk. the leaf now vouches for its expected digest, so the computed
    /// digests on the path to the root are refreshed. returns false if it was already completed.
    pub fn mark_completed(&mut self, chunk: ChunkIndex) -> bool {
        if chunk >= self.leaf_count || self.is_completed(chunk) {
            return false;
        }
        self.completed.set(chunk, true);

        let leaf = &mut self.nodes[chunk];
        leaf.computed = leaf.expected.clone();

        let mut cursor = leaf.parent;
        while let Some(index) = cursor {
            if let NodeKind::Internal { left, right } = self.nodes[index].kind {
                let computed = combine(&self.nodes[left].computed, &self.nodes[right].computed);
                self.nodes[index].computed = computed;
            }
            cursor = self.nodes[index].parent;
        }
        true
    }

    /// every expected digest in descriptor order: internal nodes as created, then the chunks.
    pub fn all_hashes(&self) -> Vec<HexDigest> {
        let (leaves, internals) = self.nodes.split_at(self.leaf_count);
        internals
            .iter()
            .chain(leaves)
            .map(|node| node.expected.clone())
            .collect()
    }

    pub fn completed_leaf_hashes(&self) -> Vec<HexDigest> {
        self.completed
            .iter_ones()
            .map(|chunk| self.nodes[chunk].expected.clone())
            .collect()
    }

    /// expected digests of the maximal fully completed subtrees, left to right. nothing is
    /// reported when no chunk is completed.
    pub fn minimal_completion_hashes(&self) -> Vec<HexDigest> {
        let Some(root) = self.root else {
            return Vec::new();
        };

        // children precede parents in the arena, one forward pass settles every node
        let mut complete = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let done = match node.kind {
                NodeKind::Leaf(chunk) => self.is_completed(chunk),
                NodeKind::Internal { left, right } => complete[left] && complete[right],
            };
            complete.push(done);
        }

        let mut hashes = Vec::new();
        let mut stack = vec![root];
        while let Some(index) = stack.pop() {
            if complete[index] {
                hashes.push(self.nodes[index].expected.clone());
            } else if let NodeKind::Internal { left, right } = self.nodes[index].kind {
                stack.push(right);
                stack.push(left);
            }
        }
        hashes
    }

    /// expected chunk digests below the node identified by `hash`, left to right. the node is
    /// matched on its computed digest, falling back to its expected digest so descriptor hashes
    /// work against a partially downloaded package.
    pub fn chunk_hashes_under(&self, hash: &str) -> Result<Vec<HexDigest>, TreeError> {
        let hash = hash.to_ascii_lowercase();
        let start = self
            .nodes
            .iter()
            .position(|node| node.computed == hash)
            .or_else(|| self.nodes.iter().position(|node| node.expected == hash))
            .ok_or_else(|| TreeError::HashNotFound(hash.clone()))?;

        let mut hashes = Vec::new();
        let mut stack = vec![start];
        while let Some(index) = stack.pop() {
            match self.nodes[index].kind {
                NodeKind::Leaf(_) => hashes.push(self.nodes[index].expected.clone()),
                NodeKind::Internal { left, right } => {
                    stack.push(right);
                    stack.push(left);
                }
            }
        }
        Ok(hashes)
    }
}

/// internal digests for a set of leaf digests, in the order a descriptor lists them.
#[cfg(test)]
pub(crate) fn internal_digests(leaves: &[HexDigest]) -> Vec<HexDigest> {
    let mut digests = Vec::new();
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let mut next_level = Vec::new();
        for pair in level.chunks(2) {
            match pair {
                [left, right] => {
                    let parent = combine(left, right);
                    digests.push(parent.clone());
                    next_level.push(parent);
                }
                [carried] => next_level.push(carried.clone()),
                _ => unreachable!(),
            }
        }
        level = next_level;
    }
    digests
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn leaf_digests(n: usize) -> Vec<HexDigest> {
        (0..n)
            .map(|i| HashEngine::hex_digest_of(format!("chunk {i}")))
            .collect()
    }

    fn verified_tree(n: usize) -> (IntegrityTree, Vec<HexDigest>, Vec<HexDigest>) {
        let leaves = leaf_digests(n);
        let internals = internal_digests(&leaves);
        let digests: Vec<_> = leaves
            .iter()
            .map(|hash| LeafDigests {
                expected: hash.clone(),
                computed: hash.clone(),
            })
            .collect();
        let tree = IntegrityTree::build(&digests, &internals).unwrap();
        (tree, leaves, internals)
    }

    #[rstest]
    #[case(1, 0)]
    #[case(2, 1)]
    #[case(3, 2)]
    #[case(5, 3)]
    #[case(8, 3)]
    #[case(13, 4)]
    #[case(64, 6)]
    fn shape_follows_carry_rule(#[case] n: usize, #[case] max_depth: usize) {
        let (tree, _, internals) = verified_tree(n);
        assert_eq!(tree.leaf_count(), n);
        assert_eq!(tree.internal_count(), n - 1);
        assert_eq!(internals.len(), n - 1);
        assert!(tree.depth() <= max_depth);
    }

    #[test]
    fn carried_node_is_not_rehashed() {
        let (tree, leaves, _) = verified_tree(3);
        let expected_root = combine(&combine(&leaves[0], &leaves[1]), &leaves[2]);
        assert_eq!(tree.root_hash(), Some(expected_root.as_str()));
    }

    #[test]
    fn too_few_internal_hashes_is_a_shape_mismatch() {
        let leaves = leaf_digests(4);
        let digests: Vec<_> = leaves
            .iter()
            .map(|hash| LeafDigests {
                expected: hash.clone(),
                computed: hash.clone(),
            })
            .collect();
        let err = IntegrityTree::build(&digests, &internal_digests(&leaves)[..2]).unwrap_err();
        assert_eq!(
            err,
            TreeError::ShapeMismatch {
                required: 3,
                supplied: 2
            }
        );
    }

    #[test]
    fn empty_tree_answers_empty() {
        let tree = IntegrityTree::build(&[], &[]).unwrap();
        assert!(tree.root_hash().is_none());
        assert!(tree.all_hashes().is_empty());
        assert!(tree.minimal_completion_hashes().is_empty());
        assert!(tree.chunk_hashes_under(&"0".repeat(64)).is_err());
    }

    #[test]
    fn all_hashes_round_trips_descriptor_order() {
        let (tree, leaves, internals) = verified_tree(6);
        let descriptor_order: Vec<_> = internals.iter().chain(&leaves).cloned().collect();
        assert_eq!(tree.all_hashes(), descriptor_order);
    }

    #[test]
    fn marking_twice_does_not_duplicate() {
        let (mut tree, leaves, _) = verified_tree(4);
        assert!(tree.mark_completed(2));
        assert!(!tree.mark_completed(2));
        assert!(!tree.mark_completed(99));
        assert_eq!(tree.completed_leaf_hashes(), vec![leaves[2].clone()]);
    }

    #[test]
    fn completed_leaves_keep_chunk_order() {
        let (mut tree, leaves, _) = verified_tree(5);
        tree.mark_completed(4);
        tree.mark_completed(1);
        assert_eq!(
            tree.completed_leaf_hashes(),
            vec![leaves[1].clone(), leaves[4].clone()]
        );
    }

    #[test]
    fn minimal_hashes_collapse_first_half_of_eight() {
        let (mut tree, _, internals) = verified_tree(8);
        for chunk in 0..4 {
            tree.mark_completed(chunk);
        }
        // level one holds internals 0..4, level two holds 4 and 5
        assert_eq!(tree.minimal_completion_hashes(), vec![internals[4].clone()]);
    }

    #[test]
    fn minimal_hashes_mix_subtrees_and_leaves() {
        let (mut tree, leaves, internals) = verified_tree(8);
        for chunk in [0, 1, 2, 3, 6] {
            tree.mark_completed(chunk);
        }
        assert_eq!(
            tree.minimal_completion_hashes(),
            vec![internals[4].clone(), leaves[6].clone()]
        );
    }

    #[test]
    fn minimal_hashes_of_complete_tree_is_root() {
        let (mut tree, _, internals) = verified_tree(5);
        for chunk in 0..5 {
            tree.mark_completed(chunk);
        }
        assert!(tree.is_complete());
        assert_eq!(
            tree.minimal_completion_hashes(),
            vec![internals.last().unwrap().clone()]
        );
    }

    #[test]
    fn minimal_hashes_empty_without_completions() {
        let (tree, _, _) = verified_tree(8);
        assert!(tree.minimal_completion_hashes().is_empty());
    }

    #[test]
    fn chunk_hashes_under_root_and_left_child() {
        let (tree, leaves, internals) = verified_tree(8);
        let root = tree.root_hash().unwrap().to_string();
        assert_eq!(tree.chunk_hashes_under(&root).unwrap(), leaves);
        assert_eq!(tree.chunk_hashes_under(&internals[4]).unwrap(), leaves[..4]);
        assert_eq!(tree.chunk_hashes_under(&internals[5]).unwrap(), leaves[4..]);
        assert_eq!(
            tree.chunk_hashes_under(&leaves[3]).unwrap(),
            vec![leaves[3].clone()]
        );
    }

    #[test]
    fn chunk_hashes_under_uneven_split() {
        // five leaves: root = (((0,1),(2,3)),4)
        let (tree, leaves, internals) = verified_tree(5);
        assert_eq!(tree.chunk_hashes_under(&internals[2]).unwrap(), leaves[..4]);
    }

    #[test]
    fn unknown_hash_is_not_found() {
        let (tree, _, _) = verified_tree(4);
        let missing = "f".repeat(64);
        assert_eq!(
            tree.chunk_hashes_under(&missing),
            Err(TreeError::HashNotFound(missing))
        );
    }

    #[test]
    fn completion_refreshes_computed_path() {
        let leaves = leaf_digests(4);
        let internals = internal_digests(&leaves);
        let zeroed = HashEngine::hex_digest_of([0u8; 4]);
        let digests: Vec<_> = leaves
            .iter()
            .map(|hash| LeafDigests {
                expected: hash.clone(),
                computed: zeroed.clone(),
            })
            .collect();
        let mut tree = IntegrityTree::build(&digests, &internals).unwrap();
        assert_ne!(tree.root_hash(), internals.last().map(String::as_str));

        // expected digests still resolve before any data arrived
        assert_eq!(tree.chunk_hashes_under(&internals[0]).unwrap(), leaves[..2]);

        for chunk in 0..4 {
            tree.mark_completed(chunk);
        }
        assert_eq!(tree.root_hash(), internals.last().map(String::as_str));
    }
}
