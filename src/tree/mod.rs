//! Weighted quadtree of per-tile counts.
//!
//! The tree is an append-only arena: nodes are addressed by their index,
//! index 0 is always the root, and nodes are never freed individually.
//! `rollup`, `rollup_child` and `clip` detach subtrees by clearing child
//! slots, leaving the detached nodes in the arena but unreachable.
//!
//! Every reachable node satisfies `total == weight + sum(children.total)`.

pub mod count;
pub mod groups;
#[cfg(feature = "snapshot")]
pub mod snapshot;

use crate::error::{QtSortError, Result};
use crate::quadtree::Quadtree;
use serde::{Deserialize, Serialize};
use std::ops::Index;

pub use count::{AddCountMap, CollectCounts, CountMap, build_tree, collect_block};
pub use groups::{
    GroupFinder, RollupStats, find_groups_clip, find_groups_copy, tree_rollup, tree_round_copy,
};

/// Child slot value meaning "no child".
const NO_CHILD: usize = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub code: Quadtree,
    /// Count attributed directly to this tile.
    pub weight: i64,
    /// `weight` plus the totals of all attached children.
    pub total: i64,
    pub parent: usize,
    pub children: [usize; 4],
    /// Sequence index: order of the first exact `add`, or the dense 1-based
    /// group number once a groups tree has been numbered.
    pub index: u32,
}

impl TreeNode {
    fn new(code: Quadtree, parent: usize) -> Self {
        Self {
            code,
            weight: 0,
            total: 0,
            parent,
            children: [NO_CHILD; 4],
            index: 0,
        }
    }

    #[inline]
    pub fn has_children(&self) -> bool {
        self.children.iter().any(|&c| c != NO_CHILD)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedQuadtree {
    nodes: Vec<TreeNode>,
    next_index: u32,
}

impl WeightedQuadtree {
    pub fn new() -> Self {
        Self {
            nodes: vec![TreeNode::new(Quadtree::ROOT, 0)],
            next_index: 1,
        }
    }

    /// Number of arena slots, including detached nodes. Preorder walks
    /// terminate when `next` returns this value.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when nothing has any weight.
    pub fn is_empty(&self) -> bool {
        self.nodes[0].total == 0
    }

    #[inline]
    pub fn root(&self) -> &TreeNode {
        &self.nodes[0]
    }

    pub fn get(&self, i: usize) -> Option<&TreeNode> {
        self.nodes.get(i)
    }

    /// Add `weight` to the tile `code`, creating any missing tiles on the way
    /// one level at a time. Every node on the path has its `total` increased;
    /// only the node at `code` has its `weight` increased. Returns the index
    /// of that node.
    pub fn add(&mut self, code: Quadtree, weight: i64) -> Result<usize> {
        if !code.is_valid() {
            return Err(QtSortError::Structural(format!(
                "cannot add invalid quadtree {}",
                code.as_int()
            )));
        }
        let mut curr = 0;
        loop {
            let node = &mut self.nodes[curr];
            node.total += weight;
            if node.code == code {
                if node.index == 0 {
                    node.index = self.next_index;
                    self.next_index += 1;
                }
                node.weight += weight;
                return Ok(curr);
            }

            let depth = node.code.depth();
            let q = code.quadrant(depth);
            let child = node.children[q];
            curr = if child == NO_CHILD {
                let idx = self.nodes.len();
                self.nodes.push(TreeNode::new(code.round(depth + 1), curr));
                self.nodes[curr].children[q] = idx;
                idx
            } else {
                child
            };
        }
    }

    /// Index of the node at `code`, or of the deepest existing ancestor of
    /// `code` when the tile itself is not in the tree.
    pub fn find(&self, code: Quadtree) -> usize {
        let mut curr = 0;
        loop {
            let node = &self.nodes[curr];
            if node.code == code || node.code.depth() >= code.depth() {
                return curr;
            }
            let child = node.children[code.quadrant(node.code.depth())];
            if child == NO_CHILD {
                return curr;
            }
            curr = child;
        }
    }

    /// Index of the node which owns `code`: the result of [`find`](Self::find),
    /// walked upwards past any node without weight of its own. Never goes
    /// above the root.
    pub fn find_tile_index(&self, code: Quadtree) -> usize {
        let mut curr = self.find(code);
        while curr != 0 && self.nodes[curr].weight == 0 {
            curr = self.nodes[curr].parent;
        }
        curr
    }

    /// The node which owns `code`. In a groups tree its `index` is the
    /// destination tile.
    pub fn find_tile(&self, code: Quadtree) -> &TreeNode {
        &self.nodes[self.find_tile_index(code)]
    }

    /// Preorder successor of `curr`, considering only children in slots
    /// `startchild..4`. Passing `startchild = 4` skips `curr`'s subtree.
    /// Returns `len()` once the walk is complete.
    pub fn next(&self, curr: usize, startchild: usize) -> usize {
        let mut curr = curr;
        let mut start = startchild;
        loop {
            let node = &self.nodes[curr];
            if let Some(&child) = node
                .children
                .iter()
                .skip(start)
                .find(|&&c| c != NO_CHILD)
            {
                return child;
            }
            if curr == 0 {
                return self.len();
            }
            start = node.code.quadrant(node.code.depth() - 1) + 1;
            curr = node.parent;
        }
    }

    /// Fold `curr`'s whole subtree into `curr`: its weight becomes its total
    /// and all children are detached.
    pub fn rollup(&mut self, curr: usize) {
        let node = &mut self.nodes[curr];
        node.weight = node.total;
        node.children = [NO_CHILD; 4];
    }

    /// Fold child slot `ci` of `curr` into `curr`'s own weight. Returns false
    /// (and changes nothing) when there is no such child.
    pub fn rollup_child(&mut self, curr: usize, ci: usize) -> bool {
        let child = self.nodes[curr].children[ci];
        if child == NO_CHILD {
            log::warn!(
                "rollup of empty child {} of {} ({})",
                ci,
                curr,
                self.nodes[curr].code
            );
            return false;
        }
        let child_total = self.nodes[child].total;
        let node = &mut self.nodes[curr];
        node.weight += child_total;
        node.children[ci] = NO_CHILD;
        true
    }

    /// Detach `curr` from its parent and remove its total from every
    /// ancestor. Returns the preorder position following `curr`'s subtree.
    ///
    /// The root has no parent: clipping it empties the tree.
    pub fn clip(&mut self, curr: usize) -> usize {
        if curr == 0 {
            let root = &mut self.nodes[0];
            root.weight = 0;
            root.total = 0;
            root.children = [NO_CHILD; 4];
            return self.len();
        }
        let total = self.nodes[curr].total;
        let code = self.nodes[curr].code;
        let parent = self.nodes[curr].parent;

        let mut p = parent;
        loop {
            self.nodes[p].total -= total;
            if p == 0 {
                break;
            }
            p = self.nodes[p].parent;
        }

        let pc = code.quadrant(code.depth() - 1);
        self.nodes[parent].children[pc] = NO_CHILD;
        self.next(parent, pc + 1)
    }

    /// Preorder walk over the reachable nodes.
    pub fn iter(&self) -> Preorder<'_> {
        Preorder { tree: self, pos: 0 }
    }

    /// Reachable nodes carrying weight of their own, in preorder.
    pub fn groups(&self) -> impl Iterator<Item = &TreeNode> {
        self.iter().map(|(_, n)| n).filter(|n| n.weight != 0)
    }

    pub fn num_groups(&self) -> usize {
        self.groups().count()
    }

    /// Give every weighted node a dense 1-based index in preorder, and every
    /// other node index 0. Returns the number of groups.
    pub(crate) fn number_groups(&mut self) -> usize {
        let mut idx = 1;
        let mut i = 0;
        while i < self.len() {
            let node = &mut self.nodes[i];
            if node.weight != 0 {
                node.index = idx;
                idx += 1;
            } else {
                node.index = 0;
            }
            i = self.next(i, 0);
        }
        (idx - 1) as usize
    }

    /// Check the links and totals of every reachable node. Trees built
    /// through `add` always pass; this guards trees read back from disk.
    pub fn validate(&self) -> Result<()> {
        let Some(root) = self.nodes.first() else {
            return Err(QtSortError::Structural("tree has no root".to_string()));
        };
        if root.code != Quadtree::ROOT {
            return Err(QtSortError::Structural(format!(
                "root node has code {}",
                root.code.as_int()
            )));
        }
        let mut stack = vec![0];
        while let Some(i) = stack.pop() {
            let node = &self.nodes[i];
            let mut children_total = 0;
            for (q, &c) in node.children.iter().enumerate() {
                if c == NO_CHILD {
                    continue;
                }
                let Some(child) = self.nodes.get(c) else {
                    return Err(QtSortError::Structural(format!(
                        "node {} has child {} past the end of {} nodes",
                        i,
                        c,
                        self.len()
                    )));
                };
                if child.parent != i || node.code.child(q).ok() != Some(child.code) {
                    return Err(QtSortError::Structural(format!(
                        "node {} ({}) is not child {} of node {} ({})",
                        c, child.code, q, i, node.code
                    )));
                }
                children_total += child.total;
                stack.push(c);
            }
            if node.total != node.weight + children_total {
                return Err(QtSortError::Structural(format!(
                    "node {} ({}) has total {}, expected {}",
                    i,
                    node.code,
                    node.total,
                    node.weight + children_total
                )));
            }
        }
        Ok(())
    }
}

impl Default for WeightedQuadtree {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for WeightedQuadtree {
    type Output = TreeNode;

    fn index(&self, i: usize) -> &TreeNode {
        &self.nodes[i]
    }
}

/// Preorder iterator returned by [`WeightedQuadtree::iter`].
pub struct Preorder<'a> {
    tree: &'a WeightedQuadtree,
    pos: usize,
}

impl<'a> Iterator for Preorder<'a> {
    type Item = (usize, &'a TreeNode);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.tree.len() {
            return None;
        }
        let i = self.pos;
        self.pos = self.tree.next(i, 0);
        Some((i, &self.tree.nodes[i]))
    }
}
