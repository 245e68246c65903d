//! Route keys: where an element should go.

use super::{Element, ElementKind, RouteKey};
use crate::error::{QtSortError, Result};
use crate::tree::WeightedQuadtree;
use std::sync::Arc;

/// Route by group: the tile is the index of the group owning the element's
/// quadtree, divided by `blocksplit`.
#[derive(Debug, Clone)]
pub struct SortGroup {
    groups: Arc<WeightedQuadtree>,
    blocksplit: usize,
}

impl SortGroup {
    pub fn new(groups: Arc<WeightedQuadtree>, blocksplit: usize) -> Result<Self> {
        if blocksplit == 0 {
            return Err(QtSortError::InvalidInput(
                "blocksplit must be at least 1".to_string(),
            ));
        }
        Ok(Self { groups, blocksplit })
    }

    pub fn blocksplit(&self) -> usize {
        self.blocksplit
    }

    pub fn max_tile(&self) -> usize {
        self.groups.len() / self.blocksplit + 1
    }

    /// Group index for `element`, before dividing by `blocksplit`.
    pub fn group<T: Element>(&self, element: &T) -> Result<usize> {
        let qt = element.quadtree();
        if !qt.is_valid() {
            return Err(QtSortError::Structural(format!(
                "{:?} {} has invalid quadtree {}",
                element.kind(),
                element.id(),
                qt.as_int()
            )));
        }
        Ok(self.groups.find_tile(qt).index as usize)
    }
}

impl<T: Element> RouteKey<T> for SortGroup {
    fn tile(&self, element: &T) -> Result<usize> {
        Ok(self.group(element)? / self.blocksplit)
    }
}

/// Route by id range, with nodes, ways and relations in three separate
/// bands of `offset` tiles each. Ids past the end of a band stay in its last
/// tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitById {
    node_split_at: i64,
    way_split_at: i64,
    offset: i64,
}

impl SplitById {
    pub fn new(node_split_at: i64, way_split_at: i64, offset: i64) -> Result<Self> {
        if node_split_at <= 0 || way_split_at <= 0 || offset <= 0 {
            return Err(QtSortError::InvalidInput(format!(
                "split sizes must be positive: nodes {}, ways {}, offset {}",
                node_split_at, way_split_at, offset
            )));
        }
        Ok(Self {
            node_split_at,
            way_split_at,
            offset,
        })
    }

    /// Derive the bands from a single node split size: ways are split eight
    /// times finer and each band spans 2^34 ids.
    pub fn from_split_at(split_at: i64) -> Result<Self> {
        if split_at <= 0 {
            return Err(QtSortError::InvalidInput(format!(
                "split size must be positive, got {}",
                split_at
            )));
        }
        Self::new(split_at, (split_at / 8).max(1), ((1i64 << 34) / split_at).max(1))
    }

    pub fn max_tile(&self) -> usize {
        (3 * self.offset) as usize
    }

    fn band(&self, id: i64, split_at: i64) -> i64 {
        (id / split_at).min(self.offset - 1)
    }
}

impl<T: Element> RouteKey<T> for SplitById {
    fn tile(&self, element: &T) -> Result<usize> {
        let id = element.id();
        if id < 0 {
            return Err(QtSortError::InvalidInput(format!(
                "cannot split negative id {}",
                id
            )));
        }
        let tile = match element.kind() {
            ElementKind::Node => self.band(id, self.node_split_at),
            ElementKind::Way => self.offset + self.band(id, self.way_split_at),
            ElementKind::Relation => {
                2 * self.offset + self.band(id, (self.way_split_at / 10).max(1))
            }
            other => {
                return Err(QtSortError::InvalidInput(format!(
                    "cannot split {:?} {} by id",
                    other, id
                )));
            }
        };
        Ok(tile as usize)
    }
}
