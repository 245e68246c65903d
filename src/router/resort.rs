//! Second sort pass for batches holding several groups.
//!
//! When routing with a `blocksplit` above one, tile `t` holds the elements of
//! groups `t * blocksplit .. (t + 1) * blocksplit`. `ResortObjects` splits
//! such a batch back into one batch per group.

use super::{Element, TileBatch};
use crate::error::{QtSortError, Result};
use crate::pipeline::callback::CallFinish;
use crate::tree::WeightedQuadtree;
use std::marker::PhantomData;
use std::sync::Arc;

pub struct ResortObjects<T, C> {
    groups: Arc<WeightedQuadtree>,
    blocksplit: usize,
    sort: bool,
    downstream: C,
    _item: PhantomData<fn(T)>,
}

impl<T, C> ResortObjects<T, C>
where
    T: Element,
    C: CallFinish<CallType = TileBatch<T>>,
{
    pub fn new(groups: Arc<WeightedQuadtree>, blocksplit: usize, downstream: C) -> Result<Self> {
        if blocksplit == 0 {
            return Err(QtSortError::InvalidInput(
                "blocksplit must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            groups,
            blocksplit,
            sort: false,
            downstream,
            _item: PhantomData,
        })
    }

    /// Also sort each group's elements by `(kind, id)`.
    pub fn sorted(mut self) -> Self {
        self.sort = true;
        self
    }
}

impl<T, C> CallFinish for ResortObjects<T, C>
where
    T: Element,
    C: CallFinish<CallType = TileBatch<T>>,
{
    type CallType = TileBatch<T>;
    type ReturnType = C::ReturnType;

    fn call(&mut self, batch: TileBatch<T>) -> Result<()> {
        let off = batch.tile * self.blocksplit;
        let mut parts: Vec<Vec<T>> = (0..self.blocksplit).map(|_| Vec::new()).collect();
        for element in batch.elements {
            let group = self.groups.find_tile(element.quadtree()).index as usize;
            if group < off || group >= off + self.blocksplit {
                return Err(QtSortError::Structural(format!(
                    "{:?} {} in wrong tile: group {} not in {}..{}",
                    element.kind(),
                    element.id(),
                    group,
                    off,
                    off + self.blocksplit
                )));
            }
            parts[group - off].push(element);
        }
        for (i, mut elements) in parts.into_iter().enumerate() {
            if elements.is_empty() {
                continue;
            }
            if self.sort {
                elements.sort_by_key(|e| e.sort_key());
            }
            self.downstream.call(TileBatch {
                tile: off + i,
                elements,
            })?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<C::ReturnType> {
        self.downstream.finish()
    }
}
