//! Regrouping an element stream into fixed-size blocks.

use super::{Block, Element, ElementKind};
use crate::error::{QtSortError, Result};
use crate::pipeline::callback::{CallFinish, SplitCallback};

/// Cuts incoming elements into blocks of `blocksize` and deals the blocks
/// to the downstream stages in rotation. With an order check enabled, the
/// incoming elements must be strictly increasing by `(kind, id)`.
pub struct BlockCollector<T, C> {
    split: SplitCallback<C>,
    blocksize: usize,
    pending: Vec<T>,
    next_index: u64,
    seen: u64,
    expected: Option<u64>,
    check_order: bool,
    last_key: Option<(ElementKind, i64)>,
}

impl<T, C> BlockCollector<T, C>
where
    T: Element,
    C: CallFinish<CallType = Block<T>>,
{
    pub fn new(downstream: Vec<C>, blocksize: usize) -> Result<Self> {
        if blocksize == 0 {
            return Err(QtSortError::InvalidInput(
                "blocksize must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            split: SplitCallback::new(downstream)?,
            blocksize,
            pending: Vec::with_capacity(blocksize),
            next_index: 0,
            seen: 0,
            expected: None,
            check_order: false,
            last_key: None,
        })
    }

    /// Reject elements that do not follow the previous one in `(kind, id)`
    /// order.
    pub fn check_order(mut self) -> Self {
        self.check_order = true;
        self
    }

    /// Number of elements expected in total, used for block progress.
    pub fn with_expected(mut self, total: u64) -> Self {
        self.expected = Some(total);
        self
    }

    fn emit(&mut self) -> Result<()> {
        let elements = std::mem::replace(&mut self.pending, Vec::with_capacity(self.blocksize));
        let progress = match self.expected {
            Some(total) if total > 0 => (self.seen as f64 * 100.0 / total as f64).min(100.0),
            _ => 0.0,
        };
        let block = Block::new(self.next_index, progress, elements);
        self.next_index += 1;
        self.split.call(block)
    }
}

impl<T, C> CallFinish for BlockCollector<T, C>
where
    T: Element,
    C: CallFinish<CallType = Block<T>>,
{
    type CallType = Vec<T>;
    type ReturnType = Vec<C::ReturnType>;

    fn call(&mut self, elements: Vec<T>) -> Result<()> {
        for element in elements {
            if self.check_order {
                let key = element.sort_key();
                if let Some(last) = self.last_key {
                    if key <= last {
                        return Err(QtSortError::Structural(format!(
                            "{:?} {} out of order after {:?} {}",
                            key.0, key.1, last.0, last.1
                        )));
                    }
                }
                self.last_key = Some(key);
            }
            self.pending.push(element);
            self.seen += 1;
            if self.pending.len() == self.blocksize {
                self.emit()?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<Vec<C::ReturnType>> {
        if !self.pending.is_empty() {
            self.emit()?;
        }
        log::debug!("collected {} elements into {} blocks", self.seen, self.next_index);
        self.split.finish()
    }
}
