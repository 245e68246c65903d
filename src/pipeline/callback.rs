//! The stage trait and the synchronous stages built on it.

use crate::error::{QtSortError, Result};
use std::marker::PhantomData;

/// A pipeline stage: receives items one at a time through `call`, then a
/// single `finish` which marks the end of the stream and yields the stage's
/// result.
///
/// Stages own their downstream, so a chain of stages is a value and the end
/// of the stream propagates by each `finish` calling the next.
pub trait CallFinish: Send + 'static {
    type CallType: Send + 'static;
    type ReturnType: Send + 'static;

    fn call(&mut self, item: Self::CallType) -> Result<()>;

    fn finish(&mut self) -> Result<Self::ReturnType>;
}

impl<C> CallFinish for Box<C>
where
    C: CallFinish + ?Sized,
{
    type CallType = C::CallType;
    type ReturnType = C::ReturnType;

    fn call(&mut self, item: Self::CallType) -> Result<()> {
        (**self).call(item)
    }

    fn finish(&mut self) -> Result<Self::ReturnType> {
        (**self).finish()
    }
}

/// Stage wrapping a closure; the stream's end does nothing.
pub struct CallbackFn<T, F> {
    f: F,
    _item: PhantomData<fn(T)>,
}

impl<T, F> CallbackFn<T, F>
where
    T: Send + 'static,
    F: FnMut(T) -> Result<()> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _item: PhantomData,
        }
    }
}

impl<T, F> CallFinish for CallbackFn<T, F>
where
    T: Send + 'static,
    F: FnMut(T) -> Result<()> + Send + 'static,
{
    type CallType = T;
    type ReturnType = ();

    fn call(&mut self, item: T) -> Result<()> {
        (self.f)(item)
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Terminal stage gathering everything it receives.
pub struct Collect<T> {
    items: Vec<T>,
}

impl<T> Collect<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> Default for Collect<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> CallFinish for Collect<T> {
    type CallType = T;
    type ReturnType = Vec<T>;

    fn call(&mut self, item: T) -> Result<()> {
        self.items.push(item);
        Ok(())
    }

    fn finish(&mut self) -> Result<Vec<T>> {
        Ok(std::mem::take(&mut self.items))
    }
}

/// Apply `f` to each item and pass the result downstream.
pub struct MapCallback<In, F, C> {
    f: F,
    downstream: C,
    _item: PhantomData<fn(In)>,
}

impl<In, F, C> MapCallback<In, F, C>
where
    In: Send + 'static,
    C: CallFinish,
    F: FnMut(In) -> Result<C::CallType> + Send + 'static,
{
    pub fn new(f: F, downstream: C) -> Self {
        Self {
            f,
            downstream,
            _item: PhantomData,
        }
    }
}

impl<In, F, C> CallFinish for MapCallback<In, F, C>
where
    In: Send + 'static,
    C: CallFinish,
    F: FnMut(In) -> Result<C::CallType> + Send + 'static,
{
    type CallType = In;
    type ReturnType = C::ReturnType;

    fn call(&mut self, item: In) -> Result<()> {
        let mapped = (self.f)(item)?;
        self.downstream.call(mapped)
    }

    fn finish(&mut self) -> Result<C::ReturnType> {
        self.downstream.finish()
    }
}

/// Deal items to several targets in strict rotation: item `i` goes to
/// target `i % n`.
pub struct SplitCallback<C> {
    targets: Vec<C>,
    next: usize,
}

impl<C: CallFinish> SplitCallback<C> {
    pub fn new(targets: Vec<C>) -> Result<Self> {
        if targets.is_empty() {
            return Err(QtSortError::InvalidInput(
                "split needs at least one target".to_string(),
            ));
        }
        Ok(Self { targets, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl<C: CallFinish> CallFinish for SplitCallback<C> {
    type CallType = C::CallType;
    type ReturnType = Vec<C::ReturnType>;

    fn call(&mut self, item: C::CallType) -> Result<()> {
        let n = self.targets.len();
        let target = &mut self.targets[self.next % n];
        self.next += 1;
        target.call(item)
    }

    /// Finishes every target, even after one of them fails, and reports the
    /// first failure. A target's own error is preferred over a cancellation
    /// caused by a sibling failing.
    fn finish(&mut self) -> Result<Vec<C::ReturnType>> {
        let mut results = Vec::with_capacity(self.targets.len());
        let mut first_err: Option<QtSortError> = None;
        for target in self.targets.iter_mut() {
            match target.finish() {
                Ok(r) => results.push(r),
                Err(e) => {
                    if first_err.as_ref().is_none_or(|prev| prev.is_cancelled() && !e.is_cancelled()) {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_collect_returns_items_in_order() {
        let mut collect = Collect::new();
        for i in 0..4 {
            collect.call(i).unwrap();
        }
        assert_eq!(collect.finish().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_map_then_collect() {
        let mut stage = MapCallback::new(|x: i32| Ok(x * 10), Collect::new());
        stage.call(1).unwrap();
        stage.call(2).unwrap();
        assert_eq!(stage.finish().unwrap(), vec![10, 20]);
    }

    #[test]
    fn test_map_error_stops_item() {
        let mut stage = MapCallback::new(
            |x: i32| {
                if x < 0 {
                    Err(QtSortError::InvalidInput("negative".into()))
                } else {
                    Ok(x)
                }
            },
            Collect::new(),
        );
        stage.call(1).unwrap();
        assert!(stage.call(-1).is_err());
        assert_eq!(stage.finish().unwrap(), vec![1]);
    }

    #[test]
    fn test_callback_fn() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut stage = CallbackFn::new(move |s: &'static str| {
            sink.lock().push(s);
            Ok(())
        });
        stage.call("a").unwrap();
        stage.call("b").unwrap();
        stage.finish().unwrap();
        assert_eq!(*seen.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_split_round_robin() {
        let mut split = SplitCallback::new(vec![Collect::new(), Collect::new(), Collect::new()]).unwrap();
        for i in 0..7 {
            split.call(i).unwrap();
        }
        let parts = split.finish().unwrap();
        assert_eq!(parts, vec![vec![0, 3, 6], vec![1, 4], vec![2, 5]]);
    }

    struct FinishWith(Option<QtSortError>);

    impl CallFinish for FinishWith {
        type CallType = u8;
        type ReturnType = ();

        fn call(&mut self, _: u8) -> Result<()> {
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            match self.0.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[test]
    fn test_split_reports_root_cause_over_cancellation() {
        let mut split = SplitCallback::new(vec![
            FinishWith(None),
            FinishWith(Some(QtSortError::Cancelled)),
            FinishWith(Some(QtSortError::InvalidInput("bad".into()))),
            FinishWith(Some(QtSortError::Structural("later".into()))),
        ])
        .unwrap();
        let err = split.finish().unwrap_err();
        assert!(matches!(err, QtSortError::InvalidInput(ref m) if m == "bad"));

        let mut split = SplitCallback::new(vec![FinishWith(Some(QtSortError::Cancelled))]).unwrap();
        assert!(split.finish().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_split_needs_targets() {
        assert!(SplitCallback::<Collect<u8>>::new(Vec::new()).is_err());
    }

    #[test]
    fn test_boxed_stage() {
        let mut stage: Box<dyn CallFinish<CallType = u8, ReturnType = Vec<u8>>> =
            Box::new(Collect::new());
        stage.call(7).unwrap();
        assert_eq!(stage.finish().unwrap(), vec![7]);
    }
}
