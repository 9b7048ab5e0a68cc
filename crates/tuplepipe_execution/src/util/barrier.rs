use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// One-shot handoff of a value from a single publisher to any number of
/// waiting readers.
///
/// Readers block in `wait` until the barrier is unblocked. Unblocking with
/// `None` signals the publisher gave up, readers should exit without doing
/// any work.
#[derive(Debug)]
pub struct PublishBarrier<T> {
    inner: Arc<BarrierInner<T>>,
}

impl<T> Clone for PublishBarrier<T> {
    fn clone(&self) -> Self {
        PublishBarrier {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct BarrierInner<T> {
    state: Mutex<BarrierState<T>>,
    cond: Condvar,
}

#[derive(Debug)]
struct BarrierState<T> {
    unblocked: bool,
    item: Option<Arc<T>>,
}

impl<T> Default for PublishBarrier<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PublishBarrier<T> {
    pub fn new() -> Self {
        PublishBarrier {
            inner: Arc::new(BarrierInner {
                state: Mutex::new(BarrierState {
                    unblocked: false,
                    item: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Unblock all readers. Only the first call has an effect.
    pub fn unblock(&self, item: Option<Arc<T>>) {
        let mut state = self.inner.state.lock();
        if state.unblocked {
            return;
        }
        state.unblocked = true;
        state.item = item;
        self.inner.cond.notify_all();
    }

    #[cfg(test)]
    fn is_unblocked(&self) -> bool {
        self.inner.state.lock().unblocked
    }

    /// Block until unblocked, returning the published item.
    pub fn wait(&self) -> Option<Arc<T>> {
        let mut state = self.inner.state.lock();
        while !state.unblocked {
            self.inner.cond.wait(&mut state);
        }
        state.item.clone()
    }

    /// Guard unblocking the barrier with `None` when dropped, unless
    /// something was published first.
    pub fn abort_guard(&self) -> AbortOnDrop<T> {
        AbortOnDrop {
            barrier: self.clone(),
        }
    }
}

#[derive(Debug)]
pub struct AbortOnDrop<T> {
    barrier: PublishBarrier<T>,
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.barrier.unblock(None);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn readers_see_published_item() {
        let barrier = PublishBarrier::new();
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let barrier = barrier.clone();
                thread::spawn(move || barrier.wait().map(|v| *v))
            })
            .collect();

        barrier.unblock(Some(Arc::new(7)));
        for r in readers {
            assert_eq!(Some(7), r.join().unwrap());
        }
    }

    #[test]
    fn guard_aborts_unpublished() {
        let barrier: PublishBarrier<i32> = PublishBarrier::new();
        {
            let _guard = barrier.abort_guard();
        }
        assert!(barrier.is_unblocked());
        assert_eq!(None, barrier.wait());
    }

    #[test]
    fn first_unblock_wins() {
        let barrier = PublishBarrier::new();
        barrier.unblock(Some(Arc::new(1)));
        drop(barrier.abort_guard());
        assert_eq!(Some(1), barrier.wait().map(|v| *v));
    }
}
