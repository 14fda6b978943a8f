//! Counting semaphore used for the parent/child rendezvous points.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::relax::RelaxStrategy;

#[cfg(not(test))]
pub type DefaultRelax = spin::relax::Spin;

/// Host threads give up their time slice instead of burning it.
#[cfg(test)]
pub struct DefaultRelax;

#[cfg(test)]
impl RelaxStrategy for DefaultRelax {
    fn relax() {
        std::thread::yield_now();
    }
}

/// A counting semaphore.
///
/// `down` blocks until the count is positive and then decrements it; `up`
/// increments it. Every `up` releases exactly one `down`, whichever thread
/// performs it.
pub struct Semaphore<R: RelaxStrategy = DefaultRelax> {
    value: AtomicUsize,
    _relax: PhantomData<fn() -> R>,
}

impl<R: RelaxStrategy> Semaphore<R> {
    pub const fn new(value: usize) -> Self {
        Semaphore {
            value: AtomicUsize::new(value),
            _relax: PhantomData,
        }
    }

    pub fn up(&self) {
        self.value.fetch_add(1, Ordering::Release);
    }

    /// Decrement the count if it is positive. Never blocks.
    pub fn try_down(&self) -> bool {
        let mut current = self.value.load(Ordering::Relaxed);
        while current > 0 {
            match self.value.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    pub fn down(&self) {
        self.down_with(R::relax);
    }

    /// Like [`down`](Self::down), calling `relax` between attempts.
    pub fn down_with(&self, mut relax: impl FnMut()) {
        while !self.try_down() {
            relax();
        }
    }

    pub fn value(&self) -> usize {
        self.value.load(Ordering::Relaxed)
    }
}
