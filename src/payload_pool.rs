//! A small free list of reusable payload structs, used to avoid allocation
//! churn on the hot voice-update reconcile path.

/// A value that can be pooled: reset to a blank state before being handed
/// back out by [`PayloadPool::acquire`].
pub trait Poolable: Default {
    /// Reset every field to its default, releasing any borrowed data.
    fn reset(&mut self);
}

/// Free list of at most [`PayloadPool::CAPACITY`] pre-shaped payloads.
///
/// Not thread-safe: each [`crate::node::Node`] or
/// [`crate::connection::Connection`] owns its own pool and only ever
/// touches it from its own task.
#[derive(Debug)]
pub struct PayloadPool<T> {
    free: Vec<T>,
}

impl<T: Poolable> PayloadPool<T> {
    /// Maximum number of payloads retained for reuse.
    pub const CAPACITY: usize = 12;

    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            free: Vec::with_capacity(Self::CAPACITY),
        }
    }

    /// Take a payload from the free list, or construct a fresh one if the
    /// list is empty.
    #[must_use]
    pub fn acquire(&mut self) -> T {
        self.free.pop().unwrap_or_default()
    }

    /// Reset `value` and return it to the free list, unless the list is
    /// already at capacity, in which case it is dropped.
    pub fn release(&mut self, mut value: T) {
        value.reset();

        if self.free.len() < Self::CAPACITY {
            self.free.push(value);
        }
    }

    /// The number of payloads currently held in reserve.
    #[must_use]
    pub fn len(&self) -> usize {
        self.free.len()
    }

    /// Whether the free list currently holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

impl<T: Poolable> Default for PayloadPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, PartialEq, Debug)]
    struct Payload {
        value: i32,
    }

    impl Poolable for Payload {
        fn reset(&mut self) {
            self.value = 0;
        }
    }

    #[test]
    fn release_resets_and_caps_at_capacity() {
        let mut pool: PayloadPool<Payload> = PayloadPool::new();

        for i in 0..(PayloadPool::<Payload>::CAPACITY + 4) {
            pool.release(Payload { value: i as i32 });
        }

        assert_eq!(pool.len(), PayloadPool::<Payload>::CAPACITY);
    }

    #[test]
    fn acquire_reuses_reset_payloads() {
        let mut pool: PayloadPool<Payload> = PayloadPool::new();
        pool.release(Payload { value: 42 });

        let payload = pool.acquire();
        assert_eq!(payload, Payload { value: 0 });
        assert!(pool.is_empty());
    }
}
