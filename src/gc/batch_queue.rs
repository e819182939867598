//! Double-buffered batch queue.
//!
//! Producers push into the current buffer. The consumer swaps it out for the
//! spare one, processes the detached batch with no lock held, then hands the
//! emptied buffer back so its allocation can be reused.
//!
//! ```text
//!   push ──► [ current ]          take_batch() ──► [ batch ] ──► process
//!            [ spare   ] ──► becomes current          │
//!                                                      ▼
//!                                  give_back(): clear, shrink if oversized,
//!                                  store as spare
//! ```

/// Initial capacity of each buffer.
pub const DESTRUCTION_QUEUE_INITIAL_SIZE: usize = 8;

/// A drained buffer larger than this is replaced by a fresh small one.
pub const DESTRUCTION_QUEUE_MAX_CAPACITY: usize = 10_000;

/// Two-buffer queue. Not synchronized by itself; the owner wraps it in a mutex.
pub struct BatchQueue<T> {
    current: Vec<T>,
    spare: Vec<T>,
    initial_capacity: usize,
    max_capacity: usize,
}

impl<T> BatchQueue<T> {
    pub fn new(initial_capacity: usize, max_capacity: usize) -> Self {
        Self {
            current: Vec::with_capacity(initial_capacity),
            spare: Vec::with_capacity(initial_capacity),
            initial_capacity,
            max_capacity,
        }
    }

    #[inline]
    pub fn push(&mut self, item: T) {
        self.current.push(item);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.current.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Detach the current buffer, leaving the (empty) spare in its place.
    pub fn take_batch(&mut self) -> Vec<T> {
        let next = std::mem::take(&mut self.spare);
        std::mem::replace(&mut self.current, next)
    }

    /// Return a processed batch so its allocation can back the next swap.
    ///
    /// Anything still in the batch is dropped. A buffer that grew past the
    /// max capacity is discarded in favor of a fresh one.
    pub fn give_back(&mut self, mut batch: Vec<T>) {
        batch.clear();

        if batch.capacity() > self.max_capacity {
            batch = Vec::with_capacity(self.initial_capacity);
        }

        self.spare = batch;
    }

    /// Drain both buffers, e.g. at teardown.
    pub fn take_all(&mut self) -> Vec<T> {
        let mut all = self.take_batch();
        all.append(&mut self.spare);
        all
    }

    #[cfg(test)]
    pub(crate) fn capacities(&self) -> (usize, usize) {
        (self.current.capacity(), self.spare.capacity())
    }
}

impl<T> Default for BatchQueue<T> {
    fn default() -> Self {
        Self::new(DESTRUCTION_QUEUE_INITIAL_SIZE, DESTRUCTION_QUEUE_MAX_CAPACITY)
    }
}
