//! Fixed-capacity FIFO rings shared between the pipeline stages.

/// Circular buffer with overwrite-oldest semantics on push.
///
/// Callers wrap a `Ring` in its own `parking_lot::Mutex`; the ring itself
/// holds no lock so it can also be used single-threaded (tests, modem state).
pub struct Ring<T: Copy + Default> {
    data: Vec<T>,
    head: usize,
    size: usize,
}

impl<T: Copy + Default> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self { data: vec![T::default(); capacity], head: 0, size: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Append `items`, overwriting the oldest entries once full.
    pub fn push(&mut self, items: &[T]) {
        let cap = self.data.len();
        for &item in items {
            let tail = (self.head + self.size) % cap;
            self.data[tail] = item;
            if self.size == cap {
                self.head = (self.head + 1) % cap;
            } else {
                self.size += 1;
            }
        }
    }

    /// Pop up to `out.len()` items; returns how many were written.
    pub fn pop(&mut self, out: &mut [T]) -> usize {
        let cap = self.data.len();
        let n = self.size.min(out.len());
        for slot in out.iter_mut().take(n) {
            *slot = self.data[self.head];
            self.head = (self.head + 1) % cap;
        }
        self.size -= n;
        n
    }

    /// Copy the first `out.len()` items without consuming them.
    /// Returns false (and copies nothing) when fewer are buffered.
    pub fn peek(&self, out: &mut [T]) -> bool {
        if self.size < out.len() {
            return false;
        }
        let cap = self.data.len();
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.data[(self.head + i) % cap];
        }
        true
    }

    /// Discard the first `count` items without copying.
    pub fn drop_front(&mut self, count: usize) {
        if count >= self.size {
            self.head = 0;
            self.size = 0;
        } else {
            self.head = (self.head + count) % self.data.len();
            self.size -= count;
        }
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.size = 0;
    }
}
