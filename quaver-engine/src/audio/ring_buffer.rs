//! Fixed-capacity circular byte buffer
//!
//! Backing store for [`crate::audio::OutputBuffer`]. Put/get/peek copy in at
//! most two segments around the wrap boundary and never block or overwrite
//! unread bytes. There is no locking here: concurrency safety is the
//! caller's responsibility (OutputBuffer holds this inside its state mutex).

/// Circular byte store with a fixed capacity chosen at construction
pub struct RingBuffer {
    store: Vec<u8>,
    /// Read cursor, wraps modulo capacity
    rpos: usize,
    /// Bytes currently buffered; 0 <= fill <= capacity
    fill: usize,
}

impl RingBuffer {
    /// Create a buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            store: vec![0; capacity],
            rpos: 0,
            fill: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.store.len()
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.fill
    }

    pub fn is_empty(&self) -> bool {
        self.fill == 0
    }

    /// Free space in bytes
    pub fn space(&self) -> usize {
        self.store.len() - self.fill
    }

    /// Reset to empty. Does not touch the backing store contents.
    pub fn clear(&mut self) {
        self.rpos = 0;
        self.fill = 0;
    }

    /// Copy as much of `data` as fits, returning bytes actually written
    /// (0 if full). Never overwrites unread bytes.
    pub fn put(&mut self, data: &[u8]) -> usize {
        let cap = self.store.len();
        let n = data.len().min(self.space());
        if n == 0 {
            return 0;
        }

        let wpos = (self.rpos + self.fill) % cap;
        let first = n.min(cap - wpos);
        self.store[wpos..wpos + first].copy_from_slice(&data[..first]);
        if first < n {
            // Wrapped: remainder lands at the start of the store
            self.store[..n - first].copy_from_slice(&data[first..n]);
        }

        self.fill += n;
        n
    }

    /// Remove and return up to `out.len()` buffered bytes (0 if empty).
    pub fn get(&mut self, out: &mut [u8]) -> usize {
        let n = self.copy_out(out);
        self.rpos = (self.rpos + n) % self.store.len();
        self.fill -= n;
        n
    }

    /// Same copy as [`RingBuffer::get`] but leaves the buffer unchanged.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        self.copy_out(out)
    }

    fn copy_out(&self, out: &mut [u8]) -> usize {
        let cap = self.store.len();
        let n = out.len().min(self.fill);
        if n == 0 {
            return 0;
        }

        let first = n.min(cap - self.rpos);
        out[..first].copy_from_slice(&self.store[self.rpos..self.rpos + first]);
        if first < n {
            out[first..n].copy_from_slice(&self.store[..n - first]);
        }
        n
    }
}
