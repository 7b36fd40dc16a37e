//! small outbound-buffer pool
//!
//! outbound frames are short-lived allocations on the send hot path, so the
//! node caches one freed buffer per 16-byte size class and hands it back to
//! the next send of a similar size

const CLASS_SHIFT: usize = 4;
const CLASS_MASK: usize = (1 << CLASS_SHIFT) - 1;
/// largest buffer the pool will cache
pub(crate) const MAX_POOLED: usize = 1024;

/// size-class index for a buffer of `len` bytes
#[inline]
fn class_of(len: usize) -> usize {
    (len >> CLASS_SHIFT) + usize::from(len & CLASS_MASK != 0)
}

/// one cached block per size class
pub(crate) struct BufferPool {
    slots: Vec<Option<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            slots: (0..=class_of(MAX_POOLED)).map(|_| None).collect(),
        }
    }

    /// an empty buffer with capacity for at least `len` bytes
    pub fn alloc(&mut self, len: usize) -> Vec<u8> {
        if len > MAX_POOLED {
            return Vec::with_capacity(len);
        }
        let class = class_of(len);
        match self.slots[class].take() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(class << CLASS_SHIFT),
        }
    }

    /// return a buffer, keeping it only if its class slot is empty
    pub fn free(&mut self, buf: Vec<u8>) {
        let cap = buf.capacity();
        if cap == 0 || cap > MAX_POOLED {
            return;
        }
        // file under the class the capacity fully covers
        let class = cap >> CLASS_SHIFT;
        if class > 0 && self.slots[class].is_none() {
            self.slots[class] = Some(buf);
        }
    }
}
