// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Growable circular buffer.
//!
//! New elements go in at `head`, the oldest element comes out at `tail`.
//! Buffers, pending queues and the dispatcher task queue all sit on top
//! of this.

/// FIFO ring over a slot vector. Empty slots hold `None`.
#[derive(Debug)]
pub struct RingBuffer<T> {
    head: usize,
    tail: usize,
    len: usize,
    slots: Vec<Option<T>>,
}

impl<T> RingBuffer<T> {
    /// Create a ring with room for `capacity` elements before it has to
    /// grow. A zero capacity still allocates one slot.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity.max(1));
        slots.resize_with(capacity.max(1), || None);
        Self {
            head: 0,
            tail: 0,
            len: 0,
            slots,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slots currently allocated.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Remove and return the oldest element.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots[self.tail].take();
        self.tail = (self.tail + 1) % self.slots.len();
        self.len -= 1;
        value
    }

    /// Insert at `head`. The caller has already checked there is room.
    pub fn unshift(&mut self, value: T) {
        debug_assert!(self.len < self.slots.len(), "unshift on a full ring");
        self.slots[self.head] = Some(value);
        self.head = (self.head + 1) % self.slots.len();
        self.len += 1;
    }

    /// Insert at `head`, doubling the backing storage first if needed.
    pub fn unbounded_unshift(&mut self, value: T) {
        if self.len == self.slots.len() {
            self.resize();
        }
        self.unshift(value);
    }

    /// Double the backing storage and relinearize: oldest element lands
    /// at index 0.
    fn resize(&mut self) {
        let new_cap = self.slots.len() * 2;
        let mut slots = Vec::with_capacity(new_cap);
        while let Some(value) = self.pop() {
            slots.push(Some(value));
        }
        let len = slots.len();
        slots.resize_with(new_cap, || None);
        self.slots = slots;
        self.tail = 0;
        self.head = len;
        self.len = len;
    }

    /// Keep only elements passing `keep`, preserving their order.
    /// Returns how many were dropped.
    pub fn cleanup<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let before = self.len;
        for _ in 0..before {
            if let Some(value) = self.pop() {
                if keep(&value) {
                    self.unshift(value);
                }
            }
        }
        before - self.len
    }
}
