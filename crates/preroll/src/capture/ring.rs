//! Fixed-capacity slot ring
//!
//! Holds the head/tail/wrap arithmetic shared by the keyframe index and the
//! post-process queue, so both can be reasoned about as plain FIFOs.

/// Bounded FIFO over a fixed slot array.
#[derive(Debug, Clone)]
pub struct SlotRing<T> {
    slots: Box<[Option<T>]>,
    /// Index of the oldest element
    head: usize,
    /// Index where the next element is written
    tail: usize,
    len: usize,
}

impl<T> SlotRing<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "SlotRing capacity must be non-zero");
        let slots = (0..capacity).map(|_| None).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Next slot index after `index`, wrapping at capacity.
    pub fn wrap(&self, index: usize) -> usize {
        (index + 1) % self.capacity()
    }

    /// Append at the tail. Hands the value back if the ring is full.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        if self.is_full() {
            return Err(value);
        }
        self.slots[self.tail] = Some(value);
        self.tail = self.wrap(self.tail);
        self.len += 1;
        Ok(())
    }

    /// Append at the tail, dropping the oldest element if full.
    pub fn push_overwrite(&mut self, value: T) -> Option<T> {
        let evicted = if self.is_full() { self.pop() } else { None };
        // Cannot fail: a slot was just freed if needed
        let _ = self.push(value);
        evicted
    }

    /// Remove the oldest element.
    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let value = self.slots[self.head].take();
        self.head = self.wrap(self.head);
        self.len -= 1;
        value
    }

    pub fn front(&self) -> Option<&T> {
        if self.is_empty() {
            None
        } else {
            self.slots[self.head].as_ref()
        }
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let cap = self.capacity();
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) % cap].as_ref())
    }

    pub fn clear(&mut self) {
        while self.pop().is_some() {}
        self.head = 0;
        self.tail = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_fifo_order() {
        let mut ring = SlotRing::new(3);
        assert!(ring.is_empty());
        ring.push(1).unwrap();
        ring.push(2).unwrap();
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.front(), Some(&1));
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn push_rejects_when_full() {
        let mut ring = SlotRing::new(2);
        ring.push("a").unwrap();
        ring.push("b").unwrap();
        assert!(ring.is_full());
        assert_eq!(ring.push("c"), Err("c"));
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn head_and_tail_wrap_around() {
        let mut ring = SlotRing::new(3);
        for round in 0..10 {
            ring.push(round).unwrap();
            ring.push(round + 100).unwrap();
            assert_eq!(ring.pop(), Some(round));
            assert_eq!(ring.pop(), Some(round + 100));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn push_overwrite_evicts_oldest() {
        let mut ring = SlotRing::new(2);
        assert_eq!(ring.push_overwrite(1), None);
        assert_eq!(ring.push_overwrite(2), None);
        assert_eq!(ring.push_overwrite(3), Some(1));
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn iter_follows_logical_order_across_wrap() {
        let mut ring = SlotRing::new(4);
        for v in 0..4 {
            ring.push(v).unwrap();
        }
        ring.pop();
        ring.pop();
        ring.push(4).unwrap();
        ring.push(5).unwrap();
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn clear_resets_cursors() {
        let mut ring = SlotRing::new(3);
        ring.push(1).unwrap();
        ring.push(2).unwrap();
        ring.pop();
        ring.clear();
        assert!(ring.is_empty());
        ring.push(9).unwrap();
        assert_eq!(ring.front(), Some(&9));
    }

    #[test]
    fn wrap_predicate() {
        let ring: SlotRing<u8> = SlotRing::new(4);
        assert_eq!(ring.wrap(0), 1);
        assert_eq!(ring.wrap(3), 0);
    }

    #[test]
    #[should_panic(expected = "capacity must be non-zero")]
    fn zero_capacity_panics() {
        let _ring: SlotRing<u8> = SlotRing::new(0);
    }
}
