//! Bounded circular buffer.

/// Fixed-capacity ring that keeps the most recent values pushed into it.
///
/// Used to retain recent message identifiers for diagnostics. Deliberately
/// a circular buffer and not a growable log: memory use is bounded no
/// matter how many messages pass through.
pub struct Ring<T> {
    slots: Vec<Option<T>>,
    next: usize,
}

impl<T> Ring<T> {
    /// Create a ring with the given capacity. Panics if capacity is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            next: 0,
        }
    }

    /// Push a value, overwriting the oldest once the ring is full.
    pub fn push(&mut self, value: T) {
        self.slots[self.next] = Some(value);
        self.next = (self.next + 1) % self.slots.len();
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of values currently retained.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.is_none())
    }

    /// Retained values, oldest first.
    pub fn recent(&self) -> Vec<&T> {
        let capacity = self.slots.len();
        (0..capacity)
            .map(|i| &self.slots[(self.next + i) % capacity])
            .filter_map(|slot| slot.as_ref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_ring() {
        let ring: Ring<u32> = Ring::new(4);
        assert!(ring.is_empty());
        assert_eq!(ring.len(), 0);
        assert!(ring.recent().is_empty());
    }

    #[test]
    fn test_partial_fill_keeps_order() {
        let mut ring = Ring::new(4);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.recent(), vec![&1, &2]);
    }

    #[test]
    fn test_overwrite_drops_oldest() {
        let mut ring = Ring::new(3);
        for i in 1..=5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.recent(), vec![&3, &4, &5]);
    }

    #[test]
    #[should_panic(expected = "non-zero")]
    fn test_zero_capacity_panics() {
        let _ring: Ring<u32> = Ring::new(0);
    }

    proptest! {
        #[test]
        fn prop_ring_keeps_last_capacity_values(
            capacity in 1usize..64,
            values in proptest::collection::vec(any::<u32>(), 0..500),
        ) {
            let mut ring = Ring::new(capacity);
            for value in &values {
                ring.push(*value);
            }

            let expected: Vec<&u32> = values
                .iter()
                .skip(values.len().saturating_sub(capacity))
                .collect();
            prop_assert_eq!(ring.len(), expected.len());
            prop_assert_eq!(ring.recent(), expected);
        }
    }
}
