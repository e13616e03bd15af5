//! Fixed-capacity sliding window used for every accelerator's history.
//!
//! The window owns `capacity` preallocated slots and two indices: `head`, the
//! slot holding the oldest entry, and `len`, the number of live entries.
//! Pushing into a full window overwrites the oldest slot, so after
//! construction no pushes allocate as long as callers use [`Window::push_with`]
//! to fill slots in place.

/// A bounded FIFO of history entries, oldest first.
#[derive(Debug, Clone)]
pub struct Window<T> {
    slots: Vec<T>,
    head: usize,
    len: usize,
}

impl<T> Window<T> {
    /// Creates a window with `capacity` slots, each initialized by `init`.
    ///
    /// The slot values are storage only; they are not visible as entries
    /// until something is pushed.
    pub fn from_fn(capacity: usize, mut init: impl FnMut() -> T) -> Self {
        Self {
            slots: (0..capacity).map(|_| init()).collect(),
            head: 0,
            len: 0,
        }
    }

    /// Maximum number of entries retained.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of entries currently held, `min(pushes since clear, capacity)`.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Forgets every entry. Slot storage is kept for reuse.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    // Physical slot of the logical index `i` (0 = oldest).
    fn slot(&self, i: usize) -> usize {
        let idx = self.head + i;
        if idx >= self.capacity() {
            idx - self.capacity()
        } else {
            idx
        }
    }

    /// Claims the slot for a fresh entry, evicting the oldest one if the
    /// window is full, and lets `fill` overwrite it in place.
    ///
    /// Returns `false` without calling `fill` when the capacity is zero.
    pub fn push_with(&mut self, fill: impl FnOnce(&mut T)) -> bool {
        let cap = self.capacity();
        if cap == 0 {
            return false;
        }
        let target = if self.len < cap {
            let target = self.slot(self.len);
            self.len += 1;
            target
        } else {
            let target = self.head;
            self.head = if self.head + 1 == cap { 0 } else { self.head + 1 };
            target
        };
        fill(&mut self.slots[target]);
        true
    }

    /// Appends `entry`, evicting the oldest entry when full.
    ///
    /// With zero capacity the entry is discarded immediately.
    pub fn push(&mut self, entry: T) {
        let mut entry = Some(entry);
        self.push_with(|slot| {
            if let Some(value) = entry.take() {
                *slot = value;
            }
        });
    }

    /// Entry at logical index `i`, where 0 is the oldest.
    pub fn get(&self, i: usize) -> Option<&T> {
        if i < self.len {
            Some(&self.slots[self.slot(i)])
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut T> {
        if i < self.len {
            let idx = self.slot(i);
            Some(&mut self.slots[idx])
        } else {
            None
        }
    }

    /// The most recently pushed entry.
    pub fn newest(&self) -> Option<&T> {
        self.len.checked_sub(1).and_then(|i| self.get(i))
    }

    /// Iterates oldest to newest. Use `.rev()` for newest to oldest.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            window: self,
            front: 0,
            back: self.len,
        }
    }

    /// Mutable iteration, oldest to newest.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        // The live entries are `slots[head..]` followed by the wrapped prefix.
        let cap = self.capacity();
        let first = self.len.min(cap - self.head);
        let wrapped = self.len - first;
        let (prefix, tail) = self.slots.split_at_mut(self.head);
        tail.iter_mut()
            .take(first)
            .chain(prefix.iter_mut().take(wrapped))
    }
}

/// Double-ended iterator over a [`Window`], oldest first.
pub struct Iter<'a, T> {
    window: &'a Window<T>,
    front: usize,
    back: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front == self.back {
            return None;
        }
        let item = self.window.get(self.front);
        self.front += 1;
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl<T> DoubleEndedIterator for Iter<'_, T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front == self.back {
            return None;
        }
        self.back -= 1;
        self.window.get(self.back)
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}

impl<'a, T> IntoIterator for &'a Window<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
