//! Expiring LIFO pool of idle streams.
//!
//! Each connection keeps recently finished bidirectional streams here so the
//! next accepted stream can reuse their buffers instead of allocating.
//!
//! # Layout
//!
//! ```text
//!  slots:  [ S1 | S2 | S3 | None | None ]
//!            ▲ oldest       ▲ newest (push/pop end)
//!  count:  3
//! ```
//!
//! Expiration ticks are stamped at push time from a non-decreasing clock, so
//! they grow from bottom to top. A sweep only ever removes a prefix.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

// ============================================================================
// Expiring
// ============================================================================

/// An item that can sit in a [`StreamPool`].
pub trait Expiring {
    /// Tick at which the item stops being worth keeping.
    fn pool_expiration_tick(&self) -> u64;

    /// Irreversibly releases the item. Called for items swept from the pool.
    fn release(self);
}

// ============================================================================
// StreamPool
// ============================================================================

/// Array-backed stack with an explicit count.
///
/// Slots at and beyond `count` are always `None`, so no stale item outlives
/// its logical removal.
pub struct StreamPool<T> {
    slots: Box<[Option<T>]>,
    count: usize,
}

impl<T: Expiring> StreamPool<T> {
    /// Creates an empty pool with room for `capacity` items before growing.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Self::empty_slots(capacity),
            count: 0,
        }
    }

    /// Returns the number of pooled items.
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns `true` if the pool holds no items.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns the current size of the backing array.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Pushes an item, doubling the backing array if it is full.
    pub fn push(&mut self, item: T) {
        if self.count == self.slots.len() {
            self.grow();
        }
        self.slots[self.count] = Some(item);
        self.count += 1;
    }

    /// Pushes an item unless the pool already holds `max_count` items.
    ///
    /// # Errors
    ///
    /// Hands the item back if the pool is full.
    pub fn push_within(&mut self, item: T, max_count: usize) -> Result<(), T> {
        if self.count >= max_count {
            return Err(item);
        }
        self.push(item);
        Ok(())
    }

    /// Pops the most recently pushed item.
    pub fn try_pop(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        self.slots[self.count].take()
    }

    /// Releases the longest-idle items whose expiration tick is before `now`.
    ///
    /// Stops at the first item that has not expired; everything above it was
    /// pushed later and expires later. Returns the number of released items.
    pub fn remove_expired(&mut self, now: u64) -> usize {
        let expired = self.slots[..self.count]
            .iter()
            .take_while(|slot| {
                slot.as_ref()
                    .is_some_and(|item| item.pool_expiration_tick() < now)
            })
            .count();

        if expired == 0 {
            return 0;
        }

        for slot in &mut self.slots[..expired] {
            if let Some(item) = slot.take() {
                item.release();
            }
        }

        // Shift survivors down; the emptied slots end up above `count`.
        self.slots[..self.count].rotate_left(expired);
        self.count -= expired;

        expired
    }

    /// Removes every item, newest first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.count);
        while let Some(item) = self.try_pop() {
            items.push(item);
        }
        items
    }

    fn grow(&mut self) {
        let new_capacity = (self.slots.len() * 2).max(1);
        let mut slots = Self::empty_slots(new_capacity);
        for (target, source) in slots.iter_mut().zip(self.slots.iter_mut()) {
            *target = source.take();
        }
        self.slots = slots;
    }

    fn empty_slots(capacity: usize) -> Box<[Option<T>]> {
        std::iter::repeat_with(|| None).take(capacity).collect()
    }
}

impl<T> fmt::Debug for StreamPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPool")
            .field("count", &self.count)
            .field("capacity", &self.slots.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
