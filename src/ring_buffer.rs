// ring_buffer.rs

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};
use std::ptr::{self, NonNull};
use std::slice;

/// Fixed-capacity circular buffer over a single contiguous allocation.
///
/// The allocation never moves or grows after construction, so a pointer into
/// the current read or write window stays valid until the buffer is dropped.
/// The duplex buffer relies on this to lend windows to native calls without
/// copying.
///
/// Accessors only ever materialise slices over the region they touch (the
/// occupied region for reads, the free region for writes). A producer filling
/// the free region through a raw window therefore never aliases a consumer
/// reading the occupied region.
pub struct RingBuffer<T> {
    storage: NonNull<T>,
    capacity: usize,
    start: usize,
    len: usize,
    _owns: PhantomData<Box<[T]>>,
}

// SAFETY: the buffer owns its allocation exclusively, like a `Box<[T]>`.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Sync> Sync for RingBuffer<T> {}

impl<T: Copy + Default> RingBuffer<T> {
    /// Create an empty ring buffer.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be greater than zero");
        let boxed: Box<[T]> = vec![T::default(); capacity].into_boxed_slice();
        let storage = NonNull::from(Box::leak(boxed)).cast::<T>();
        Self {
            storage,
            capacity,
            start: 0,
            len: 0,
            _owns: PhantomData,
        }
    }
}

impl<T: Copy> RingBuffer<T> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items currently held.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// Number of items that can still be appended.
    pub fn free(&self) -> usize {
        self.capacity - self.len
    }

    /// Array offset of the first item.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Array offset one past the last item, wrapped.
    pub fn end(&self) -> usize {
        (self.start + self.len) % self.capacity
    }

    /// Contiguous free space starting at [`end`](Self::end).
    ///
    /// This is bounded by the end of the array, not by [`free`](Self::free).
    pub fn write_len(&self) -> usize {
        if self.start + self.len >= self.capacity {
            self.capacity - self.len
        } else {
            self.capacity - self.start - self.len
        }
    }

    /// Contiguous occupied space starting at [`start`](Self::start).
    pub fn read_len(&self) -> usize {
        if self.start + self.len >= self.capacity {
            self.capacity - self.start
        } else {
            self.len
        }
    }

    /// Mark `count` items as written, after they were placed directly into
    /// the write window.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds [`free`](Self::free).
    pub fn produce(&mut self, count: usize) {
        assert!(
            count <= self.free(),
            "can't produce more data than buffer size: free={}, produce={}",
            self.free(),
            count
        );
        self.len += count;
    }

    /// Drop `count` items from the front.
    ///
    /// The start offset is advanced rather than reset even when the buffer
    /// becomes empty, so a write window lent out before the call still lines
    /// up with the next [`produce`](Self::produce).
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds [`len`](Self::len).
    pub fn consume(&mut self, count: usize) {
        assert!(
            count <= self.len,
            "can't consume more data than exists: len={}, consume={}",
            self.len,
            count
        );
        self.len -= count;
        self.start = (self.start + count) % self.capacity;
    }

    /// Empty the buffer without touching the allocation.
    pub fn reset(&mut self) {
        self.start = 0;
        self.len = 0;
    }

    /// Copy as many of `items` as fit. Returns the number appended, which is
    /// `min(items.len(), free())`. Never blocks and never fails on overflow.
    pub fn append(&mut self, items: &[T]) -> usize {
        let count = items.len().min(self.free());
        if count == 0 {
            return 0;
        }

        let first = count.min(self.write_len());
        let end = self.end();
        self.region_mut(end, first).copy_from_slice(&items[..first]);
        self.len += first;

        let rest = count - first;
        if rest > 0 {
            // The free space wrapped; it now continues at the array start.
            let end = self.end();
            self.region_mut(end, rest).copy_from_slice(&items[first..count]);
            self.len += rest;
        }
        count
    }

    /// Append a single item, returning `false` if the buffer is full.
    pub fn push(&mut self, item: T) -> bool {
        if self.is_full() {
            return false;
        }
        let end = self.end();
        // SAFETY: `end < capacity` and the slot is in the free region.
        unsafe { self.storage.as_ptr().add(end).write(item) };
        self.len += 1;
        true
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let item = self[0];
        self.consume(1);
        Some(item)
    }

    /// Copy up to `dest.len()` items from the front without consuming them.
    pub fn copy_to(&self, dest: &mut [T]) -> usize {
        let count = dest.len().min(self.len);
        if count == 0 {
            return 0;
        }
        let first = count.min(self.read_len());
        dest[..first].copy_from_slice(self.region(self.start, first));
        if count > first {
            dest[first..count].copy_from_slice(self.region(0, count - first));
        }
        count
    }

    /// Copy then consume up to `dest.len()` items.
    pub fn move_to(&mut self, dest: &mut [T]) -> usize {
        let count = self.copy_to(dest);
        self.consume(count);
        count
    }

    /// Occupied items that are contiguous from the start offset.
    pub fn read_window(&self) -> &[T] {
        self.region(self.start, self.read_len())
    }

    /// Free slots that are contiguous from the end offset.
    pub fn write_window(&mut self) -> &mut [T] {
        let end = self.end();
        let len = self.write_len();
        self.region_mut(end, len)
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len).map(move |i| self[i])
    }

    /// Raw form of [`write_window`](Self::write_window) for callers that
    /// fill the window after releasing their lock on the buffer.
    pub(crate) fn write_window_raw(&mut self) -> (*mut T, usize) {
        // SAFETY: `end() < capacity`, so the offset stays inside the allocation.
        let ptr = unsafe { self.storage.as_ptr().add(self.end()) };
        (ptr, self.write_len())
    }

    /// Raw form of [`read_window`](Self::read_window).
    pub(crate) fn read_window_raw(&self) -> (*const T, usize) {
        // SAFETY: `start < capacity`.
        let ptr = unsafe { self.storage.as_ptr().add(self.start) } as *const T;
        (ptr, self.read_len())
    }

    fn region(&self, offset: usize, len: usize) -> &[T] {
        debug_assert!(offset + len <= self.capacity);
        // SAFETY: the range lies inside the allocation and every slot is
        // initialised from construction on.
        unsafe { slice::from_raw_parts(self.storage.as_ptr().add(offset), len) }
    }

    fn region_mut(&mut self, offset: usize, len: usize) -> &mut [T] {
        debug_assert!(offset + len <= self.capacity);
        // SAFETY: as in `region`, and `&mut self` gives exclusive access.
        unsafe { slice::from_raw_parts_mut(self.storage.as_ptr().add(offset), len) }
    }

    fn slot(&self, index: usize) -> *mut T {
        assert!(
            index < self.len,
            "index {} out of range for ring buffer of length {}",
            index,
            self.len
        );
        // SAFETY: the wrapped offset is always below capacity.
        unsafe { self.storage.as_ptr().add((self.start + index) % self.capacity) }
    }
}

impl<T: Copy> Index<usize> for RingBuffer<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        // SAFETY: `slot` bounds-checks against the occupied length.
        unsafe { &*self.slot(index) }
    }
}

impl<T: Copy> IndexMut<usize> for RingBuffer<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        // SAFETY: `slot` bounds-checks, `&mut self` is exclusive.
        unsafe { &mut *self.slot(index) }
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        // SAFETY: `storage` and `capacity` came from a leaked `Box<[T]>`.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.storage.as_ptr(),
                self.capacity,
            )));
        }
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("start", &self.start)
            .field("len", &self.len)
            .field("free", &(self.capacity - self.len))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_append_truncates_at_capacity() {
        let mut ring = RingBuffer::<u8>::new(8);
        let appended = ring.append(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(appended, 8);
        assert_eq!(ring.free(), 0);
        assert!(ring.is_full());
        assert_eq!(ring.append(&[42]), 0);
    }

    #[test]
    fn test_append_wraps_around() {
        let mut ring = RingBuffer::<u8>::new(8);
        ring.append(&[1, 2, 3, 4, 5, 6]);
        ring.consume(4);
        assert_eq!(ring.start(), 4);

        // 2 occupied at offsets 4..6; 6 free split as 6..8 and 0..4
        assert_eq!(ring.write_len(), 2);
        assert_eq!(ring.append(&[7, 8, 9, 10, 11]), 5);
        assert_eq!(ring.len(), 7);
        assert_eq!(ring.end(), 3);
        assert_eq!(ring.iter().collect::<Vec<_>>(), vec![5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_windows_are_contiguous() {
        let mut ring = RingBuffer::<u8>::new(10);
        ring.append(&[0; 7]);
        ring.consume(5);

        // occupied 5..7, free 7..10 then 0..5
        assert_eq!(ring.read_len(), 2);
        assert_eq!(ring.write_len(), 3);
        assert_eq!(ring.write_window().len(), 3);

        ring.write_window().copy_from_slice(&[1, 2, 3]);
        ring.produce(3);
        assert_eq!(ring.end(), 0);
        assert_eq!(ring.write_len(), 5);
        assert_eq!(ring.read_window(), &[0, 0, 1, 2, 3]);
    }

    #[test]
    fn test_write_len_when_wrapped() {
        let mut ring = RingBuffer::<u8>::new(8);
        ring.append(&[0; 8]);
        ring.consume(6);
        ring.append(&[1, 2, 3]);
        // occupied 6..8 and 0..3, free 3..6
        assert_eq!(ring.write_len(), 3);
        assert_eq!(ring.read_len(), 2);
    }

    #[test]
    fn test_move_to_preserves_order() {
        let mut ring = RingBuffer::<u8>::new(4);
        ring.append(&[1, 2, 3]);
        ring.consume(2);
        ring.append(&[4, 5, 6]);

        let mut out = [0u8; 3];
        assert_eq!(ring.move_to(&mut out), 3);
        assert_eq!(out, [3, 4, 5]);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.pop(), Some(6));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_consume_advances_start_when_emptied() {
        let mut ring = RingBuffer::<u8>::new(8);
        ring.append(&[1, 2, 3]);
        ring.consume(3);
        assert!(ring.is_empty());
        assert_eq!(ring.start(), 3);
        assert_eq!(ring.end(), 3);

        ring.reset();
        assert_eq!(ring.start(), 0);
    }

    #[test]
    fn test_index_in_place() {
        let mut ring = RingBuffer::<char>::new(3);
        ring.append(&['a', 'b', 'c']);
        ring.consume(2);
        ring.push('d');
        ring[1] = 'e';
        assert_eq!(ring[0], 'c');
        assert_eq!(ring[1], 'e');
    }

    #[test]
    #[should_panic(expected = "can't produce more data")]
    fn test_produce_beyond_free_panics() {
        let mut ring = RingBuffer::<u8>::new(4);
        ring.produce(5);
    }

    #[test]
    #[should_panic]
    fn test_zero_capacity_panics() {
        let _ = RingBuffer::<u8>::new(0);
    }

    #[quickcheck]
    fn prop_length_plus_free_is_capacity(capacity: u8, ops: Vec<(u8, u8)>) -> bool {
        let capacity = usize::from(capacity) + 1;
        let mut ring = RingBuffer::<u8>::new(capacity);
        let mut model = std::collections::VecDeque::new();

        for (append, consume) in ops {
            let items = vec![append; usize::from(append % 16)];
            let appended = ring.append(&items);
            if appended != items.len().min(capacity - model.len()) {
                return false;
            }
            model.extend(&items[..appended]);

            let consume = usize::from(consume).min(ring.len());
            ring.consume(consume);
            model.drain(..consume);

            if ring.len() + ring.free() != capacity {
                return false;
            }
        }
        ring.iter().eq(model.iter().copied())
    }

    #[quickcheck]
    fn prop_write_then_read_roundtrips(data: Vec<u8>, offset: u8) -> bool {
        let capacity = data.len().max(1) + usize::from(offset % 7);
        let mut ring = RingBuffer::<u8>::new(capacity);

        // Rotate the start so the copy wraps for most inputs.
        let shift = usize::from(offset) % capacity;
        ring.append(&vec![0; shift]);
        ring.consume(shift);

        ring.append(&data);
        let mut out = vec![0; data.len()];
        ring.move_to(&mut out) == data.len() && out == data && ring.is_empty()
    }
}
