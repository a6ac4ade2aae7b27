//! Per-channel mark queue: the "gray" worklist of object ids awaiting
//! reference traversal.
//!
//! Organized as a ring of fixed-capacity segments addressed by head/tail
//! segment indices plus in-segment offsets. Advancing the write head reuses
//! the next already-drained segment when one exists and splices a new one
//! into the ring otherwise, bounding memory to the high-water mark of
//! concurrently pending ids. Any channel may enqueue (cross-channel
//! reference routing); only the owning channel's thread consumes.

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{Result, StorageError};
use crate::oid::{NULL_OBJECT_ID, ObjectId};

struct Segment {
    oids: Box<[ObjectId]>,
    /// Next index to consume. Only nonzero in the tail segment.
    low: usize,
    /// Next index to fill. Equals capacity in full intermediate segments.
    high: usize,
}

impl Segment {
    fn new(capacity: usize) -> Self {
        Self {
            oids: vec![NULL_OBJECT_ID; capacity].into_boxed_slice(),
            low: 0,
            high: 0,
        }
    }

    fn reset(&mut self) {
        // old oid data in the buffer is irrelevant
        self.low = 0;
        self.high = 0;
    }
}

struct QueueState {
    /// Segments in ring order. Walking forward from `tail` reaches `head`;
    /// segments strictly in between are full, the remainder is drained.
    segments: Vec<Segment>,
    /// Index of the segment currently consumed.
    tail: usize,
    /// Index of the segment currently filled.
    head: usize,
    size: usize,
}

impl QueueState {
    fn advance_head(&mut self, capacity: usize) {
        let next = (self.head + 1) % self.segments.len();
        if next == self.tail {
            // ring is saturated; splice a fresh segment in after the head
            self.segments.insert(self.head + 1, Segment::new(capacity));
            if self.tail > self.head {
                self.tail += 1;
            }
            self.head += 1;
        } else {
            // reuse the next, already drained segment
            self.segments[next].reset();
            self.head = next;
        }
    }

    fn push(&mut self, oid: ObjectId, capacity: usize) {
        debug_assert_ne!(oid, NULL_OBJECT_ID, "null oids are filtered at the producer");
        if self.segments[self.head].high == capacity {
            self.advance_head(capacity);
        }
        let segment = &mut self.segments[self.head];
        segment.oids[segment.high] = oid;
        segment.high += 1;
        self.size += 1;
    }
}

/// Unbounded multi-producer single-consumer FIFO of object ids.
pub struct MarkQueue {
    channel_index: usize,
    segment_capacity: usize,
    state: CachePadded<Mutex<QueueState>>,
    new_work: Condvar,
}

impl MarkQueue {
    /// Creates the queue for `channel_index` with the given segment capacity.
    pub fn new(channel_index: usize, segment_capacity: usize) -> Self {
        Self {
            channel_index,
            segment_capacity,
            state: CachePadded::new(Mutex::new(QueueState {
                segments: vec![Segment::new(segment_capacity)],
                tail: 0,
                head: 0,
                size: 0,
            })),
            new_work: Condvar::new(),
        }
    }

    /// The channel owning (consuming) this queue.
    pub fn channel_index(&self) -> usize {
        self.channel_index
    }

    /// Appends one object id and wakes a waiting consumer.
    pub fn enqueue(&self, object_id: ObjectId) {
        let mut state = self.state.lock();
        state.push(object_id, self.segment_capacity);
        drop(state);
        self.new_work.notify_all();
    }

    /// Appends a batch of object ids under a single lock acquisition.
    pub fn enqueue_bulk(&self, object_ids: &[ObjectId]) {
        if object_ids.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for &oid in object_ids {
            state.push(oid, self.segment_capacity);
        }
        drop(state);
        self.new_work.notify_all();
    }

    /// Copies up to `buffer.len()` pending ids from the consumption end
    /// without removing them. At most one segment's worth is returned.
    pub fn get_next(&self, buffer: &mut [ObjectId]) -> usize {
        let state = self.state.lock();
        let segment = &state.segments[state.tail];
        let available = segment.high - segment.low;
        let amount = available.min(buffer.len());
        buffer[..amount].copy_from_slice(&segment.oids[segment.low..segment.low + amount]);
        amount
    }

    /// Consumes `amount` ids previously observed via [`MarkQueue::get_next`].
    ///
    /// Advancing past the filled region would make retained ids appear
    /// already processed and risk premature reclamation, so it fails loudly
    /// as a fatal consistency error instead of clamping.
    pub fn advance_tail(&self, amount: usize) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let tail = state.tail;
        let segment = &mut state.segments[tail];
        let available = segment.high - segment.low;
        if amount > available {
            return Err(StorageError::consistency(
                self.channel_index,
                format!(
                    "mark queue tail advanced by {amount} past the filled region of {available}"
                ),
            ));
        }
        segment.low += amount;
        state.size -= amount;

        // a fully drained segment is reset; unless it is also the write
        // head, it is handed back to the ring and the tail moves on
        let segment = &mut state.segments[tail];
        if segment.low == segment.high {
            segment.reset();
            if tail != state.head {
                state.tail = (tail + 1) % state.segments.len();
            }
        }
        Ok(())
    }

    /// Whether any ids are pending.
    pub fn has_elements(&self) -> bool {
        self.state.lock().size > 0
    }

    /// Number of pending ids.
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    /// Blocks until an element is present or the timeout elapses.
    /// Returns whether elements are present.
    pub fn wait_for_elements(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.size > 0 {
            return true;
        }
        let _ = self.new_work.wait_for(&mut state, timeout);
        state.size > 0
    }

    /// Drops all content and shrinks back to a single empty segment.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.segments.truncate(1);
        state.segments[0].reset();
        state.tail = 0;
        state.head = 0;
        state.size = 0;
    }
}
