//! Cross-channel GC coordination.
//!
//! Central locking instance for concurrent entity marking. All marking,
//! sweeping and the concurrency management around it stays strictly thread
//! local to each channel; the only shared state is this monitor's aggregate
//! counters and the pure-oid mark queues it routes into. Every transition
//! executes atomically under one exclusive lock with short hold times
//! (integer and flag updates only, no I/O, no traversal).

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{Result, StorageError};
use crate::mark_queue::MarkQueue;
use crate::oid::{self, NULL_OBJECT_ID, ObjectId};

struct MonitorState {
    pending_marks_count: u64,
    pending_store_updates: Box<[bool]>,
    pending_store_update_count: usize,

    needs_sweep: Box<[bool]>,
    sweeping_channel_count: usize,

    /// Root-oid scoreboard, reset at sweep initiation and filled by each
    /// channel's sweep-completion report.
    channel_root_oids: Box<[ObjectId]>,

    sweep_generation: u64,
    gc_hot_generation: u64,
    gc_cold_generation: u64,

    /// No new data since the last sweep; one full mark+sweep pass done.
    /// Stored entities are forced gray, so virtually doomed entities can
    /// still be kept alive by this pass; only a second pass finds them.
    gc_hot_phase_complete: bool,
    /// A second consecutive sweep has run with zero intervening stores,
    /// establishing a stable, fully reclaimed state. Shuts off all GC
    /// activity until the next store resets the flags.
    gc_cold_phase_complete: bool,
}

impl MonitorState {
    fn new(channel_count: usize) -> Self {
        Self {
            pending_marks_count: 0,
            pending_store_updates: vec![false; channel_count].into_boxed_slice(),
            pending_store_update_count: 0,
            needs_sweep: vec![false; channel_count].into_boxed_slice(),
            sweeping_channel_count: 0,
            channel_root_oids: vec![NULL_OBJECT_ID; channel_count].into_boxed_slice(),
            sweep_generation: 0,
            gc_hot_generation: 0,
            gc_cold_generation: 0,
            // GC is initially complete because there is no data at all.
            // Initialization and stores will flip the flags.
            gc_hot_phase_complete: true,
            gc_cold_phase_complete: true,
        }
    }

    fn is_marking_complete(&self) -> bool {
        self.pending_marks_count == 0 && self.pending_store_update_count == 0
    }

    fn advance_gc_completion(&mut self) {
        if self.gc_cold_phase_complete {
            tracing::trace!(target: "marmot::gc", "GC not needed");
            return;
        }
        if self.gc_hot_phase_complete {
            self.gc_cold_phase_complete = true;
            self.gc_cold_generation += 1;
            tracing::info!(
                target: "marmot::gc",
                generation = self.gc_cold_generation,
                "storage GC completed"
            );
        } else {
            self.gc_hot_phase_complete = true;
            self.gc_hot_generation += 1;
            tracing::debug!(
                target: "marmot::gc",
                generation = self.gc_hot_generation,
                "storage GC completed hot phase"
            );
        }
    }
}

/// Cross-channel GC phase coordinator.
///
/// Aggregates per-channel pending-mark counts, pending-store flags and
/// sweep readiness, and drives the hot/cold completion state machine.
pub struct MarkMonitor {
    channel_count: usize,
    channel_hash_modulo: u64,
    reference_cache_length: usize,
    queues: Box<[Arc<MarkQueue>]>,
    state: Mutex<MonitorState>,
}

impl MarkMonitor {
    /// Creates the monitor and one mark queue per channel.
    pub fn new(
        channel_count: usize,
        segment_capacity: usize,
        reference_cache_length: usize,
    ) -> Result<Self> {
        if !oid::is_valid_channel_count(channel_count) {
            return Err(StorageError::Configuration(format!(
                "channel count {} must be a power of two in [1, {}]",
                channel_count,
                oid::MAX_CHANNEL_COUNT
            )));
        }
        let queues = (0..channel_count)
            .map(|i| Arc::new(MarkQueue::new(i, segment_capacity)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            channel_count,
            channel_hash_modulo: channel_count as u64 - 1,
            reference_cache_length,
            queues,
            state: Mutex::new(MonitorState::new(channel_count)),
        })
    }

    /// Number of coordinated channels.
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// The mark queue owned (consumed) by `channel`.
    pub fn queue(&self, channel: usize) -> &Arc<MarkQueue> {
        &self.queues[channel]
    }

    /// Routes one object id into its owning channel's mark queue.
    ///
    /// Null ids are dropped without taking the lock. Always legal, even
    /// mid-sweep: stores happening concurrently with a sweep are deferred
    /// through the pending-store protocol, but reference ids discovered by
    /// marking flow through here at any time.
    pub fn enqueue(&self, object_id: ObjectId) {
        if object_id == NULL_OBJECT_ID {
            return;
        }
        self.state.lock().pending_marks_count += 1;
        // no need to keep the monitor lock nested with the queue lock
        self.queues[oid::channel_of(object_id, self.channel_hash_modulo)].enqueue(object_id);
    }

    /// Bulk variant used by the reference batcher: accounts the total under
    /// one monitor lock acquisition, then appends every non-empty batch
    /// under its queue's own lock only. Batches are drained.
    pub(crate) fn enqueue_batches(&self, batches: &mut [Vec<ObjectId>]) {
        let total: usize = batches.iter().map(Vec::len).sum();
        if total == 0 {
            return;
        }
        self.state.lock().pending_marks_count += total as u64;
        for (channel, batch) in batches.iter_mut().enumerate() {
            if !batch.is_empty() {
                self.queues[channel].enqueue_bulk(batch);
                batch.clear();
            }
        }
    }

    /// Consumes `amount` ids from `channel`'s queue and decrements the
    /// pending-mark count, validating the global count first. The queue tail
    /// is advanced while the monitor lock is held.
    pub fn advance_marking(&self, channel: usize, amount: usize) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.pending_marks_count < amount as u64 {
            return Err(StorageError::consistency(
                channel,
                format!(
                    "pending marks count {} is smaller than the number to be advanced {}",
                    state.pending_marks_count, amount
                ),
            ));
        }
        self.queues[channel].advance_tail(amount)?;
        state.pending_marks_count -= amount as u64;
        Ok(())
    }

    /// Flags `channel` as having an unincorporated store. Idempotent.
    pub fn signal_pending_store_update(&self, channel: usize) {
        let mut state = self.state.lock();
        if !state.pending_store_updates[channel] {
            state.pending_store_updates[channel] = true;
            state.pending_store_update_count += 1;
        }
    }

    /// Clears `channel`'s pending-store flag. Idempotent.
    pub fn clear_pending_store_update(&self, channel: usize) {
        let mut state = self.state.lock();
        if state.pending_store_updates[channel] {
            state.pending_store_updates[channel] = false;
            state.pending_store_update_count -= 1;
        }
    }

    /// Signals a pending store and reactivates the GC in one atomic step.
    pub fn register_pending_store_update(&self, channel: usize) {
        let mut state = self.state.lock();
        if !state.pending_store_updates[channel] {
            state.pending_store_updates[channel] = true;
            state.pending_store_update_count += 1;
        }
        state.gc_hot_phase_complete = false;
        state.gc_cold_phase_complete = false;
    }

    /// Marking is complete once no oids are pending and no store is
    /// waiting to be incorporated.
    pub fn is_marking_complete(&self) -> bool {
        self.state.lock().is_marking_complete()
    }

    /// Reactivates the GC. Called whenever a store is accepted: any
    /// mutation can introduce new reachability, so at least one full hot
    /// pass must run after it.
    pub fn reset_completion(&self) {
        let mut state = self.state.lock();
        state.gc_hot_phase_complete = false;
        state.gc_cold_phase_complete = false;
    }

    /// Polls whether `channel` must sweep now.
    ///
    /// If the channel has a pending sweep flag, it is cleared and `true` is
    /// returned. Otherwise, if no sweep is in flight and marking is
    /// globally complete, this call atomically initiates the coordinated
    /// sweep: the root scoreboard is reset, every mark queue is verified
    /// empty and reset to free the last epoch's segments, every channel's
    /// flag is set and the caller's own flag is consumed. The calling
    /// channel is the single "winner"; all others observe their flag on
    /// their next poll.
    ///
    /// The timing of the individual sweeps relative to renewed marking is
    /// irrelevant; what matters is that a sweep is only issued under the
    /// lock-secured zero check and can never be issued twice concurrently.
    pub fn needs_sweep(&self, channel: usize) -> Result<bool> {
        let mut state = self.state.lock();

        if state.needs_sweep[channel] {
            state.needs_sweep[channel] = false;
            return Ok(true);
        }

        // if there is already a sweep going on, no new sweep may be done
        if state.sweeping_channel_count > 0 {
            return Ok(false);
        }
        if !state.is_marking_complete() {
            return Ok(false);
        }

        // channels update the scoreboard upon completing their sweep
        for root in state.channel_root_oids.iter_mut() {
            *root = NULL_OBJECT_ID;
        }

        // this is the only time all mark queues are guaranteed empty, so
        // reset them to free the memory occupied by the last mark
        for (index, queue) in self.queues.iter().enumerate() {
            if queue.has_elements() {
                return Err(StorageError::consistency(
                    index,
                    "mark queue still has elements at sweep initiation",
                ));
            }
            queue.reset();
        }

        for flag in state.needs_sweep.iter_mut() {
            *flag = true;
        }
        state.sweeping_channel_count = self.channel_count;
        state.needs_sweep[channel] = false;

        tracing::debug!(target: "marmot::gc", initiator = channel, "sweep initiated");
        Ok(true)
    }

    /// Whether `channel` has a sweep pending that it has not yet consumed.
    pub fn is_pending_sweep(&self, channel: usize) -> bool {
        self.state.lock().needs_sweep[channel]
    }

    /// Reports `channel`'s finished sweep along with the highest root
    /// object id it currently knows of (possibly null).
    ///
    /// The last reporting channel advances the hot/cold completion state
    /// and re-enqueues the maximum reported root id as the seed of the next
    /// mark epoch, guaranteeing every cycle starts from a known root.
    pub fn complete_sweep(&self, channel: usize, channel_root_oid: ObjectId) -> Result<()> {
        let mut state = self.state.lock();

        if state.sweeping_channel_count == 0 {
            return Err(StorageError::consistency(
                channel,
                "sweep completion reported while no sweep is in flight",
            ));
        }

        state.channel_root_oids[channel] = channel_root_oid;
        state.needs_sweep[channel] = false;

        tracing::debug!(target: "marmot::gc", channel, "channel completed sweeping");

        state.sweeping_channel_count -= 1;
        if state.sweeping_channel_count == 0 {
            state.sweep_generation += 1;
            state.advance_gc_completion();

            // at least one channel must report a non-null root oid,
            // otherwise the whole storage is (validly) empty
            let max_root = state
                .channel_root_oids
                .iter()
                .copied()
                .max()
                .unwrap_or(NULL_OBJECT_ID);
            if max_root != NULL_OBJECT_ID {
                // from here on, the pending count can only reach 0 again
                // once the next marking is complete
                state.pending_marks_count += 1;
                self.queues[oid::channel_of(max_root, self.channel_hash_modulo)]
                    .enqueue(max_root);
            }
        }
        Ok(())
    }

    /// Whether GC housekeeping is effectively complete for `channel`:
    /// either the cold phase is done (nothing can change until the next
    /// store), or the hot phase is done and the in-flight sweep only has
    /// other channels' sweeps pending.
    ///
    /// Deliberately not "hot complete and no sweep in flight": that state
    /// also occurs while marking.
    pub fn is_complete(&self, channel: usize) -> bool {
        let state = self.state.lock();
        state.gc_cold_phase_complete
            || state.gc_hot_phase_complete
                && state.sweeping_channel_count > 0
                && !state.needs_sweep[channel]
    }

    /// Number of coordinated sweeps that ran to completion.
    pub fn sweep_generation(&self) -> u64 {
        self.state.lock().sweep_generation
    }

    /// Number of completed hot phases.
    pub fn gc_hot_generation(&self) -> u64 {
        self.state.lock().gc_hot_generation
    }

    /// Number of completed cold phases.
    pub fn gc_cold_generation(&self) -> u64 {
        self.state.lock().gc_cold_generation
    }

    /// Total pending mark count across all queues.
    pub fn pending_marks_count(&self) -> u64 {
        self.state.lock().pending_marks_count
    }

    /// Resets to a clean initial state, ready to be used.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        // no consistency checks here; this is reinitialization
        for queue in self.queues.iter() {
            queue.reset();
        }
        *state = MonitorState::new(self.channel_count);
    }

    /// Creates the per-channel reference batcher for marking.
    pub fn provide_reference_marker(self: Arc<Self>) -> ReferenceMarker {
        let buffer_length = self.reference_cache_length;
        ReferenceMarker::new(self, buffer_length)
    }
}

/// Per-channel reference batcher.
///
/// Collects reference oids discovered during marking into one fixed-length
/// buffer per target channel and flushes them in bulk, so inter-channel
/// communication happens per batch instead of per oid. The buffer length is
/// deliberately small (default 100): every channel allocates one buffer per
/// channel, so memory grows with the square of the channel count.
pub struct ReferenceMarker {
    monitor: Arc<MarkMonitor>,
    channel_hash_modulo: u64,
    buffer_length: usize,
    batches: Vec<Vec<ObjectId>>,
}

impl ReferenceMarker {
    fn new(monitor: Arc<MarkMonitor>, buffer_length: usize) -> Self {
        let channel_count = monitor.channel_count();
        let channel_hash_modulo = channel_count as u64 - 1;
        Self {
            monitor,
            channel_hash_modulo,
            buffer_length,
            batches: (0..channel_count)
                .map(|_| Vec::with_capacity(buffer_length))
                .collect(),
        }
    }

    /// Buffers one reference oid, flushing all batches when the target
    /// channel's buffer fills. Null oids are dropped.
    pub fn accept_object_id(&mut self, object_id: ObjectId) {
        if object_id == NULL_OBJECT_ID {
            return;
        }
        let channel = oid::channel_of(object_id, self.channel_hash_modulo);
        self.batches[channel].push(object_id);
        if self.batches[channel].len() == self.buffer_length {
            self.monitor.enqueue_batches(&mut self.batches);
        }
    }

    /// Flushes any buffered oids. Returns whether something was flushed.
    pub fn try_flush(&mut self) -> bool {
        if self.batches.iter().all(Vec::is_empty) {
            return false;
        }
        self.monitor.enqueue_batches(&mut self.batches);
        true
    }

    /// Drops all buffered oids without enqueuing them.
    pub fn reset(&mut self) {
        for batch in &mut self.batches {
            batch.clear();
        }
    }
}
