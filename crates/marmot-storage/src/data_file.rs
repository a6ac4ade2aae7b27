//! Data files and their lifecycle.
//!
//! Each channel owns a circular ring of append-only data files. Exactly one
//! file, the head, accepts appends; a head reaching the configured maximum
//! is retired and a new head is spliced in. Sweeps and entity updates turn
//! stale bytes into gaps (`data_length` shrinks, `total_length` does not);
//! files whose fill ratio degrades are dissolved by migrating their live
//! entities forward into the head and deleting the emptied source, deferred
//! while readers still hold the file open.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

use crate::config::DataFileConfig;
use crate::entity::{Entity, EntityArena, NO_SLOT, Slot};
use crate::error::{Result, StorageError};
use crate::io::{FileIdentity, FileNumberProvider, StorageIo};

/// One append-only data file of a channel.
pub(crate) struct DataFile {
    identity: FileIdentity,
    /// Bytes ever written, including gaps from removed entity versions.
    total_length: u64,
    /// Live bytes.
    data_length: u64,
    /// Entity chain sentinels.
    pub(crate) head: Slot,
    pub(crate) tail: Slot,
    /// File ring links.
    pub(crate) prev: Slot,
    pub(crate) next: Slot,
    /// Outstanding reader/backup registrations.
    users: Arc<Mutex<u32>>,
    retired: bool,
    pending_delete: bool,
}

impl DataFile {
    pub(crate) fn identity(&self) -> FileIdentity {
        self.identity
    }

    pub(crate) fn total_length(&self) -> u64 {
        self.total_length
    }

    pub(crate) fn data_length(&self) -> u64 {
        self.data_length
    }

    pub(crate) fn data_fill_ratio(&self) -> f64 {
        self.data_length as f64 / self.total_length as f64
    }

    pub(crate) fn has_content(&self) -> bool {
        self.data_length != 0
    }

    /// The first entity's length amounting to the whole live length means
    /// it must be the only live entity.
    pub(crate) fn has_single_entity(&self, arena: &EntityArena) -> bool {
        arena[arena[self.head].file_next].data_length() == self.data_length
    }

    fn is_gapless_single_entity(&self, arena: &EntityArena) -> bool {
        self.has_single_entity(arena) && self.data_length == self.total_length
    }
}

/// RAII registration of an outstanding file reader. The file cannot be
/// deleted while any usage is alive.
pub struct FileUsage {
    users: Arc<Mutex<u32>>,
}

impl FileUsage {
    fn new(users: Arc<Mutex<u32>>) -> Self {
        *users.lock() += 1;
        Self { users }
    }
}

impl Drop for FileUsage {
    fn drop(&mut self) {
        *self.users.lock() -= 1;
    }
}

/// Decides data file retirement and dissolution.
///
/// A file is dissolved in one of three extreme cases: too small, too much
/// gap space, or too big. The over-sized case exempts gapless
/// single-entity files to avoid perpetually rewriting one oversized entity.
/// An undersized head file is never dissolved, as the replacement head
/// would start undersized again.
#[derive(Debug, Clone)]
pub struct DataFileEvaluator {
    file_minimum_size: u64,
    file_maximum_size: u64,
    minimum_use_ratio: f64,
    cleanup_head_file: bool,
}

impl DataFileEvaluator {
    /// Creates an evaluator, validating the documented bounds.
    pub fn new(
        file_minimum_size: u64,
        file_maximum_size: u64,
        minimum_use_ratio: f64,
        cleanup_head_file: bool,
    ) -> Result<Self> {
        if file_minimum_size < 1024 {
            return Err(StorageError::Configuration(format!(
                "file minimum size of {file_minimum_size} is lower than the minimum value 1024"
            )));
        }
        if file_maximum_size < file_minimum_size + 1024 {
            return Err(StorageError::Configuration(format!(
                "file maximum size of {file_maximum_size} must exceed the minimum size \
                 {file_minimum_size} by at least 1024"
            )));
        }
        if !(minimum_use_ratio > 0.0 && minimum_use_ratio <= 1.0) {
            return Err(StorageError::Configuration(format!(
                "minimum use ratio of {minimum_use_ratio} is not in the valid range ]0.0, 1.0]"
            )));
        }
        Ok(Self {
            file_minimum_size,
            file_maximum_size,
            minimum_use_ratio,
            cleanup_head_file,
        })
    }

    /// Builds the evaluator from a validated configuration section.
    pub fn from_config(config: &DataFileConfig) -> Result<Self> {
        Self::new(
            config.file_minimum_size,
            config.file_maximum_size,
            config.minimum_use_ratio,
            config.cleanup_head_file,
        )
    }

    /// Whether a file of `total_length` no longer accepts appends.
    pub fn needs_retirement(&self, total_length: u64) -> bool {
        total_length >= self.file_maximum_size
    }

    fn needs_dissolving(&self, file: &DataFile, arena: &EntityArena, is_head: bool) -> bool {
        if is_head && !self.cleanup_head_file {
            return false;
        }
        file.total_length() < self.file_minimum_size && !is_head
            || file.data_fill_ratio() < self.minimum_use_ratio
            || file.total_length() > self.file_maximum_size
                && !file.is_gapless_single_entity(arena)
    }
}

/// Condensed per-file state for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct FileSummary {
    /// The file's identity.
    pub identity: FileIdentity,
    /// Bytes ever written, including gaps.
    pub total_length: u64,
    /// Live bytes.
    pub data_length: u64,
    /// Whether this is the current append head.
    pub is_head: bool,
    /// Whether the file stopped accepting appends.
    pub retired: bool,
}

/// Per-channel data file ring.
pub(crate) struct FileManager {
    channel_index: usize,
    io: Box<dyn StorageIo>,
    numbers: Box<dyn FileNumberProvider>,
    evaluator: DataFileEvaluator,
    files: Vec<Option<DataFile>>,
    free: Vec<Slot>,
    head_file: Slot,
    file_count: usize,
    cleanup_cursor: Option<Slot>,
}

impl FileManager {
    pub(crate) fn new(
        channel_index: usize,
        io: Box<dyn StorageIo>,
        numbers: Box<dyn FileNumberProvider>,
        evaluator: DataFileEvaluator,
        arena: &mut EntityArena,
    ) -> Result<Self> {
        let mut manager = Self {
            channel_index,
            io,
            numbers,
            evaluator,
            files: Vec::new(),
            free: Vec::new(),
            head_file: NO_SLOT,
            file_count: 0,
            cleanup_cursor: None,
        };
        let first = manager.create_file(arena)?;
        manager.head_file = first;
        Ok(manager)
    }

    fn io_error(identity: FileIdentity) -> impl FnOnce(std::io::Error) -> StorageError {
        move |source| StorageError::Io { identity, source }
    }

    fn file(&self, slot: Slot) -> &DataFile {
        self.files[slot as usize]
            .as_ref()
            .expect("file slot resolved after deletion")
    }

    fn file_mut(&mut self, slot: Slot) -> &mut DataFile {
        self.files[slot as usize]
            .as_mut()
            .expect("file slot resolved after deletion")
    }

    fn create_file(&mut self, arena: &mut EntityArena) -> Result<Slot> {
        let identity = FileIdentity {
            channel_index: self.channel_index,
            number: self.numbers.next_file_number(self.channel_index),
        };
        self.io.create(identity).map_err(Self::io_error(identity))?;

        let head = arena.alloc(Entity::sentinel());
        let tail = arena.alloc(Entity::sentinel());
        arena[head].file_next = tail;
        arena[tail].file_prev = head;

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.files.push(None);
                (self.files.len() - 1) as Slot
            }
        };
        arena[head].set_file_slot(slot);
        arena[tail].set_file_slot(slot);

        let mut file = DataFile {
            identity,
            total_length: 0,
            data_length: 0,
            head,
            tail,
            prev: slot,
            next: slot,
            users: Arc::new(Mutex::new(0)),
            retired: false,
            pending_delete: false,
        };

        if self.head_file != NO_SLOT {
            // splice after the current head
            let after = self.file(self.head_file).next;
            file.prev = self.head_file;
            file.next = after;
            self.files[slot as usize] = Some(file);
            self.file_mut(self.head_file).next = slot;
            self.file_mut(after).prev = slot;
        } else {
            self.files[slot as usize] = Some(file);
        }
        self.file_count += 1;

        tracing::debug!(
            target: "marmot::files",
            file = %identity,
            "created data file"
        );
        Ok(slot)
    }

    /// Retires the head file and splices in a fresh one.
    fn start_new_head_file(&mut self, arena: &mut EntityArena) -> Result<()> {
        let old = self.head_file;
        self.file_mut(old).retired = true;
        tracing::debug!(
            target: "marmot::files",
            file = %self.file(old).identity(),
            total_length = self.file(old).total_length(),
            "retired data file"
        );
        self.head_file = self.create_file(arena)?;
        Ok(())
    }

    fn ensure_head_capacity(&mut self, arena: &mut EntityArena) -> Result<()> {
        if self
            .evaluator
            .needs_retirement(self.file(self.head_file).total_length())
        {
            self.start_new_head_file(arena)?;
        }
        Ok(())
    }

    fn link_entry(arena: &mut EntityArena, tail: Slot, entity: Slot, file_slot: Slot) {
        // the entry goes right before the tail sentinel, keeping file order
        let last = arena[tail].file_prev;
        arena[entity].file_prev = last;
        arena[entity].file_next = tail;
        arena[last].file_next = entity;
        arena[tail].file_prev = entity;
        arena[entity].set_file_slot(file_slot);
    }

    /// Appends an entity's serialized bytes to the head file, updating the
    /// entity's storage information and file chain membership.
    pub(crate) fn append(
        &mut self,
        arena: &mut EntityArena,
        entity: Slot,
        bytes: &[u8],
    ) -> Result<()> {
        self.ensure_head_capacity(arena)?;

        let head_slot = self.head_file;
        let identity = self.file(head_slot).identity();
        let position = self
            .io
            .write(identity, bytes)
            .map_err(Self::io_error(identity))?;

        let length = bytes.len() as u64;
        let file = self.file_mut(head_slot);
        file.total_length += length;
        file.data_length += length;
        let tail = file.tail;

        arena[entity].update_storage_information(bytes.len() as u32, position);
        Self::link_entry(arena, tail, entity, head_slot);
        Ok(())
    }

    /// Unchains an entity from its file, turning its bytes into a gap.
    /// Used both by entity updates (superseded version) and by the sweep.
    pub(crate) fn remove_entity(&mut self, arena: &mut EntityArena, entity: Slot) {
        let file_slot = arena[entity].file_slot();
        let prev = arena[entity].file_prev;
        let next = arena[entity].file_next;
        arena[prev].file_next = next;
        arena[next].file_prev = prev;
        arena[entity].file_prev = NO_SLOT;
        arena[entity].file_next = NO_SLOT;

        let length = arena[entity].data_length();
        self.file_mut(file_slot).data_length -= length;
    }

    /// Reads an entity's serialized bytes from its file.
    pub(crate) fn load_entity_data(
        &self,
        arena: &EntityArena,
        entity: Slot,
    ) -> Result<Box<[u8]>> {
        let file = self.file(arena[entity].file_slot());
        let identity = file.identity();
        let bytes = self
            .io
            .read(
                identity,
                arena[entity].storage_position(),
                arena[entity].data_length(),
            )
            .map_err(Self::io_error(identity))?;
        Ok(bytes.into_boxed_slice())
    }

    /// The first proper entity in file order, scanning the ring from the
    /// head file. `None` if all files are empty.
    pub(crate) fn first_entity(&self, arena: &EntityArena) -> Option<Slot> {
        let start = self.head_file;
        let mut current = start;
        loop {
            let file = self.file(current);
            let first = arena[file.head].file_next;
            if first != file.tail {
                return Some(first);
            }
            current = file.next;
            if current == start {
                return None;
            }
        }
    }

    /// Registers an outstanding reader of the file numbered `number`.
    pub(crate) fn register_usage(&self, number: u64) -> Option<FileUsage> {
        let start = self.head_file;
        let mut current = start;
        loop {
            let file = self.file(current);
            if file.identity().number == number {
                return Some(FileUsage::new(Arc::clone(&file.users)));
            }
            current = file.next;
            if current == start {
                return None;
            }
        }
    }

    /// Resets the housekeeping cursor so the next file check starts over.
    /// Called after every sweep: gaps may have opened anywhere.
    pub(crate) fn restart_file_cleanup_cursor(&mut self) {
        self.cleanup_cursor = None;
    }

    /// The ring successor of `file_slot`.
    pub(crate) fn ring_next(&self, file_slot: Slot) -> Slot {
        self.file(file_slot).next
    }

    /// The head sentinel entity of `file_slot`.
    pub(crate) fn head_sentinel(&self, file_slot: Slot) -> Slot {
        self.file(file_slot).head
    }

    /// The tail sentinel entity of `file_slot`.
    pub(crate) fn tail_sentinel(&self, file_slot: Slot) -> Slot {
        self.file(file_slot).tail
    }

    pub(crate) fn file_count(&self) -> usize {
        self.file_count
    }

    pub(crate) fn head_file_identity(&self) -> FileIdentity {
        self.file(self.head_file).identity()
    }

    pub(crate) fn file_summaries(&self) -> Vec<FileSummary> {
        let start = self.head_file;
        let mut summaries = Vec::with_capacity(self.file_count);
        let mut current = start;
        loop {
            let file = self.file(current);
            summaries.push(FileSummary {
                identity: file.identity(),
                total_length: file.total_length(),
                data_length: file.data_length(),
                is_head: current == self.head_file,
                retired: file.retired,
            });
            current = file.next;
            if current == start {
                return summaries;
            }
        }
    }

    /// Budgeted housekeeping pass over the file ring: deletes gap-only
    /// files, dissolves degraded files by migrating their live entities
    /// into the head, and retries deferred deletions. Returns `true` when
    /// the full ring was checked, `false` when the deadline struck first.
    pub(crate) fn incremental_file_check(
        &mut self,
        arena: &mut EntityArena,
        deadline: Instant,
    ) -> Result<bool> {
        if self.file_count == 0 {
            return Ok(true);
        }

        // snapshot the ring; files created during this pass (new heads)
        // start clean and need no check
        let mut snapshot = Vec::with_capacity(self.file_count);
        let start = match self.cleanup_cursor.take() {
            Some(slot) if self.files[slot as usize].is_some() => slot,
            _ => self.head_file,
        };
        let mut current = start;
        loop {
            snapshot.push((current, self.file(current).identity().number));
            current = self.file(current).next;
            if current == start {
                break;
            }
        }

        for (index, (slot, number)) in snapshot.iter().copied().enumerate() {
            if Instant::now() >= deadline {
                self.cleanup_cursor = Some(slot);
                return Ok(false);
            }
            // skip slots deleted or reused since the snapshot
            match &self.files[slot as usize] {
                Some(file) if file.identity().number == number => {}
                _ => continue,
            }
            if !self.check_file(arena, slot, deadline)? {
                // remember the rest for the next pass
                self.cleanup_cursor = snapshot.get(index).map(|(slot, _)| *slot);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Checks one file; returns `false` on deadline.
    fn check_file(&mut self, arena: &mut EntityArena, slot: Slot, deadline: Instant) -> Result<bool> {
        if self.file(slot).pending_delete {
            self.delete_file_or_defer(arena, slot)?;
            return Ok(true);
        }

        let is_head = slot == self.head_file;
        if !self.file(slot).has_content() {
            // gap-only or never-written file; the head stays
            if !is_head {
                self.delete_file_or_defer(arena, slot)?;
            }
            return Ok(true);
        }

        if !self
            .evaluator
            .needs_dissolving(self.file(slot), arena, is_head)
        {
            return Ok(true);
        }

        if is_head {
            // dissolving the head: retire it first so migration has a target
            self.start_new_head_file(arena)?;
        }

        tracing::debug!(
            target: "marmot::files",
            file = %self.file(slot).identity(),
            data_length = self.file(slot).data_length(),
            total_length = self.file(slot).total_length(),
            "dissolving data file"
        );

        loop {
            let first = arena[self.file(slot).head].file_next;
            if first == self.file(slot).tail {
                break;
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            self.migrate_entity(arena, slot, first)?;
        }
        self.delete_file_or_defer(arena, slot)?;
        Ok(true)
    }

    /// Copies one live entity forward into the head file.
    fn migrate_entity(
        &mut self,
        arena: &mut EntityArena,
        source_slot: Slot,
        entity: Slot,
    ) -> Result<()> {
        self.ensure_head_capacity(arena)?;
        let target_slot = self.head_file;
        debug_assert_ne!(source_slot, target_slot);

        let source_identity = self.file(source_slot).identity();
        let target_identity = self.file(target_slot).identity();
        let length = arena[entity].data_length();
        let position = self
            .io
            .copy(
                source_identity,
                arena[entity].storage_position(),
                length,
                target_identity,
            )
            .map_err(Self::io_error(target_identity))?;

        self.remove_entity(arena, entity);

        let target = self.file_mut(target_slot);
        target.total_length += length;
        target.data_length += length;
        let tail = target.tail;
        arena[entity].update_storage_information(length as u32, position);
        Self::link_entry(arena, tail, entity, target_slot);
        Ok(())
    }

    /// Deletes an empty file, or defers the deletion while readers hold it.
    fn delete_file_or_defer(&mut self, arena: &mut EntityArena, slot: Slot) -> Result<()> {
        debug_assert!(!self.file(slot).has_content());
        debug_assert_ne!(slot, self.head_file);

        if *self.file(slot).users.lock() > 0 {
            self.file_mut(slot).pending_delete = true;
            tracing::debug!(
                target: "marmot::files",
                file = %self.file(slot).identity(),
                "file deletion deferred, readers still registered"
            );
            return Ok(());
        }

        let file = self.files[slot as usize].take().expect("file exists");
        self.file_mut(file.prev).next = file.next;
        self.file_mut(file.next).prev = file.prev;
        arena.release(file.head);
        arena.release(file.tail);
        self.io
            .delete(file.identity)
            .map_err(Self::io_error(file.identity))?;
        self.free.push(slot);
        self.file_count -= 1;

        tracing::debug!(
            target: "marmot::files",
            file = %file.identity,
            "deleted data file"
        );
        Ok(())
    }
}
