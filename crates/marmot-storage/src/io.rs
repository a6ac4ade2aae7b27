//! Storage I/O capability.
//!
//! Data files are addressed by a channel-scoped, monotonically numbered
//! identity; the actual write/copy/truncate/delete mechanics live behind
//! [`StorageIo`]. The core never touches a filesystem API directly, which
//! also allows running entirely in memory.

use rustc_hash::FxHashMap;
use std::fmt;

/// Identity of one data file: owning channel plus monotonic file number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    /// Index of the owning channel.
    pub channel_index: usize,
    /// Monotonic per-channel file number.
    pub number: u64,
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel_{}_data_{}", self.channel_index, self.number)
    }
}

/// Abstract data file I/O. One instance per channel; single-writer by
/// construction (only the owning channel thread mutates its files).
pub trait StorageIo: Send {
    /// Creates an empty file.
    fn create(&mut self, identity: FileIdentity) -> std::io::Result<()>;

    /// Appends `bytes`, returning the position they were written at.
    fn write(&mut self, identity: FileIdentity, bytes: &[u8]) -> std::io::Result<u64>;

    /// Reads `length` bytes starting at `position`.
    fn read(&self, identity: FileIdentity, position: u64, length: u64) -> std::io::Result<Vec<u8>>;

    /// Appends a byte range of `source` to `target`, returning the position
    /// within `target`.
    fn copy(
        &mut self,
        source: FileIdentity,
        position: u64,
        length: u64,
        target: FileIdentity,
    ) -> std::io::Result<u64>;

    /// Truncates the file to `new_length` bytes.
    fn truncate(&mut self, identity: FileIdentity, new_length: u64) -> std::io::Result<()>;

    /// Deletes the file.
    fn delete(&mut self, identity: FileIdentity) -> std::io::Result<()>;
}

/// Supplies per-channel monotonic file numbers.
pub trait FileNumberProvider: Send {
    /// The next unused file number for `channel_index`.
    fn next_file_number(&mut self, channel_index: usize) -> u64;
}

/// Default provider counting up from 1.
#[derive(Debug, Default)]
pub struct SequentialFileNumbers {
    next: u64,
}

impl FileNumberProvider for SequentialFileNumbers {
    fn next_file_number(&mut self, _channel_index: usize) -> u64 {
        self.next += 1;
        self.next
    }
}

fn not_found(identity: FileIdentity) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no such data file: {identity}"),
    )
}

/// In-memory [`StorageIo`] implementation.
///
/// Backs tests and embeddings that run without a filesystem.
#[derive(Debug, Default)]
pub struct MemoryStorageIo {
    files: FxHashMap<FileIdentity, Vec<u8>>,
}

impl MemoryStorageIo {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current length of a file, if it exists.
    pub fn file_length(&self, identity: FileIdentity) -> Option<u64> {
        self.files.get(&identity).map(|f| f.len() as u64)
    }

    /// Whether the file exists.
    pub fn contains(&self, identity: FileIdentity) -> bool {
        self.files.contains_key(&identity)
    }

    /// Number of existing files.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

impl StorageIo for MemoryStorageIo {
    fn create(&mut self, identity: FileIdentity) -> std::io::Result<()> {
        if self.files.contains_key(&identity) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("data file already exists: {identity}"),
            ));
        }
        self.files.insert(identity, Vec::new());
        Ok(())
    }

    fn write(&mut self, identity: FileIdentity, bytes: &[u8]) -> std::io::Result<u64> {
        let file = self
            .files
            .get_mut(&identity)
            .ok_or_else(|| not_found(identity))?;
        let position = file.len() as u64;
        file.extend_from_slice(bytes);
        Ok(position)
    }

    fn read(&self, identity: FileIdentity, position: u64, length: u64) -> std::io::Result<Vec<u8>> {
        let file = self.files.get(&identity).ok_or_else(|| not_found(identity))?;
        let start = position as usize;
        let end = start + length as usize;
        if end > file.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "read of [{position}, {end}) exceeds length {} of {identity}",
                    file.len()
                ),
            ));
        }
        Ok(file[start..end].to_vec())
    }

    fn copy(
        &mut self,
        source: FileIdentity,
        position: u64,
        length: u64,
        target: FileIdentity,
    ) -> std::io::Result<u64> {
        let bytes = self.read(source, position, length)?;
        self.write(target, &bytes)
    }

    fn truncate(&mut self, identity: FileIdentity, new_length: u64) -> std::io::Result<()> {
        let file = self.files.get_mut(&identity).ok_or_else(|| not_found(identity))?;
        file.truncate(new_length as usize);
        Ok(())
    }

    fn delete(&mut self, identity: FileIdentity) -> std::io::Result<()> {
        self.files.remove(&identity).ok_or_else(|| not_found(identity))?;
        Ok(())
    }
}
