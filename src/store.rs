//! Immutable full-precision vector storage.
//!
//! Stores the exact embeddings the re-ranking stage needs, either in memory
//! (fresh from a build) or memory-mapped from an artifact file. The store is
//! read-only for the lifetime of a serving process; a rebuild produces a new
//! file that is loaded as part of a new artifact.
//!
//! # File format
//!
//! Little-endian binary, optimized for mmap:
//! - Header (16 bytes): magic `PXVE`, version u32, dimension u32, count u32
//! - Data: `count * dimension` f32 values, slot order
//!
//! Vector access out of the mapped region is a pointer cast, no copy; the
//! OS page cache does the rest.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use memmap2::{Mmap, MmapOptions};
use thiserror::Error;

use crate::vector::{Slot, VectorDimension, VectorError};

/// Current storage format version.
const STORAGE_VERSION: u32 = 1;

/// Size of the storage header in bytes.
const HEADER_SIZE: usize = 16;

/// Magic bytes identifying vector store files.
const MAGIC_BYTES: &[u8; 4] = b"PXVE";

/// Errors specific to vector store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid storage format: {0}")]
    InvalidFormat(String),

    #[error("Vector error: {0}")]
    Vector(#[from] VectorError),
}

enum Backing {
    InMemory(Vec<f32>),
    Mapped(Mmap),
}

impl std::fmt::Debug for Backing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backing::InMemory(data) => write!(f, "InMemory({} floats)", data.len()),
            Backing::Mapped(mmap) => write!(f, "Mapped({} bytes)", mmap.len()),
        }
    }
}

/// Immutable collection of full-precision embeddings, addressed by [`Slot`].
#[derive(Debug)]
pub struct VectorStore {
    backing: Backing,
    dimension: VectorDimension,
    count: usize,
}

impl VectorStore {
    /// Wraps a flat slot-ordered buffer produced by the builder.
    pub fn from_flat(dimension: VectorDimension, data: Vec<f32>) -> Result<Self, StoreError> {
        if data.len() % dimension.get() != 0 {
            return Err(StoreError::InvalidFormat(format!(
                "buffer of {} floats is not a multiple of dimension {}",
                data.len(),
                dimension.get()
            )));
        }
        let count = data.len() / dimension.get();
        Ok(Self {
            backing: Backing::InMemory(data),
            dimension,
            count,
        })
    }

    /// Memory-maps an existing store file, validating its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("vector store file not found: {}", path.display()),
            )));
        }

        let file = File::open(path)?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let (dimension, count) = Self::read_header(&mmap)?;

        let expected = HEADER_SIZE + count * dimension.get() * size_of::<f32>();
        if mmap.len() != expected {
            return Err(StoreError::InvalidFormat(format!(
                "file length {} does not match header (expected {expected})",
                mmap.len()
            )));
        }
        // Data is cast in place; the header is 4-byte aligned and mmap
        // regions are page aligned, so this holds by construction.
        if (mmap.as_ptr() as usize + HEADER_SIZE) % align_of::<f32>() != 0 {
            return Err(StoreError::InvalidFormat(
                "mapped region is not aligned for f32 access".to_string(),
            ));
        }

        Ok(Self {
            backing: Backing::Mapped(mmap),
            dimension,
            count,
        })
    }

    /// Writes a slot-ordered flat buffer to `path` in the store format.
    pub fn write(
        path: impl AsRef<Path>,
        dimension: VectorDimension,
        data: &[f32],
    ) -> Result<(), StoreError> {
        if data.len() % dimension.get() != 0 {
            return Err(StoreError::InvalidFormat(format!(
                "buffer of {} floats is not a multiple of dimension {}",
                data.len(),
                dimension.get()
            )));
        }
        let count = data.len() / dimension.get();

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC_BYTES)?;
        writer.write_all(&STORAGE_VERSION.to_le_bytes())?;
        writer.write_all(&(dimension.get() as u32).to_le_bytes())?;
        writer.write_all(&(count as u32).to_le_bytes())?;
        for &value in data {
            writer.write_all(&value.to_le_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Returns the vector stored at `slot`.
    ///
    /// # Panics
    /// Panics if `slot` is out of range; slots come from the id map and
    /// partition lists, which the artifact loader validates against the count.
    #[must_use]
    pub fn vector(&self, slot: Slot) -> &[f32] {
        assert!(slot.index() < self.count, "slot {slot} out of range");
        let dim = self.dimension.get();
        match &self.backing {
            Backing::InMemory(data) => &data[slot.index() * dim..(slot.index() + 1) * dim],
            Backing::Mapped(mmap) => {
                let offset = HEADER_SIZE + slot.index() * dim * size_of::<f32>();
                // Alignment and bounds were validated at open(); values are
                // little-endian on disk, matching every supported target.
                unsafe {
                    std::slice::from_raw_parts(mmap.as_ptr().add(offset).cast::<f32>(), dim)
                }
            }
        }
    }

    /// Number of stored vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Embedding dimension of every stored vector.
    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    fn read_header(mmap: &Mmap) -> Result<(VectorDimension, usize), StoreError> {
        if mmap.len() < HEADER_SIZE {
            return Err(StoreError::InvalidFormat(
                "file too small to contain header".to_string(),
            ));
        }
        if &mmap[0..4] != MAGIC_BYTES {
            return Err(StoreError::InvalidFormat("invalid magic bytes".to_string()));
        }
        let version = u32::from_le_bytes([mmap[4], mmap[5], mmap[6], mmap[7]]);
        if version != STORAGE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "unsupported storage version {version} (expected {STORAGE_VERSION})"
            )));
        }
        let dim = u32::from_le_bytes([mmap[8], mmap[9], mmap[10], mmap[11]]);
        let dimension = VectorDimension::new(dim as usize)?;
        let count = u32::from_le_bytes([mmap[12], mmap[13], mmap[14], mmap[15]]) as usize;
        Ok((dimension, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_in_memory_access() {
        let dim = VectorDimension::new(3).unwrap();
        let store =
            VectorStore::from_flat(dim, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.vector(Slot::new(0)), &[1.0, 2.0, 3.0]);
        assert_eq!(store.vector(Slot::new(1)), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_write_then_open_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("vectors.bin");
        let dim = VectorDimension::new(4).unwrap();
        let data = vec![
            1.0, 2.0, 3.0, 4.0, //
            5.0, 6.0, 7.0, 8.0, //
            9.0, 10.0, 11.0, 12.0,
        ];

        VectorStore::write(&path, dim, &data).unwrap();
        let store = VectorStore::open(&path).unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(store.dimension(), dim);
        assert_eq!(store.vector(Slot::new(0)), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(store.vector(Slot::new(2)), &[9.0, 10.0, 11.0, 12.0]);
    }

    #[test]
    fn test_open_missing_file() {
        let temp = TempDir::new().unwrap();
        let result = VectorStore::open(temp.path().join("absent.bin"));
        assert!(matches!(result, Err(StoreError::Io(_))));
    }

    #[test]
    fn test_open_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("garbage.bin");
        std::fs::write(&path, b"not a vector store at all").unwrap();
        assert!(matches!(
            VectorStore::open(&path),
            Err(StoreError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_open_rejects_truncated_data() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("truncated.bin");
        let dim = VectorDimension::new(4).unwrap();
        VectorStore::write(&path, dim, &[0.5; 8]).unwrap();

        // Chop off the last vector's tail.
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

        assert!(matches!(
            VectorStore::open(&path),
            Err(StoreError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_flat_buffer_must_match_dimension() {
        let dim = VectorDimension::new(3).unwrap();
        assert!(VectorStore::from_flat(dim, vec![0.0; 7]).is_err());
    }
}
