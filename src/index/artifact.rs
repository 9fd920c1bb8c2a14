//! The persisted index artifact: everything a serving process needs.
//!
//! An artifact is a directory:
//!
//! ```text
//! manifest.json    dimension, metric, counts, format version
//! centroids.bin    P * D floats (coarse partition representatives)
//! codebooks.bin    M * 256 * (D/M) floats (quantizer codebooks)
//! codes.bin        count * M bytes (per-item quantization codes, slot order)
//! partitions.bin   per-partition member slot lists
//! ids.bin          slot -> item-id map
//! vectors.bin      full-precision embeddings (store format, mmap-loaded)
//! ```
//!
//! Loading validates every structural invariant before any server becomes
//! ready; a violation is a [`ArtifactError::Corrupt`] with the reason, never
//! a partially initialized index.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{StoreError, VectorStore};
use crate::vector::{CODEBOOK_SIZE, ItemId, Metric, ProductQuantizer, Slot, VectorDimension};

/// Artifact format version; bumped on any layout change.
pub const ARTIFACT_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest.json";
const CENTROIDS_FILE: &str = "centroids.bin";
const CODEBOOKS_FILE: &str = "codebooks.bin";
const CODES_FILE: &str = "codes.bin";
const PARTITIONS_FILE: &str = "partitions.bin";
const IDS_FILE: &str = "ids.bin";
const VECTORS_FILE: &str = "vectors.bin";

const CENTROIDS_MAGIC: &[u8; 4] = b"PXCN";
const CODEBOOKS_MAGIC: &[u8; 4] = b"PXCB";
const CODES_MAGIC: &[u8; 4] = b"PXPQ";
const PARTITIONS_MAGIC: &[u8; 4] = b"PXPT";
const IDS_MAGIC: &[u8; 4] = b"PXID";

/// Errors raised while persisting or loading an artifact.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Index artifact not found at '{path}'\nSuggestion: Run the build command first, or point --artifact at an existing index directory")]
    NotFound { path: String },

    #[error("Corrupt index artifact: {reason}\nSuggestion: Rebuild the index; a server must not start against a partially valid artifact")]
    Corrupt { reason: String },

    #[error("IO failure on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl ArtifactError {
    fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Build parameters and counts, serialized as `manifest.json`.
///
/// The loader cross-checks every binary section against these numbers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    /// Artifact format version.
    pub version: u32,
    /// Embedding dimension D.
    pub dimension: VectorDimension,
    /// Distance metric the index was built for.
    pub metric: Metric,
    /// Total item count.
    pub item_count: usize,
    /// Number of partitions P (after empty-partition dropping).
    pub partition_count: usize,
    /// Sub-vector count M.
    pub num_subspaces: usize,
    /// Codebook entries per subspace.
    pub codebook_size: usize,
}

/// A fully validated, immutable index: centroids, quantizer, codes, id map,
/// partition membership, and the full-precision store for re-ranking.
#[derive(Debug)]
pub struct IndexArtifact {
    manifest: Manifest,
    /// Flat centroid buffer, `P * D` floats.
    centroids: Vec<f32>,
    quantizer: ProductQuantizer,
    /// Per-item codes, `count * M` bytes in slot order.
    codes: Vec<u8>,
    /// Slot -> item id.
    id_map: Vec<ItemId>,
    /// Item id -> slot (rebuilt, never serialized).
    slot_map: HashMap<ItemId, Slot>,
    /// Per-partition member slots.
    partitions: Vec<Vec<Slot>>,
    store: VectorStore,
}

impl IndexArtifact {
    /// Assembles an artifact from its parts, enforcing every invariant.
    ///
    /// Used by the builder for fresh output and by [`IndexArtifact::load`]
    /// for deserialized sections; both paths get identical validation.
    pub fn new(
        manifest: Manifest,
        centroids: Vec<f32>,
        quantizer: ProductQuantizer,
        codes: Vec<u8>,
        id_map: Vec<ItemId>,
        partitions: Vec<Vec<Slot>>,
        store: VectorStore,
    ) -> Result<Self, ArtifactError> {
        let d = manifest.dimension.get();
        let p = manifest.partition_count;
        let m = manifest.num_subspaces;
        let count = manifest.item_count;

        if manifest.version != ARTIFACT_VERSION {
            return Err(ArtifactError::corrupt(format!(
                "unsupported artifact version {} (expected {ARTIFACT_VERSION})",
                manifest.version
            )));
        }
        if manifest.codebook_size != CODEBOOK_SIZE {
            return Err(ArtifactError::corrupt(format!(
                "manifest codebook size {} does not match supported size {CODEBOOK_SIZE}",
                manifest.codebook_size
            )));
        }
        if centroids.len() != p * d {
            return Err(ArtifactError::corrupt(format!(
                "centroid buffer holds {} floats, expected {p} partitions x {d} dims",
                centroids.len()
            )));
        }
        if quantizer.dimension() != manifest.dimension || quantizer.num_subspaces() != m {
            return Err(ArtifactError::corrupt(
                "quantizer shape does not match manifest dimension/sub-vector count",
            ));
        }
        if codes.len() != count * m {
            return Err(ArtifactError::corrupt(format!(
                "code buffer holds {} bytes, expected {count} items x {m} sub-vectors",
                codes.len()
            )));
        }
        if id_map.len() != count {
            return Err(ArtifactError::corrupt(format!(
                "id map holds {} entries, expected {count}",
                id_map.len()
            )));
        }
        if store.len() != count || store.dimension() != manifest.dimension {
            return Err(ArtifactError::corrupt(format!(
                "vector store shape {}x{} does not match manifest {count}x{d}",
                store.len(),
                store.dimension().get()
            )));
        }

        // Id map must be a bijection onto slots.
        let mut slot_map = HashMap::with_capacity(count);
        for (slot, id) in id_map.iter().enumerate() {
            if slot_map.insert(id.clone(), Slot::new(slot as u32)).is_some() {
                return Err(ArtifactError::corrupt(format!(
                    "duplicate item id '{id}' in id map"
                )));
            }
        }

        // Partitions must partition the slot set: no overlap, no omission.
        if partitions.len() != p {
            return Err(ArtifactError::corrupt(format!(
                "found {} partition lists, manifest says {p}",
                partitions.len()
            )));
        }
        let mut seen = vec![false; count];
        for (pi, members) in partitions.iter().enumerate() {
            if members.is_empty() {
                return Err(ArtifactError::corrupt(format!(
                    "partition {pi} is empty; empty partitions must be dropped at build time"
                )));
            }
            for slot in members {
                let idx = slot.index();
                if idx >= count {
                    return Err(ArtifactError::corrupt(format!(
                        "partition {pi} references slot {slot} beyond item count {count}"
                    )));
                }
                if seen[idx] {
                    return Err(ArtifactError::corrupt(format!(
                        "slot {slot} appears in more than one partition"
                    )));
                }
                seen[idx] = true;
            }
        }
        if let Some(missing) = seen.iter().position(|&s| !s) {
            return Err(ArtifactError::corrupt(format!(
                "slot {missing} belongs to no partition"
            )));
        }

        Ok(Self {
            manifest,
            centroids,
            quantizer,
            codes,
            id_map,
            slot_map,
            partitions,
            store,
        })
    }

    /// Persists the artifact into `dir`, creating it if needed.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<(), ArtifactError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| ArtifactError::io(dir, e))?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest_file =
            File::create(&manifest_path).map_err(|e| ArtifactError::io(&manifest_path, e))?;
        serde_json::to_writer_pretty(BufWriter::new(manifest_file), &self.manifest)
            .map_err(|e| ArtifactError::corrupt(format!("manifest serialization failed: {e}")))?;

        write_f32_section(&dir.join(CENTROIDS_FILE), CENTROIDS_MAGIC, &self.centroids)?;
        write_f32_section(
            &dir.join(CODEBOOKS_FILE),
            CODEBOOKS_MAGIC,
            self.quantizer.codebook(),
        )?;
        write_u8_section(&dir.join(CODES_FILE), CODES_MAGIC, &self.codes)?;
        self.write_partitions(&dir.join(PARTITIONS_FILE))?;
        self.write_ids(&dir.join(IDS_FILE))?;

        let vectors_path = dir.join(VECTORS_FILE);
        let flat = self.flat_vectors();
        VectorStore::write(&vectors_path, self.manifest.dimension, &flat)
            .map_err(|e| store_to_artifact_error(&vectors_path, e))?;

        tracing::info!(
            dir = %dir.display(),
            items = self.manifest.item_count,
            partitions = self.manifest.partition_count,
            "saved index artifact"
        );
        Ok(())
    }

    /// Loads and validates an artifact from `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let dir = dir.as_ref();
        let manifest_path = dir.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Err(ArtifactError::NotFound {
                path: dir.display().to_string(),
            });
        }

        let manifest_file =
            File::open(&manifest_path).map_err(|e| ArtifactError::io(&manifest_path, e))?;
        let manifest: Manifest = serde_json::from_reader(BufReader::new(manifest_file))
            .map_err(|e| ArtifactError::corrupt(format!("manifest parse failed: {e}")))?;

        let centroids = read_f32_section(&dir.join(CENTROIDS_FILE), CENTROIDS_MAGIC)?;
        let codebook = read_f32_section(&dir.join(CODEBOOKS_FILE), CODEBOOKS_MAGIC)?;
        let codes = read_u8_section(&dir.join(CODES_FILE), CODES_MAGIC)?;
        let partitions = read_partitions(&dir.join(PARTITIONS_FILE))?;
        let id_map = read_ids(&dir.join(IDS_FILE))?;

        let quantizer =
            ProductQuantizer::from_codebook(manifest.dimension, manifest.num_subspaces, codebook)
                .map_err(|e| ArtifactError::corrupt(format!("codebook invalid: {e}")))?;

        let vectors_path = dir.join(VECTORS_FILE);
        let store =
            VectorStore::open(&vectors_path).map_err(|e| store_to_artifact_error(&vectors_path, e))?;

        let artifact = Self::new(
            manifest, centroids, quantizer, codes, id_map, partitions, store,
        )?;
        tracing::info!(
            dir = %dir.display(),
            items = artifact.manifest.item_count,
            partitions = artifact.manifest.partition_count,
            metric = %artifact.manifest.metric,
            "loaded index artifact"
        );
        Ok(artifact)
    }

    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    #[must_use]
    pub fn metric(&self) -> Metric {
        self.manifest.metric
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.manifest.dimension
    }

    /// Total number of indexed items.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.manifest.item_count
    }

    /// Number of partitions.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.manifest.partition_count
    }

    /// Centroid of partition `p`.
    #[must_use]
    pub fn centroid(&self, p: usize) -> &[f32] {
        let d = self.manifest.dimension.get();
        &self.centroids[p * d..(p + 1) * d]
    }

    /// Member slots of partition `p`.
    #[must_use]
    pub fn partition_members(&self, p: usize) -> &[Slot] {
        &self.partitions[p]
    }

    /// Quantization code of the item at `slot`.
    #[must_use]
    pub fn code(&self, slot: Slot) -> &[u8] {
        let m = self.manifest.num_subspaces;
        &self.codes[slot.index() * m..(slot.index() + 1) * m]
    }

    /// Item id at `slot`.
    #[must_use]
    pub fn item_id(&self, slot: Slot) -> &ItemId {
        &self.id_map[slot.index()]
    }

    /// Slot of `id`, if indexed.
    #[must_use]
    pub fn slot_of(&self, id: &ItemId) -> Option<Slot> {
        self.slot_map.get(id).copied()
    }

    #[must_use]
    pub fn quantizer(&self) -> &ProductQuantizer {
        &self.quantizer
    }

    /// Full-precision store used by the re-ranking stage.
    #[must_use]
    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    fn flat_vectors(&self) -> Vec<f32> {
        let d = self.manifest.dimension.get();
        let mut flat = Vec::with_capacity(self.manifest.item_count * d);
        for slot in 0..self.manifest.item_count {
            flat.extend_from_slice(self.store.vector(Slot::new(slot as u32)));
        }
        flat
    }

    fn write_partitions(&self, path: &Path) -> Result<(), ArtifactError> {
        let file = File::create(path).map_err(|e| ArtifactError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        let io_err = |e| ArtifactError::io(path, e);
        writer.write_all(PARTITIONS_MAGIC).map_err(io_err)?;
        writer
            .write_all(&ARTIFACT_VERSION.to_le_bytes())
            .map_err(io_err)?;
        writer
            .write_all(&(self.partitions.len() as u32).to_le_bytes())
            .map_err(io_err)?;
        for members in &self.partitions {
            writer
                .write_all(&(members.len() as u32).to_le_bytes())
                .map_err(io_err)?;
            for slot in members {
                writer.write_all(&slot.to_bytes()).map_err(io_err)?;
            }
        }
        writer.flush().map_err(io_err)
    }

    fn write_ids(&self, path: &Path) -> Result<(), ArtifactError> {
        let file = File::create(path).map_err(|e| ArtifactError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        let io_err = |e| ArtifactError::io(path, e);
        writer.write_all(IDS_MAGIC).map_err(io_err)?;
        writer
            .write_all(&ARTIFACT_VERSION.to_le_bytes())
            .map_err(io_err)?;
        writer
            .write_all(&(self.id_map.len() as u32).to_le_bytes())
            .map_err(io_err)?;
        for id in &self.id_map {
            let bytes = id.as_str().as_bytes();
            writer
                .write_all(&(bytes.len() as u32).to_le_bytes())
                .map_err(io_err)?;
            writer.write_all(bytes).map_err(io_err)?;
        }
        writer.flush().map_err(io_err)
    }
}

fn store_to_artifact_error(path: &Path, err: StoreError) -> ArtifactError {
    match err {
        StoreError::Io(e) if e.kind() == io::ErrorKind::NotFound => ArtifactError::NotFound {
            path: path.display().to_string(),
        },
        StoreError::Io(e) => ArtifactError::io(path, e),
        StoreError::InvalidFormat(reason) => ArtifactError::corrupt(reason),
        StoreError::Vector(e) => ArtifactError::corrupt(e.to_string()),
    }
}

fn write_section_header(
    writer: &mut impl Write,
    magic: &[u8; 4],
    len: usize,
) -> Result<(), io::Error> {
    writer.write_all(magic)?;
    writer.write_all(&ARTIFACT_VERSION.to_le_bytes())?;
    writer.write_all(&(len as u32).to_le_bytes())?;
    Ok(())
}

fn read_section_header(
    reader: &mut impl Read,
    magic: &[u8; 4],
    path: &Path,
) -> Result<usize, ArtifactError> {
    let mut header = [0u8; 12];
    reader
        .read_exact(&mut header)
        .map_err(|e| ArtifactError::io(path, e))?;
    if &header[0..4] != magic {
        return Err(ArtifactError::corrupt(format!(
            "bad magic bytes in '{}'",
            path.display()
        )));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != ARTIFACT_VERSION {
        return Err(ArtifactError::corrupt(format!(
            "unsupported section version {version} in '{}'",
            path.display()
        )));
    }
    Ok(u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize)
}

fn write_f32_section(path: &Path, magic: &[u8; 4], data: &[f32]) -> Result<(), ArtifactError> {
    let file = File::create(path).map_err(|e| ArtifactError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    let result: Result<(), io::Error> = (|| {
        write_section_header(&mut writer, magic, data.len())?;
        for &value in data {
            writer.write_all(&value.to_le_bytes())?;
        }
        writer.flush()
    })();
    result.map_err(|e| ArtifactError::io(path, e))
}

fn read_f32_section(path: &Path, magic: &[u8; 4]) -> Result<Vec<f32>, ArtifactError> {
    let file = File::open(path).map_err(|e| ArtifactError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let len = read_section_header(&mut reader, magic, path)?;
    let mut bytes = vec![0u8; len * size_of::<f32>()];
    reader
        .read_exact(&mut bytes)
        .map_err(|_| ArtifactError::corrupt(format!("truncated section '{}'", path.display())))?;
    ensure_at_end(&mut reader, path)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn write_u8_section(path: &Path, magic: &[u8; 4], data: &[u8]) -> Result<(), ArtifactError> {
    let file = File::create(path).map_err(|e| ArtifactError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    let result: Result<(), io::Error> = (|| {
        write_section_header(&mut writer, magic, data.len())?;
        writer.write_all(data)?;
        writer.flush()
    })();
    result.map_err(|e| ArtifactError::io(path, e))
}

fn read_u8_section(path: &Path, magic: &[u8; 4]) -> Result<Vec<u8>, ArtifactError> {
    let file = File::open(path).map_err(|e| ArtifactError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let len = read_section_header(&mut reader, magic, path)?;
    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .map_err(|_| ArtifactError::corrupt(format!("truncated section '{}'", path.display())))?;
    ensure_at_end(&mut reader, path)?;
    Ok(data)
}

fn read_partitions(path: &Path) -> Result<Vec<Vec<Slot>>, ArtifactError> {
    let file = File::open(path).map_err(|e| ArtifactError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let count = read_section_header(&mut reader, PARTITIONS_MAGIC, path)?;
    let truncated = || ArtifactError::corrupt(format!("truncated section '{}'", path.display()));

    let mut partitions = Vec::with_capacity(count);
    for _ in 0..count {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes).map_err(|_| truncated())?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut members = Vec::with_capacity(len);
        for _ in 0..len {
            let mut slot_bytes = [0u8; 4];
            reader.read_exact(&mut slot_bytes).map_err(|_| truncated())?;
            members.push(Slot::from_bytes(slot_bytes));
        }
        partitions.push(members);
    }
    ensure_at_end(&mut reader, path)?;
    Ok(partitions)
}

fn read_ids(path: &Path) -> Result<Vec<ItemId>, ArtifactError> {
    let file = File::open(path).map_err(|e| ArtifactError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let count = read_section_header(&mut reader, IDS_MAGIC, path)?;
    let truncated = || ArtifactError::corrupt(format!("truncated section '{}'", path.display()));

    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes).map_err(|_| truncated())?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes).map_err(|_| truncated())?;
        let token = String::from_utf8(bytes).map_err(|_| {
            ArtifactError::corrupt(format!("non-utf8 item id in '{}'", path.display()))
        })?;
        ids.push(ItemId::from(token));
    }
    ensure_at_end(&mut reader, path)?;
    Ok(ids)
}

fn ensure_at_end(reader: &mut impl Read, path: &Path) -> Result<(), ArtifactError> {
    let mut probe = [0u8; 1];
    match reader.read(&mut probe) {
        Ok(0) => Ok(()),
        Ok(_) => Err(ArtifactError::corrupt(format!(
            "trailing bytes after section '{}'",
            path.display()
        ))),
        Err(e) => Err(ArtifactError::io(path, e)),
    }
}
