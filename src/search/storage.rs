//! Binary storage for the vector index.
//!
//! File format: vectors.bin
//!
//! Header (55 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - next_id: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated):
//! - id: u64 (little-endian)
//! - embedding: [f32; dimensions] (little-endian)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::search::index::{FlatIndex, VectorIndex};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + next_id(8) + checksum(4)
const HEADER_SIZE: usize = 55;

/// Offset of the checksum field
const CHECKSUM_OFFSET: usize = HEADER_SIZE - 4;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Storage manager for vector embeddings.
#[derive(Debug, Clone)]
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the vector index from storage.
    ///
    /// Fails if the file was written for another model or dimension, or if
    /// any entry is malformed.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<FlatIndex, VectorStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = self.read_header(&mut reader)?;
        self.validate_header(&header, expected_model_id, expected_dimensions)?;

        let dimensions = header.dimensions as usize;
        let mut entries = Vec::with_capacity(header.entry_count.min(1 << 20) as usize);
        for _ in 0..header.entry_count {
            entries.push(self.read_entry(&mut reader, dimensions)?);
        }

        let mut trailing = [0u8; 1];
        if reader.read(&mut trailing)? != 0 {
            return Err(VectorStorageError::InvalidFormat(
                "trailing bytes after last entry".to_string(),
            ));
        }

        let count = entries.len();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries.dedup_by_key(|(id, _)| *id);
        if entries.len() != count {
            return Err(VectorStorageError::InvalidFormat("duplicate entry id".to_string()));
        }

        FlatIndex::from_parts(dimensions, header.next_id, entries)
            .map_err(|e| VectorStorageError::InvalidFormat(e.to_string()))
    }

    /// Save the vector index to storage.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, index: &FlatIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let temp_path = self.path.with_extension("tmp");

        let result = self.write_to_file(&temp_path, index, model_id);

        if result.is_err() {
            // Clean up temp file on error
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    fn write_to_file(
        &self,
        path: &Path,
        index: &FlatIndex,
        model_id: &[u8; 32],
    ) -> Result<(), VectorStorageError> {
        let dimensions = u16::try_from(index.dimensions()).map_err(|_| {
            VectorStorageError::InvalidFormat("dimensions do not fit in u16".to_string())
        })?;

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions,
            entry_count: index.len() as u64,
            next_id: index.next_id(),
        };
        self.write_header(&mut writer, &header)?;

        for (id, embedding) in index.iter() {
            self.write_entry(&mut writer, id, embedding)?;
        }

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(())
    }

    fn read_header(&self, reader: &mut impl Read) -> Result<Header, VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                VectorStorageError::InvalidFormat("file shorter than header".to_string())
            }
            _ => e.into(),
        })?;

        let version = header_bytes[0];

        // Version check first
        if version > FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes(le_array(&header_bytes[CHECKSUM_OFFSET..]));
        let computed_checksum = Self::compute_checksum(&header_bytes[..CHECKSUM_OFFSET]);
        if stored_checksum != computed_checksum {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[1..33]);

        Ok(Header {
            version,
            model_id,
            dimensions: u16::from_le_bytes(le_array(&header_bytes[33..35])),
            entry_count: u64::from_le_bytes(le_array(&header_bytes[35..43])),
            next_id: u64::from_le_bytes(le_array(&header_bytes[43..51])),
        })
    }

    fn validate_header(
        &self,
        header: &Header,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<(), VectorStorageError> {
        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }

        if header.dimensions as usize != expected_dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        Ok(())
    }

    fn write_header(&self, writer: &mut impl Write, header: &Header) -> Result<(), VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0] = header.version;
        header_bytes[1..33].copy_from_slice(&header.model_id);
        header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
        header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());
        header_bytes[43..51].copy_from_slice(&header.next_id.to_le_bytes());

        let checksum = Self::compute_checksum(&header_bytes[..CHECKSUM_OFFSET]);
        header_bytes[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());

        writer.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_entry(
        &self,
        reader: &mut impl Read,
        dimensions: usize,
    ) -> Result<(u64, Vec<f32>), VectorStorageError> {
        let mut id_bytes = [0u8; 8];
        reader.read_exact(&mut id_bytes)?;
        let id = u64::from_le_bytes(id_bytes);

        let mut embedding = Vec::with_capacity(dimensions);
        for _ in 0..dimensions {
            let mut float_bytes = [0u8; 4];
            reader.read_exact(&mut float_bytes)?;
            embedding.push(f32::from_le_bytes(float_bytes));
        }

        Ok((id, embedding))
    }

    fn write_entry(
        &self,
        writer: &mut impl Write,
        id: u64,
        embedding: &[f32],
    ) -> Result<(), VectorStorageError> {
        writer.write_all(&id.to_le_bytes())?;

        for &value in embedding {
            writer.write_all(&value.to_le_bytes())?;
        }

        Ok(())
    }

    /// Compute CRC32 checksum of data.
    fn compute_checksum(data: &[u8]) -> u32 {
        crc32fast::hash(data)
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
    next_id: u64,
}
