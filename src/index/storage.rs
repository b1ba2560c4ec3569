//! Persistence for index generations.
//!
//! A generation is stored as a pair of files in the data directory:
//!
//! `index.bin` — vector blob:
//! - version: u8 (1)
//! - space_id: [u8; 32] (SHA256 of the embedding-space name)
//! - dimension: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - built_at: i64 unix seconds (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//! - entries: entry_count * dimension f32 (little-endian), ordinal order
//!
//! `products.json` — ordinal-ordered side table with the normalized
//! products plus the same entry_count/built_at/space for cross-checking.
//!
//! The pair is written to temp files and renamed into place; a load that
//! sees only one half, or halves that disagree, fails rather than
//! serving a torn generation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::catalog::Product;
use crate::embed::space_id_hash;
use crate::index::{FlatIpIndex, IndexGeneration};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size: version(1) + space_id(32) + dimension(2) + entry_count(8)
/// + built_at(8) + checksum(4)
const HEADER_SIZE: usize = 55;

const INDEX_FILE: &str = "index.bin";
const META_FILE: &str = "products.json";

#[derive(Debug, thiserror::Error)]
pub enum GenerationStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    #[error("version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("index was built for a different embedding space")]
    SpaceMismatch,

    #[error("checksum mismatch: index file may be corrupted")]
    ChecksumMismatch,

    #[error("inconsistent generation pair: {0}")]
    Inconsistent(String),

    #[error("side table is malformed: {0}")]
    Meta(#[from] serde_json::Error),
}

/// Ordinal-ordered side table persisted next to the vector blob.
#[derive(Serialize, Deserialize)]
struct GenerationMeta {
    built_at: i64,
    entry_count: u64,
    space: String,
    products: Vec<Product>,
}

#[derive(Debug)]
struct Header {
    version: u8,
    space_id: [u8; 32],
    dimension: u16,
    entry_count: u64,
    built_at: i64,
}

/// Storage manager for one data directory.
pub struct GenerationStorage {
    dir: PathBuf,
}

impl GenerationStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    /// True when both halves of the pair are present.
    pub fn exists(&self) -> bool {
        self.index_path().exists() && self.meta_path().exists()
    }

    /// Persist a generation atomically: both files are written to temp
    /// locations, fsynced, then renamed into place.
    pub fn save(&self, generation: &IndexGeneration) -> Result<(), GenerationStorageError> {
        std::fs::create_dir_all(&self.dir)?;

        let index_tmp = self.index_path().with_extension("bin.tmp");
        let meta_tmp = self.meta_path().with_extension("json.tmp");

        let result = self.write_pair(generation, &index_tmp, &meta_tmp);
        if result.is_err() {
            let _ = std::fs::remove_file(&index_tmp);
            let _ = std::fs::remove_file(&meta_tmp);
            return result;
        }

        std::fs::rename(&index_tmp, self.index_path())?;
        std::fs::rename(&meta_tmp, self.meta_path())?;
        Ok(())
    }

    /// Load the persisted generation, verifying it was built for the
    /// expected embedding space and that both halves agree.
    pub fn load(
        &self,
        expected_space_id: &[u8; 32],
    ) -> Result<IndexGeneration, GenerationStorageError> {
        let index_exists = self.index_path().exists();
        let meta_exists = self.meta_path().exists();
        if index_exists != meta_exists {
            return Err(GenerationStorageError::Inconsistent(format!(
                "found {} without {}",
                if index_exists { INDEX_FILE } else { META_FILE },
                if index_exists { META_FILE } else { INDEX_FILE },
            )));
        }

        let file = File::open(self.index_path())?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let header = read_header(&mut reader)?;

        if header.space_id != *expected_space_id {
            return Err(GenerationStorageError::SpaceMismatch);
        }

        // Cross-check the declared size against the actual file size
        // before allocating, so a bogus entry_count cannot drive a huge
        // allocation.
        let declared_len = header
            .entry_count
            .checked_mul(header.dimension as u64)
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(HEADER_SIZE as u64))
            .ok_or_else(|| {
                GenerationStorageError::InvalidFormat(
                    "declared entry count overflows".to_string(),
                )
            })?;
        if declared_len != file_len {
            return Err(GenerationStorageError::InvalidFormat(format!(
                "index file is {file_len} bytes, header declares {declared_len}"
            )));
        }

        let dimension = header.dimension as usize;
        let count = header.entry_count as usize;
        let mut data = vec![0f32; dimension * count];
        let mut buf = [0u8; 4];
        for slot in data.iter_mut() {
            reader.read_exact(&mut buf)?;
            *slot = f32::from_le_bytes(buf);
        }

        let meta: GenerationMeta =
            serde_json::from_reader(BufReader::new(File::open(self.meta_path())?))?;

        if meta.entry_count != header.entry_count {
            return Err(GenerationStorageError::Inconsistent(format!(
                "side table has {} entries, index has {}",
                meta.entry_count, header.entry_count
            )));
        }
        if meta.built_at != header.built_at {
            return Err(GenerationStorageError::Inconsistent(
                "side table and index are from different builds".to_string(),
            ));
        }
        if meta.products.len() as u64 != meta.entry_count {
            return Err(GenerationStorageError::Inconsistent(format!(
                "side table declares {} entries but lists {} products",
                meta.entry_count,
                meta.products.len()
            )));
        }
        if space_id_hash(&meta.space) != header.space_id {
            return Err(GenerationStorageError::Inconsistent(
                "side table space does not match index space".to_string(),
            ));
        }

        let index = FlatIpIndex::from_raw(dimension, data).ok_or_else(|| {
            GenerationStorageError::InvalidFormat("vector blob has a partial entry".to_string())
        })?;

        let built_at: DateTime<Utc> = DateTime::from_timestamp(header.built_at, 0)
            .ok_or_else(|| {
                GenerationStorageError::InvalidFormat("built_at timestamp out of range".to_string())
            })?;

        Ok(IndexGeneration::from_parts(
            index,
            meta.products,
            meta.space,
            built_at,
        ))
    }

    /// Remove both halves if present.
    pub fn delete(&self) -> Result<(), GenerationStorageError> {
        for path in [self.index_path(), self.meta_path()] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn write_pair(
        &self,
        generation: &IndexGeneration,
        index_tmp: &Path,
        meta_tmp: &Path,
    ) -> Result<(), GenerationStorageError> {
        let built_at = generation.built_at().timestamp();

        // vector blob
        let file = File::create(index_tmp)?;
        let mut writer = BufWriter::new(file);
        write_header(
            &mut writer,
            &Header {
                version: FORMAT_VERSION,
                space_id: space_id_hash(generation.space()),
                dimension: generation.dimension() as u16,
                entry_count: generation.len() as u64,
                built_at,
            },
        )?;
        for value in generation.index().raw_data() {
            writer.write_all(&value.to_le_bytes())?;
        }
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        file.sync_all()?;

        // side table
        let meta = GenerationMeta {
            built_at,
            entry_count: generation.len() as u64,
            space: generation.space().to_string(),
            products: generation.products().to_vec(),
        };
        let file = File::create(meta_tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &meta)?;
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        file.sync_all()?;

        Ok(())
    }
}

fn write_header(
    writer: &mut BufWriter<File>,
    header: &Header,
) -> Result<(), GenerationStorageError> {
    let mut bytes = [0u8; HEADER_SIZE];
    bytes[0] = header.version;
    bytes[1..33].copy_from_slice(&header.space_id);
    bytes[33..35].copy_from_slice(&header.dimension.to_le_bytes());
    bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());
    bytes[43..51].copy_from_slice(&header.built_at.to_le_bytes());

    let checksum = crc32fast::hash(&bytes[0..51]);
    bytes[51..55].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&bytes)?;
    Ok(())
}

fn read_header(reader: &mut BufReader<File>) -> Result<Header, GenerationStorageError> {
    let mut bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut bytes)?;

    let version = bytes[0];
    if version > FORMAT_VERSION {
        return Err(GenerationStorageError::VersionMismatch(
            version,
            FORMAT_VERSION,
        ));
    }

    let stored_checksum = u32::from_le_bytes(
        bytes[51..55]
            .try_into()
            .map_err(|_| GenerationStorageError::InvalidFormat("short header".to_string()))?,
    );
    if crc32fast::hash(&bytes[0..51]) != stored_checksum {
        return Err(GenerationStorageError::ChecksumMismatch);
    }

    let mut space_id = [0u8; 32];
    space_id.copy_from_slice(&bytes[1..33]);

    Ok(Header {
        version,
        space_id,
        dimension: u16::from_le_bytes([bytes[33], bytes[34]]),
        entry_count: u64::from_le_bytes(
            bytes[35..43]
                .try_into()
                .map_err(|_| GenerationStorageError::InvalidFormat("short header".to_string()))?,
        ),
        built_at: i64::from_le_bytes(
            bytes[43..51]
                .try_into()
                .map_err(|_| GenerationStorageError::InvalidFormat("short header".to_string()))?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::EmbeddingVector;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn test_dir() -> PathBuf {
        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "vogue-storage-test-{}-{}",
            std::process::id(),
            counter
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn test_generation() -> IndexGeneration {
        let products = vec![
            crate::catalog::normalize(&json!({"id": "a", "title": "Red Shoes"})),
            crate::catalog::normalize(&json!({"id": "b", "title": "Blue Jacket"})),
        ];
        let vectors = vec![
            EmbeddingVector {
                values: vec![1.0, 0.0, 0.0],
                provider: "test".into(),
                space: "test-space".into(),
            },
            EmbeddingVector {
                values: vec![0.0, 1.0, 0.0],
                provider: "test".into(),
                space: "test-space".into(),
            },
        ];
        crate::index::build(products, vectors).unwrap()
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = test_dir();
        let storage = GenerationStorage::new(dir.clone());
        let generation = test_generation();
        let space_id = space_id_hash("test-space");

        storage.save(&generation).unwrap();
        assert!(storage.exists());

        let loaded = storage.load(&space_id).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.dimension(), 3);
        assert_eq!(loaded.space(), "test-space");
        let ids: Vec<&str> = loaded.ordinal_to_id().collect();
        assert_eq!(ids, vec!["a", "b"]);

        // identical query results against the reloaded generation
        let query = [1.0, 0.0, 0.0];
        let before = generation.search(&query, 2);
        let after = loaded.search(&query, 2);
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.0, a.0);
            assert!((b.1 - a.1).abs() < 1e-6);
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_rejects_wrong_space() {
        let dir = test_dir();
        let storage = GenerationStorage::new(dir.clone());
        storage.save(&test_generation()).unwrap();

        let result = storage.load(&space_id_hash("other-space"));
        assert!(matches!(result, Err(GenerationStorageError::SpaceMismatch)));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_rejects_orphan_half() {
        let dir = test_dir();
        let storage = GenerationStorage::new(dir.clone());
        storage.save(&test_generation()).unwrap();

        std::fs::remove_file(dir.join(META_FILE)).unwrap();
        let result = storage.load(&space_id_hash("test-space"));
        assert!(matches!(result, Err(GenerationStorageError::Inconsistent(_))));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let dir = test_dir();
        let storage = GenerationStorage::new(dir.clone());
        storage.save(&test_generation()).unwrap();

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.join(INDEX_FILE))
            .unwrap();
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        let result = storage.load(&space_id_hash("test-space"));
        assert!(matches!(result, Err(GenerationStorageError::ChecksumMismatch)));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_rejects_entry_count_beyond_file_size() {
        let dir = test_dir();
        let storage = GenerationStorage::new(dir.clone());
        storage.save(&test_generation()).unwrap();

        // Forge a header that declares far more entries than the blob
        // holds, with a recomputed (valid) checksum.
        let path = dir.join(INDEX_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[35..43].copy_from_slice(&(1u64 << 40).to_le_bytes());
        let checksum = crc32fast::hash(&bytes[0..51]);
        bytes[51..55].copy_from_slice(&checksum.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let result = storage.load(&space_id_hash("test-space"));
        assert!(matches!(result, Err(GenerationStorageError::InvalidFormat(_))));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_save_cleans_up_temp_on_error() {
        let storage = GenerationStorage::new(PathBuf::from("/dev/null/nope"));
        let result = storage.save(&test_generation());
        assert!(result.is_err());
    }

    #[test]
    fn test_delete_removes_pair() {
        let dir = test_dir();
        let storage = GenerationStorage::new(dir.clone());
        storage.save(&test_generation()).unwrap();
        assert!(storage.exists());

        storage.delete().unwrap();
        assert!(!storage.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
