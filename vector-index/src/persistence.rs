//! On-disk index format.
//!
//! An index saved at `base` produces two files:
//!
//! - `base.idx`: `RAGCIDX1` magic, format version, dimension, body length,
//!   CRC32 of the body, then the serialized backend.
//! - `base.meta.json`: id-to-metadata map, id counter, dimension, the
//!   configuration the index was built with, and the CRC32 of the blob body
//!   it was saved alongside.
//!
//! Both are written to a temporary file and renamed into place. A crash
//! between the two renames leaves a blob and a sidecar from different saves;
//! `load` detects the pair through the shared checksum and the id sets.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32Hasher;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::EntryMetadata;
use crate::backend::AnyBackend;
use crate::config::{BackendKind, IndexConfig};
use crate::error::{IndexError, Result};

/// Magic bytes identifying an index blob.
pub const MAGIC: &[u8; 8] = b"RAGCIDX1";

/// Current blob format version.
pub const FORMAT_VERSION: u32 = 1;

/// magic + version + dimension + body length + crc
const HEADER_LEN: usize = 8 + 4 + 4 + 8 + 4;

/// Sidecar describing the entries of a saved index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSidecar {
    pub id_to_metadata: BTreeMap<u64, EntryMetadata>,
    pub id_counter: u64,
    pub embedding_dim: usize,
    pub backend_kind: BackendKind,
    pub backend_config: IndexConfig,
    /// CRC32 of the blob body written by the same save.
    #[serde(default)]
    pub blob_checksum: u32,
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Path of the backend blob for an index saved at `base`.
pub fn blob_path(base: &Path) -> PathBuf {
    with_suffix(base, ".idx")
}

/// Path of the metadata sidecar for an index saved at `base`.
pub fn sidecar_path(base: &Path) -> PathBuf {
    with_suffix(base, ".meta.json")
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = with_suffix(path, ".tmp");
    fs::write(&temp_path, bytes)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Serialize a backend into a checksummed blob.
pub fn encode_backend(backend: &AnyBackend, dimension: usize) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(backend)?;
    let mut hasher = Crc32Hasher::new();
    hasher.update(&body);

    let mut blob = Vec::with_capacity(HEADER_LEN + body.len());
    blob.extend_from_slice(MAGIC);
    blob.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    blob.extend_from_slice(&(dimension as u32).to_le_bytes());
    blob.extend_from_slice(&(body.len() as u64).to_le_bytes());
    blob.extend_from_slice(&hasher.finalize().to_le_bytes());
    blob.extend_from_slice(&body);
    Ok(blob)
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N]> {
    bytes
        .get(offset..offset + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| IndexError::Corruption("truncated header".to_string()))
}

/// Body checksum recorded in a blob header.
pub fn blob_checksum(blob: &[u8]) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(blob, 24)?))
}

/// Validate and deserialize a blob produced by [`encode_backend`].
pub fn decode_backend(blob: &[u8], expected_dimension: usize) -> Result<AnyBackend> {
    let magic: [u8; 8] = read_array(blob, 0)?;
    if &magic != MAGIC {
        return Err(IndexError::Corruption("bad magic bytes".to_string()));
    }

    let version = u32::from_le_bytes(read_array(blob, 8)?);
    if version != FORMAT_VERSION {
        return Err(IndexError::Corruption(format!(
            "unsupported format version {version}"
        )));
    }

    let dimension = u32::from_le_bytes(read_array(blob, 12)?) as usize;
    if dimension != expected_dimension {
        return Err(IndexError::Corruption(format!(
            "blob dimension {dimension} does not match index dimension {expected_dimension}"
        )));
    }

    let body_len = u64::from_le_bytes(read_array(blob, 16)?) as usize;
    let stored_crc = blob_checksum(blob)?;
    let body = blob
        .get(HEADER_LEN..)
        .filter(|body| body.len() == body_len)
        .ok_or_else(|| IndexError::Corruption("body length mismatch".to_string()))?;

    let mut hasher = Crc32Hasher::new();
    hasher.update(body);
    let computed_crc = hasher.finalize();
    if stored_crc != computed_crc {
        return Err(IndexError::Corruption(format!(
            "CRC32 mismatch: stored={stored_crc:#010x}, computed={computed_crc:#010x}"
        )));
    }

    serde_json::from_slice(body)
        .map_err(|e| IndexError::Corruption(format!("unreadable backend state: {e}")))
}

/// Write both artifacts for an index at `base`, stamping the sidecar with the
/// blob's checksum.
pub fn save(base: &Path, backend: &AnyBackend, mut sidecar: IndexSidecar) -> Result<()> {
    if let Some(parent) = base.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let blob = encode_backend(backend, sidecar.embedding_dim)?;
    sidecar.blob_checksum = blob_checksum(&blob)?;
    write_atomic(&blob_path(base), &blob)?;
    write_atomic(&sidecar_path(base), &serde_json::to_vec_pretty(&sidecar)?)?;

    debug!(
        "Wrote index blob ({} bytes) and sidecar for {} entries to {}",
        blob.len(),
        sidecar.id_to_metadata.len(),
        base.display()
    );
    Ok(())
}

/// Read both artifacts for an index at `base`.
///
/// Returns `Ok(None)` when either file is missing and an error when the
/// files exist but fail validation.
pub fn load(base: &Path, expected_dimension: usize) -> Result<Option<(AnyBackend, IndexSidecar)>> {
    let blob_path = blob_path(base);
    let sidecar_path = sidecar_path(base);
    if !blob_path.exists() || !sidecar_path.exists() {
        return Ok(None);
    }

    let sidecar: IndexSidecar = serde_json::from_slice(&fs::read(&sidecar_path)?)
        .map_err(|e| IndexError::Corruption(format!("unreadable sidecar: {e}")))?;
    if sidecar.embedding_dim != expected_dimension {
        return Err(IndexError::Corruption(format!(
            "sidecar dimension {} does not match index dimension {expected_dimension}",
            sidecar.embedding_dim
        )));
    }

    let blob = fs::read(&blob_path)?;
    let backend = decode_backend(&blob, expected_dimension)?;
    let checksum = blob_checksum(&blob)?;
    if checksum != sidecar.blob_checksum {
        return Err(IndexError::Corruption(format!(
            "sidecar was written for blob {:#010x}, found {checksum:#010x}",
            sidecar.blob_checksum
        )));
    }
    if backend.kind() != sidecar.backend_kind {
        return Err(IndexError::Corruption(format!(
            "blob holds a {} backend but sidecar describes {}",
            backend.kind(),
            sidecar.backend_kind
        )));
    }

    let stored: BTreeSet<u64> = backend.ids().into_iter().collect();
    if !stored.iter().eq(sidecar.id_to_metadata.keys()) {
        return Err(IndexError::Corruption(format!(
            "blob holds {} ids but sidecar describes {}",
            stored.len(),
            sidecar.id_to_metadata.len()
        )));
    }
    if let Some(&last) = stored.last().filter(|&&id| id >= sidecar.id_counter) {
        return Err(IndexError::Corruption(format!(
            "id counter {} is not past stored id {last}",
            sidecar.id_counter
        )));
    }

    Ok(Some((backend, sidecar)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use pretty_assertions::assert_eq;

    fn flat_backend() -> AnyBackend {
        let mut backend = AnyBackend::empty(BackendKind::Flat, &IndexConfig::default());
        backend.add(0, vec![1.0, 0.0]);
        backend.add(1, vec![0.0, 1.0]);
        backend
    }

    #[test]
    fn test_blob_round_trip() {
        let backend = flat_backend();
        let blob = encode_backend(&backend, 2).unwrap();
        assert_eq!(&blob[..8], MAGIC);
        assert_eq!(decode_backend(&blob, 2).unwrap(), backend);
    }

    #[test]
    fn test_flipped_body_byte_fails_checksum() {
        let mut blob = encode_backend(&flat_backend(), 2).unwrap();
        let last = blob.len() - 2;
        blob[last] ^= 0x01;

        let err = decode_backend(&blob, 2).unwrap_err();
        assert!(matches!(err, IndexError::Corruption(msg) if msg.contains("CRC32")));
    }

    #[test]
    fn test_header_validation() {
        let blob = encode_backend(&flat_backend(), 2).unwrap();

        assert!(matches!(
            decode_backend(&blob, 3),
            Err(IndexError::Corruption(_))
        ));
        assert!(matches!(
            decode_backend(&blob[..10], 2),
            Err(IndexError::Corruption(_))
        ));

        let mut bad_magic = blob;
        bad_magic[0] = b'X';
        assert!(matches!(
            decode_backend(&bad_magic, 2),
            Err(IndexError::Corruption(_))
        ));
    }

    fn sidecar_for(backend: &AnyBackend) -> IndexSidecar {
        let ids: Vec<u64> = backend.ids();
        IndexSidecar {
            id_to_metadata: ids.iter().map(|id| (*id, EntryMetadata::new())).collect(),
            id_counter: ids.last().map_or(0, |id| id + 1),
            embedding_dim: 2,
            backend_kind: backend.kind(),
            backend_config: IndexConfig::default(),
            blob_checksum: 0,
        }
    }

    #[test]
    fn test_save_stamps_sidecar_with_blob_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("index");
        let backend = flat_backend();
        save(&base, &backend, sidecar_for(&backend)).unwrap();

        let (loaded, sidecar) = load(&base, 2).unwrap().unwrap();
        assert_eq!(loaded, backend);
        let blob = fs::read(blob_path(&base)).unwrap();
        assert_eq!(sidecar.blob_checksum, blob_checksum(&blob).unwrap());
    }

    #[test]
    fn test_sidecar_from_another_save_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("index");
        let backend = flat_backend();
        save(&base, &backend, sidecar_for(&backend)).unwrap();
        let old_sidecar = fs::read(sidecar_path(&base)).unwrap();

        let mut grown = backend;
        grown.add(2, vec![0.6, 0.8]);
        save(&base, &grown, sidecar_for(&grown)).unwrap();
        fs::write(sidecar_path(&base), old_sidecar).unwrap();

        let err = load(&base, 2).unwrap_err();
        assert!(matches!(err, IndexError::Corruption(msg) if msg.contains("sidecar")));
    }

    #[test]
    fn test_id_sets_must_agree() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("index");
        let backend = flat_backend();
        let mut sidecar = sidecar_for(&backend);
        sidecar.id_to_metadata.remove(&1);
        save(&base, &backend, sidecar).unwrap();

        assert!(matches!(load(&base, 2), Err(IndexError::Corruption(_))));
    }

    #[test]
    fn test_stale_id_counter_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("index");
        let backend = flat_backend();
        let mut sidecar = sidecar_for(&backend);
        sidecar.id_counter = 1;
        save(&base, &backend, sidecar).unwrap();

        assert!(matches!(load(&base, 2), Err(IndexError::Corruption(_))));
    }

    #[test]
    fn test_paths_append_suffixes() {
        let base = Path::new("/data/index.v1");
        assert_eq!(blob_path(base), PathBuf::from("/data/index.v1.idx"));
        assert_eq!(sidecar_path(base), PathBuf::from("/data/index.v1.meta.json"));
    }
}
