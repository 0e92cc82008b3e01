//! On-disk storage version detection
//!
//! Every database begins with a 12-byte header: the 3-byte `KUZ` magic,
//! one byte of padding, then a little-endian unsigned 64-bit storage
//! version code. The code maps to an engine release through a fixed
//! table; codes may be added over time but never removed.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Magic prefix of a catalog file.
pub const STORAGE_MAGIC: &[u8; 3] = b"KUZ";

/// Catalog file name inside a directory-based database.
pub const CATALOG_FILE_NAME: &str = "catalog.kz";

/// Byte range of the version code within the catalog header.
pub const VERSION_CODE_OFFSET: u64 = 4;

/// Known storage versions and the engine releases that write them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageVersion {
    V0_9_0,
    V0_10_0,
    V0_11_0,
}

/// The storage version written by this build of the engine.
pub const CURRENT_STORAGE_VERSION: StorageVersion = StorageVersion::V0_11_0;

/// Errors produced while reading or mapping a storage version code.
#[derive(Debug, thiserror::Error)]
pub enum StorageVersionError {
    #[error("catalog file does not exist: {0}")]
    CatalogMissing(PathBuf),

    #[error("file '{0}' does not contain a storage version code")]
    HeaderTruncated(PathBuf),

    #[error("file '{path}' is not a graph database (bad magic)")]
    BadMagic { path: PathBuf },

    #[error("unknown storage version code {0}; cannot map it to an engine release")]
    UnknownCode(u64),
}

impl StorageVersion {
    /// Map a raw catalog code to a known version.
    pub fn from_code(code: u64) -> Result<Self, StorageVersionError> {
        match code {
            37 => Ok(Self::V0_9_0),
            38 => Ok(Self::V0_10_0),
            39 => Ok(Self::V0_11_0),
            other => Err(StorageVersionError::UnknownCode(other)),
        }
    }

    /// The raw code written into the catalog header.
    pub fn code(&self) -> u64 {
        match self {
            Self::V0_9_0 => 37,
            Self::V0_10_0 => 38,
            Self::V0_11_0 => 39,
        }
    }

    /// The engine release string for this storage version.
    pub fn release(&self) -> &'static str {
        match self {
            Self::V0_9_0 => "0.9.0",
            Self::V0_10_0 => "0.10.0",
            Self::V0_11_0 => "0.11.0",
        }
    }

    /// Parse an engine release string (`"0.9.0"`) back to a version.
    pub fn from_release(release: &str) -> Option<Self> {
        match release {
            "0.9.0" => Some(Self::V0_9_0),
            "0.10.0" => Some(Self::V0_10_0),
            "0.11.0" => Some(Self::V0_11_0),
            _ => None,
        }
    }
}

impl std::fmt::Display for StorageVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.release())
    }
}

/// Locate the catalog file of a database path.
///
/// A directory-based database keeps its catalog at a well-known relative
/// path inside the directory; a file-based database is its own catalog.
pub fn catalog_path(db_path: &Path) -> Result<PathBuf, StorageVersionError> {
    if db_path.is_dir() {
        let catalog = db_path.join(CATALOG_FILE_NAME);
        if !catalog.is_file() {
            return Err(StorageVersionError::CatalogMissing(catalog));
        }
        Ok(catalog)
    } else {
        Ok(db_path.to_path_buf())
    }
}

/// Read the raw storage version code from a database's catalog file.
pub fn read_storage_version_code(db_path: &Path) -> Result<u64> {
    let catalog = catalog_path(db_path)?;
    let mut file = File::open(&catalog)
        .with_context(|| format!("failed to open catalog file: {}", catalog.display()))?;

    // Skip the 3-byte magic and one byte of padding, then read the
    // little-endian u64 version code.
    let mut header = [0u8; 12];
    let mut read = 0;
    while read < header.len() {
        let n = file
            .read(&mut header[read..])
            .with_context(|| format!("failed to read catalog header: {}", catalog.display()))?;
        if n == 0 {
            return Err(StorageVersionError::HeaderTruncated(catalog).into());
        }
        read += n;
    }

    if &header[..3] != STORAGE_MAGIC {
        return Err(StorageVersionError::BadMagic { path: catalog }.into());
    }

    let mut code_bytes = [0u8; 8];
    code_bytes.copy_from_slice(&header[4..12]);
    Ok(u64::from_le_bytes(code_bytes))
}

/// Read and map the storage version of a database.
///
/// An unknown code is a hard error: callers must never guess at a
/// database format they cannot identify.
pub fn read_storage_version(db_path: &Path) -> Result<StorageVersion> {
    let code = read_storage_version_code(db_path)?;
    Ok(StorageVersion::from_code(code)?)
}

/// Encode the 12-byte catalog header for a version.
pub fn encode_header(version: StorageVersion) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[..3].copy_from_slice(STORAGE_MAGIC);
    header[4..12].copy_from_slice(&version.code().to_le_bytes());
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_version_code_mapping() {
        assert_eq!(StorageVersion::from_code(37).unwrap(), StorageVersion::V0_9_0);
        assert_eq!(StorageVersion::from_code(38).unwrap(), StorageVersion::V0_10_0);
        assert_eq!(StorageVersion::from_code(39).unwrap(), StorageVersion::V0_11_0);
        assert!(matches!(
            StorageVersion::from_code(99),
            Err(StorageVersionError::UnknownCode(99))
        ));
    }

    #[test]
    fn test_release_round_trip() {
        for version in [
            StorageVersion::V0_9_0,
            StorageVersion::V0_10_0,
            StorageVersion::V0_11_0,
        ] {
            assert_eq!(StorageVersion::from_release(version.release()), Some(version));
        }
        assert_eq!(StorageVersion::from_release("1.0.0"), None);
    }

    #[test]
    fn test_read_version_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db_file = dir.path().join("graph.db");

        let mut file = File::create(&db_file)?;
        file.write_all(&encode_header(StorageVersion::V0_9_0))?;
        file.write_all(b"trailing catalog payload")?;
        drop(file);

        assert_eq!(read_storage_version(&db_file)?, StorageVersion::V0_9_0);
        Ok(())
    }

    #[test]
    fn test_read_version_from_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db_dir = dir.path().join("graph_db");
        std::fs::create_dir_all(&db_dir)?;

        let mut file = File::create(db_dir.join(CATALOG_FILE_NAME))?;
        file.write_all(&encode_header(StorageVersion::V0_10_0))?;
        drop(file);

        assert_eq!(read_storage_version(&db_dir)?, StorageVersion::V0_10_0);
        Ok(())
    }

    #[test]
    fn test_missing_catalog_in_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db_dir = dir.path().join("empty_db");
        std::fs::create_dir_all(&db_dir)?;

        let err = read_storage_version(&db_dir).unwrap_err();
        assert!(err.to_string().contains("catalog file does not exist"));
        Ok(())
    }

    #[test]
    fn test_truncated_header() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db_file = dir.path().join("short.db");
        std::fs::write(&db_file, b"KUZ\0\x25")?;

        let err = read_storage_version(&db_file).unwrap_err();
        assert!(err.to_string().contains("storage version code"));
        Ok(())
    }

    #[test]
    fn test_bad_magic() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db_file = dir.path().join("other.db");
        std::fs::write(&db_file, b"SQLite format 3\0")?;

        let err = read_storage_version(&db_file).unwrap_err();
        assert!(err.to_string().contains("bad magic"));
        Ok(())
    }
}
