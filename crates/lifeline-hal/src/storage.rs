//! Generic `BackingStore` trait for id-addressed non-volatile records, and a
//! directory-backed implementation for host builds.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use lifeline_types::StorageError;
use tracing::debug;

/// Geometry reported when a storage partition is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub name: String,
    pub sector_size: u32,
    pub sector_count: u32,
}

/// Non-volatile record storage (flash NVS, files, ...).
///
/// [`open`][BackingStore::open] and [`mount`][BackingStore::mount] may fail
/// transiently and are retried by the caller.
pub trait BackingStore: Send {
    /// Locate `partition` and report its geometry.
    fn open(&mut self, partition: &str) -> Result<PartitionInfo, StorageError>;

    /// Mount the filesystem on a previously opened partition.
    fn mount(&mut self, partition: &PartitionInfo) -> Result<(), StorageError>;

    /// Read record `id`; `Ok(None)` when it was never written.
    fn read(&mut self, id: u16) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace record `id` with `data`.
    fn write(&mut self, id: u16, data: &[u8]) -> Result<(), StorageError>;

    /// Wipe every record. Only test harnesses call this.
    fn erase_all(&mut self) -> Result<(), StorageError>;
}

// ────────────────────────────────────────────────────────────────────────────
// FileStore
// ────────────────────────────────────────────────────────────────────────────

/// [`BackingStore`] keeping one file per record under `<root>/<partition>/`.
///
/// Writes go through a temporary file and a rename so a crash mid-write
/// leaves either the old or the new record.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    mounted: Option<PathBuf>,
}

const SECTOR_SIZE: u32 = 4096;

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mounted: None,
        }
    }

    fn dir(&self) -> Result<&Path, StorageError> {
        self.mounted.as_deref().ok_or(StorageError::NotMounted)
    }

    fn record_path(dir: &Path, id: u16) -> PathBuf {
        dir.join(format!("{id:04x}.rec"))
    }
}

fn io_err(e: std::io::Error) -> StorageError {
    StorageError::Io(e.to_string())
}

impl BackingStore for FileStore {
    fn open(&mut self, partition: &str) -> Result<PartitionInfo, StorageError> {
        let dir = self.root.join(partition);
        fs::create_dir_all(&dir)
            .map_err(|e| StorageError::Open(format!("{}: {e}", dir.display())))?;
        Ok(PartitionInfo {
            name: partition.to_string(),
            sector_size: SECTOR_SIZE,
            sector_count: 2,
        })
    }

    fn mount(&mut self, partition: &PartitionInfo) -> Result<(), StorageError> {
        let dir = self.root.join(&partition.name);
        if !dir.is_dir() {
            return Err(StorageError::Mount(format!(
                "{} is not a directory",
                dir.display()
            )));
        }
        debug!(path = %dir.display(), "file store mounted");
        self.mounted = Some(dir);
        Ok(())
    }

    fn read(&mut self, id: u16) -> Result<Option<Vec<u8>>, StorageError> {
        let path = Self::record_path(self.dir()?, id);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(e)),
        }
    }

    fn write(&mut self, id: u16, data: &[u8]) -> Result<(), StorageError> {
        let dir = self.dir()?;
        let path = Self::record_path(dir, id);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)
    }

    fn erase_all(&mut self) -> Result<(), StorageError> {
        let dir = self.dir()?.to_path_buf();
        for entry in fs::read_dir(&dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if entry.path().is_file() {
                fs::remove_file(entry.path()).map_err(io_err)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mounted_store(root: &Path) -> FileStore {
        let mut store = FileStore::new(root);
        let info = store.open("storage").expect("open");
        store.mount(&info).expect("mount");
        store
    }

    #[test]
    fn read_before_mount_is_rejected() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let mut store = FileStore::new(dir.path());
        assert_eq!(store.read(1), Err(StorageError::NotMounted));
    }

    #[test]
    fn missing_record_reads_as_none() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let mut store = mounted_store(dir.path());
        assert_eq!(store.read(7).expect("read"), None);
    }

    #[test]
    fn written_record_survives_remount() {
        let dir = tempfile::tempdir().expect("tmp dir");
        mounted_store(dir.path()).write(1, b"abc").expect("write");

        let mut again = mounted_store(dir.path());
        assert_eq!(again.read(1).expect("read"), Some(b"abc".to_vec()));
    }

    #[test]
    fn erase_all_removes_every_record() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let mut store = mounted_store(dir.path());
        store.write(1, b"a").expect("write");
        store.write(2, b"b").expect("write");
        store.erase_all().expect("erase");
        assert_eq!(store.read(1).expect("read"), None);
        assert_eq!(store.read(2).expect("read"), None);
    }

    #[test]
    fn mount_without_open_fails() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let mut store = FileStore::new(dir.path());
        let info = PartitionInfo {
            name: "never-opened".into(),
            sector_size: SECTOR_SIZE,
            sector_count: 2,
        };
        assert!(matches!(store.mount(&info), Err(StorageError::Mount(_))));
    }
}
