//! Filesystem capability consumed by the storage engine.
//!
//! Every persisted structure (schema files, column pages, the deleted-row
//! ledger, auto-increment counters, view SQL) goes through the
//! [`Filesystem`] trait so that the engine never touches `std::fs` paths
//! directly. [`RealFilesystem`] is the production implementation; tests use
//! it against a scratch directory.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::{StorageError, StorageResult};

/// Advisory lock modes for [`DbFile::lock`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A random-access file handle.
///
/// Offsets are absolute; `truncate` both shrinks and extends (extension
/// zero-fills, which is what column-page pre-sizing relies on).
pub trait DbFile {
    fn len(&mut self) -> StorageResult<u64>;
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> StorageResult<()>;
    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> StorageResult<()>;
    fn read_all(&mut self) -> StorageResult<Vec<u8>>;
    fn truncate(&mut self, size: u64) -> StorageResult<()>;
    fn lock(&mut self, mode: LockMode) -> StorageResult<()>;
    fn unlock(&mut self) -> StorageResult<()>;
}

/// Scoped advisory lock: acquired on construction, released on drop, so
/// every exit path (including `?` propagation) gives the lock back.
pub struct FileLockGuard<'a> {
    file: &'a mut dyn DbFile,
}

impl<'a> FileLockGuard<'a> {
    pub fn new(file: &'a mut dyn DbFile, mode: LockMode) -> StorageResult<Self> {
        file.lock(mode)?;
        Ok(Self { file })
    }

    pub fn file(&mut self) -> &mut dyn DbFile {
        self.file
    }
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        //  Nothing sensible to do with an unlock failure during unwind.
        let _ = self.file.unlock();
    }
}

/// Capability handed to the schema manager and row lifecycle manager.
///
/// Paths are engine-relative strings produced by [`FilePaths`]; the
/// implementation decides where they land on disk.
pub trait Filesystem {
    fn open(&self, path: &str) -> StorageResult<Box<dyn DbFile>>;
    fn file_exists(&self, path: &str) -> bool;
    fn unlink(&self, path: &str) -> StorageResult<()>;
    /// File names (not paths) inside a directory; empty when the directory
    /// does not exist yet.
    fn list_dir(&self, path: &str) -> StorageResult<Vec<String>>;
    fn read_to_string(&self, path: &str) -> StorageResult<String>;
    fn write_string(&self, path: &str, contents: &str) -> StorageResult<()>;
}

/// Production filesystem rooted at the engine's data directory.
pub struct RealFilesystem {
    root: PathBuf,
}

impl RealFilesystem {
    pub fn new<P: AsRef<Path>>(root: P) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl Filesystem for RealFilesystem {
    fn open(&self, path: &str) -> StorageResult<Box<dyn DbFile>> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&full)?;
        Ok(Box::new(RealFile { file }))
    }

    fn file_exists(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }

    fn unlink(&self, path: &str) -> StorageResult<()> {
        let full = self.resolve(path);
        if !full.is_file() {
            return Err(StorageError::NotFound(format!("file '{path}'")));
        }
        fs::remove_file(full)?;
        Ok(())
    }

    fn list_dir(&self, path: &str) -> StorageResult<Vec<String>> {
        let full = self.resolve(path);
        if !full.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(full)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_to_string(&self, path: &str) -> StorageResult<String> {
        let full = self.resolve(path);
        if !full.is_file() {
            return Err(StorageError::NotFound(format!("file '{path}'")));
        }
        Ok(fs::read_to_string(full)?)
    }

    fn write_string(&self, path: &str, contents: &str) -> StorageResult<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, contents)?;
        Ok(())
    }
}

struct RealFile {
    file: File,
}

impl DbFile for RealFile {
    fn len(&mut self) -> StorageResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_all_at(&mut self, offset: u64, buf: &[u8]) -> StorageResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn read_all(&mut self) -> StorageResult<Vec<u8>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn truncate(&mut self, size: u64) -> StorageResult<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    #[cfg(unix)]
    fn lock(&mut self, mode: LockMode) -> StorageResult<()> {
        use std::os::unix::io::AsRawFd;
        let op = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        };
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), op) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock(&mut self, _mode: LockMode) -> StorageResult<()> {
        //  Advisory locking is unix-only; elsewhere the caller must
        //  serialize writers externally.
        Ok(())
    }

    #[cfg(unix)]
    fn unlock(&mut self) -> StorageResult<()> {
        use std::os::unix::io::AsRawFd;
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn unlock(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

/// Path templates for everything the engine persists, parameterized by
/// database-id, table name/index, column id, page index and view index.
pub struct FilePaths;

impl FilePaths {
    pub const SCHEMA_DIR: &'static str = "schemata";
    pub const SCHEMA_SUFFIX: &'static str = ".schema";

    pub fn schema(schema_id: &str) -> String {
        format!("{}/{schema_id}{}", Self::SCHEMA_DIR, Self::SCHEMA_SUFFIX)
    }

    pub fn table_schema(schema_id: &str, table_index: usize) -> String {
        format!("{schema_id}/tables/{table_index}.schema")
    }

    pub fn table_index_schema(schema_id: &str, table_index: usize) -> String {
        format!("{schema_id}/tables/{table_index}.indexes")
    }

    pub fn column_data_dir(schema_id: &str, table_name: &str, column_id: usize) -> String {
        format!("{schema_id}/{table_name}/columns/{column_id}")
    }

    pub fn column_data_file(
        schema_id: &str,
        table_name: &str,
        column_id: usize,
        page_index: u64,
    ) -> String {
        format!("{schema_id}/{table_name}/columns/{column_id}/{page_index}.data")
    }

    pub fn deleted_rows(schema_id: &str, table_name: &str) -> String {
        format!("{schema_id}/{table_name}/deleted-rows.dat")
    }

    pub fn auto_increment(schema_id: &str, table_name: &str) -> String {
        format!("{schema_id}/{table_name}/auto-increment.int")
    }

    pub fn view_sql(schema_id: &str, view_index: usize) -> String {
        format!("{schema_id}/views/{view_index}.sql")
    }

    pub fn index_file(schema_id: &str, table_name: &str, index_name: &str) -> String {
        format!("{schema_id}/{table_name}/indices/{index_name}.idx")
    }
}

#[cfg(test)]
mod filesystem_tests {
    use super::*;
    use crate::test_utils::TestDir;

    #[test]
    fn open_creates_parent_directories_and_round_trips_bytes() {
        let dir = TestDir::new_unique("flatdb_fs");
        let fs = RealFilesystem::new(&dir).unwrap();

        let mut file = fs.open("a/b/c.data").unwrap();
        assert_eq!(file.len().unwrap(), 0);

        file.write_all_at(4, &[1, 2, 3]).unwrap();
        assert_eq!(file.len().unwrap(), 7);

        let mut buf = [0u8; 3];
        file.read_exact_at(4, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);

        //  The gap before the written range is zero-filled.
        let all = file.read_all().unwrap();
        assert_eq!(all, vec![0, 0, 0, 0, 1, 2, 3]);
    }

    #[test]
    fn truncate_extends_with_zeroes_and_shrinks() {
        let dir = TestDir::new_unique("flatdb_fs");
        let fs = RealFilesystem::new(&dir).unwrap();

        let mut file = fs.open("t.data").unwrap();
        file.truncate(16).unwrap();
        assert_eq!(file.len().unwrap(), 16);
        assert_eq!(file.read_all().unwrap(), vec![0u8; 16]);

        file.truncate(4).unwrap();
        assert_eq!(file.len().unwrap(), 4);
    }

    #[test]
    fn list_dir_reports_file_names_and_tolerates_missing_directories() {
        let dir = TestDir::new_unique("flatdb_fs");
        let fs = RealFilesystem::new(&dir).unwrap();

        assert!(fs.list_dir("nope").unwrap().is_empty());

        fs.write_string("d/0.data", "x").unwrap();
        fs.write_string("d/1.data", "y").unwrap();
        assert_eq!(fs.list_dir("d").unwrap(), vec!["0.data", "1.data"]);
    }

    #[test]
    fn unlink_missing_file_is_not_found() {
        let dir = TestDir::new_unique("flatdb_fs");
        let fs = RealFilesystem::new(&dir).unwrap();
        assert!(matches!(
            fs.unlink("ghost.data"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn lock_guard_releases_on_drop() {
        let dir = TestDir::new_unique("flatdb_fs");
        let fs = RealFilesystem::new(&dir).unwrap();

        let mut file = fs.open("locked.dat").unwrap();
        {
            let mut guard = FileLockGuard::new(file.as_mut(), LockMode::Exclusive).unwrap();
            guard.file().write_all_at(0, b"under lock").unwrap();
        }
        //  Re-acquiring after the guard dropped must not dead-lock.
        let _guard = FileLockGuard::new(file.as_mut(), LockMode::Exclusive).unwrap();
    }
}
