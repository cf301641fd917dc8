use std::path::{Path, PathBuf};
use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};


/// A file which can be read from front to back.
///
/// Nothing beyond [`Read`] is needed; the alias exists so that trait objects
/// name the role the file plays rather than the mechanism.
pub trait SequentialFile: Read + Send {}

impl<T: Read + Send> SequentialFile for T {}

/// A file which may be read at arbitrary positions.
///
/// Unlike a `Seek` + `Read` pair, implementations must be logically
/// threadsafe: concurrent [`read_at`] calls from any number of threads must
/// each see the bytes at their requested offset. For [`std::fs::File`] this
/// relies on platform positioned-read support rather than the shared cursor.
///
/// [`read_at`]: RandomAccessFile::read_at
pub trait RandomAccessFile: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes read. Same semantics as [`Read::read`], at a position.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> IoResult<usize>;

    /// Read exactly `buf.len()` bytes starting at `offset`.
    ///
    /// Retries on [`ErrorKind::Interrupted`]; reaching end-of-file before the
    /// buffer is full is an [`ErrorKind::UnexpectedEof`] error, and the
    /// contents of `buf` are then unspecified.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> IoResult<()> {
        let mut bytes_read = 0_usize;

        while bytes_read < buf.len() {
            match self.read_at(offset + bytes_read as u64, &mut buf[bytes_read..]) {
                Ok(0) => break,
                Ok(additional) => bytes_read += additional,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }

        if bytes_read == buf.len() {
            Ok(())
        } else {
            Err(ErrorKind::UnexpectedEof.into())
        }
    }

    /// The current length of the file in bytes.
    fn len(&self) -> IoResult<u64>;

    fn is_empty(&self) -> IoResult<bool> {
        self.len().map(|len| len == 0)
    }
}

/// A file being written front to back, obtained from [`FileSystem::create`]
/// or [`FileSystem::append`].
///
/// Implementations should buffer writes; `flush` pushes buffered bytes to the
/// underlying file, while [`sync_data`] additionally asks the storage layer
/// to make the file contents durable.
///
/// [`sync_data`]: WritableFile::sync_data
pub trait WritableFile: Write + Send {
    /// Flush buffered writes and force file data to persistent storage.
    ///
    /// File metadata other than the length need not be synced. For in-memory
    /// implementations this may be a no-op.
    fn sync_data(&mut self) -> IoResult<()>;
}

impl<W: WritableFile + ?Sized> WritableFile for Box<W> {
    #[inline]
    fn sync_data(&mut self) -> IoResult<()> {
        (**self).sync_data()
    }
}

/// An advisory, process-scoped exclusive lock on a file.
///
/// Dropping the value releases the lock. The guarded file is not deleted on
/// release.
pub trait FileLock: Send {}

/// The filesystem operations the database needs, as a dyn-compatible trait.
///
/// Paths are joined with the platform separator when materialized; the
/// database itself only ever produces single-component file names beneath its
/// root directory.
pub trait FileSystem: Send + Sync {
    /// Open an existing file for sequential reading.
    fn open_sequential(&self, path: &Path) -> IoResult<Box<dyn SequentialFile>>;

    /// Open an existing file for positioned reads.
    fn open_random_access(&self, path: &Path) -> IoResult<Box<dyn RandomAccessFile>>;

    /// Create (or truncate) a file for writing.
    fn create(&self, path: &Path) -> IoResult<Box<dyn WritableFile>>;

    /// Open a file for appending, creating it if absent and keeping existing
    /// contents otherwise.
    fn append(&self, path: &Path) -> IoResult<Box<dyn WritableFile>>;

    /// Whether a filesystem entity exists at `path`.
    fn exists(&self, path: &Path) -> IoResult<bool>;

    /// The names of entries directly contained in the directory at `path`,
    /// relative to that directory.
    fn children(&self, path: &Path) -> IoResult<Vec<PathBuf>>;

    /// Delete the file at `path`.
    fn remove_file(&self, path: &Path) -> IoResult<()>;

    /// Create the directory at `path`, along with missing parents.
    fn create_dir_all(&self, path: &Path) -> IoResult<()>;

    /// Remove the (empty) directory at `path`.
    fn remove_dir(&self, path: &Path) -> IoResult<()>;

    /// Atomically rename `from` to `to`, replacing any file at `to`.
    fn rename(&self, from: &Path, to: &Path) -> IoResult<()>;

    /// Size in bytes of the file at `path`.
    fn size_of(&self, path: &Path) -> IoResult<u64>;

    /// Create `path` if missing, then take an exclusive advisory lock on it.
    ///
    /// Returns an error if another holder (in this or another process) has
    /// the file locked.
    fn lock(&self, path: &Path) -> IoResult<Box<dyn FileLock>>;
}

/// Error used by both filesystems when a lock is already held.
pub(crate) fn already_locked(path: &Path) -> IoError {
    IoError::new(
        ErrorKind::WouldBlock,
        format!("lock already held: {}", path.display()),
    )
}
