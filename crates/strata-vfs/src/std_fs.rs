use std::{fs, fs::File};
use std::io::{BufWriter, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use crate::traits::{
    already_locked, FileLock, FileSystem, RandomAccessFile, SequentialFile, WritableFile,
};


/// The operating system's filesystem.
#[derive(Default, Debug, Clone, Copy)]
pub struct StdFs;

impl FileSystem for StdFs {
    #[inline]
    fn open_sequential(&self, path: &Path) -> IoResult<Box<dyn SequentialFile>> {
        File::open(path).map(|file| Box::new(file) as _)
    }

    #[inline]
    fn open_random_access(&self, path: &Path) -> IoResult<Box<dyn RandomAccessFile>> {
        File::open(path).map(|file| Box::new(file) as _)
    }

    #[inline]
    fn create(&self, path: &Path) -> IoResult<Box<dyn WritableFile>> {
        File::create(path).map(|file| Box::new(StdWritableFile(BufWriter::new(file))) as _)
    }

    fn append(&self, path: &Path) -> IoResult<Box<dyn WritableFile>> {
        File::options()
            .append(true)
            .create(true)
            .open(path)
            .map(|file| Box::new(StdWritableFile(BufWriter::new(file))) as _)
    }

    #[inline]
    fn exists(&self, path: &Path) -> IoResult<bool> {
        path.try_exists()
    }

    fn children(&self, path: &Path) -> IoResult<Vec<PathBuf>> {
        path.read_dir()?
            .map(|dir_entry| Ok(dir_entry?.file_name().into()))
            .collect()
    }

    #[inline]
    fn remove_file(&self, path: &Path) -> IoResult<()> {
        fs::remove_file(path)
    }

    #[inline]
    fn create_dir_all(&self, path: &Path) -> IoResult<()> {
        fs::create_dir_all(path)
    }

    #[inline]
    fn remove_dir(&self, path: &Path) -> IoResult<()> {
        fs::remove_dir(path)
    }

    #[inline]
    fn rename(&self, from: &Path, to: &Path) -> IoResult<()> {
        fs::rename(from, to)
    }

    #[inline]
    fn size_of(&self, path: &Path) -> IoResult<u64> {
        path.metadata().map(|metadata| metadata.len())
    }

    fn lock(&self, path: &Path) -> IoResult<Box<dyn FileLock>> {
        use fs4::fs_std::FileExt as _;

        // Open with `append` + `create` so the lockfile is created if absent
        // and previous contents survive if present.
        let lockfile = File::options().append(true).create(true).open(path)?;

        match lockfile.try_lock_exclusive() {
            Ok(true) => Ok(Box::new(StdFileLock(lockfile))),
            Ok(false) => Err(already_locked(path)),
            Err(err) => Err(err),
        }
    }
}

struct StdWritableFile(BufWriter<File>);

impl Write for StdWritableFile {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        self.0.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> IoResult<()> {
        self.0.flush()
    }
}

impl WritableFile for StdWritableFile {
    fn sync_data(&mut self) -> IoResult<()> {
        self.0.flush()?;
        self.0.get_ref().sync_data()
    }
}

struct StdFileLock(File);

impl FileLock for StdFileLock {}

impl Drop for StdFileLock {
    fn drop(&mut self) {
        use fs4::fs_std::FileExt as _;

        let _ = self.0.unlock();
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        impl RandomAccessFile for File {
            /// Unix positioned reads neither use nor move the shared cursor.
            #[inline]
            fn read_at(&self, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
                std::os::unix::fs::FileExt::read_at(self, buf, offset)
            }

            #[inline]
            fn len(&self) -> IoResult<u64> {
                self.metadata().map(|metadata| metadata.len())
            }
        }
    } else if #[cfg(windows)] {
        impl RandomAccessFile for File {
            /// `seek_read` moves the cursor but does not depend on it, so
            /// concurrent callers each read from their own offset.
            #[inline]
            fn read_at(&self, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
                std::os::windows::fs::FileExt::seek_read(self, buf, offset)
            }

            #[inline]
            fn len(&self) -> IoResult<u64> {
                self.metadata().map(|metadata| metadata.len())
            }
        }
    }
}
