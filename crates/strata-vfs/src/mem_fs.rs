use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use hashbrown::{HashMap, HashSet};

use crate::traits::{
    already_locked, FileLock, FileSystem, RandomAccessFile, SequentialFile, WritableFile,
};


/// An entirely in-memory filesystem.
///
/// Used by tests so that database behavior (including crash-recovery paths,
/// by reopening over the same `MemFs`) can be exercised without touching
/// disk. Cloning shares the underlying storage.
#[derive(Default, Debug, Clone)]
pub struct MemFs {
    state: Arc<Mutex<FsState>>,
}

#[derive(Default, Debug)]
struct FsState {
    /// Live file contents, shared with open handles; a handle to a file that
    /// has since been removed or replaced keeps reading the old bytes, the
    /// same observable behavior as POSIX unlink.
    files: HashMap<PathBuf, SharedContents>,
    dirs:  HashSet<PathBuf>,
    locks: HashSet<PathBuf>,
}

type SharedContents = Arc<RwLock<Vec<u8>>>;

/// Lexically normalize a path: strip `.`, the root, and prefix components.
///
/// The in-memory filesystem has no working directory, so relative and
/// absolute spellings of the same path collapse to one key.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    normalized
}

fn not_found(path: &Path) -> IoError {
    IoError::new(ErrorKind::NotFound, format!("no such file: {}", path.display()))
}

impl MemFs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn contents(&self, path: &Path) -> IoResult<SharedContents> {
        let state = self.state.lock().expect("MemFs mutex poisoned");
        state
            .files
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| not_found(path))
    }

    fn open_for_write(&self, path: &Path, truncate: bool) -> IoResult<Box<dyn WritableFile>> {
        let mut state = self.state.lock().expect("MemFs mutex poisoned");
        let contents = state
            .files
            .entry(normalize(path))
            .or_insert_with(SharedContents::default)
            .clone();
        if truncate {
            contents.write().expect("MemFs file lock poisoned").clear();
        }
        Ok(Box::new(MemWritableFile { contents }))
    }
}

impl FileSystem for MemFs {
    fn open_sequential(&self, path: &Path) -> IoResult<Box<dyn SequentialFile>> {
        let contents = self.contents(path)?;
        Ok(Box::new(MemReadFile { contents, position: 0 }))
    }

    fn open_random_access(&self, path: &Path) -> IoResult<Box<dyn RandomAccessFile>> {
        let contents = self.contents(path)?;
        Ok(Box::new(MemRandomAccessFile { contents }))
    }

    fn create(&self, path: &Path) -> IoResult<Box<dyn WritableFile>> {
        self.open_for_write(path, true)
    }

    fn append(&self, path: &Path) -> IoResult<Box<dyn WritableFile>> {
        self.open_for_write(path, false)
    }

    fn exists(&self, path: &Path) -> IoResult<bool> {
        let state = self.state.lock().expect("MemFs mutex poisoned");
        let path = normalize(path);
        Ok(state.files.contains_key(&path) || state.dirs.contains(&path))
    }

    fn children(&self, path: &Path) -> IoResult<Vec<PathBuf>> {
        let state = self.state.lock().expect("MemFs mutex poisoned");
        let dir = normalize(path);
        let mut children: Vec<PathBuf> = state
            .files
            .keys()
            .chain(state.dirs.iter())
            .filter_map(|entry| entry.strip_prefix(&dir).ok())
            .filter_map(|relative| relative.components().next())
            .map(|first_component| PathBuf::from(first_component.as_os_str()))
            .collect();
        children.sort();
        children.dedup();
        Ok(children)
    }

    fn remove_file(&self, path: &Path) -> IoResult<()> {
        let mut state = self.state.lock().expect("MemFs mutex poisoned");
        state
            .files
            .remove(&normalize(path))
            .map(|_| ())
            .ok_or_else(|| not_found(path))
    }

    fn create_dir_all(&self, path: &Path) -> IoResult<()> {
        let mut state = self.state.lock().expect("MemFs mutex poisoned");
        let mut dir = normalize(path);
        while !dir.as_os_str().is_empty() {
            state.dirs.insert(dir.clone());
            if !dir.pop() {
                break;
            }
        }
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> IoResult<()> {
        let mut state = self.state.lock().expect("MemFs mutex poisoned");
        let dir = normalize(path);
        let occupied = state
            .files
            .keys()
            .any(|file| file.strip_prefix(&dir).is_ok_and(|rest| !rest.as_os_str().is_empty()));
        if occupied {
            return Err(IoError::other(format!(
                "directory not empty: {}",
                path.display()
            )));
        }
        state.dirs.remove(&dir);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> IoResult<()> {
        let mut state = self.state.lock().expect("MemFs mutex poisoned");
        let contents = state
            .files
            .remove(&normalize(from))
            .ok_or_else(|| not_found(from))?;
        state.files.insert(normalize(to), contents);
        Ok(())
    }

    fn size_of(&self, path: &Path) -> IoResult<u64> {
        let contents = self.contents(path)?;
        let len = contents.read().expect("MemFs file lock poisoned").len();
        Ok(len as u64)
    }

    fn lock(&self, path: &Path) -> IoResult<Box<dyn FileLock>> {
        let mut state = self.state.lock().expect("MemFs mutex poisoned");
        let lock_path = normalize(path);
        state.files.entry(lock_path.clone()).or_default();
        if !state.locks.insert(lock_path.clone()) {
            return Err(already_locked(path));
        }
        Ok(Box::new(MemFileLock {
            state: Arc::clone(&self.state),
            path:  lock_path,
        }))
    }
}

struct MemReadFile {
    contents: SharedContents,
    position: usize,
}

impl Read for MemReadFile {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        let contents = self.contents.read().expect("MemFs file lock poisoned");
        let available = contents.get(self.position..).unwrap_or(&[]);
        let to_copy = available.len().min(buf.len());
        buf[..to_copy].copy_from_slice(&available[..to_copy]);
        self.position += to_copy;
        Ok(to_copy)
    }
}

struct MemRandomAccessFile {
    contents: SharedContents,
}

impl RandomAccessFile for MemRandomAccessFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
        let contents = self.contents.read().expect("MemFs file lock poisoned");
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let available = contents.get(offset..).unwrap_or(&[]);
        let to_copy = available.len().min(buf.len());
        buf[..to_copy].copy_from_slice(&available[..to_copy]);
        Ok(to_copy)
    }

    fn len(&self) -> IoResult<u64> {
        let len = self.contents.read().expect("MemFs file lock poisoned").len();
        Ok(len as u64)
    }
}

struct MemWritableFile {
    contents: SharedContents,
}

impl Write for MemWritableFile {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        self.contents
            .write()
            .expect("MemFs file lock poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }
}

impl WritableFile for MemWritableFile {
    #[inline]
    fn sync_data(&mut self) -> IoResult<()> {
        Ok(())
    }
}

struct MemFileLock {
    state: Arc<Mutex<FsState>>,
    path:  PathBuf,
}

impl FileLock for MemFileLock {}

impl Drop for MemFileLock {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.locks.remove(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;


    #[test]
    fn write_then_read_back() {
        let fs = MemFs::new();
        let path = Path::new("db/000001.log");

        let mut file = fs.create(path).unwrap();
        file.write_all(b"hello").unwrap();
        file.sync_data().unwrap();
        drop(file);

        let mut file = fs.append(path).unwrap();
        file.write_all(b" world").unwrap();
        drop(file);

        let mut read = fs.open_sequential(path).unwrap();
        let mut contents = Vec::new();
        read.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"hello world");
        assert_eq!(fs.size_of(path).unwrap(), 11);
    }

    #[test]
    fn random_access_reads() {
        let fs = MemFs::new();
        let path = Path::new("file");
        fs.create(path).unwrap().write_all(b"0123456789").unwrap();

        let file = fs.open_random_access(path).unwrap();
        let mut buf = [0_u8; 4];
        file.read_exact_at(3, &mut buf).unwrap();
        assert_eq!(&buf, b"3456");

        // Reads past the end are short, not errors.
        assert_eq!(file.read_at(8, &mut buf).unwrap(), 2);
        assert!(file.read_exact_at(8, &mut buf).is_err());
    }

    #[test]
    fn rename_and_children() {
        let fs = MemFs::new();
        fs.create_dir_all(Path::new("db")).unwrap();
        fs.create(Path::new("db/CURRENT.dbtmp")).unwrap().write_all(b"MANIFEST-000002\n").unwrap();
        fs.rename(Path::new("db/CURRENT.dbtmp"), Path::new("db/CURRENT")).unwrap();

        assert!(!fs.exists(Path::new("db/CURRENT.dbtmp")).unwrap());
        assert!(fs.exists(Path::new("db/CURRENT")).unwrap());
        assert_eq!(fs.children(Path::new("db")).unwrap(), vec![PathBuf::from("CURRENT")]);
    }

    #[test]
    fn exclusive_lock() {
        let fs = MemFs::new();
        let path = Path::new("db/LOCK");

        let lock = fs.lock(path).unwrap();
        assert!(fs.lock(path).is_err());
        drop(lock);
        let _relocked = fs.lock(path).unwrap();
    }
}
