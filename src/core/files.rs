//! File store collaborator used by the applier.

use crate::core::error::GuardError;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use ulid::Ulid;

pub trait FileStore: Send + Sync {
    /// `Ok(None)` when the path does not exist.
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>>;

    fn write(&self, path: &str, bytes: &[u8]) -> io::Result<()>;

    /// Deleting an absent path is not an error.
    fn delete(&self, path: &str) -> io::Result<()>;

    fn exists(&self, path: &str) -> io::Result<bool>;
}

/// Normalizes a workspace-relative path: forward slashes, no `.` segments,
/// no empty segments. Absolute paths and `..` escapes are rejected.
pub fn normalize_path(raw: &str) -> Result<String, GuardError> {
    let unified = raw.replace('\\', "/");
    let path = Path::new(&unified);
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(GuardError::PathError(format!("path escapes workspace: {raw}")));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(GuardError::PathError(format!("path must be relative: {raw}")));
            }
        }
    }
    if parts.is_empty() {
        return Err(GuardError::PathError(format!("empty path: {raw:?}")));
    }
    Ok(parts.join("/"))
}

/// Files under a workspace root. Writes go to a sibling temp file which is
/// synced and renamed over the target, so a reader never sees a torn file.
#[derive(Debug, Clone)]
pub struct FsFileStore {
    root: PathBuf,
}

impl FsFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl FileStore for FsFileStore {
    fn read(&self, path: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.resolve(path)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, path: &str, bytes: &[u8]) -> io::Result<()> {
        let target = self.resolve(path);
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::other(format!("no parent directory for {path}")))?;
        fs::create_dir_all(parent)?;
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{file_name}.cg-{}", Ulid::new()));
        let result = (|| {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(bytes)?;
            f.sync_all()?;
            fs::rename(&tmp, &target)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        match fs::remove_file(self.resolve(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn exists(&self, path: &str) -> io::Result<bool> {
        self.resolve(path).try_exists()
    }
}
