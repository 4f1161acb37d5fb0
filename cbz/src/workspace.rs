use std::{
    env, fs, io,
    path::{Path, PathBuf},
    process,
};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{Error, Result};

/// Scratch directory owned by one conversion at a time.
///
/// The caller allocates it, hands it to the converter for the duration of a
/// conversion, and disposes of it afterwards. Conversions running at the same
/// time must each get their own workspace.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    disposed: bool,
}

impl Workspace {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            disposed: false,
        }
    }

    /// A workspace unique to the running user and process, under the system temp dir
    #[must_use]
    pub fn for_process() -> Self {
        let root = env::temp_dir()
            .join(format!("cbr2cbztemp-u{}", user_id()))
            .join(format!("p{}", process::id()));

        Self::new(root)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the workspace if needed and empties it.
    ///
    /// ## Errors
    ///
    /// Fails with `Error::WorkspaceIntegrity` if the workspace can't be created,
    /// is not a directory, or still has content after clearing.
    pub fn prepare(&self) -> Result<()> {
        if !self.root.exists() {
            debug!("creating workspace {}", self.root.display());
            fs::create_dir_all(&self.root).map_err(|err| self.integrity(Some(err)))?;
        }

        if !self.root.is_dir() {
            return Err(self.integrity(None));
        }

        self.clear().map_err(|err| self.integrity(Some(err)))?;

        if !self.is_empty().map_err(|err| self.integrity(Some(err)))? {
            return Err(self.integrity(None));
        }

        Ok(())
    }

    /// Removes everything below the workspace root, keeping the root itself
    ///
    /// ## Errors
    ///
    /// Fails if any entry can't be removed
    pub fn clear(&self) -> io::Result<()> {
        if !self.root.is_dir() {
            return Ok(());
        }

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }

        Ok(())
    }

    /// ## Errors
    ///
    /// Fails if the workspace root can't be read
    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(fs::read_dir(&self.root)?.next().is_none())
    }

    /// Every regular file in the workspace, relative to its root, sorted by raw path
    ///
    /// ## Errors
    ///
    /// Fails if the tree can't be walked
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(&self.root) {
                files.push(relative.to_path_buf());
            }
        }
        files.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));

        Ok(files)
    }

    /// Deletes the workspace directory
    ///
    /// ## Errors
    ///
    /// Fails if the directory exists but can't be removed
    pub fn dispose(mut self) -> io::Result<()> {
        self.disposed = true;
        remove_root(&self.root)
    }

    fn integrity(&self, source: Option<io::Error>) -> Error {
        Error::WorkspaceIntegrity {
            path: self.root.clone(),
            source,
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        if let Err(err) = remove_root(&self.root) {
            warn!("couldn't remove workspace {}: {err}", self.root.display());
        }
    }
}

fn remove_root(root: &Path) -> io::Result<()> {
    match fs::remove_dir_all(root) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn user_id() -> String {
    nix::unistd::geteuid().to_string()
}

#[cfg(not(unix))]
fn user_id() -> String {
    env::var("USERNAME").unwrap_or_else(|_| String::from("unknown"))
}
