use std::{
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use tracing::{debug, trace};
use walkdir::WalkDir;
use zip::{result::ZipError, ZipArchive};

use crate::{errors::ExtractError, process, Cbz};

/// A file produced by extraction, relative to the workspace root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEntry {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Foreign,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub kind: ArchiveKind,
    pub entries: Vec<ExtractedEntry>,
}

/// Unpacks archives that are not zip containers (RAR in practice)
pub trait Unpacker {
    fn name(&self) -> &str {
        "unpacker"
    }

    /// Unpacks `archive` into the `destination` directory, returning what the tool printed
    ///
    /// ## Errors
    ///
    /// Fails if the tool can't be run or reports a failure
    fn unpack(&self, archive: &Path, destination: &Path) -> Result<String, ExtractError>;
}

/// Runs `unrar x <archive> <destination>/`
#[derive(Debug, Clone)]
pub struct Unrar {
    program: String,
    timeout: Option<Duration>,
}

impl Default for Unrar {
    fn default() -> Self {
        Self {
            program: String::from("unrar"),
            timeout: None,
        }
    }
}

impl Unrar {
    #[must_use]
    pub fn set_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    #[must_use]
    pub fn set_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Unpacker for Unrar {
    fn name(&self) -> &str {
        &self.program
    }

    fn unpack(&self, archive: &Path, destination: &Path) -> Result<String, ExtractError> {
        let mut command = Command::new(&self.program);
        // The trailing separator tells unrar the destination is a directory
        command.arg("x").arg(archive).arg(destination.join(""));

        let captured = process::run(&mut command, self.timeout)?;
        if !captured.success {
            return Err(ExtractError::UnpackFailed {
                program: self.program.clone(),
                output: captured.output(),
                status: captured.status,
            });
        }

        Ok(captured.output())
    }
}

/// End of central directory record signature
const END_OF_CENTRAL_DIRECTORY: &[u8] = b"PK\x05\x06";

/// The record is 22 bytes, followed by a comment of at most `u16::MAX` bytes
const END_RECORD_SEARCH: u64 = 22 + 65_535;

/// Structural check: the file ends with a zip end of central directory
/// record, whatever its extension
#[must_use]
pub fn is_zip(path: &Path) -> bool {
    read_tail(path).is_ok_and(|tail| {
        tail.windows(END_OF_CENTRAL_DIRECTORY.len())
            .any(|window| window == END_OF_CENTRAL_DIRECTORY)
    })
}

fn read_tail(path: &Path) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(END_RECORD_SEARCH)))?;

    let mut tail = Vec::new();
    file.read_to_end(&mut tail)?;

    Ok(tail)
}

/// Extracts `input` into `root`, which is expected to be an empty workspace.
///
/// Zip containers are read in-process, anything else goes through `unpacker`.
///
/// ## Errors
///
/// Fails on a corrupt zip, an entry escaping `root`, or a failing unpacker.
/// An unpacker that succeeds without producing any file is a failure as well.
pub fn extract(
    input: &Path,
    root: &Path,
    unpacker: &dyn Unpacker,
) -> Result<Extraction, ExtractError> {
    if is_zip(input) {
        debug!("unzipping {}", input.display());
        let entries = CbzReader::from_path(input)?.extract_to(root)?;

        return Ok(Extraction {
            kind: ArchiveKind::Zip,
            entries,
        });
    }

    debug!("unpacking {} with {}", input.display(), unpacker.name());
    let output = unpacker.unpack(input, root)?;
    trace!("{output}");

    let entries = list_entries(root)?;
    if entries.is_empty() {
        return Err(ExtractError::UnpackFailed {
            program: unpacker.name().to_string(),
            status: String::from("no files extracted"),
            output,
        });
    }

    Ok(Extraction {
        kind: ArchiveKind::Foreign,
        entries,
    })
}

fn list_entries(root: &Path) -> io::Result<Vec<ExtractedEntry>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            entries.push(ExtractedEntry {
                path: relative.to_path_buf(),
                size: entry.metadata()?.len(),
            });
        }
    }

    Ok(entries)
}

#[derive(Debug)]
pub struct CbzReader<R> {
    archive: ZipArchive<R>,
}

impl<R> CbzReader<R>
where
    R: Read + Seek,
{
    /// Creates `CbzReader` from a `Read`
    ///
    /// ## Errors
    ///
    /// Fails if the underlying `ZipArchive` can't be created
    pub fn from_reader(reader: R) -> Result<Self, ZipError> {
        let archive = ZipArchive::new(reader)?;

        Ok(Self { archive })
    }

    /// Extracts every entry below `root`, one by one.
    ///
    /// ## Errors
    ///
    /// Fails on the first entry that can't be read or written, or whose name
    /// would resolve outside of `root` (absolute or `..` paths)
    pub fn extract_to(&mut self, root: &Path) -> Result<Vec<ExtractedEntry>, ExtractError> {
        let mut entries = Vec::with_capacity(self.archive.len());

        for index in 0..self.archive.len() {
            let mut file = self.archive.by_index(index)?;
            let name = file.name().to_string();
            trace!("extracting {name}");

            let Some(relative) = file.enclosed_name().map(Path::to_path_buf) else {
                return Err(ExtractError::UnsafeEntryPath(name));
            };
            let target = root.join(&relative);
            let corrupt = |err: io::Error| ExtractError::ZipCorrupt {
                entry: Some(name.clone()),
                source: err.into(),
            };

            if file.is_dir() {
                fs::create_dir_all(&target).map_err(corrupt)?;
                continue;
            }

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(corrupt)?;
            }
            let mut out = File::create(&target).map_err(corrupt)?;
            let size = io::copy(&mut file, &mut out).map_err(corrupt)?;

            entries.push(ExtractedEntry {
                path: relative,
                size,
            });
        }

        Ok(entries)
    }
}

impl CbzReader<File> {
    /// Creates `CbzReader` from a path
    ///
    /// ## Errors
    ///
    /// Fails if the file can't be open or the underlying `ZipArchive` can't be created
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ZipError> {
        let file = File::open(path.as_ref())?;

        Self::from_reader(file)
    }
}

impl<R> Cbz for CbzReader<R>
where
    R: Read + Seek,
{
    fn len(&self) -> usize {
        self.archive.len()
    }
}
