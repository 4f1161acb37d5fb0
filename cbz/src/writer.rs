use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Read, Seek, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, trace, warn};
use zip::{write::FileOptions, CompressionMethod, DateTime, ZipWriter};

use crate::{errors::WriteError, Cbz};

/// Pages are already compressed images, entries are stored as is.
/// The fixed timestamp makes the output depend on the pages only.
fn stored_file_options() -> FileOptions {
    FileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644)
}

pub struct CbzWriter<W: Write + Seek> {
    archive: ZipWriter<W>,
    size: usize,
}

impl<W> CbzWriter<W>
where
    W: Write + Seek,
{
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            archive: ZipWriter::new(writer),
            size: 0,
        }
    }

    /// Adds a stored entry named `name` with the whole content of `reader`
    ///
    /// ## Errors
    ///
    /// Fails if the entry can't be started or the content can't be copied
    pub fn insert_from_reader(
        &mut self,
        name: &str,
        reader: &mut impl Read,
    ) -> Result<u64, WriteError> {
        self.archive.start_file(name, stored_file_options())?;

        let written = io::copy(reader, &mut self.archive).map_err(|source| WriteError::Entry {
            name: name.to_string(),
            source,
        })?;

        self.size += 1;

        Ok(written)
    }

    /// Writes the central directory and hands back the underlying writer
    ///
    /// ## Errors
    ///
    /// Same errors as the underlying `ZipWriter::finish` method
    pub fn finish(mut self) -> Result<W, WriteError> {
        Ok(self.archive.finish()?)
    }
}

impl<W> Cbz for CbzWriter<W>
where
    W: Write + Seek,
{
    fn len(&self) -> usize {
        self.size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub entries: Vec<String>,
    pub bytes: u64,
}

/// Non-breaking spaces turned into spaces, anything outside printable ASCII turned into `?`
#[must_use]
pub fn ascii_lossy(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{a0}' => ' ',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '?',
        })
        .collect()
}

/// Name of a workspace file inside the archive: `/` separated and `ascii_lossy`
#[must_use]
pub fn archive_name(relative: &Path) -> String {
    let joined = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    ascii_lossy(&joined)
}

/// Writes `files` (relative to `root`) into a new stored archive at `output`,
/// sorted by path so the result doesn't depend on how they were listed.
///
/// ## Errors
///
/// Fails if `output` already exists or any file can't be added. In the latter
/// case the partial archive is removed.
pub fn write_archive(
    root: &Path,
    files: &[PathBuf],
    output: &Path,
) -> Result<WriteReport, WriteError> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(output)
        .map_err(|err| {
            if err.kind() == io::ErrorKind::AlreadyExists {
                WriteError::AlreadyExists(output.to_path_buf())
            } else {
                err.into()
            }
        })?;

    debug!("creating {}", output.display());
    write_entries(root, files, file).map_err(|err| {
        if let Err(rm_err) = fs::remove_file(output) {
            warn!("couldn't remove partial archive {}: {rm_err}", output.display());
        }
        err
    })
}

fn write_entries(root: &Path, files: &[PathBuf], file: File) -> Result<WriteReport, WriteError> {
    let mut files = files.to_vec();
    files.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));

    let mut writer = CbzWriter::new(BufWriter::new(file));
    let mut entries = Vec::with_capacity(files.len());

    for relative in &files {
        let name = archive_name(relative);
        trace!("adding {name}");

        let mut source =
            File::open(root.join(relative)).map_err(|source| WriteError::Entry {
                name: name.clone(),
                source,
            })?;
        writer.insert_from_reader(&name, &mut source)?;
        entries.push(name);
    }

    let file = writer
        .finish()?
        .into_inner()
        .map_err(io::IntoInnerError::into_error)?;
    let bytes = file.metadata()?.len();

    Ok(WriteReport { entries, bytes })
}
