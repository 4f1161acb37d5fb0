#![allow(dead_code)]

use std::{
    cell::Cell,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    rc::Rc,
};

use cbz::{errors::ExtractError, reader::Unpacker};
use image::{ImageFormat, Rgb, RgbImage};
use tempfile::TempDir;
use zip::{write::FileOptions, CompressionMethod, ZipArchive, ZipWriter};

pub fn temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("cbz-test-")
        .tempdir()
        .expect("Failed to create temp dir")
}

/// Writes a deflated zip holding `entries`, in the given order
pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, content) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(content).unwrap();
    }
    zip.finish().unwrap();
}

/// Entry names and contents, in archive order
pub fn read_zip(path: &Path) -> Vec<(String, Vec<u8>)> {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .map(|index| {
            let mut file = archive.by_index(index).unwrap();
            let mut content = Vec::new();
            file.read_to_end(&mut content).unwrap();
            (file.name().to_string(), content)
        })
        .collect()
}

pub fn compression_methods(path: &Path) -> Vec<CompressionMethod> {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .map(|index| archive.by_index(index).unwrap().compression())
        .collect()
}

fn noise(width: u32, height: u32) -> RgbImage {
    let mut state: u32 = 0x1234_5678;
    let mut next = move || {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        (state >> 24) as u8
    };
    RgbImage::from_fn(width, height, |_, _| Rgb([next(), next(), next()]))
}

fn encode(page: &RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut bytes = std::io::Cursor::new(Vec::new());
    page.write_to(&mut bytes, format).unwrap();
    bytes.into_inner()
}

/// A PNG full of noise, which compresses badly
pub fn noisy_png(width: u32, height: u32) -> Vec<u8> {
    encode(&noise(width, height), ImageFormat::Png)
}

pub fn noisy_jpeg(width: u32, height: u32) -> Vec<u8> {
    encode(&noise(width, height), ImageFormat::Jpeg)
}

/// Stands in for `unrar`: writes its files into the destination and counts calls
#[derive(Clone, Default)]
pub struct FakeRar {
    files: Vec<(String, Vec<u8>)>,
    pub calls: Rc<Cell<usize>>,
}

impl FakeRar {
    pub fn with_files(files: &[(&str, &[u8])]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(name, content)| ((*name).to_string(), content.to_vec()))
                .collect(),
            calls: Rc::default(),
        }
    }
}

impl Unpacker for FakeRar {
    fn name(&self) -> &str {
        "fake-rar"
    }

    fn unpack(&self, archive: &Path, destination: &Path) -> Result<String, ExtractError> {
        self.calls.set(self.calls.get() + 1);
        if fs::read(archive)?.starts_with(b"broken") {
            return Err(ExtractError::UnpackFailed {
                program: String::from("fake-rar"),
                status: String::from("exit status: 3"),
                output: String::from("CRC failed"),
            });
        }

        for (name, content) in &self.files {
            let target = destination.join(name);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(target, content)?;
        }

        Ok(format!("extracted {} files", self.files.len()))
    }
}

pub fn files_below(root: &Path) -> Vec<PathBuf> {
    let mut files = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.path().to_path_buf())
        .collect::<Vec<_>>();
    files.sort();
    files
}
