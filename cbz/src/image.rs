use std::{
    fmt::Display,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use image::{
    codecs::jpeg::JpegEncoder, imageops::FilterType, io::Reader as ImageReader, ColorType,
    DynamicImage, ImageFormat,
};
use tracing::{debug, trace};

use crate::{errors::ShrinkError, process};

/// Which tools measure and re-encode pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ImageBackend {
    /// ImageMagick's `identify` and `convert`
    #[default]
    Magick,
    /// In-process decoding and encoding
    Native,
}

impl Display for ImageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Magick => "magick",
                Self::Native => "native",
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Other(String),
}

impl ImageKind {
    fn from_magick(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "JPEG" | "JPG" => Self::Jpeg,
            "PNG" => Self::Png,
            other => Self::Other(other.to_string()),
        }
    }

    fn from_format(format: ImageFormat) -> Self {
        match format {
            ImageFormat::Jpeg => Self::Jpeg,
            ImageFormat::Png => Self::Png,
            other => Self::Other(format!("{other:?}").to_ascii_uppercase()),
        }
    }

    /// Only these get re-encoded
    #[must_use]
    pub fn is_shrinkable(&self) -> bool {
        matches!(self, Self::Jpeg | Self::Png)
    }
}

/// What a probe learnt about a page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageStat {
    pub size: u64,
    pub extension: String,
    pub kind: ImageKind,
    pub width: u32,
    pub height: u32,
}

impl ImageStat {
    #[must_use]
    pub fn aspect_ratio(&self) -> f64 {
        f64::from(self.width) / f64::from(self.height)
    }
}

/// Parses `identify -format "%b %e %m %W %H"` output, e.g. `482113B jpg JPEG 1200 1800`.
///
/// The extension may be empty, so fields are split on single spaces.
///
/// ## Errors
///
/// Fails if a field is missing or malformed, or if a dimension is zero
pub fn parse_identify(output: &str) -> Result<ImageStat, ShrinkError> {
    let parse_error = || ShrinkError::ProbeParse(output.to_string());

    let line = output.trim_end_matches(|c: char| c == '\n' || c == '\r');
    let fields = line.split(' ').collect::<Vec<_>>();
    let [size, extension, kind, width, height] = fields.as_slice() else {
        return Err(parse_error());
    };

    let size = size
        .strip_suffix('B')
        .unwrap_or(size)
        .parse::<u64>()
        .map_err(|_| parse_error())?;
    let width = width.parse::<u32>().map_err(|_| parse_error())?;
    let height = height.parse::<u32>().map_err(|_| parse_error())?;
    if width == 0 || height == 0 {
        return Err(parse_error());
    }

    Ok(ImageStat {
        size,
        extension: (*extension).to_string(),
        kind: ImageKind::from_magick(kind),
        width,
        height,
    })
}

pub trait ImageProbe {
    /// ## Errors
    ///
    /// Fails if the file can't be measured
    fn probe(&self, path: &Path) -> Result<ImageStat, ShrinkError>;
}

pub trait ImageTransform {
    /// Re-encodes `source` as a JPEG at `destination`, downscaling it to at most
    /// `max_height` pixels high while keeping its aspect ratio.
    ///
    /// ## Errors
    ///
    /// Fails if the image can't be decoded, encoded or written
    fn transform(
        &self,
        source: &Path,
        destination: &Path,
        quality: u8,
        max_height: u32,
    ) -> Result<(), ShrinkError>;
}

/// ImageMagick, run as subprocesses
#[derive(Debug, Clone)]
pub struct Magick {
    identify: String,
    convert: String,
    timeout: Option<Duration>,
}

impl Default for Magick {
    fn default() -> Self {
        Self {
            identify: String::from("identify"),
            convert: String::from("convert"),
            timeout: None,
        }
    }
}

impl Magick {
    #[must_use]
    pub fn set_identify(mut self, identify: impl Into<String>) -> Self {
        self.identify = identify.into();
        self
    }

    #[must_use]
    pub fn set_convert(mut self, convert: impl Into<String>) -> Self {
        self.convert = convert.into();
        self
    }

    #[must_use]
    pub fn set_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl ImageProbe for Magick {
    fn probe(&self, path: &Path) -> Result<ImageStat, ShrinkError> {
        let mut command = Command::new(&self.identify);
        command
            .args(["-precision", "16", "-format", "%b %e %m %W %H", "-quiet"])
            .arg(path);

        let captured = process::run(&mut command, self.timeout)?;
        if !captured.success {
            return Err(ShrinkError::Probe {
                path: path.to_path_buf(),
                output: captured.output(),
            });
        }
        if !captured.stderr.is_empty() {
            trace!("{}: {}", self.identify, captured.stderr);
        }

        parse_identify(&captured.stdout)
    }
}

impl ImageTransform for Magick {
    fn transform(
        &self,
        source: &Path,
        destination: &Path,
        quality: u8,
        max_height: u32,
    ) -> Result<(), ShrinkError> {
        let mut command = Command::new(&self.convert);
        command
            .arg(source)
            .arg("-quality")
            .arg(quality.to_string())
            .arg("-resize")
            .arg(format!("x{max_height}>"))
            .arg(destination);

        let captured = process::run(&mut command, self.timeout)?;
        if !captured.success {
            return Err(ShrinkError::Transform {
                path: source.to_path_buf(),
                output: captured.output(),
            });
        }

        Ok(())
    }
}

/// In-process backend built on the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct Native;

impl ImageProbe for Native {
    fn probe(&self, path: &Path) -> Result<ImageStat, ShrinkError> {
        let size = fs::metadata(path)?.len();
        let reader = ImageReader::open(path)?.with_guessed_format()?;
        let Some(format) = reader.format() else {
            return Err(ShrinkError::Probe {
                path: path.to_path_buf(),
                output: String::from("unknown image format"),
            });
        };
        let (width, height) = reader.into_dimensions()?;
        if width == 0 || height == 0 {
            return Err(ShrinkError::ProbeParse(format!("{width}x{height}")));
        }

        Ok(ImageStat {
            size,
            extension: path
                .extension()
                .map(|extension| extension.to_string_lossy().into_owned())
                .unwrap_or_default(),
            kind: ImageKind::from_format(format),
            width,
            height,
        })
    }
}

impl ImageTransform for Native {
    fn transform(
        &self,
        source: &Path,
        destination: &Path,
        quality: u8,
        max_height: u32,
    ) -> Result<(), ShrinkError> {
        Image::open(source)?
            .fit_height(max_height)
            .write_jpeg(destination, quality)
    }
}

#[derive(Debug, PartialEq)]
pub struct Image {
    dynamic_image: DynamicImage,
}

impl Image {
    /// ## Errors
    ///
    /// Fails if the image can't be open or decoded
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ShrinkError> {
        let reader = ImageReader::open(&path)?.with_guessed_format()?;
        Ok(Self::from_dynamic_image(reader.decode()?))
    }

    fn from_dynamic_image(dynamic_image: DynamicImage) -> Self {
        Self { dynamic_image }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.dynamic_image.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.dynamic_image.height()
    }

    /// Downscales to `max_height`, never upscales
    #[must_use]
    pub fn fit_height(self, max_height: u32) -> Self {
        let (width, height) = (self.width(), self.height());
        if max_height == 0 || height <= max_height {
            return self;
        }

        let new_width = (u64::from(width) * u64::from(max_height) + u64::from(height) / 2)
            / u64::from(height);
        let new_width = u32::try_from(new_width.max(1)).unwrap_or(u32::MAX);
        debug!("resizing {width}x{height} to {new_width}x{max_height}");

        Self::from_dynamic_image(self.dynamic_image.resize_exact(
            new_width,
            max_height,
            FilterType::Lanczos3,
        ))
    }

    /// ## Errors
    ///
    /// Fails if the file can't be created or the image can't be encoded
    pub fn write_jpeg(&self, path: impl Into<PathBuf>, quality: u8) -> Result<(), ShrinkError> {
        let rgb = self.dynamic_image.to_rgb8();
        let mut out = BufWriter::new(File::create(path.into())?);

        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            ColorType::Rgb8,
        )?;
        out.flush()?;

        Ok(())
    }
}
