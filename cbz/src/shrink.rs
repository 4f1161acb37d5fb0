use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::{
    errors::ShrinkError,
    image::{ImageProbe, ImageStat, ImageTransform},
};

/// Single pages are usually about 0.65 wide for 1 high, this brings the
/// threshold back to roughly `threshold_bytes` for them
pub static ASPECT_MULTIPLIER: f64 = 1.5;

pub static SHRINK_SUFFIX: &str = ".shrink.jpg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrinkOptions {
    pub threshold_bytes: u64,
    pub quality: u8,
    pub max_height: u32,
}

impl Default for ShrinkOptions {
    fn default() -> Self {
        Self {
            threshold_bytes: 300 * 1000,
            quality: 40,
            max_height: 1500,
        }
    }
}

impl ShrinkOptions {
    #[must_use]
    pub fn set_threshold_kb(mut self, kb: u64) -> Self {
        self.threshold_bytes = kb.saturating_mul(1000);
        self
    }

    #[must_use]
    pub fn set_quality(mut self, quality: u8) -> Self {
        self.quality = quality.min(100);
        self
    }

    #[must_use]
    pub fn set_max_height(mut self, max_height: u32) -> Self {
        self.max_height = max_height;
        self
    }

    /// Size above which a page with this geometry gets re-encoded
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn limit_for(&self, stat: &ImageStat) -> f64 {
        stat.aspect_ratio() * ASPECT_MULTIPLIER * self.threshold_bytes as f64
    }

    #[allow(clippy::cast_precision_loss)]
    fn needs_shrink(&self, stat: &ImageStat) -> bool {
        stat.size as f64 > self.limit_for(stat)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShrinkOutcome {
    /// Replaced by a smaller JPEG, now living at `path`
    Shrunk {
        path: PathBuf,
        old_size: u64,
        new_size: u64,
    },
    /// Small enough already
    Unchanged,
    /// Re-encoded but not saving enough, original kept
    Rejected { old_size: u64, new_size: u64 },
    SkippedUnsupported,
    SkippedNameClash,
    ProbeFailed,
    TransformFailed,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShrinkReport {
    pub shrunk: usize,
    pub unchanged: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Sizes of the replaced pages, before and after
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl ShrinkReport {
    fn record(&mut self, outcome: &ShrinkOutcome) {
        match outcome {
            ShrinkOutcome::Shrunk {
                old_size, new_size, ..
            } => {
                self.shrunk += 1;
                self.bytes_before += old_size;
                self.bytes_after += new_size;
            }
            ShrinkOutcome::Unchanged => self.unchanged += 1,
            ShrinkOutcome::Rejected { .. } => self.rejected += 1,
            ShrinkOutcome::SkippedUnsupported | ShrinkOutcome::SkippedNameClash => {
                self.skipped += 1;
            }
            ShrinkOutcome::ProbeFailed | ShrinkOutcome::TransformFailed => self.failed += 1,
        }
    }
}

/// Where a shrunk page ends up: same name with a `jpg` extension
#[must_use]
pub fn jpg_path(path: &Path) -> PathBuf {
    path.with_extension("jpg")
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(SHRINK_SUFFIX);
    PathBuf::from(name)
}

/// Only keeps a re-encoded page saving more than 10%
fn is_worth_it(old_size: u64, new_size: u64) -> bool {
    u128::from(new_size) * 10 < u128::from(old_size) * 9
}

pub struct Shrinker<'a> {
    probe: &'a dyn ImageProbe,
    transform: &'a dyn ImageTransform,
    options: ShrinkOptions,
}

impl<'a> Shrinker<'a> {
    #[must_use]
    pub fn new(
        probe: &'a dyn ImageProbe,
        transform: &'a dyn ImageTransform,
        options: ShrinkOptions,
    ) -> Self {
        Self {
            probe,
            transform,
            options,
        }
    }

    /// Re-encodes the page at `path` if it's an oversized JPEG or PNG.
    ///
    /// Probe and transform failures leave the page as it was and are only
    /// reported through the outcome.
    ///
    /// ## Errors
    ///
    /// Fails if the temporary file can't be removed, or if the original can't
    /// be replaced once the re-encoded page has been accepted
    pub fn shrink_if_needed(&self, path: &Path) -> Result<ShrinkOutcome, ShrinkError> {
        let stat = match self.probe.probe(path) {
            Ok(stat) => stat,
            Err(err) => {
                warn!("couldn't probe {}: {err}", path.display());
                return Ok(ShrinkOutcome::ProbeFailed);
            }
        };

        if !stat.kind.is_shrinkable() {
            debug!("not shrinking {} ({:?})", path.display(), stat.kind);
            return Ok(ShrinkOutcome::SkippedUnsupported);
        }

        let target = jpg_path(path);
        if path.extension().map_or(true, |extension| extension != "jpg") && target.exists() {
            warn!(
                "shrink name clash: {} -> {}",
                path.display(),
                target.display()
            );
            return Ok(ShrinkOutcome::SkippedNameClash);
        }

        if !self.options.needs_shrink(&stat) {
            return Ok(ShrinkOutcome::Unchanged);
        }

        let temporary = temporary_path(path);
        if let Err(err) = self.transform.transform(
            path,
            &temporary,
            self.options.quality,
            self.options.max_height,
        ) {
            warn!("couldn't shrink {}: {err}", path.display());
            remove_temporary(&temporary)?;
            return Ok(ShrinkOutcome::TransformFailed);
        }

        let old_size = fs::metadata(path)?.len();
        let new_size = fs::metadata(&temporary)?.len();

        if !is_worth_it(old_size, new_size) {
            debug!(
                "no shrink {}: {new_size}/{old_size}",
                path.display()
            );
            remove_temporary(&temporary)?;
            return Ok(ShrinkOutcome::Rejected { old_size, new_size });
        }

        fs::remove_file(path)?;
        fs::rename(&temporary, &target)?;
        info!("shrunk {}: {old_size} -> {new_size}", target.display());

        Ok(ShrinkOutcome::Shrunk {
            path: target,
            old_size,
            new_size,
        })
    }

    /// Runs `shrink_if_needed` once on each of `files`, relative to `root`.
    ///
    /// The list is taken as given: pages renamed along the way are not visited again.
    ///
    /// ## Errors
    ///
    /// Stops at the first error `shrink_if_needed` returns
    pub fn shrink_all(&self, root: &Path, files: &[PathBuf]) -> Result<ShrinkReport, ShrinkError> {
        let mut report = ShrinkReport::default();

        for file in files {
            let outcome = self.shrink_if_needed(&root.join(file))?;
            report.record(&outcome);
        }

        Ok(report)
    }
}

fn remove_temporary(path: &Path) -> Result<(), ShrinkError> {
    if !path.exists() {
        return Ok(());
    }

    fs::remove_file(path).map_err(|source| ShrinkError::Cleanup {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::image::ImageKind;

    /// Reports the real size with fixed geometry and kind
    struct FakeProbe {
        kind: ImageKind,
        width: u32,
        height: u32,
    }

    impl FakeProbe {
        fn jpeg(width: u32, height: u32) -> Self {
            Self {
                kind: ImageKind::Jpeg,
                width,
                height,
            }
        }
    }

    impl ImageProbe for FakeProbe {
        fn probe(&self, path: &Path) -> Result<ImageStat, ShrinkError> {
            Ok(ImageStat {
                size: fs::metadata(path)?.len(),
                extension: path
                    .extension()
                    .map(|extension| extension.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                kind: self.kind.clone(),
                width: self.width,
                height: self.height,
            })
        }
    }

    struct BrokenProbe;

    impl ImageProbe for BrokenProbe {
        fn probe(&self, path: &Path) -> Result<ImageStat, ShrinkError> {
            Err(ShrinkError::Probe {
                path: path.to_path_buf(),
                output: String::from("identify: no decode delegate"),
            })
        }
    }

    /// Writes `size` bytes, or fails after writing them when `fail` is set
    struct FakeTransform {
        size: usize,
        fail: bool,
        calls: Cell<usize>,
    }

    impl FakeTransform {
        fn writing(size: usize) -> Self {
            Self {
                size,
                fail: false,
                calls: Cell::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                size: 10,
                fail: true,
                calls: Cell::new(0),
            }
        }
    }

    impl ImageTransform for FakeTransform {
        fn transform(
            &self,
            source: &Path,
            destination: &Path,
            _quality: u8,
            _max_height: u32,
        ) -> Result<(), ShrinkError> {
            self.calls.set(self.calls.get() + 1);
            fs::write(destination, vec![0; self.size])?;
            if self.fail {
                return Err(ShrinkError::Transform {
                    path: source.to_path_buf(),
                    output: String::from("convert: corrupt image"),
                });
            }
            Ok(())
        }
    }

    fn options(threshold_bytes: u64) -> ShrinkOptions {
        ShrinkOptions {
            threshold_bytes,
            ..ShrinkOptions::default()
        }
    }

    fn page(root: &Path, name: &str, size: usize) -> PathBuf {
        let path = root.join(name);
        fs::write(&path, vec![1; size]).unwrap();
        path
    }

    #[test]
    fn limit_scales_with_aspect_ratio() {
        let stat = ImageStat {
            size: 0,
            extension: String::from("jpg"),
            kind: ImageKind::Jpeg,
            width: 1000,
            height: 1500,
        };
        let limit = ShrinkOptions::default().limit_for(&stat);
        assert!((limit - 300_000.0).abs() < 1e-6);
        assert_eq!(ShrinkOptions::default().set_threshold_kb(100).threshold_bytes, 100_000);
    }

    #[test]
    fn undersized_page_is_left_alone() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = page(temp_dir.path(), "001.jpg", 1000);
        // limit is 1 * 1.5 * 1000 = 1500 bytes
        let probe = FakeProbe::jpeg(100, 100);
        let transform = FakeTransform::writing(10);

        let outcome = Shrinker::new(&probe, &transform, options(1000))
            .shrink_if_needed(&path)
            .unwrap();

        assert_eq!(outcome, ShrinkOutcome::Unchanged);
        assert_eq!(transform.calls.get(), 0);
        assert_eq!(fs::read(&path).unwrap().len(), 1000);
    }

    #[test]
    fn oversized_png_becomes_a_jpeg() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = page(temp_dir.path(), "001.png", 2000);
        let probe = FakeProbe {
            kind: ImageKind::Png,
            width: 100,
            height: 100,
        };
        let transform = FakeTransform::writing(500);

        let outcome = Shrinker::new(&probe, &transform, options(1000))
            .shrink_if_needed(&path)
            .unwrap();

        let target = temp_dir.path().join("001.jpg");
        assert_eq!(
            outcome,
            ShrinkOutcome::Shrunk {
                path: target.clone(),
                old_size: 2000,
                new_size: 500,
            }
        );
        assert!(!path.exists());
        assert_eq!(fs::read(&target).unwrap().len(), 500);
        assert!(!temp_dir.path().join("001.png.shrink.jpg").exists());
    }

    #[test]
    fn exactly_ninety_percent_is_not_enough() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = page(temp_dir.path(), "001.jpg", 2000);
        let probe = FakeProbe::jpeg(100, 100);

        let transform = FakeTransform::writing(1800);
        let outcome = Shrinker::new(&probe, &transform, options(1000))
            .shrink_if_needed(&path)
            .unwrap();
        assert_eq!(
            outcome,
            ShrinkOutcome::Rejected {
                old_size: 2000,
                new_size: 1800,
            }
        );
        assert_eq!(fs::read(&path).unwrap(), vec![1; 2000]);
        assert!(!temp_dir.path().join("001.jpg.shrink.jpg").exists());

        let transform = FakeTransform::writing(1799);
        let outcome = Shrinker::new(&probe, &transform, options(1000))
            .shrink_if_needed(&path)
            .unwrap();
        assert!(matches!(outcome, ShrinkOutcome::Shrunk { new_size: 1799, .. }));
        assert_eq!(fs::read(&path).unwrap().len(), 1799);
    }

    #[test]
    fn name_clash_leaves_both_pages() {
        let temp_dir = tempfile::tempdir().unwrap();
        let png = page(temp_dir.path(), "page.png", 2000);
        let jpg = page(temp_dir.path(), "page.jpg", 100);
        let probe = FakeProbe {
            kind: ImageKind::Png,
            width: 100,
            height: 100,
        };
        let transform = FakeTransform::writing(10);

        let outcome = Shrinker::new(&probe, &transform, options(1000))
            .shrink_if_needed(&png)
            .unwrap();

        assert_eq!(outcome, ShrinkOutcome::SkippedNameClash);
        assert_eq!(transform.calls.get(), 0);
        assert_eq!(fs::read(&png).unwrap().len(), 2000);
        assert_eq!(fs::read(&jpg).unwrap().len(), 100);
    }

    #[test]
    fn unsupported_kinds_are_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = page(temp_dir.path(), "anim.gif", 20_000);
        let probe = FakeProbe {
            kind: ImageKind::Other(String::from("GIF")),
            width: 100,
            height: 100,
        };
        let transform = FakeTransform::writing(10);

        let outcome = Shrinker::new(&probe, &transform, options(1000))
            .shrink_if_needed(&path)
            .unwrap();

        assert_eq!(outcome, ShrinkOutcome::SkippedUnsupported);
        assert_eq!(transform.calls.get(), 0);
    }

    #[test]
    fn probe_failure_keeps_the_page() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = page(temp_dir.path(), "001.jpg", 2000);
        let transform = FakeTransform::writing(10);

        let outcome = Shrinker::new(&BrokenProbe, &transform, options(1000))
            .shrink_if_needed(&path)
            .unwrap();

        assert_eq!(outcome, ShrinkOutcome::ProbeFailed);
        assert!(path.exists());
    }

    #[test]
    fn transform_failure_cleans_up() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = page(temp_dir.path(), "001.jpg", 2000);
        let probe = FakeProbe::jpeg(100, 100);
        let transform = FakeTransform::failing();

        let outcome = Shrinker::new(&probe, &transform, options(1000))
            .shrink_if_needed(&path)
            .unwrap();

        assert_eq!(outcome, ShrinkOutcome::TransformFailed);
        assert_eq!(fs::read(&path).unwrap().len(), 2000);
        assert!(!temp_dir.path().join("001.jpg.shrink.jpg").exists());
    }

    #[test]
    fn page_without_extension_gets_one() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = page(temp_dir.path(), "cover", 2000);
        let probe = FakeProbe::jpeg(100, 100);
        let transform = FakeTransform::writing(100);

        let outcome = Shrinker::new(&probe, &transform, options(1000))
            .shrink_if_needed(&path)
            .unwrap();

        assert!(matches!(outcome, ShrinkOutcome::Shrunk { .. }));
        assert!(temp_dir.path().join("cover.jpg").exists());
        assert!(!path.exists());
    }

    #[test]
    fn every_page_is_visited_once() {
        let temp_dir = tempfile::tempdir().unwrap();
        page(temp_dir.path(), "001.png", 2000);
        page(temp_dir.path(), "002.jpg", 2000);
        page(temp_dir.path(), "003.jpg", 10);
        let probe = FakeProbe::jpeg(100, 100);
        let transform = FakeTransform::writing(100);

        let files = vec![
            PathBuf::from("001.png"),
            PathBuf::from("002.jpg"),
            PathBuf::from("003.jpg"),
        ];
        let report = Shrinker::new(&probe, &transform, options(1000))
            .shrink_all(temp_dir.path(), &files)
            .unwrap();

        assert_eq!(transform.calls.get(), 2);
        assert_eq!(report.shrunk, 2);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.bytes_before, 4000);
        assert_eq!(report.bytes_after, 200);
        assert!(temp_dir.path().join("001.jpg").exists());
    }
}
