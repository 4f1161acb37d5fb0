use std::{
    fs,
    path::{Path, PathBuf},
};

use regex::{Regex, RegexBuilder};
use tracing::{debug, trace};

use crate::{errors::FilterError, Result};

/// An ordered list of regular expressions, searched (not fully matched) against text
#[derive(Debug, Clone, Default)]
pub struct Patterns(Vec<Regex>);

impl Patterns {
    /// ## Errors
    ///
    /// Fails if any pattern is not a valid regular expression
    pub fn new<I, S>(patterns: I, case_sensitive: bool) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| {
                RegexBuilder::new(pattern.as_ref().trim_end())
                    .case_insensitive(!case_sensitive)
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self(patterns))
    }

    /// Reads one pattern per line, blank lines are ignored
    ///
    /// ## Errors
    ///
    /// Fails if the file can't be read or holds an invalid pattern
    pub fn from_file(path: impl AsRef<Path>, case_sensitive: bool) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;

        Self::new(
            content.lines().filter(|line| !line.trim().is_empty()),
            case_sensitive,
        )
    }

    pub fn extend(&mut self, other: Patterns) {
        self.0.extend(other.0);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First pattern, in list order, found anywhere in `haystack`
    #[must_use]
    pub fn first_match(&self, haystack: &str) -> Option<&Regex> {
        self.0.iter().find(|pattern| pattern.is_match(haystack))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageDecision {
    Kept,
    Excluded,
}

/// Include and exclude lists applied together
#[derive(Debug, Clone, Default)]
pub struct Selection {
    include: Patterns,
    exclude: Patterns,
}

impl Selection {
    #[must_use]
    pub fn new(include: Patterns, exclude: Patterns) -> Self {
        Self { include, exclude }
    }

    /// Everything is kept
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// A non-empty include list must match, then any exclude match drops the text
    #[must_use]
    pub fn decide(&self, text: &str) -> PageDecision {
        if !self.include.is_empty() && self.include.first_match(text).is_none() {
            return PageDecision::Excluded;
        }

        if let Some(pattern) = self.exclude.first_match(text) {
            trace!("{text} excluded by {pattern}");
            return PageDecision::Excluded;
        }

        PageDecision::Kept
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilterReport {
    pub kept: Vec<PathBuf>,
    pub excluded: Vec<PathBuf>,
}

/// Decides every file by its leaf name and deletes the excluded ones right away.
///
/// `files` are relative to `root`.
///
/// ## Errors
///
/// Fails if an excluded file can't be removed
pub fn filter_pages(
    root: &Path,
    files: Vec<PathBuf>,
    selection: &Selection,
) -> Result<FilterReport, FilterError> {
    let mut report = FilterReport::default();

    for file in files {
        let leaf = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        match selection.decide(&leaf) {
            PageDecision::Kept => report.kept.push(file),
            PageDecision::Excluded => {
                debug!("excluding page {}", file.display());
                let path = root.join(&file);
                fs::remove_file(&path).map_err(|source| FilterError::Remove { path, source })?;
                report.excluded.push(file);
            }
        }
    }

    Ok(report)
}
