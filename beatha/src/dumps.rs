//! Dump artifacts on disk.
//!
//! Layout under the dump root:
//!
//! ```text
//! <root>/
//!   Shredder_4.4.0/
//!     dump_20240301-101500.txt
//!   Unknown_Device_unknown/
//!     diagnostic_20240301-101700.txt
//! ```
//!
//! The core only ever creates files here. Reads go through
//! [`DumpStore::read`], which refuses anything that canonicalizes outside
//! the root.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::{debug, info};

use crate::error::{Error, Result};

/// Directory used when no firmware signature matched.
pub const UNKNOWN_DEVICE_DIR: &str = "Unknown_Device_unknown";

/// Longest sanitized path component.
pub const MAX_COMPONENT_LEN: usize = 64;

const FORBIDDEN_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Make `input` safe to use as a single path component.
///
/// Strips path separators, shell/Windows-reserved characters and control
/// characters, collapses whitespace runs into `_`, trims dots and
/// underscores at both ends and caps the length. Never returns an empty
/// string.
pub fn sanitize(input: &str) -> String {
    let kept: String = input
        .chars()
        .filter(|c| !FORBIDDEN_CHARS.contains(c) && !c.is_control())
        .collect();
    let joined = kept.split_whitespace().collect::<Vec<_>>().join("_");
    let capped: String = joined
        .trim_matches(['.', '_'])
        .chars()
        .take(MAX_COMPONENT_LEN)
        .collect();
    let trimmed = capped.trim_matches(['.', '_']);

    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Directory name of an artifact: `sanitize(name)_sanitize(version)`.
pub fn artifact_dir_name(name: &str, version: Option<&str>) -> String {
    format!("{}_{}", sanitize(name), sanitize(version.unwrap_or_default()))
}

/// `dump_YYYYMMDD-HHMMSS.txt`
pub fn dump_file_name(at: &DateTime<Local>) -> String {
    format!("dump_{}.txt", at.format("%Y%m%d-%H%M%S"))
}

/// `diagnostic_YYYYMMDD-HHMMSS.txt`
pub fn diagnostic_file_name(at: &DateTime<Local>) -> String {
    format!("diagnostic_{}.txt", at.format("%Y%m%d-%H%M%S"))
}

/// Kind of a stored artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DumpKind {
    /// Configuration dump.
    Dump,
    /// Diagnostic report of an unidentified device.
    Diagnostic,
}

/// Metadata of one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DumpEntry {
    /// Path relative to the dump root, `/`-separated.
    pub path: String,
    /// Artifact directory (device name and version).
    pub device: String,
    /// File name.
    pub file_name: String,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: Option<DateTime<Local>>,
    /// Dump or diagnostic.
    pub kind: DumpKind,
}

/// Read/write access to the dump root.
#[derive(Debug, Clone)]
pub struct DumpStore {
    root: PathBuf,
}

impl DumpStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Dump root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a new artifact file and return its metadata.
    pub fn write_artifact(&self, dir_name: &str, file_name: &str, contents: &str) -> Result<DumpEntry> {
        let single = Path::new(dir_name).components().count() == 1 && lexically_inside(Path::new(dir_name));
        if !single || dir_name.contains(['/', '\\']) || file_name.contains(['/', '\\']) {
            return Err(Error::PathOutsideDumpRoot(PathBuf::from(dir_name).join(file_name)));
        }
        let dir = self.root.join(dir_name);
        fs::create_dir_all(&dir)?;
        let path = dir.join(file_name);
        fs::write(&path, contents)?;
        info!("Saved {} ({} bytes)", path.display(), contents.len());
        self.entry_for(&path)
    }

    /// Metadata of a file inside the root.
    pub fn entry_for(&self, path: &Path) -> Result<DumpEntry> {
        let meta = fs::metadata(path)?;
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| Error::PathOutsideDumpRoot(path.to_path_buf()))?;
        let file_name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let device = relative
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let kind = if file_name.starts_with("diagnostic_") {
            DumpKind::Diagnostic
        } else {
            DumpKind::Dump
        };

        Ok(DumpEntry {
            path: relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            device,
            file_name,
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Local>::from),
            kind,
        })
    }

    /// Every `.txt` artifact, newest first.
    ///
    /// A missing root is an empty listing.
    pub fn list(&self) -> Result<Vec<DumpEntry>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for dir in fs::read_dir(&self.root)? {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(dir.path())? {
                let path = file?.path();
                if path.is_file() && path.extension().is_some_and(|e| e == "txt") {
                    entries.push(self.entry_for(&path)?);
                }
            }
        }

        entries.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| b.file_name.cmp(&a.file_name))
        });
        debug!("Listed {} artifacts under {}", entries.len(), self.root.display());
        Ok(entries)
    }

    /// Most recent artifact, if any.
    pub fn latest(&self) -> Result<Option<DumpEntry>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Resolve `path` (relative to the root, or absolute) to a file inside
    /// the root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let root = self.root.canonicalize()?;
        let requested = Path::new(path);
        let candidate = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            root.join(requested)
        };

        let resolved = match candidate.canonicalize() {
            Ok(p) => p,
            // `..` that escapes the root is rejected before existence matters.
            Err(_) if !lexically_inside(requested) => {
                return Err(Error::PathOutsideDumpRoot(requested.to_path_buf()));
            },
            Err(e) => return Err(e.into()),
        };

        if !resolved.starts_with(&root) || !resolved.is_file() {
            return Err(Error::PathOutsideDumpRoot(requested.to_path_buf()));
        }
        Ok(resolved)
    }

    /// Read one artifact as text.
    pub fn read(&self, path: &str) -> Result<String> {
        let resolved = self.resolve(path)?;
        let bytes = fs::read(resolved)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Whether a relative path can never climb above its base.
fn lexically_inside(path: &Path) -> bool {
    use std::path::Component;

    if path.is_absolute() {
        return false;
    }
    let mut depth = 0i32;
    for component in path.components() {
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            _ => {},
        }
        if depth < 0 {
            return false;
        }
    }
    true
}
