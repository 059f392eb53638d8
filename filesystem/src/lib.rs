//! Path-allow-listed filesystem operations.
//!
//! Every operation resolves its path lexically (no symlink chasing; the OS
//! permission model is the final arbiter) and requires it to sit inside one
//! of the configured root directories.

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use globset::Glob;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::info;
use walkdir::WalkDir;

/// Hard cap on glob search hits so a broad pattern over a deep tree cannot
/// produce an unbounded response.
const SEARCH_RESULT_CAP: usize = 1000;

pub type Result<T> = std::result::Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("path is outside the allowed directories: {0}")]
    NotAllowed(PathBuf),

    #[error("path not found: {0}")]
    NotFound(PathBuf),

    #[error("filesystem error on {path}: {error}")]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },
}

impl FsError {
    fn io(path: &Path, error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path.to_path_buf())
        } else {
            Self::Io {
                path: path.to_path_buf(),
                error,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub kind: EntryKind,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Other,
}

/// One find/replace operation for [`FilesystemService::edit_text_file`].
#[derive(Debug, Clone)]
pub struct TextEdit {
    /// Exact text to find; the first occurrence is replaced.
    pub old_text: String,
    pub new_text: String,
}

/// Per-edit outcome of an edit batch.
#[derive(Debug, Clone, Serialize)]
pub struct EditOutcome {
    pub old_text: String,
    pub new_text: String,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EditReport {
    pub changes: Vec<EditOutcome>,
    pub content_changed: bool,
    /// The would-be file content; populated only on a dry run.
    pub preview: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub readonly: bool,
}

pub struct FilesystemService {
    allowed: Vec<PathBuf>,
}

impl FilesystemService {
    /// At least one allowed directory is required; entries must be absolute.
    pub fn new(allowed_dirs: Vec<PathBuf>) -> Result<Self> {
        if allowed_dirs.is_empty() {
            return Err(FsError::InvalidArgument(
                "at least one allowed directory is required".to_string(),
            ));
        }
        let mut allowed = Vec::with_capacity(allowed_dirs.len());
        for dir in allowed_dirs {
            if !dir.is_absolute() {
                return Err(FsError::InvalidArgument(format!(
                    "allowed directory must be absolute: {}",
                    dir.display()
                )));
            }
            allowed.push(normalize(&dir));
        }
        info!(
            "filesystem service allows: {}",
            allowed
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(Self { allowed })
    }

    pub fn allowed_directories(&self) -> &[PathBuf] {
        &self.allowed
    }

    pub fn is_path_allowed(&self, path: &Path) -> bool {
        if !path.is_absolute() {
            return false;
        }
        let normalized = normalize(path);
        self.allowed.iter().any(|root| normalized.starts_with(root))
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        if !path.is_absolute() {
            return Err(FsError::InvalidArgument(format!(
                "path must be absolute: {}",
                path.display()
            )));
        }
        let normalized = normalize(path);
        if self.allowed.iter().any(|root| normalized.starts_with(root)) {
            Ok(normalized)
        } else {
            Err(FsError::NotAllowed(normalized))
        }
    }

    pub async fn read_text_file(&self, path: &Path) -> Result<String> {
        let path = self.resolve(path)?;
        fs::read_to_string(&path).await.map_err(|err| FsError::io(&path, err))
    }

    /// Per-path results; one unreadable file does not fail the batch.
    pub async fn read_multiple_text_files(
        &self,
        paths: &[PathBuf],
    ) -> Vec<(PathBuf, Result<String>)> {
        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            results.push((path.clone(), self.read_text_file(path).await));
        }
        results
    }

    pub async fn write_text_file(&self, path: &Path, content: &str) -> Result<()> {
        let path = self.resolve(path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| FsError::io(parent, err))?;
        }
        fs::write(&path, content).await.map_err(|err| FsError::io(&path, err))
    }

    /// Apply edits in order, each replacing the first occurrence of its
    /// `old_text`. An edit whose text is absent (or empty) is recorded as
    /// not applied without failing the batch. With `dry_run` the file is
    /// left untouched and the would-be content comes back as a preview.
    pub async fn edit_text_file(
        &self,
        path: &Path,
        edits: &[TextEdit],
        dry_run: bool,
    ) -> Result<EditReport> {
        let resolved = self.resolve(path)?;
        let original = fs::read_to_string(&resolved)
            .await
            .map_err(|err| FsError::io(&resolved, err))?;

        let mut modified = original.clone();
        let mut changes = Vec::with_capacity(edits.len());
        for edit in edits {
            let applied = if edit.old_text.is_empty() {
                false
            } else {
                match modified.find(&edit.old_text) {
                    Some(at) => {
                        modified.replace_range(at..at + edit.old_text.len(), &edit.new_text);
                        true
                    }
                    None => false,
                }
            };
            changes.push(EditOutcome {
                old_text: edit.old_text.clone(),
                new_text: edit.new_text.clone(),
                applied,
            });
        }

        let content_changed = modified != original;
        if dry_run {
            return Ok(EditReport {
                changes,
                content_changed,
                preview: Some(modified),
            });
        }
        if content_changed {
            fs::write(&resolved, &modified)
                .await
                .map_err(|err| FsError::io(&resolved, err))?;
        }
        Ok(EditReport {
            changes,
            content_changed,
            preview: None,
        })
    }

    pub async fn create_directory(&self, path: &Path) -> Result<()> {
        let path = self.resolve(path)?;
        fs::create_dir_all(&path).await.map_err(|err| FsError::io(&path, err))
    }

    pub async fn list_directory(&self, path: &Path) -> Result<Vec<DirEntryInfo>> {
        let path = self.resolve(path)?;
        let mut reader = fs::read_dir(&path).await.map_err(|err| FsError::io(&path, err))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| FsError::io(&path, err))?
        {
            let meta = entry.metadata().await.ok();
            let kind = match &meta {
                Some(meta) if meta.is_dir() => EntryKind::Directory,
                Some(meta) if meta.is_file() => EntryKind::File,
                _ => EntryKind::Other,
            };
            entries.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
                size: meta.and_then(|meta| meta.is_file().then(|| meta.len())),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Rename; both ends must be inside the allow-list.
    pub async fn move_path(&self, source: &Path, destination: &Path) -> Result<()> {
        let source = self.resolve(source)?;
        let destination = self.resolve(destination)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| FsError::io(parent, err))?;
        }
        fs::rename(&source, &destination)
            .await
            .map_err(|err| FsError::io(&source, err))
    }

    /// Glob match on file names under `root`, capped at 1000 hits. A match
    /// whose file name also matches any exclude pattern is dropped. The walk
    /// runs on the blocking pool; symlinks are not followed.
    pub async fn search_files(
        &self,
        root: &Path,
        pattern: &str,
        exclude_patterns: &[String],
    ) -> Result<Vec<PathBuf>> {
        let root = self.resolve(root)?;
        let matcher = Glob::new(pattern)
            .map_err(|err| FsError::InvalidArgument(format!("invalid glob pattern: {err}")))?
            .compile_matcher();
        let mut excludes = Vec::with_capacity(exclude_patterns.len());
        for exclude in exclude_patterns {
            excludes.push(
                Glob::new(exclude)
                    .map_err(|err| {
                        FsError::InvalidArgument(format!(
                            "invalid exclude pattern '{exclude}': {err}"
                        ))
                    })?
                    .compile_matcher(),
            );
        }
        let hits = tokio::task::spawn_blocking(move || {
            let mut hits = Vec::new();
            for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
                if !matcher.is_match(entry.file_name()) {
                    continue;
                }
                if excludes.iter().any(|ex| ex.is_match(entry.file_name())) {
                    continue;
                }
                hits.push(entry.into_path());
                if hits.len() >= SEARCH_RESULT_CAP {
                    break;
                }
            }
            hits
        })
        .await
        .map_err(|err| FsError::InvalidArgument(format!("search task failed: {err}")))?;
        Ok(hits)
    }

    pub async fn file_info(&self, path: &Path) -> Result<FileInfo> {
        let path = self.resolve(path)?;
        let meta = fs::metadata(&path).await.map_err(|err| FsError::io(&path, err))?;
        let kind = if meta.is_dir() {
            EntryKind::Directory
        } else if meta.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };
        Ok(FileInfo {
            kind,
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            created: meta.created().ok().map(DateTime::<Utc>::from),
            readonly: meta.permissions().readonly(),
            path,
        })
    }
}

/// Lexical normalization: collapse `.` and `..` without touching the disk.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
