use crate::config::{DEFAULT_SKIP_DIRS, DEFAULT_SKIP_FILES};
use anyhow::Result;
use ignore::WalkBuilder;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

const PYTHON_EXTENSIONS: &[&str] = &["py", "pyi"];

#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    pub modified: i64,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub no_ignore: bool,
    /// Directory names (or `*suffix` patterns) skipped on top of the defaults.
    pub exclude: Vec<String>,
    pub max_file_bytes: u64,
}

impl ScanOptions {
    pub fn new(no_ignore: bool) -> Self {
        Self {
            no_ignore,
            ..Self::default()
        }
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            no_ignore: false,
            exclude: Vec::new(),
            max_file_bytes: 10 * 1024 * 1024,
        }
    }
}

pub fn scan_repo(repo_root: &Path) -> Result<Vec<ScannedFile>> {
    scan_repo_with_options(repo_root, &ScanOptions::default())
}

pub fn scan_repo_with_options(repo_root: &Path, options: &ScanOptions) -> Result<Vec<ScannedFile>> {
    let mut files = Vec::new();
    let mut builder = WalkBuilder::new(repo_root);
    if options.no_ignore {
        builder
            .ignore(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .parents(false);
    } else {
        builder
            .ignore(true)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .parents(true)
            .require_git(false);
    }
    let exclude = options.exclude.clone();
    let walker = builder
        .hidden(false)
        .filter_entry(move |entry| !is_ignored_entry(entry, &exclude))
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("walk error: {err}");
                continue;
            }
        };
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        if !is_python_source(path) || is_skipped_file(path) {
            continue;
        }
        let rel_path = crate::util::normalize_rel_path(repo_root, path)?;
        let metadata = fs::metadata(path)?;
        let size = metadata.len();
        if size > options.max_file_bytes {
            tracing::warn!(
                "skipping {rel_path}: {size} bytes exceeds limit of {}",
                options.max_file_bytes
            );
            continue;
        }
        files.push(ScannedFile {
            rel_path,
            abs_path: path.to_path_buf(),
            size,
            modified: modified_secs(&metadata),
        });
    }
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(files)
}

fn is_ignored_entry(entry: &ignore::DirEntry, exclude: &[String]) -> bool {
    if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
        return false;
    }
    let name = entry.file_name();
    if name == OsStr::new(".codegraph") {
        return true;
    }
    let Some(name) = name.to_str() else {
        return false;
    };
    DEFAULT_SKIP_DIRS
        .iter()
        .copied()
        .chain(exclude.iter().map(String::as_str))
        .any(|pattern| matches_dir_pattern(name, pattern))
}

fn matches_dir_pattern(name: &str, pattern: &str) -> bool {
    match pattern.strip_prefix('*') {
        Some(suffix) => name.ends_with(suffix),
        None => name == pattern,
    }
}

fn is_skipped_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| DEFAULT_SKIP_FILES.contains(&name))
}

pub fn is_python_source(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| PYTHON_EXTENSIONS.contains(&ext))
}

/// Scan a single path. Returns `None` for paths outside the repository,
/// non-Python files and files that do not exist.
pub fn scan_path(repo_root: &Path, path: &Path) -> Result<Option<ScannedFile>> {
    if !path.is_file() || !is_python_source(path) {
        return Ok(None);
    }
    let rel_path = match crate::util::normalize_rel_path(repo_root, path) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };
    let metadata = fs::metadata(path)?;
    Ok(Some(ScannedFile {
        rel_path,
        abs_path: path.to_path_buf(),
        size: metadata.len(),
        modified: modified_secs(&metadata),
    }))
}

fn modified_secs(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
