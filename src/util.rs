use anyhow::{Context, Result};
use std::fs;
use std::path::{Component, Path};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

pub fn normalize_rel_path(repo_root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(repo_root).with_context(|| {
        format!(
            "strip prefix {} from {}",
            repo_root.display(),
            path.display()
        )
    })?;
    Ok(normalize_path(rel))
}

pub fn normalize_path(path: &Path) -> String {
    let mut parts = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(os) => parts.push(os.to_string_lossy().to_string()),
            Component::ParentDir => parts.push("..".to_string()),
            Component::CurDir => {}
            _ => {}
        }
    }
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// Whole lines `start_line..=end_line` (1-based), joined with `\n`.
pub fn slice_lines(content: &str, start_line: usize, end_line: usize) -> String {
    if content.is_empty() {
        return String::new();
    }
    let lines: Vec<&str> = content.lines().collect();
    let start = start_line.max(1) - 1;
    if start >= lines.len() {
        return String::new();
    }
    let end = end_line.max(start + 1).min(lines.len());
    lines[start..end].join("\n")
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    }
    Ok(())
}

pub fn git_head_sha(repo_root: &Path) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo_root)
        .arg("rev-parse")
        .arg("HEAD")
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let sha = String::from_utf8_lossy(&output.stdout);
    let trimmed = sha.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn normalize_drops_cur_dir_components() {
        assert_eq!(normalize_path(Path::new("./pkg/./mod.py")), "pkg/mod.py");
        assert_eq!(normalize_path(Path::new("")), ".");
    }

    #[test]
    fn rel_path_is_forward_slashed() {
        let root = PathBuf::from("/repo");
        let path = root.join("pkg").join("sub").join("mod.py");
        assert_eq!(normalize_rel_path(&root, &path).unwrap(), "pkg/sub/mod.py");
        assert!(normalize_rel_path(&root, Path::new("/elsewhere/x.py")).is_err());
    }

    #[test]
    fn slice_lines_clamps_range() {
        let text = "a\nb\nc\n";
        assert_eq!(slice_lines(text, 2, 3), "b\nc");
        assert_eq!(slice_lines(text, 3, 99), "c");
        assert_eq!(slice_lines(text, 9, 10), "");
        assert_eq!(slice_lines(text, 2, 1), "b");
    }
}
