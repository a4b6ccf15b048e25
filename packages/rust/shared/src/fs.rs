//! Filesystem helpers shared by the task store and the pipeline stages.

use std::path::{Path, PathBuf};

use crate::error::{KbError, Result};

/// Write `contents` to `target` atomically: write a hidden temp file next to
/// it, then rename over the target. Parent directories are created.
pub fn write_atomic(target: &Path, contents: &[u8]) -> Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| KbError::validation(format!("{} has no parent", target.display())))?;
    std::fs::create_dir_all(dir).map_err(|e| KbError::io(dir, e))?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = dir.join(format!(".{file_name}.tmp"));

    std::fs::write(&temp, contents).map_err(|e| KbError::io(&temp, e))?;
    std::fs::rename(&temp, target).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        KbError::io(target, e)
    })?;
    Ok(())
}

/// All regular files under `root` whose name ends with one of `suffixes`,
/// sorted by their forward-slash path relative to `root`.
///
/// A missing root yields an empty list.
pub fn find_files(root: &Path, suffixes: &[&str]) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if root.is_dir() {
        walk(root, suffixes, &mut found)?;
    }
    found.sort_by_cached_key(|p| relative_slash_path(root, p));
    Ok(found)
}

fn walk(dir: &Path, suffixes: &[&str], found: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| KbError::io(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| KbError::io(dir, e))?.path();
        if path.is_dir() {
            walk(&path, suffixes, found)?;
        } else if path
            .file_name()
            .map(|n| n.to_string_lossy())
            .is_some_and(|name| !name.starts_with('.') && suffixes.iter().any(|s| name.ends_with(s)))
        {
            found.push(path);
        }
    }
    Ok(())
}

/// Path of `file` relative to `root`, with forward slashes.
pub fn relative_slash_path(root: &Path, file: &Path) -> String {
    let rel = file.strip_prefix(root).unwrap_or(file);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
