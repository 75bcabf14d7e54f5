use std::fs;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use md5::{Digest, Md5};
use walkdir::WalkDir;

use crate::{Result, WidepatchError};

const NAME_MATCH: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Lowercase hex MD5 of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Optional constraints a located file has to satisfy besides its name.
#[derive(Debug, Clone, Default)]
pub struct FileFilter<'a> {
    pub size: Option<u64>,
    pub md5: Option<&'a str>,
}

/// Every file under `root` whose name matches `pattern` (case-insensitive)
/// and which passes `filter`, sorted by path.
pub fn find_files(root: &Path, pattern: &str, filter: &FileFilter<'_>) -> Result<Vec<PathBuf>> {
    let pattern = Pattern::new(pattern)?;
    let mut found = Vec::new();

    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if !pattern.matches_with(name, NAME_MATCH) {
            continue;
        }
        if let Some(size) = filter.size {
            if entry.metadata()?.len() != size {
                continue;
            }
        }
        if let Some(md5) = filter.md5 {
            if !md5_hex(&fs::read(entry.path())?).eq_ignore_ascii_case(md5) {
                continue;
            }
        }
        found.push(entry.into_path());
    }

    found.sort();
    Ok(found)
}

/// Like [`find_files`], but exactly one result is wanted. Extra matches are
/// reported and the first one wins.
pub fn find_unique(root: &Path, pattern: &str, filter: &FileFilter<'_>) -> Result<PathBuf> {
    let mut found = find_files(root, pattern, filter)?;
    if found.len() > 1 {
        log::warn!(
            "{} files match '{}' under {}; using {}",
            found.len(),
            pattern,
            root.display(),
            found[0].display()
        );
    }
    if found.is_empty() {
        return Err(WidepatchError::NotFound {
            pattern: pattern.to_string(),
            root: root.to_path_buf(),
        });
    }
    Ok(found.swap_remove(0))
}

/// Writes `data` to `path`, creating parent directories as needed.
pub fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, data)?;
    Ok(())
}
