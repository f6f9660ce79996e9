//! Stat-derived file identity and the glider-file eligibility rules.
//!
//! Ported from `dockserver_utils/fileDecompressor.py`'s `FileProperties`
//! namedtuple and `AsynchronousFileDecompressorBase.is_to_be_processed`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

/// Case-insensitive extensions eligible for decompression, matching the
/// original's `EXTENSIONS` list (which spells out both cases explicitly
/// rather than lower-casing at match time).
const EXTENSIONS: &[&str] = &[
    "dcd", "ecd", "mcd", "ncb", "scd", "tcd", "mcg", "ncg", "ccc",
];

/// Stat-derived, immutable identity of one candidate file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub full_base_name: String,
    pub base_name: String,
    pub extension: String,
    pub parent_dir_name: String,
}

impl FileEntry {
    /// Builds a `FileEntry` from `path` if it names a regular file that
    /// still exists; returns `None` otherwise (mirrors
    /// `get_file_properties`'s `os.path.isfile` guard).
    pub fn from_path(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        if !path.is_file() {
            return None;
        }
        let full_base_name = path.file_name()?.to_str()?.to_string();
        let (base_name, extension) = match full_base_name.rsplit_once('.') {
            Some((base, ext)) => (base.to_string(), format!(".{ext}")),
            None => (full_base_name.clone(), String::new()),
        };
        let parent_dir_name = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        Some(Self {
            path,
            full_base_name,
            base_name,
            extension,
            parent_dir_name,
        })
    }

    pub fn extension_lower(&self) -> String {
        self.extension.trim_start_matches('.').to_ascii_lowercase()
    }
}

fn data_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\d{8}\.(dcd|ecd|mcd|ncd|scd|tcd)$").unwrap())
}

fn log_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\d{8}\.(mcg|ncg)$").unwrap())
}

fn cache_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^[0-9a-fA-F]{8}\.(ccc)$").unwrap())
}

/// True if `entry` is a glider file the decompression pipeline should act
/// on: its extension is one of the known compressed families, it lives
/// directly under a `from-glider` directory, and its basename matches one
/// of the datafile/logfile/cachefile shapes.
pub fn is_eligible(entry: &FileEntry) -> bool {
    if entry.parent_dir_name != "from-glider" {
        return false;
    }
    if !EXTENSIONS.contains(&entry.extension_lower().as_str()) {
        return false;
    }
    data_file_re().is_match(&entry.full_base_name)
        || log_file_re().is_match(&entry.full_base_name)
        || cache_file_re().is_match(&entry.full_base_name)
}

/// True for the cache-file family (`.ccc`/`.CCC`), which skips the Renamer
/// since cache files already carry their canonical hexadecimal name.
pub fn is_cache_file(entry: &FileEntry) -> bool {
    entry.extension_lower() == "ccc"
}

pub fn parent_is_from_glider(path: &Path) -> bool {
    path.parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .map(|n| n == "from-glider")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn data_file_is_eligible() {
        let dir = tempfile::tempdir().unwrap();
        let from_glider = dir.path().join("from-glider");
        std::fs::create_dir(&from_glider).unwrap();
        let path = from_glider.join("01600001.dcd");
        File::create(&path).unwrap();

        let entry = FileEntry::from_path(&path).unwrap();
        assert!(is_eligible(&entry));
        assert!(!is_cache_file(&entry));
    }

    #[test]
    fn cache_file_is_eligible_and_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let from_glider = dir.path().join("from-glider");
        std::fs::create_dir(&from_glider).unwrap();
        let path = from_glider.join("daad1b20.ccc");
        File::create(&path).unwrap();

        let entry = FileEntry::from_path(&path).unwrap();
        assert!(is_eligible(&entry));
        assert!(is_cache_file(&entry));
    }

    #[test]
    fn uppercase_extension_still_matches() {
        let dir = tempfile::tempdir().unwrap();
        let from_glider = dir.path().join("from-glider");
        std::fs::create_dir(&from_glider).unwrap();
        let path = from_glider.join("01600001.DCD");
        File::create(&path).unwrap();

        let entry = FileEntry::from_path(&path).unwrap();
        assert!(is_eligible(&entry));
    }

    #[test]
    fn wrong_parent_directory_is_not_eligible() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("elsewhere");
        std::fs::create_dir(&other).unwrap();
        let path = other.join("01600001.dcd");
        File::create(&path).unwrap();

        let entry = FileEntry::from_path(&path).unwrap();
        assert!(!is_eligible(&entry));
    }

    #[test]
    fn non_matching_basename_is_not_eligible() {
        let dir = tempfile::tempdir().unwrap();
        let from_glider = dir.path().join("from-glider");
        std::fs::create_dir(&from_glider).unwrap();
        let path = from_glider.join("notaglider.dcd");
        File::create(&path).unwrap();

        let entry = FileEntry::from_path(&path).unwrap();
        assert!(!is_eligible(&entry));
    }

    #[test]
    fn missing_file_yields_none() {
        assert!(FileEntry::from_path("/nonexistent/path/file.dcd").is_none());
    }
}
