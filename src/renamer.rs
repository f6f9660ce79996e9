//! 8.3-name / long-name rename, an involution over a decompressed glider file.
//!
//! Ported from `dockserver_utils/fileDecompressor.py`'s `GliderFileRenamer` /
//! `DBDMLGFileRenamer`. The header scan and first-colon key/value split are
//! preserved verbatim, including the original's tolerance for invalid UTF-8
//! lines (skipped, not fatal) and its 14-line scan window.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Header lines scanned before giving up, matching the original's `i > 13: break`.
const MAX_HEADER_LINES: usize = 14;

const THE8X3_KEY: &str = "the8x3_filename";
const FULL_KEY: &str = "full_filename";

#[derive(Debug, Error)]
pub enum RenameError {
    #[error("failed to read header of {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("header of {path} did not carry both {THE8X3_KEY} and {FULL_KEY}")]
    MissingMapping { path: String },
    #[error("neither the8x3 nor full filename form appears in {path}")]
    NoMatchingForm { path: String },
}

/// Splits `key: value` on the first colon only, trimming the value.
/// A line without a colon yields `None`, matching the original's
/// `parse_filename_line` returning `""` (treated as "no value") rather
/// than raising.
fn parse_filename_line(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    Some((key, value))
}

/// Scans the first [`MAX_HEADER_LINES`] lines of `path`, tolerating
/// non-UTF-8 lines by skipping them, looking for `the8x3_filename` and
/// `full_filename` header entries. Short-circuits as soon as both are
/// found.
fn retrieve_filename_mapping(path: &Path) -> std::io::Result<HashMap<String, String>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut mapping = HashMap::new();

    for (i, line_bytes) in reader.split(b'\n').enumerate() {
        if i >= MAX_HEADER_LINES {
            break;
        }
        let line_bytes = line_bytes?;
        let Ok(line) = String::from_utf8(line_bytes) else {
            continue;
        };
        for key in [THE8X3_KEY, FULL_KEY] {
            if line.starts_with(key) {
                if let Some((_, value)) = parse_filename_line(&line) {
                    mapping.insert(key.to_string(), value.to_string());
                }
            }
        }
        if mapping.len() == 2 {
            break;
        }
    }

    if mapping.len() == 2 {
        Ok(mapping)
    } else {
        Ok(HashMap::new())
    }
}

/// Renames a decompressed glider file between its 8.3 and long canonical
/// forms by reading the two name fields out of its own header.
pub trait GliderFileRenamer {
    fn rename(&self, path: &Path) -> Result<PathBuf, RenameError>;
}

#[derive(Default)]
pub struct DbdMlgRenamer;

impl GliderFileRenamer for DbdMlgRenamer {
    fn rename(&self, path: &Path) -> Result<PathBuf, RenameError> {
        let path_str = path.to_string_lossy().to_string();
        let mapping = retrieve_filename_mapping(path).map_err(|e| RenameError::Io {
            path: path_str.clone(),
            source: e,
        })?;
        if mapping.len() != 2 {
            return Err(RenameError::MissingMapping { path: path_str });
        }
        let the8x3 = &mapping[THE8X3_KEY];
        let full = &mapping[FULL_KEY];

        let new_path = if path_str.contains(the8x3.as_str()) {
            path_str.replacen(the8x3.as_str(), full.as_str(), 1)
        } else if path_str.contains(full.as_str()) {
            path_str.replacen(full.as_str(), the8x3.as_str(), 1)
        } else {
            return Err(RenameError::NoMatchingForm { path: path_str });
        };

        let new_path = PathBuf::from(new_path);
        std::fs::rename(path, &new_path).map_err(|e| RenameError::Io {
            path: path_str,
            source: e,
        })?;
        tracing::debug!(from = %path.display(), to = %new_path.display(), "renamed glider file");
        Ok(new_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_header(path: &Path, the8x3: &str, full: &str) {
        let mut f = File::create(path).unwrap();
        writeln!(f, "some other header line").unwrap();
        writeln!(f, "the8x3_filename: {the8x3}").unwrap();
        writeln!(f, "full_filename: {full}").unwrap();
        writeln!(f, "binary garbage follows").unwrap();
    }

    #[test]
    fn round_trip_rename_is_an_involution() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("01600001.dbd");
        write_header(&original, "01600001", "k_999-2023-107-0-1");

        let renamer = DbdMlgRenamer;
        let renamed = renamer.rename(&original).unwrap();
        assert_eq!(renamed, dir.path().join("k_999-2023-107-0-1.dbd"));

        let roundtrip = renamer.rename(&renamed).unwrap();
        assert_eq!(roundtrip, dir.path().join("01600001.dbd"));
    }

    #[test]
    fn missing_header_fields_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("01600001.dbd");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "no useful headers here").unwrap();

        let renamer = DbdMlgRenamer;
        let err = renamer.rename(&path).unwrap_err();
        assert!(matches!(err, RenameError::MissingMapping { .. }));
    }

    #[test]
    fn header_scan_stops_after_fourteen_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late_header.dbd");
        let mut f = File::create(&path).unwrap();
        for _ in 0..14 {
            writeln!(f, "filler").unwrap();
        }
        writeln!(f, "the8x3_filename: 01600001").unwrap();
        writeln!(f, "full_filename: k_999-2023-107-0-1").unwrap();
        drop(f);

        let renamer = DbdMlgRenamer;
        let err = renamer.rename(&path).unwrap_err();
        assert!(matches!(err, RenameError::MissingMapping { .. }));
    }

    #[test]
    fn invalid_utf8_header_line_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("01600001.dbd");
        let mut f = File::create(&path).unwrap();
        f.write_all(&[0xff, 0xfe, 0x00]).unwrap();
        f.write_all(b"\n").unwrap();
        writeln!(f, "the8x3_filename: 01600001").unwrap();
        writeln!(f, "full_filename: k_999-2023-107-0-1").unwrap();
        drop(f);

        let renamer = DbdMlgRenamer;
        let renamed = renamer.rename(&path).unwrap();
        assert_eq!(renamed, dir.path().join("k_999-2023-107-0-1.dbd"));
    }

    #[test]
    fn parse_filename_line_splits_on_first_colon_only() {
        assert_eq!(
            parse_filename_line("full_filename: k_999-2023-107-0-1"),
            Some(("full_filename", "k_999-2023-107-0-1"))
        );
        assert_eq!(parse_filename_line("no colon here"), None);
    }
}
