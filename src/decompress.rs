//! Multi-root filesystem watcher that decompresses and renames landed
//! glider files.
//!
//! Ported from `dockserver_utils/fileDecompressor.py`'s
//! `AsynchronousFileDecompressorAionotify`: the original mixed two
//! filesystem-notification libraries and settled on CREATE+CLOSE_WRITE
//! pairing as the only reliable "copy finished" signal (the
//! `watchfiles`-based predecessor couldn't see CLOSE_WRITE and was
//! superseded). We implement only that surviving protocol, via `notify`'s
//! raw inotify backend on Linux.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel as channel;
use notify::event::{AccessKind, AccessMode, CreateKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;

use crate::file_entry::{is_cache_file, is_eligible, FileEntry};
use crate::renamer::{DbdMlgRenamer, GliderFileRenamer};

/// Matches `add_new_glider`'s `asyncio.sleep(0.5)`: gives the dockserver
/// time to finish creating a newly-arrived glider's directory tree.
const GLIDER_DISCOVERY_SETTLE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum DecompressError {
    #[error("external decompressor failed for {path}: {reason}")]
    ExternalTool { path: String, reason: String },
}

/// Seam over the binary decompression codec, which is out of scope per
/// spec.md §1 ("external collaborators"). The original calls into
/// `dbdreader.decompress.FileDecompressor`, an opaque external dependency;
/// here that becomes a trait with an external-process-backed
/// implementation.
pub trait Decompressor: Send + Sync {
    /// Decompresses `path` in place, returning the path of the
    /// decompressed output (same directory, canonical extension) or
    /// `None` if the input was not actually compressed.
    fn decompress(&self, path: &Path) -> Result<Option<PathBuf>, DecompressError>;
}

/// Shells out to an external decompressor binary, the idiomatic
/// substitute for the original's `dbdreader.decompress` dependency.
pub struct ExternalDecompressor {
    binary: String,
}

impl ExternalDecompressor {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Default for ExternalDecompressor {
    fn default() -> Self {
        Self::new("dbd_decompress")
    }
}

impl Decompressor for ExternalDecompressor {
    fn decompress(&self, path: &Path) -> Result<Option<PathBuf>, DecompressError> {
        let output = Command::new(&self.binary)
            .arg(path)
            .output()
            .map_err(|e| DecompressError::ExternalTool {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(DecompressError::ExternalTool {
                path: path.display().to_string(),
                reason: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        let decompressed = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if decompressed.is_empty() {
            return Ok(None);
        }
        Ok(Some(PathBuf::from(decompressed)))
    }
}

/// Tracks paths seen at CREATE but not yet CLOSE_WRITE, the copy-completion
/// protocol spec.md §4.5 specifies. A path is "complete" only once its
/// CLOSE_WRITE arrives.
#[derive(Default)]
struct InFlightFiles {
    pending: HashSet<PathBuf>,
}

impl InFlightFiles {
    fn mark_created(&mut self, path: PathBuf) {
        self.pending.insert(path);
    }

    /// Returns true (and forgets the path) if `path` was previously seen
    /// as CREATE; a CLOSE_WRITE with no matching CREATE is not a completed copy.
    fn mark_closed(&mut self, path: &Path) -> bool {
        self.pending.remove(path)
    }
}

pub struct FileWatcherPipeline {
    root: PathBuf,
    decompressor: Arc<dyn Decompressor>,
    renamer: Arc<dyn GliderFileRenamer + Send + Sync>,
}

impl FileWatcherPipeline {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            decompressor: Arc::new(ExternalDecompressor::default()),
            renamer: Arc::new(DbdMlgRenamer),
        }
    }

    pub fn with_decompressor(mut self, decompressor: Arc<dyn Decompressor>) -> Self {
        self.decompressor = decompressor;
        self
    }

    pub fn with_renamer(mut self, renamer: Arc<dyn GliderFileRenamer + Send + Sync>) -> Self {
        self.renamer = renamer;
        self
    }

    /// Processes one fully-copied file: decompress, and unless it was a
    /// cache file, rename the decompressed output between its 8.3 and long
    /// forms. Faults in a single file never abort the watch loop.
    pub fn process_file(&self, path: &Path) {
        let Some(entry) = FileEntry::from_path(path) else {
            return;
        };
        if !is_eligible(&entry) {
            return;
        }
        let decompressed = match self.decompressor.decompress(path) {
            Ok(Some(p)) => p,
            Ok(None) => {
                tracing::debug!(path = %path.display(), "not a compressed file, skipping");
                return;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "decompression failed");
                return;
            }
        };
        if is_cache_file(&entry) {
            tracing::info!(from = %entry.full_base_name, to = %decompressed.display(), "decompressed cache file");
            return;
        }
        match self.renamer.rename(&decompressed) {
            Ok(renamed) => {
                tracing::info!(
                    from = %entry.full_base_name,
                    to = %renamed.display(),
                    "decompressed and renamed glider file"
                );
            }
            Err(e) => {
                tracing::warn!(path = %decompressed.display(), error = %e, "rename failed, leaving decompressed file as-is");
            }
        }
    }

    /// Every immediate subdirectory of `root` that already has a
    /// `from-glider` child (and isn't literally `unknown`) at startup.
    fn initial_glider_dirs(&self) -> Vec<(String, PathBuf)> {
        let mut dirs = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return dirs;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(alias) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if alias == "unknown" {
                continue;
            }
            let from_glider = path.join("from-glider");
            if from_glider.is_dir() {
                dirs.push((alias.to_string(), from_glider));
            }
        }
        dirs
    }

    /// Runs the watch loop. Blocks until the watcher itself fails to
    /// initialize or is stopped externally (a single bad file never ends
    /// the loop, matching spec.md §7's "the file pipeline never aborts on
    /// a single bad file").
    pub fn run(&self) -> anyhow::Result<()> {
        let (tx, rx) = channel::unbounded::<notify::Result<Event>>();
        let watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        let watcher = Arc::new(Mutex::new(watcher));

        for (alias, path) in self.initial_glider_dirs() {
            if let Err(e) = watcher.lock().unwrap().watch(&path, RecursiveMode::NonRecursive) {
                tracing::warn!(glider = %alias, path = %path.display(), error = %e, "failed to watch glider directory");
            } else {
                tracing::info!(glider = %alias, path = %path.display(), "watching glider directory");
            }
        }
        watcher.lock().unwrap().watch(&self.root, RecursiveMode::NonRecursive)?;

        let mut in_flight = InFlightFiles::default();
        loop {
            let event = match rx.recv() {
                Ok(Ok(event)) => event,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "file watcher error");
                    continue;
                }
                Err(_) => {
                    tracing::error!("file watch channel closed unexpectedly");
                    return Ok(());
                }
            };
            self.handle_event(event, &mut in_flight, &watcher);
        }
    }

    fn handle_event(&self, event: Event, in_flight: &mut InFlightFiles, watcher: &Arc<Mutex<RecommendedWatcher>>) {
        for path in &event.paths {
            match &event.kind {
                EventKind::Create(CreateKind::Folder) if path.parent() == Some(self.root.as_path()) => {
                    self.maybe_add_new_glider(path.clone(), Arc::clone(watcher));
                }
                EventKind::Create(_) => {
                    in_flight.mark_created(path.clone());
                }
                EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
                    // IN_CLOSE_WRITE, the raw inotify backend's only reliable
                    // "copy finished" signal; only act on paths we saw CREATE
                    // for. IN_MODIFY fires on every write during the copy, not
                    // just at the end, so it can't stand in for this.
                    if in_flight.mark_closed(path) {
                        self.process_file(path);
                    }
                }
                _ => {}
            }
        }
    }

    /// Waits out the dockserver's directory-creation settle delay, then
    /// adds a watch for the new glider's `from-glider` subdirectory if one
    /// exists and the glider isn't the literal `unknown` placeholder.
    fn maybe_add_new_glider(&self, glider_dir: PathBuf, watcher: Arc<Mutex<RecommendedWatcher>>) {
        thread::spawn(move || {
            thread::sleep(GLIDER_DISCOVERY_SETTLE_DELAY);
            let Some(alias) = glider_dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                return;
            };
            if alias == "unknown" {
                return;
            }
            let from_glider = glider_dir.join("from-glider");
            if !from_glider.is_dir() {
                tracing::debug!(glider = %alias, "new directory was not a glider directory");
                return;
            }
            match watcher.lock().unwrap().watch(&from_glider, RecursiveMode::NonRecursive) {
                Ok(()) => tracing::info!(glider = %alias, path = %from_glider.display(), "new glider detected, added watch"),
                Err(e) => tracing::warn!(glider = %alias, error = %e, "failed to watch new glider directory"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDecompressor {
        output: PathBuf,
    }

    impl Decompressor for FixedDecompressor {
        fn decompress(&self, _path: &Path) -> Result<Option<PathBuf>, DecompressError> {
            Ok(Some(self.output.clone()))
        }
    }

    struct NoopRenamer {
        renamed_to: PathBuf,
    }

    impl GliderFileRenamer for NoopRenamer {
        fn rename(&self, _path: &Path) -> Result<PathBuf, crate::renamer::RenameError> {
            Ok(self.renamed_to.clone())
        }
    }

    #[test]
    fn in_flight_requires_create_before_close() {
        let mut in_flight = InFlightFiles::default();
        let path = PathBuf::from("/tmp/from-glider/01600001.dcd");
        assert!(!in_flight.mark_closed(&path));
        in_flight.mark_created(path.clone());
        assert!(in_flight.mark_closed(&path));
        // A second close without an intervening create does not re-fire.
        assert!(!in_flight.mark_closed(&path));
    }

    #[test]
    fn process_file_skips_ineligible_paths() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("elsewhere");
        std::fs::create_dir(&other).unwrap();
        let path = other.join("01600001.dcd");
        std::fs::File::create(&path).unwrap();

        let pipeline = FileWatcherPipeline::new(dir.path()).with_decompressor(Arc::new(FixedDecompressor {
            output: path.clone(),
        }));
        // Should not panic and should simply decline to process.
        pipeline.process_file(&path);
    }

    #[test]
    fn process_file_renames_non_cache_output() {
        let dir = tempfile::tempdir().unwrap();
        let from_glider = dir.path().join("from-glider");
        std::fs::create_dir(&from_glider).unwrap();
        let path = from_glider.join("01600001.dcd");
        std::fs::File::create(&path).unwrap();
        let decompressed = from_glider.join("01600001.dbd");
        std::fs::File::create(&decompressed).unwrap();
        let renamed_to = from_glider.join("k_999-2023-107-0-1.dbd");

        let pipeline = FileWatcherPipeline::new(dir.path())
            .with_decompressor(Arc::new(FixedDecompressor {
                output: decompressed.clone(),
            }))
            .with_renamer(Arc::new(NoopRenamer {
                renamed_to: renamed_to.clone(),
            }));
        pipeline.process_file(&path);
    }

    #[test]
    fn process_file_skips_renamer_for_cache_files() {
        let dir = tempfile::tempdir().unwrap();
        let from_glider = dir.path().join("from-glider");
        std::fs::create_dir(&from_glider).unwrap();
        let path = from_glider.join("daad1b20.ccc");
        std::fs::File::create(&path).unwrap();
        let decompressed = from_glider.join("daad1b20.cac");
        std::fs::File::create(&decompressed).unwrap();

        struct PanicRenamer;
        impl GliderFileRenamer for PanicRenamer {
            fn rename(&self, _path: &Path) -> Result<PathBuf, crate::renamer::RenameError> {
                panic!("renamer must not be invoked for cache files");
            }
        }

        let pipeline = FileWatcherPipeline::new(dir.path())
            .with_decompressor(Arc::new(FixedDecompressor {
                output: decompressed.clone(),
            }))
            .with_renamer(Arc::new(PanicRenamer));
        pipeline.process_file(&path);
    }
}
