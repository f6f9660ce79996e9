//! Serial<->TCP dockserver forwarder and glider file decompression sidecar.
//!
//! Two binaries share this library: `serial-tcp-connector` (per-device
//! serial<->TCP bridging, gated on carrier-detect) and
//! `file-decompressor-helper` (watches landed glider files, decompresses
//! and renames them). See each module's doc comment for the original
//! component it generalizes.

pub mod cli;
pub mod config;
pub mod constants;
pub mod control;
pub mod decompress;
pub mod device_watcher;
pub mod dialogue;
pub mod file_entry;
pub mod forwarder;
pub mod metrics;
pub mod parsers;
pub mod renamer;
pub mod serial;
pub mod supervisor;
pub mod timer;
