//! File provider — loads and merges config files, watches for changes
//!
//! The main file is parsed first; when `providers.file` is enabled its
//! paths (files or directories of config files) are merged section by
//! section. The watcher coalesces rapid file-system events and emits one
//! reload event per burst.

use crate::config::Options;
use crate::error::{BifrostError, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Debounce interval to coalesce rapid file changes
const DEBOUNCE_MS: u64 = 500;

/// Emitted when watched configuration changed on disk
#[derive(Debug, Clone)]
pub struct ReloadEvent {
    /// Path that triggered the reload
    pub trigger_path: PathBuf,
}

/// File provider — one main config file plus optional merge paths
pub struct FileProvider {
    main_path: PathBuf,
}

impl FileProvider {
    pub fn new(main_path: impl AsRef<Path>) -> Self {
        Self {
            main_path: main_path.as_ref().to_path_buf(),
        }
    }

    pub fn main_path(&self) -> &Path {
        &self.main_path
    }

    /// Load the main file, merge provider paths, validate
    pub fn load(&self) -> Result<Options> {
        if !self.main_path.exists() {
            return Err(BifrostError::Config(format!(
                "config file not found, path: {}",
                self.main_path.display()
            )));
        }

        let mut options = Options::from_file(&self.main_path)?;

        if options.providers.file.enabled {
            for path in options.providers.file.paths.clone() {
                for file in expand_path(Path::new(&path))? {
                    let extra = Options::from_file(&file).map_err(|e| {
                        BifrostError::Config(format!("path: {}, error: {}", file.display(), e))
                    })?;
                    options.merge(extra).map_err(|e| {
                        BifrostError::Config(format!("path: {}, error: {}", file.display(), e))
                    })?;
                }
            }
        }

        options.validate()?;
        Ok(options)
    }

    /// Paths the watcher must cover: the main file plus provider paths
    fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.main_path.clone()];
        if let Ok(options) = Options::from_file(&self.main_path) {
            if options.providers.file.enabled {
                paths.extend(options.providers.file.paths.iter().map(PathBuf::from));
            }
        }
        paths
    }

    /// Start watching for changes. Returns a channel of debounced reload
    /// events; the background thread lives as long as the receiver.
    pub fn watch(&self) -> Result<mpsc::Receiver<ReloadEvent>> {
        let (event_tx, event_rx) = mpsc::channel();
        let (notify_tx, notify_rx) = mpsc::channel();

        let mut watcher: RecommendedWatcher =
            Watcher::new(notify_tx, notify::Config::default()).map_err(|e| {
                BifrostError::Other(format!("failed to create file watcher: {}", e))
            })?;

        for path in self.watched_paths() {
            let target = if path.is_dir() {
                path.clone()
            } else {
                path.parent().unwrap_or(Path::new(".")).to_path_buf()
            };
            let mode = if path.is_dir() {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            if target.exists() {
                watcher.watch(&target, mode).map_err(|e| {
                    BifrostError::Other(format!(
                        "failed to watch {}: {}",
                        target.display(),
                        e
                    ))
                })?;
            }
        }

        std::thread::spawn(move || {
            let _watcher = watcher; // keep alive
            let mut last_emit = Instant::now() - Duration::from_millis(DEBOUNCE_MS);

            while let Ok(event) = notify_rx.recv() {
                let event = match event {
                    Ok(event) => event,
                    Err(_) => continue,
                };
                if !matches!(
                    event.kind,
                    notify::EventKind::Create(_)
                        | notify::EventKind::Modify(_)
                        | notify::EventKind::Remove(_)
                ) {
                    continue;
                }
                if last_emit.elapsed() < Duration::from_millis(DEBOUNCE_MS) {
                    continue;
                }
                last_emit = Instant::now();

                let trigger_path = event.paths.first().cloned().unwrap_or_default();
                if event_tx.send(ReloadEvent { trigger_path }).is_err() {
                    return;
                }
            }
        });

        Ok(event_rx)
    }
}

/// Expand a path into config files: a file yields itself, a directory its
/// yaml/yml/toml entries in name order.
fn expand_path(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(BifrostError::Config(format!(
            "provider path not found: {}",
            path.display()
        )));
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(path).map_err(BifrostError::Io)? {
        let entry = entry.map_err(BifrostError::Io)?;
        let entry_path = entry.path();
        if !entry_path.is_file() {
            continue;
        }
        match entry_path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") | Some("toml") => files.push(entry_path),
            _ => {}
        }
    }
    files.sort();
    Ok(files)
}
