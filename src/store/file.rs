//! Rotating file store
//!
//! Each item is routed to a logical file whose name is rendered from
//! templates (`<root>/<child>/<name>`). Once a file reaches the size
//! threshold its handle is closed; the next write to the same logical name
//! renames the full file to `<stem>_<N><ext>` and starts a fresh one.
//!
//! `N` is the number of files in the directory sharing the stem (the live
//! file plus earlier rotations) at the time of the rename. It is recomputed
//! from a directory scan every time, so files deleted by someone else between
//! two rotations can make the next suffix repeat an earlier one; an existing
//! target is then skipped by counting upward.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{
    DEFAULT_FILE_MAX_BYTES, DEFAULT_FILE_NAME_TEMPLATE, DEFAULT_FILE_PATH,
    DEFAULT_FILE_TEMPLATE, DEFAULT_FILE_TIME_TEMPLATE, DEFAULT_GC_INTERVAL_MINS,
};
use crate::item::LogItem;
use crate::template::Template;

use super::retention::RetentionTask;
use super::{Store, StoreError};

/// Settings for a [`FileStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStoreOptions {
    /// Store root; `~` is expanded and relative paths are resolved against the
    /// working directory
    pub root: PathBuf,
    /// Rotation threshold in bytes
    pub max_bytes: u64,
    /// Delete files older than this many days; 0 disables the sweep
    pub retain_days: u64,
    /// Pause between retention sweeps
    pub gc_interval: Duration,
    /// Sub-directory template, empty for none
    pub child_template: String,
    /// File name template
    pub name_template: String,
    /// Timestamp template, available to `template` as `{time}`
    pub time_template: String,
    /// Line template
    pub template: String,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_FILE_PATH),
            max_bytes: DEFAULT_FILE_MAX_BYTES,
            retain_days: 0,
            gc_interval: Duration::from_secs(DEFAULT_GC_INTERVAL_MINS * 60),
            child_template: String::new(),
            name_template: DEFAULT_FILE_NAME_TEMPLATE.to_string(),
            time_template: DEFAULT_FILE_TIME_TEMPLATE.to_string(),
            template: DEFAULT_FILE_TEMPLATE.to_string(),
        }
    }
}

/// One logical output file
#[derive(Debug)]
struct FileUnit {
    /// Path relative to the root, before any rotation suffix
    logical_name: String,
    /// Open append handle, if any
    file: Option<File>,
    /// Size observed after the last write
    size: u64,
}

impl FileUnit {
    fn new(logical_name: String) -> Self {
        Self {
            logical_name,
            file: None,
            size: 0,
        }
    }
}

/// Size-rotated file store with optional retention sweep
///
/// The table of logical files is guarded by a mutex, so concurrent writes to
/// the same logical name are serialized and never interleave mid-line.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    max_bytes: u64,
    child_template: Template,
    name_template: Template,
    time_template: Template,
    template: Template,
    units: Mutex<HashMap<String, FileUnit>>,
    retention: Mutex<Option<RetentionTask>>,
}

impl FileStore {
    /// Create the store and its root directory
    ///
    /// With a positive retention the sweep task is started on the current
    /// tokio runtime.
    pub fn open(options: FileStoreOptions) -> Result<Self, StoreError> {
        let child_template = Template::parse(&options.child_template)?;
        let name_template = Template::parse(&options.name_template)?;
        let time_template = Template::parse(&options.time_template)?;
        let template = Template::parse(&options.template)?;

        let root = normalize_root(&options.root)?;
        fs::create_dir_all(&root).map_err(|source| StoreError::CreateDir {
            path: root.clone(),
            source,
        })?;

        let max_bytes = if options.max_bytes == 0 {
            DEFAULT_FILE_MAX_BYTES
        } else {
            options.max_bytes
        };
        let gc_interval = if options.gc_interval.is_zero() {
            Duration::from_secs(DEFAULT_GC_INTERVAL_MINS * 60)
        } else {
            options.gc_interval
        };

        let retention = if options.retain_days > 0 {
            Some(RetentionTask::spawn(
                root.clone(),
                options.retain_days,
                gc_interval,
            )?)
        } else {
            None
        };

        info!(
            root = %root.display(),
            max_bytes,
            retain_days = options.retain_days,
            "File store ready"
        );

        Ok(Self {
            root,
            max_bytes,
            child_template,
            name_template,
            time_template,
            template,
            units: Mutex::new(HashMap::new()),
            retention: Mutex::new(retention),
        })
    }

    /// Absolute store root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rotation threshold in bytes
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Number of logical files with an open handle
    pub fn open_files(&self) -> usize {
        self.lock_units()
            .values()
            .filter(|unit| unit.file.is_some())
            .count()
    }

    /// Size recorded after the last write to a logical file
    pub fn observed_size(&self, logical_name: &str) -> Option<u64> {
        self.lock_units().get(logical_name).map(|unit| unit.size)
    }

    /// Logical file name for an item, relative to the root
    pub fn logical_name(&self, item: &LogItem) -> Result<String, StoreError> {
        let child = self.child_template.render(item);
        let mut name = self.name_template.render(item);
        if name.is_empty() {
            name = format!("unknown.{}.log", item.time.format("%Y%m%d"));
        }

        let child = child.trim_matches('/');
        let logical = if child.is_empty() {
            name
        } else {
            format!("{}/{}", child, name)
        };

        let escapes = Path::new(&logical)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(StoreError::InvalidName(logical));
        }
        Ok(logical)
    }

    /// Output line for an item, without the trailing newline
    pub fn render_line(&self, item: &LogItem) -> String {
        let time = self.time_template.render(item);
        self.template.render_with_time(item, Some(&time))
    }

    fn lock_units(&self) -> MutexGuard<'_, HashMap<String, FileUnit>> {
        self.units.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decide whether the unit must rotate, then make sure a handle is open
    fn prepare<'a>(&self, unit: &'a mut FileUnit, path: &Path) -> Result<&'a mut File, StoreError> {
        if let Some(file) = unit.file.as_ref() {
            match file.metadata() {
                Ok(meta) if meta.len() < self.max_bytes => {}
                Ok(meta) => {
                    unit.size = meta.len();
                    unit.file = None;
                    self.rotate(&unit.logical_name);
                    unit.size = 0;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to stat open log file");
                    unit.file = None;
                    self.rotate(&unit.logical_name);
                    unit.size = 0;
                }
            }
        } else if unit.size >= self.max_bytes {
            self.rotate(&unit.logical_name);
            unit.size = 0;
        }

        let file = match unit.file.take() {
            Some(file) => file,
            None => open_append(path)?,
        };
        Ok(unit.file.insert(file))
    }

    /// Rename the live file of a logical name out of the way
    ///
    /// Failures are logged; writes continue into the existing file.
    fn rotate(&self, logical_name: &str) -> Option<PathBuf> {
        let path = self.root.join(logical_name);
        if !path.is_file() {
            debug!(path = %path.display(), "Nothing to rotate");
            return None;
        }

        let target = match rotation_target(&path) {
            Ok(target) => target,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to scan for rotated files");
                return None;
            }
        };

        match fs::rename(&path, &target) {
            Ok(()) => {
                info!(from = %path.display(), to = %target.display(), "Rotated log file");
                Some(target)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to rotate log file");
                None
            }
        }
    }
}

impl Store for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    fn store(&self, item: &LogItem) -> Result<(), StoreError> {
        let logical_name = self.logical_name(item)?;
        let mut line = self.render_line(item);
        line.push('\n');

        let mut units = self.lock_units();
        let unit = units
            .entry(logical_name)
            .or_insert_with_key(|name| FileUnit::new(name.clone()));
        let path = self.root.join(&unit.logical_name);

        let file = self.prepare(unit, &path)?;
        let result = file
            .write_all(line.as_bytes())
            .map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })
            .and_then(|()| {
                file.metadata().map_err(|source| StoreError::Stat {
                    path: path.clone(),
                    source,
                })
            });

        match result {
            Ok(meta) => {
                unit.size = meta.len();
                if unit.size >= self.max_bytes {
                    // Rotated lazily by the next write to this name
                    debug!(path = %path.display(), size = unit.size, "Log file reached size limit");
                    unit.file = None;
                }
                Ok(())
            }
            Err(e) => {
                unit.file = None;
                Err(e)
            }
        }
    }

    fn close(&self) -> Result<(), StoreError> {
        if let Some(mut task) = self
            .retention
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.stop();
        }

        let mut units = self.lock_units();
        for (_, mut unit) in units.drain() {
            unit.file = None;
            if unit.size >= self.max_bytes {
                self.rotate(&unit.logical_name);
            }
        }
        debug!(root = %self.root.display(), "File store closed");
        Ok(())
    }
}

/// Expand `~`, make absolute and drop redundant separators
fn normalize_root(root: &Path) -> Result<PathBuf, StoreError> {
    let raw = root.to_string_lossy();
    let expanded = PathBuf::from(shellexpand::tilde(&raw).into_owned());
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        let cwd = std::env::current_dir().map_err(|source| StoreError::CreateDir {
            path: expanded.clone(),
            source,
        })?;
        cwd.join(expanded)
    };
    Ok(absolute.components().collect())
}

fn open_append(path: &Path) -> Result<File, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.is_dir() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })
}

/// Split a file name into stem and extension (with its dot)
fn split_name(file_name: &str) -> (&str, &str) {
    match Path::new(file_name).extension().and_then(|e| e.to_str()) {
        Some(ext) => {
            let stem_len = file_name.len() - ext.len() - 1;
            (&file_name[..stem_len], &file_name[stem_len..])
        }
        None => (file_name, ""),
    }
}

/// True for the live file `<stem><ext>` and rotations `<stem>_<digits><ext>`
fn shares_stem(candidate: &str, stem: &str, ext: &str) -> bool {
    let Some(rest) = candidate.strip_prefix(stem) else {
        return false;
    };
    if rest == ext {
        return true;
    }
    rest.strip_prefix('_')
        .and_then(|r| r.strip_suffix(ext))
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

/// Pick the rename target for a live file
fn rotation_target(path: &Path) -> std::io::Result<PathBuf> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (stem, ext) = split_name(&file_name);

    let mut number = 0usize;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if shares_stem(&entry.file_name().to_string_lossy(), stem, ext) {
            number += 1;
        }
    }

    loop {
        let target = dir.join(format!("{}_{}{}", stem, number, ext));
        if !target.exists() {
            return Ok(target);
        }
        number += 1;
    }
}
