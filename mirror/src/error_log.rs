//! Append-only text file for recoverable failures worth keeping after the
//! console scrolls away (currently geolocation lookup failures).

use log::{error, warn};
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The file is opened once on first use and kept open, so a burst of
/// failures costs one write per line.
#[derive(Debug)]
pub struct ErrorLog {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            file: Mutex::new(None),
        }
    }

    /// Only reports through the `log` facade.
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Creates the file if it does not exist yet.
    pub fn ensure_exists(&self) -> io::Result<()> {
        if let Some(path) = &self.path {
            let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
            if file.is_none() {
                *file = Some(open_append(path)?);
            }
        }
        Ok(())
    }

    /// Records one `"<tag>: <reason>"` line.
    pub fn record(&self, tag: &str, reason: impl Display) {
        let line = format!("{}: {}", tag, reason);
        error!("{}", line);

        if let Some(path) = &self.path {
            if let Err(e) = self.append_line(path, &line) {
                warn!("Failed to write error log {}: {}", path.display(), e);
            }
        }
    }

    fn append_line(&self, path: &Path, line: &str) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if file.is_none() {
            *file = Some(open_append(path)?);
        }

        let mut bytes = String::with_capacity(line.len() + 1);
        bytes.push_str(line);
        bytes.push('\n');

        let result = match file.as_mut() {
            Some(handle) => handle.write_all(bytes.as_bytes()),
            None => Ok(()),
        };
        if result.is_err() {
            // Reopen on the next record
            *file = None;
        }
        result
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
