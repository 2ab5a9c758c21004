//! Central path resolution for relaydesk data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `RELAYDESK_DATA_DIR` env > `~/.relaydesk`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
pub fn init_data_dir(explicit: Option<&Path>) -> io::Result<PathBuf> {
    let dir = match explicit {
        Some(p) => p.to_path_buf(),
        None => dirs::home_dir()
            .map(|home| home.join(".relaydesk"))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "HOME directory not found"))?,
    };

    let mut guard = DATA_DIR
        .write()
        .map_err(|_| io::Error::other("data dir lock poisoned"))?;
    *guard = Some(dir.clone());
    Ok(dir)
}

/// Return the current data directory, falling back to the working directory
/// when `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .ok()
        .and_then(|guard| guard.clone())
        .unwrap_or_else(|| PathBuf::from(".relaydesk"))
}

pub fn db_path() -> PathBuf {
    data_dir().join("relaydesk.db")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}
