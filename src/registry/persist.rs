//! Registry state file
//!
//! The file holds a bincode encoded [`PersistedState`]. Writes go to a
//! sibling temp file first and are renamed into place.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::RegistrySnapshot;
use crate::core::{Error, Result, STATE_VERSION};

/// Versioned envelope around the registry snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Format version, checked before the rest is decoded
    pub version: u32,
    pub registry: RegistrySnapshot,
}

impl PersistedState {
    pub fn new(registry: RegistrySnapshot) -> Self {
        PersistedState {
            version: STATE_VERSION,
            registry,
        }
    }
}

/// Writes `snapshot` to `path`
pub fn save_state(path: &Path, snapshot: &RegistrySnapshot) -> Result<()> {
    let state = PersistedState::new(snapshot.clone());
    let bytes = bincode::serialize(&state)?;

    let temp = temp_path(path);
    fs::write(&temp, &bytes)?;
    fs::rename(&temp, path)?;

    debug!(path = %path.display(), len = bytes.len(), "Registry state saved");
    Ok(())
}

/// Reads the snapshot at `path`. A missing file is `Ok(None)`.
pub fn load_state(path: &Path) -> Result<Option<RegistrySnapshot>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let version: u32 = bincode::deserialize(&bytes)?;
    if version != STATE_VERSION {
        return Err(Error::persistence(format!(
            "state file version {} does not match {}",
            version, STATE_VERSION
        )));
    }

    let state: PersistedState = bincode::deserialize(&bytes)?;
    info!(
        path = %path.display(),
        nodes = state.registry.addresses.len(),
        "Registry state loaded"
    );
    Ok(Some(state.registry))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
