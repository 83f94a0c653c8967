//! Persisted client state.
//!
//! One small JSON file: stable client identity plus the last-connected
//! endpoint. Corrupt or missing state degrades to defaults; startup never
//! fails because of this file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    client_id: String,
    last_endpoint: Option<Endpoint>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            client_id: String::new(),
            last_endpoint: None,
        }
    }
}

pub struct PersistedState {
    path: Option<PathBuf>,
    data: Mutex<StateFile>,
}

impl PersistedState {
    /// Load from the default OS config location.
    pub fn load_default() -> Self {
        Self::load(default_path())
    }

    pub fn load(path: Option<PathBuf>) -> Self {
        let mut data = path
            .as_deref()
            .map(read_state)
            .unwrap_or_default();
        if data.client_id.is_empty() {
            data.client_id = Uuid::new_v4().to_string();
        }
        if data.version < CURRENT_VERSION {
            // Best-effort migration: nothing structural has changed yet,
            // just stamp the new version.
            data.version = CURRENT_VERSION;
        }
        let state = Self {
            path,
            data: Mutex::new(data),
        };
        state.save();
        state
    }

    /// Stable per-install identity.
    pub fn client_id(&self) -> String {
        self.data.lock().unwrap().client_id.clone()
    }

    pub fn last_endpoint(&self) -> Option<Endpoint> {
        self.data.lock().unwrap().last_endpoint.clone()
    }

    pub fn set_last_endpoint(&self, endpoint: Endpoint) {
        self.data.lock().unwrap().last_endpoint = Some(endpoint);
        self.save();
    }

    /// Write-through; failures are logged and otherwise ignored.
    fn save(&self) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let data = self.data.lock().unwrap().clone();
        if let Err(e) = write_state(path, &data) {
            tracing::warn!(path = %path.display(), "state save failed: {e}");
        }
    }
}

fn read_state(path: &Path) -> StateFile {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice::<StateFile>(&bytes) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(path = %path.display(), "corrupt state file, using defaults: {e}");
                StateFile::default()
            }
        },
        Err(_) => StateFile::default(),
    }
}

fn write_state(path: &Path, state: &StateFile) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let body = serde_json::to_vec_pretty(state)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    // Write-and-rename so a crash never leaves a torn file behind.
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}

fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("snapstream").join("state.json"))
}
