//! Session cache: what a checkout remembers between page loads.
//!
//! Persists a [`SessionCache`] JSON document at
//! `<home>/.checkout/sessions/<checkout_id>.json`, written atomically with
//! a `.tmp` file and a rename.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use checkout_core::{FieldDefinition, Segment};

use crate::error::{io_err, StoreError};

/// Session-scoped state shared by the controller and the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCache {
    /// Definitions resolved for the buyer's segment at load.
    #[serde(default)]
    pub definitions: Vec<FieldDefinition>,
    /// Segments that collect customer info.
    #[serde(default)]
    pub eligible_segments: BTreeSet<Segment>,
    /// Customer info was saved and passed the gate.
    #[serde(default)]
    pub customer_info_complete: bool,
    pub saved_at: DateTime<Utc>,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self {
            definitions: Vec::new(),
            eligible_segments: BTreeSet::new(),
            customer_info_complete: false,
            saved_at: Utc::now(),
        }
    }
}

impl SessionCache {
    /// Reset to the empty state.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// `<home>/.checkout/sessions/<checkout_id>.json`
pub fn store_path_at(home: &Path, checkout_id: &str) -> PathBuf {
    home.join(".checkout")
        .join("sessions")
        .join(format!("{checkout_id}.json"))
}

/// Load the cache for `checkout_id`, or `None` if nothing was saved.
pub fn load_at(home: &Path, checkout_id: &str) -> Result<Option<SessionCache>, StoreError> {
    let path = store_path_at(home, checkout_id);
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    Ok(Some(serde_json::from_str(&contents)?))
}

/// Save the cache atomically, stamping `saved_at`.
pub fn save_at(home: &Path, checkout_id: &str, cache: &mut SessionCache) -> Result<(), StoreError> {
    let path = store_path_at(home, checkout_id);
    let Some(dir) = path.parent() else {
        return Err(io_err(
            path,
            std::io::Error::other("invalid session cache path"),
        ));
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    cache.saved_at = Utc::now();
    let json = serde_json::to_string_pretty(cache)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// Remove the saved cache. Missing files are fine.
pub fn clear_at(home: &Path, checkout_id: &str) -> Result<(), StoreError> {
    let path = store_path_at(home, checkout_id);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(&path, e)),
    }
}
