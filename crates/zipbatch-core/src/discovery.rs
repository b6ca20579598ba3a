//! Item discovery: pair each primary file with its optional JSON sidecar.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::{errors::Error, Result};

/// Parsed sidecar contents.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Sidecar keys that may hold the stored secret, in lookup order.
pub const SECRET_KEYS: &[&str] = &["2fa", "2FA", "password"];

#[derive(Clone, Debug)]
pub struct DiscoveryRules {
    /// Primary file extension, without the dot.
    pub primary_ext: String,
    /// Sidecar file extension, without the dot.
    pub sidecar_ext: String,
}

impl Default for DiscoveryRules {
    fn default() -> Self {
        Self {
            primary_ext: "session".to_string(),
            sidecar_ext: "json".to_string(),
        }
    }
}

impl DiscoveryRules {
    fn is_primary(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.primary_ext))
    }
}

/// One unit of work: a primary file plus whatever sidecar sits next to it.
#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub path: PathBuf,
    /// Sidecar file, if one exists on disk (parseable or not).
    pub sidecar: Option<PathBuf>,
    /// Parsed sidecar; `None` when absent or unparseable.
    pub metadata: Option<Metadata>,
}

impl Item {
    /// Base file name without extension. Items are identified by this.
    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Stored secret from the sidecar, if any. Non-string values are ignored.
    pub fn secret(&self) -> Option<&str> {
        let meta = self.metadata.as_ref()?;
        SECRET_KEYS
            .iter()
            .filter_map(|k| meta.get(*k))
            .find_map(|v| v.as_str().filter(|s| !s.is_empty()))
    }

    /// Sidecar exists but could not be parsed into a key-value record.
    pub fn has_broken_sidecar(&self) -> bool {
        self.sidecar.is_some() && self.metadata.is_none()
    }
}

/// Walk `root` and return every primary file in a stable order.
///
/// Sidecars never abort discovery: a missing or malformed one just leaves the
/// item without metadata.
pub fn discover(root: &Path, rules: &DiscoveryRules) -> Result<Vec<Item>> {
    let mut items = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::External(format!("walk error: {e}")))?;
        if !entry.file_type().is_file() || !rules.is_primary(entry.path()) {
            continue;
        }

        let path = entry.into_path();
        let sidecar = path.with_extension(&rules.sidecar_ext);
        let (sidecar, metadata) = if sidecar.is_file() {
            let metadata = read_metadata(&sidecar);
            (Some(sidecar), metadata)
        } else {
            (None, None)
        };

        items.push(Item {
            path,
            sidecar,
            metadata,
        });
    }

    if items.is_empty() {
        return Err(Error::NoItemsFound);
    }

    tracing::debug!(count = items.len(), root = %root.display(), "discovered items");
    Ok(items)
}

fn read_metadata(path: &Path) -> Option<Metadata> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable sidecar");
            return None;
        }
    };
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        Ok(_) => {
            tracing::warn!(path = %path.display(), "sidecar is not a JSON object");
            None
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "malformed sidecar");
            None
        }
    }
}
