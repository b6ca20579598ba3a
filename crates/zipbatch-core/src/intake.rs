//! Archive intake: validate an upload and extract it into a scratch workspace.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::{
    archive_security::{
        detect_archive_kind, dir_size, safe_extract_archive, ArchiveKind, ExtractLimits,
    },
    errors::Error,
    Result,
};

#[derive(Clone, Debug)]
pub struct IntakePolicy {
    /// Upload kinds accepted; anything else is `InvalidFormat`.
    pub allowed_kinds: Vec<ArchiveKind>,
    /// Budget for the extracted tree, checked after extraction.
    pub max_extracted_bytes: u64,
    pub max_files: usize,
}

impl Default for IntakePolicy {
    fn default() -> Self {
        Self {
            allowed_kinds: vec![ArchiveKind::Zip],
            max_extracted_bytes: 4 * 1024 * 1024,
            max_files: 2000,
        }
    }
}

impl IntakePolicy {
    fn limits(&self) -> ExtractLimits {
        ExtractLimits {
            max_files: self.max_files,
            max_total_bytes: self.max_extracted_bytes,
            max_file_bytes: self.max_extracted_bytes,
        }
    }

    fn check_name(&self, file_name: &str) -> Result<ArchiveKind> {
        match detect_archive_kind(file_name) {
            Some(kind) if self.allowed_kinds.contains(&kind) => Ok(kind),
            _ => {
                let allowed = self
                    .allowed_kinds
                    .iter()
                    .flat_map(|k| k.extensions().iter().copied())
                    .collect::<Vec<_>>()
                    .join(", ");
                Err(Error::InvalidFormat(format!(
                    "{file_name} is not a supported archive (expected {allowed})"
                )))
            }
        }
    }
}

/// Isolated scratch directory for one batch run.
///
/// Removed from disk when dropped, whichever way the run ends.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn create(temp_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(temp_root)?;
        let dir = tempfile::Builder::new()
            .prefix("batch-")
            .tempdir_in(temp_root)?;
        std::fs::create_dir_all(dir.path().join("extracted"))?;
        std::fs::create_dir_all(dir.path().join("buckets"))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn extract_dir(&self) -> PathBuf {
        self.dir.path().join("extracted")
    }

    pub fn bucket_root(&self) -> PathBuf {
        self.dir.path().join("buckets")
    }
}

/// Validate `file_name`, extract `archive_path` into a fresh workspace, and
/// enforce the extracted-size budget.
pub fn accept_archive(
    archive_path: &Path,
    file_name: &str,
    policy: &IntakePolicy,
    temp_root: &Path,
) -> Result<Workspace> {
    policy.check_name(file_name)?;

    // On any error below the workspace drops and takes the partial extraction with it.
    let ws = Workspace::create(temp_root)?;
    let extract_dir = ws.extract_dir();
    let report = safe_extract_archive(archive_path, file_name, &extract_dir, policy.limits())?;

    let actual = dir_size(&extract_dir)?;
    if actual > policy.max_extracted_bytes {
        return Err(Error::TooLarge {
            limit: policy.max_extracted_bytes,
            actual,
        });
    }

    tracing::info!(
        upload = file_name,
        files = report.extracted_files.len(),
        bytes = actual,
        "archive accepted"
    );
    Ok(ws)
}

/// Extract several uploads side by side into one workspace (`extracted/<n>/`).
///
/// An upload that fails to validate or extract is logged and skipped; the
/// combined size budget still applies to the whole tree.
pub fn accept_archives(
    uploads: &[(PathBuf, String)],
    policy: &IntakePolicy,
    temp_root: &Path,
) -> Result<Workspace> {
    let ws = Workspace::create(temp_root)?;
    let extract_dir = ws.extract_dir();

    let mut accepted = 0usize;
    for (idx, (path, name)) in uploads.iter().enumerate() {
        let dest = extract_dir.join(format!("{idx:04}"));
        let res = policy
            .check_name(name)
            .and_then(|_| safe_extract_archive(path, name, &dest, policy.limits()));
        match res {
            Ok(_) => accepted += 1,
            Err(e) => {
                tracing::warn!(upload = %name, error = %e, "skipping upload");
                let _ = std::fs::remove_dir_all(&dest);
            }
        }
    }

    let actual = dir_size(&extract_dir)?;
    if actual > policy.max_extracted_bytes {
        return Err(Error::TooLarge {
            limit: policy.max_extracted_bytes,
            actual,
        });
    }

    tracing::info!(
        uploads = uploads.len(),
        accepted,
        bytes = actual,
        "archives accepted"
    );
    Ok(ws)
}
