//! Safe archive extraction (zip/tar) for uploaded batches.
//!
//! Uploads come from untrusted users, so extraction rejects:
//! - Path traversal (`../`, absolute paths, Windows drive prefixes)
//! - Symlink/hardlink entries that escape the scratch directory
//! - Resource exhaustion (too many files / too much total content)

use std::{
    fs,
    io::Read,
    path::{Component, Path, PathBuf},
};

use flate2::read::GzDecoder;
use tar::Archive;
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::{errors::Error, Result};

#[derive(Clone, Copy, Debug)]
pub struct ExtractLimits {
    /// Maximum number of regular files extracted.
    pub max_files: usize,
    /// Maximum total bytes extracted across all regular files.
    pub max_total_bytes: u64,
    /// Maximum bytes extracted per file.
    pub max_file_bytes: u64,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_files: 2000,
            max_total_bytes: 4 * 1024 * 1024, // 4MB
            max_file_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExtractReport {
    pub extracted_files: Vec<PathBuf>, // relative paths
    pub total_bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveKind {
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            ArchiveKind::Zip => &[".zip"],
            ArchiveKind::Tar => &[".tar"],
            ArchiveKind::TarGz => &[".tar.gz", ".tgz"],
        }
    }
}

pub fn detect_archive_kind(file_name: &str) -> Option<ArchiveKind> {
    let lower = file_name.to_lowercase();
    [ArchiveKind::Zip, ArchiveKind::TarGz, ArchiveKind::Tar]
        .into_iter()
        .find(|kind| kind.extensions().iter().any(|ext| lower.ends_with(ext)))
}

pub fn safe_extract_archive(
    archive_path: &Path,
    file_name: &str,
    dest_dir: &Path,
    limits: ExtractLimits,
) -> Result<ExtractReport> {
    fs::create_dir_all(dest_dir)?;

    match detect_archive_kind(file_name) {
        Some(ArchiveKind::Zip) => safe_extract_zip(archive_path, dest_dir, limits),
        Some(ArchiveKind::Tar) => {
            let f = fs::File::open(archive_path)?;
            safe_extract_tar_reader(f, dest_dir, limits)
        }
        Some(ArchiveKind::TarGz) => {
            let f = fs::File::open(archive_path)?;
            safe_extract_tar_reader(GzDecoder::new(f), dest_dir, limits)
        }
        None => Err(Error::InvalidFormat(format!(
            "unknown archive type for file: {file_name}"
        ))),
    }
}

/// Sum of regular file sizes under `root`, recursively. Symlinks are not followed.
pub fn dir_size(root: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| Error::External(format!("walk error: {e}")))?;
        if entry.file_type().is_file() {
            let md = entry
                .metadata()
                .map_err(|e| Error::External(format!("walk error: {e}")))?;
            total = total.saturating_add(md.len());
        }
    }
    Ok(total)
}

/// Running counters shared by the zip and tar paths.
struct Budget {
    limits: ExtractLimits,
    files: usize,
    total: u64,
}

impl Budget {
    fn new(limits: ExtractLimits) -> Self {
        Self {
            limits,
            files: 0,
            total: 0,
        }
    }

    /// Check a new entry's declared size before anything is written.
    fn admit(&mut self, declared: u64, name: &str) -> Result<()> {
        self.files += 1;
        if self.files > self.limits.max_files {
            return Err(Error::Security(format!(
                "archive exceeds max_files limit ({})",
                self.limits.max_files
            )));
        }
        if declared > self.limits.max_file_bytes {
            tracing::debug!(name, declared, "archive entry over per-file limit");
            return Err(Error::TooLarge {
                limit: self.limits.max_file_bytes,
                actual: declared,
            });
        }
        let projected = self.total.saturating_add(declared);
        if projected > self.limits.max_total_bytes {
            return Err(Error::TooLarge {
                limit: self.limits.max_total_bytes,
                actual: projected,
            });
        }
        Ok(())
    }

    /// Stream the entry to disk, enforcing the bound even if headers lie.
    fn write_entry<R: Read>(&mut self, entry: R, out_path: &Path) -> Result<u64> {
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(out_path)?;
        let mut limited = entry.take(self.limits.max_file_bytes + 1);
        let copied = std::io::copy(&mut limited, &mut out)?;
        if copied > self.limits.max_file_bytes {
            return Err(Error::TooLarge {
                limit: self.limits.max_file_bytes,
                actual: copied,
            });
        }
        self.total += copied;
        if self.total > self.limits.max_total_bytes {
            return Err(Error::TooLarge {
                limit: self.limits.max_total_bytes,
                actual: self.total,
            });
        }
        Ok(copied)
    }
}

fn safe_extract_zip(
    archive_path: &Path,
    dest_dir: &Path,
    limits: ExtractLimits,
) -> Result<ExtractReport> {
    let f = fs::File::open(archive_path)?;
    let mut zip =
        ZipArchive::new(f).map_err(|e| Error::InvalidFormat(format!("unreadable zip: {e}")))?;

    let mut report = ExtractReport::default();
    let mut budget = Budget::new(limits);

    for i in 0..zip.len() {
        let entry = zip
            .by_index(i)
            .map_err(|e| Error::InvalidFormat(format!("unreadable zip entry: {e}")))?;
        let name = entry.name().replace('\\', "/");
        if name.is_empty() {
            continue;
        }

        // Zip symlinks are encoded via unix mode bits.
        if let Some(mode) = entry.unix_mode() {
            if mode & 0o170000 == 0o120000 {
                return Err(Error::Security(format!(
                    "archive contains symlink entry: {name}"
                )));
            }
        }

        let rel = sanitize_rel_path(Path::new(&name))?;
        let out_path = dest_dir.join(&rel);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        budget.admit(entry.size(), &name)?;
        budget.write_entry(entry, &out_path)?;

        report.extracted_files.push(rel);
        report.total_bytes = budget.total;
    }

    Ok(report)
}

fn safe_extract_tar_reader<R: Read>(
    r: R,
    dest_dir: &Path,
    limits: ExtractLimits,
) -> Result<ExtractReport> {
    let mut archive = Archive::new(r);
    let mut report = ExtractReport::default();
    let mut budget = Budget::new(limits);

    let entries = archive
        .entries()
        .map_err(|e| Error::InvalidFormat(format!("unreadable tar: {e}")))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::InvalidFormat(format!("unreadable tar entry: {e}")))?;
        let entry_type = entry.header().entry_type();

        // Disallow symlinks/hardlinks/devices/etc.
        if !entry_type.is_file() && !entry_type.is_dir() {
            let p = entry
                .path()
                .ok()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            return Err(Error::Security(format!(
                "archive contains non-file/non-dir entry: {p}"
            )));
        }

        let rel = sanitize_rel_path(&entry.path()?)?;
        let out_path = dest_dir.join(&rel);

        if entry_type.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        let declared = entry.header().size().unwrap_or(0);
        budget.admit(declared, &rel.display().to_string())?;
        budget.write_entry(entry, &out_path)?;

        report.extracted_files.push(rel);
        report.total_bytes = budget.total;
    }

    Ok(report)
}

fn sanitize_rel_path(p: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::Normal(os) => out.push(os),
            Component::ParentDir => {
                return Err(Error::Security(format!(
                    "archive contains path traversal: {}",
                    p.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::Security(format!(
                    "archive contains absolute path: {}",
                    p.display()
                )));
            }
        }
    }

    if out.as_os_str().is_empty() {
        return Err(Error::Security("archive contains empty path".to_string()));
    }

    Ok(out)
}
