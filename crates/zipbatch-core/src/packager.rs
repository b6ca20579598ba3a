//! Compress outcome buckets into per-outcome ZIP archives.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use walkdir::WalkDir;
use zip::write::{FileOptions, ZipWriter};

use crate::{
    errors::Error,
    outcome::Outcome,
    pipeline::RunReport,
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackagedBucket {
    pub tag: &'static str,
    pub count: usize,
    pub path: PathBuf,
}

/// Archive every non-empty bucket of `report` into `out_dir/{tag}_{stamp}.zip`.
///
/// Buckets with no items produce no archive at all.
pub fn package<O: Outcome>(
    report: &RunReport<O>,
    out_dir: &Path,
    stamp: &str,
) -> Result<Vec<PackagedBucket>> {
    fs::create_dir_all(out_dir)?;

    let mut out = Vec::new();
    for (outcome, count) in report.tally.iter() {
        if count == 0 {
            continue;
        }
        let Some(dir) = report.bucket_dir(outcome) else {
            return Err(Error::InvalidPath {
                path: out_dir.to_path_buf(),
                reason: format!("no bucket directory for outcome {}", outcome.tag()),
            });
        };

        let path = out_dir.join(format!("{}_{stamp}.zip", outcome.tag()));
        let files = zip_dir(dir, &path)?;
        tracing::info!(
            tag = outcome.tag(),
            count,
            files,
            archive = %path.display(),
            "packaged bucket"
        );
        out.push(PackagedBucket {
            tag: outcome.tag(),
            count,
            path,
        });
    }
    Ok(out)
}

/// Recursively compress `src` into `dest`, with entry names relative to `src`.
/// Returns the number of files written.
pub fn zip_dir(src: &Path, dest: &Path) -> Result<usize> {
    let f = fs::File::create(dest)?;
    let mut zw = ZipWriter::new(f);
    let options = FileOptions::default().unix_permissions(0o644);

    let mut files = 0usize;
    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::External(format!("walk error: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| Error::InvalidPath {
                path: entry.path().to_path_buf(),
                reason: "outside of bucket directory".to_string(),
            })?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        zw.start_file(name, options)?;
        let mut input = fs::File::open(entry.path())?;
        io::copy(&mut input, &mut zw)?;
        files += 1;
    }

    zw.finish()?.flush()?;
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{testing::Ab, Tally};
    use std::io::Read;

    fn entry_names(path: &Path) -> Vec<String> {
        let mut zip = zip::ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
        (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn skips_empty_buckets_and_names_by_tag() {
        let root = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();

        let buckets: Vec<_> = Ab::all()
            .iter()
            .map(|o| {
                let d = root.path().join(o.tag());
                fs::create_dir_all(&d).unwrap();
                (*o, d)
            })
            .collect();
        fs::write(buckets[0].1.join("x.session"), b"x").unwrap();
        fs::write(buckets[0].1.join("x.json"), b"{}").unwrap();
        fs::write(buckets[2].1.join("y.session"), b"y").unwrap();

        let mut tally = Tally::new();
        tally.record(Ab::A);
        tally.record(Ab::Failed);
        let report = RunReport {
            tally,
            records: vec![],
            buckets,
        };

        let packed = package(&report, out.path(), "20260101_000000").unwrap();
        let tags: Vec<_> = packed.iter().map(|p| p.tag).collect();
        assert_eq!(tags, vec!["a", "failed"]);
        assert_eq!(
            packed[0].path.file_name().unwrap(),
            "a_20260101_000000.zip"
        );
        assert_eq!(entry_names(&packed[0].path), vec!["x.json", "x.session"]);
        assert!(!out.path().join("b_20260101_000000.zip").exists());
    }

    #[tokio::test]
    async fn packages_outcomes_missing_from_all() {
        use crate::{
            discovery::Item,
            pipeline::{ActionOutput, ItemAction, ItemError, Pipeline, PipelineConfig},
            progress::NullProgress,
        };

        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        enum Sparse {
            Listed,
            Unlisted,
            Failed,
        }

        impl Outcome for Sparse {
            fn tag(&self) -> &'static str {
                match self {
                    Sparse::Listed => "listed",
                    Sparse::Unlisted => "unlisted",
                    Sparse::Failed => "failed",
                }
            }

            fn all() -> &'static [Self] {
                &[Sparse::Listed, Sparse::Failed]
            }

            fn failed() -> Self {
                Sparse::Failed
            }
        }

        struct AlwaysUnlisted;

        #[async_trait::async_trait]
        impl ItemAction<Sparse> for AlwaysUnlisted {
            async fn process(
                &self,
                _item: &Item,
            ) -> std::result::Result<ActionOutput<Sparse>, ItemError> {
                Ok(ActionOutput::new(Sparse::Unlisted))
            }
        }

        let src = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let path = src.path().join("z.session");
        fs::write(&path, b"z").unwrap();
        let items = vec![Item {
            path,
            sidecar: None,
            metadata: None,
        }];

        let report = Pipeline::unpaced(PipelineConfig::default())
            .run(&items, &AlwaysUnlisted, root.path(), &NullProgress)
            .await
            .unwrap();
        let packed = package(&report, out.path(), "20260101_000000").unwrap();

        assert_eq!(packed.len(), 1);
        assert_eq!(packed[0].tag, "unlisted");
        assert_eq!(entry_names(&packed[0].path), vec!["z.session"]);
    }

    #[test]
    fn zip_dir_round_trips_contents() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/n.session"), b"payload").unwrap();
        let dest = src.path().with_extension("zip");

        assert_eq!(zip_dir(src.path(), &dest).unwrap(), 1);
        let mut zip = zip::ZipArchive::new(fs::File::open(&dest).unwrap()).unwrap();
        let mut body = String::new();
        zip.by_name("sub/n.session")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "payload");
        let _ = fs::remove_file(dest);
    }
}
