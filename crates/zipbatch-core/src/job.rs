//! One end-to-end batch: intake → discovery → pipeline → packaging.
//!
//! The scratch workspace lives for exactly one call and is removed however the
//! call ends. Output archives are written to a caller-owned directory.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Local;
use tokio::time::timeout;
use serde::Serialize;

use crate::{
    config::Config,
    discovery::{discover, DiscoveryRules, Item},
    errors::Error,
    intake::{accept_archive, accept_archives, IntakePolicy, Workspace},
    outcome::{Outcome, Tally},
    packager::{package, zip_dir, PackagedBucket},
    pacing::Pacer,
    pipeline::{ItemAction, ItemRecord, Pipeline, PipelineConfig},
    progress::ProgressSink,
    Result,
};

#[derive(Clone, Debug)]
pub struct JobOutput<O: Outcome> {
    pub total: usize,
    pub tally: Tally<O>,
    pub records: Vec<ItemRecord<O>>,
    /// One archive per non-empty outcome.
    pub archives: Vec<PackagedBucket>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutput {
    /// Distinct items written to the merged archive.
    pub items: usize,
    /// Items dropped because a later upload had the same name.
    pub duplicates: usize,
    pub archive: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SidecarState {
    Missing,
    Malformed,
    Parsed { has_secret: bool },
}

/// Listing entry for `discover_archive`; paths are relative to the archive root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ItemSummary {
    pub name: String,
    pub path: PathBuf,
    pub sidecar: SidecarState,
}

#[derive(Clone)]
pub struct BatchJob {
    intake: IntakePolicy,
    rules: DiscoveryRules,
    pipeline: PipelineConfig,
    temp_root: PathBuf,
    pacer: Arc<dyn Pacer>,
}

impl BatchJob {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            intake: IntakePolicy {
                max_extracted_bytes: cfg.max_extract_bytes,
                max_files: cfg.max_files,
                ..IntakePolicy::default()
            },
            rules: DiscoveryRules {
                primary_ext: cfg.primary_ext.clone(),
                sidecar_ext: cfg.sidecar_ext.clone(),
            },
            pipeline: PipelineConfig {
                progress_every: cfg.progress_every,
                deadline: cfg.max_run_time,
                sidecar_ext: cfg.sidecar_ext.clone(),
            },
            temp_root: cfg.temp_dir.clone(),
            pacer: cfg.pacer(),
        }
    }

    pub fn with_pacer(mut self, pacer: Arc<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn with_intake(mut self, intake: IntakePolicy) -> Self {
        self.intake = intake;
        self
    }

    /// Run `action` over every item in the uploaded archive and package the buckets.
    ///
    /// The deadline covers intake, processing and packaging. Archives are built
    /// inside the workspace and only moved to `out_dir` once the run finished in
    /// time, so a timed-out run leaves nothing behind.
    pub async fn run<O, A>(
        &self,
        archive: &Path,
        file_name: &str,
        action: &A,
        progress: &dyn ProgressSink,
        out_dir: &Path,
    ) -> Result<JobOutput<O>>
    where
        O: Outcome,
        A: ItemAction<O> + ?Sized,
    {
        let deadline = self.pipeline.deadline;
        let staged = match timeout(deadline, self.run_staged(archive, file_name, action, progress))
            .await
        {
            Ok(res) => res?,
            Err(_) => {
                tracing::warn!(
                    upload = file_name,
                    deadline_secs = deadline.as_secs(),
                    "batch run timed out; nothing packaged"
                );
                return Err(Error::RunTimeout(deadline));
            }
        };

        let out_dir = out_dir.to_path_buf();
        blocking(move || staged.publish(&out_dir)).await
    }

    async fn run_staged<O, A>(
        &self,
        archive: &Path,
        file_name: &str,
        action: &A,
        progress: &dyn ProgressSink,
    ) -> Result<Staged<O>>
    where
        O: Outcome,
        A: ItemAction<O> + ?Sized,
    {
        let (ws, items) = self.intake_and_discover(archive, file_name).await?;
        let total = items.len();
        tracing::info!(upload = file_name, total, "starting batch run");

        let pipeline = Pipeline::new(self.pipeline.clone(), self.pacer.clone());
        let report = pipeline
            .run(&items, action, &ws.bucket_root(), progress)
            .await?;

        // The workspace moves into the blocking task so it outlives packaging even
        // if this future is dropped at the deadline.
        let stamp = timestamp();
        blocking(move || {
            let staging = ws.path().join("packed");
            let archives = package(&report, &staging, &stamp)?;
            Ok(Staged {
                ws,
                output: JobOutput {
                    total,
                    tally: report.tally,
                    records: report.records,
                    archives,
                },
            })
        })
        .await
    }

    /// Combine several uploads into one archive, keeping the last copy of each item name.
    pub async fn merge(&self, uploads: &[(PathBuf, String)], out_dir: &Path) -> Result<MergeOutput> {
        let uploads = uploads.to_vec();
        let intake = self.intake.clone();
        let rules = self.rules.clone();
        let temp_root = self.temp_root.clone();
        let out_dir = out_dir.to_path_buf();

        blocking(move || {
            let ws = accept_archives(&uploads, &intake, &temp_root)?;
            let items = discover(&ws.extract_dir(), &rules)?;
            let (kept, duplicates) = dedup_last_wins(items);

            let staging = ws.path().join("merged");
            fs::create_dir_all(&staging)?;
            for item in &kept {
                copy_flat(&item.path, &staging)?;
                if let Some(sidecar) = &item.sidecar {
                    copy_flat(sidecar, &staging)?;
                }
            }

            fs::create_dir_all(&out_dir)?;
            let archive = out_dir.join(format!("merged_{}.zip", timestamp()));
            zip_dir(&staging, &archive)?;
            tracing::info!(items = kept.len(), duplicates, archive = %archive.display(), "merged uploads");

            Ok(MergeOutput {
                items: kept.len(),
                duplicates,
                archive,
            })
        })
        .await
    }

    /// List the items an upload would produce without running any action.
    pub async fn discover_archive(&self, archive: &Path, file_name: &str) -> Result<Vec<ItemSummary>> {
        let (ws, items) = self.intake_and_discover(archive, file_name).await?;
        let root = ws.extract_dir();
        Ok(items
            .iter()
            .map(|item| ItemSummary {
                name: item.name(),
                path: item
                    .path
                    .strip_prefix(&root)
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|_| item.path.clone()),
                sidecar: match (&item.sidecar, &item.metadata) {
                    (None, _) => SidecarState::Missing,
                    (Some(_), None) => SidecarState::Malformed,
                    (Some(_), Some(_)) => SidecarState::Parsed {
                        has_secret: item.secret().is_some(),
                    },
                },
            })
            .collect())
    }

    async fn intake_and_discover(
        &self,
        archive: &Path,
        file_name: &str,
    ) -> Result<(Workspace, Vec<Item>)> {
        let archive = archive.to_path_buf();
        let file_name = file_name.to_string();
        let intake = self.intake.clone();
        let rules = self.rules.clone();
        let temp_root = self.temp_root.clone();

        blocking(move || {
            let ws = accept_archive(&archive, &file_name, &intake, &temp_root)?;
            let items = discover(&ws.extract_dir(), &rules)?;
            Ok((ws, items))
        })
        .await
    }
}

/// A finished run whose archives still sit in the workspace.
struct Staged<O: Outcome> {
    ws: Workspace,
    output: JobOutput<O>,
}

impl<O: Outcome> Staged<O> {
    fn publish(self, out_dir: &Path) -> Result<JobOutput<O>> {
        let Staged { ws, mut output } = self;
        fs::create_dir_all(out_dir)?;
        for archive in &mut output.archives {
            let dest = match archive.path.file_name() {
                Some(name) => out_dir.join(name),
                None => {
                    return Err(Error::InvalidPath {
                        path: archive.path.clone(),
                        reason: "no file name".to_string(),
                    })
                }
            };
            move_file(&archive.path, &dest)?;
            archive.path = dest;
        }
        drop(ws);
        Ok(output)
    }
}

/// Rename, falling back to copy + remove when `dest` is on another filesystem.
fn move_file(src: &Path, dest: &Path) -> Result<()> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    fs::copy(src, dest)?;
    fs::remove_file(src)?;
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::External(format!("blocking task failed: {e}")))?
}

fn timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

fn dedup_last_wins(items: Vec<Item>) -> (Vec<Item>, usize) {
    let total = items.len();
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<Option<Item>> = Vec::with_capacity(total);

    for item in items {
        if let Some(prev) = slots.insert(item.name(), kept.len()) {
            kept[prev] = None;
        }
        kept.push(Some(item));
    }

    let kept: Vec<Item> = kept.into_iter().flatten().collect();
    let duplicates = total - kept.len();
    (kept, duplicates)
}

fn copy_flat(src: &Path, dir: &Path) -> Result<()> {
    let Some(name) = src.file_name() else {
        return Err(Error::InvalidPath {
            path: src.to_path_buf(),
            reason: "no file name".to_string(),
        });
    };
    fs::copy(src, dir.join(name))?;
    Ok(())
}
