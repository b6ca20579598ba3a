use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use zipbatch_core::{
    actions::AuditOutcome,
    config::Config,
    dispatch::{BatchAction, Dispatcher, Reply},
    domain::UserId,
    job::{BatchJob, JobOutput, SidecarState},
    outcome::Outcome,
    progress::LogProgress,
};

#[derive(Parser, Debug)]
#[command(name = "zipbatch", version, about = "Batch-process paired-file archives")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check every item's sidecar and repackage the upload by audit result.
    Audit {
        archive: PathBuf,
        /// Directory for the per-outcome archives.
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Combine several uploads into one archive; later uploads win on name clashes.
    Merge {
        #[arg(required = true)]
        archives: Vec<PathBuf>,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// List the items an upload contains without processing them.
    Discover {
        archive: PathBuf,
        /// Print the listing as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = zipbatch_core::logging::init("zipbatch") {
        eprintln!("error: {e}");
        return ExitCode::from(1);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let user_facing = e
                .downcast_ref::<zipbatch_core::Error>()
                .is_some_and(zipbatch_core::Error::is_user_facing);
            if user_facing {
                eprintln!("{e}");
                ExitCode::from(2)
            } else {
                tracing::error!(error = ?e, "zipbatch failed");
                eprintln!("error: {e:#}");
                ExitCode::from(1)
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = Config::load()?;
    cfg.ensure_temp_dir()?;
    let job = BatchJob::from_config(&cfg);

    match cli.command {
        Command::Audit { archive, out } => {
            let dispatcher = Dispatcher::new(job);
            let user = UserId::LOCAL;
            dispatcher.select(user, BatchAction::Audit).await;

            let name = upload_name(&archive)?;
            match dispatcher
                .upload(user, &archive, &name, &LogProgress, &out)
                .await?
            {
                Reply::Audit(output) => print_audit(&output),
                other => bail!("unexpected reply to audit upload: {other:?}"),
            }
        }
        Command::Merge { archives, out } => {
            let dispatcher = Dispatcher::new(job);
            let user = UserId::LOCAL;
            dispatcher.start_merge(user).await;

            for archive in &archives {
                let name = upload_name(archive)?;
                dispatcher
                    .upload(user, archive, &name, &LogProgress, &out)
                    .await?;
            }
            match dispatcher.confirm_merge(user, &out).await? {
                Reply::Merged(merged) => {
                    println!(
                        "merged {} items ({} duplicates dropped)",
                        merged.items, merged.duplicates
                    );
                    println!("{}", merged.archive.display());
                }
                other => bail!("unexpected reply to merge: {other:?}"),
            }
        }
        Command::Discover { archive, json } => {
            let name = upload_name(&archive)?;
            let items = job.discover_archive(&archive, &name).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
                return Ok(());
            }
            for item in &items {
                let sidecar = match item.sidecar {
                    SidecarState::Missing => "no sidecar",
                    SidecarState::Malformed => "unparseable sidecar",
                    SidecarState::Parsed { has_secret: true } => "sidecar with secret",
                    SidecarState::Parsed { has_secret: false } => "sidecar without secret",
                };
                println!("{}\t{}\t{sidecar}", item.name, item.path.display());
            }
            println!("{} items", items.len());
        }
    }
    Ok(())
}

fn upload_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}

fn print_audit(output: &JobOutput<AuditOutcome>) {
    println!("processed {} items", output.total);
    for (outcome, count) in output.tally.iter() {
        println!("  {:<12} {count}", outcome.tag());
    }
    for record in output
        .records
        .iter()
        .filter(|r| r.outcome == AuditOutcome::failed())
    {
        println!("  ! {}: {}", record.name, record.message);
    }
    for archive in &output.archives {
        println!("{}\t{}", archive.tag, archive.path.display());
    }
}
