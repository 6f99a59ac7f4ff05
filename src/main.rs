use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use dialoguer::Confirm;
use dupimg::config::Settings;
use dupimg::core::cluster::Cluster;
use dupimg::core::cull::{delete_unselected, read_history};
use dupimg::core::runner::ScanRunner;
use dupimg::core::scanner::{ScanOutcome, ScanPhase, ScanPipeline, ScanProgress, ScanReport};
use dupimg::database::IncrementalStore;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "dupimg", version, about = "Find and cull near-duplicate photos")]
struct Cli {
    /// Settings file (default: `<config dir>/dupimg/config.json`)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Embedding store directory
    #[arg(long, global = true, value_name = "DIR")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Duplicate workflows
    Duplicates {
        #[command(subcommand)]
        command: Dups,
    },

    /// Work with cull history
    History {
        #[command(subcommand)]
        command: HistoryCmd,
    },

    /// Inspect the embedding store
    Store {
        #[command(subcommand)]
        command: StoreCmd,
    },
}

#[derive(clap::Args, Debug)]
struct ScanArgs {
    /// Directory to scan (repeatable; default: configured directories)
    #[arg(short, long = "dir", value_name = "DIR")]
    dirs: Vec<PathBuf>,
    /// Neighbourhood radius in embedding space
    #[arg(long)]
    epsilon: Option<f32>,
    /// Neighbours (including itself) an image needs to anchor a group
    #[arg(long)]
    min_points: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Dups {
    /// Find and list duplicate groups
    Scan {
        #[command(flatten)]
        scan: ScanArgs,
        /// Print groups as JSON
        #[arg(long)]
        json: bool,
    },

    /// Keep each group's representative and permanently delete the rest
    Delete {
        #[command(flatten)]
        scan: ScanArgs,
        /// Don't ask for confirmation
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryCmd {
    /// List all cull history records
    List,
}

#[derive(Subcommand, Debug)]
enum StoreCmd {
    /// Show what the store holds
    Stats,
}

#[derive(Serialize)]
struct GroupView {
    representative: String,
    members: Vec<MemberView>,
}

#[derive(Serialize)]
struct MemberView {
    path: String,
    captured_at: Option<String>,
}

impl From<&Cluster> for GroupView {
    fn from(cluster: &Cluster) -> Self {
        Self {
            representative: cluster
                .representative()
                .map(|r| r.identity.clone())
                .unwrap_or_default(),
            members: cluster
                .members
                .iter()
                .map(|m| MemberView {
                    path: m.identity.clone(),
                    captured_at: format_capture_time(m.captured_at),
                })
                .collect(),
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    if let Some(store) = cli.store {
        settings.store_path = store;
    }

    match cli.command {
        Commands::Duplicates { command } => match command {
            Dups::Scan { scan, json } => {
                apply_overrides(&mut settings, scan);
                let Some((report, _)) = scan_for_duplicates(&settings)? else {
                    return Ok(());
                };
                let groups: Vec<GroupView> = report.duplicate_groups().map(GroupView::from).collect();

                if json {
                    println!("{}", serde_json::to_string_pretty(&groups)?);
                } else if groups.is_empty() {
                    println!("No duplicates found.");
                } else {
                    println!("Found {} duplicate group(s):", groups.len());
                    for (i, group) in groups.iter().enumerate() {
                        println!(" Group {}:", i + 1);
                        for member in &group.members {
                            let marker = if member.path == group.representative { "🏆" } else { "▶" };
                            println!(
                                "   {} {} ({})",
                                marker,
                                member.path,
                                member.captured_at.as_deref().unwrap_or("unknown date")
                            );
                        }
                    }
                }
                print_skipped(&report);
            }

            Dups::Delete { scan, yes } => {
                apply_overrides(&mut settings, scan);
                let Some((report, store)) = scan_for_duplicates(&settings)? else {
                    return Ok(());
                };
                let groups: Vec<&Cluster> = report.duplicate_groups().collect();
                if groups.is_empty() {
                    println!("No duplicates found.");
                    return Ok(());
                }

                let doomed: usize = groups.iter().map(|g| g.duplicates().len()).sum();
                for (i, group) in groups.iter().enumerate() {
                    println!("\n✨ Group {}:", i + 1);
                    if let Some(keep) = group.representative() {
                        println!("   🏆 Keeping → {}", keep.identity);
                    }
                    for dup in group.duplicates() {
                        println!("   🗑️  Delete {}", dup.identity);
                    }
                }

                if !yes
                    && !Confirm::new()
                        .with_prompt(format!("Permanently delete {} file(s)?", doomed))
                        .default(false)
                        .interact()?
                {
                    println!("Nothing deleted.");
                    return Ok(());
                }

                let mut deleted = 0;
                for group in groups {
                    let Some(keep) = group.representative() else {
                        continue;
                    };
                    let keep = HashSet::from([keep.identity.clone()]);
                    let outcome =
                        delete_unselected(group, &keep, &store, Some(&settings.history_path))
                            .context("Failed to cull group")?;
                    deleted += outcome.deleted.len();
                    for (path, reason) in outcome.failed {
                        eprintln!("⚠️  Could not delete {}: {}", path, reason);
                    }
                }
                store.flush()?;

                println!(
                    "\n✅ Deleted {} file(s), recorded cull history in {}",
                    deleted,
                    settings.history_path.display()
                );
            }
        },

        Commands::History { command } => match command {
            HistoryCmd::List => {
                let records = read_history(&settings.history_path).with_context(|| {
                    format!("Could not read history file {:?}", settings.history_path)
                })?;
                if records.is_empty() {
                    println!("No cull history yet.");
                    return Ok(());
                }

                println!("🗂️  Cull History:");
                for (i, rec) in records.iter().enumerate() {
                    println!(
                        "[{}] {}\n     kept: {:?}\n     culled: {:?}\n     action: {}\n",
                        i, rec.timestamp, rec.retained, rec.culled, rec.action
                    );
                }
            }
        },

        Commands::Store { command } => match command {
            StoreCmd::Stats => {
                let extractor = settings.build_extractor()?;
                let store = open_store(&settings, extractor.model_id())?;
                let records = store.get_all()?;
                let undated = records.iter().filter(|r| r.captured_at == 0).count();

                println!("🗄️  Store: {}", settings.store_path.display());
                println!("     model: {}", store.model_id());
                println!("     images: {}", records.len());
                println!("     without capture time: {}", undated);
            }
        },
    }

    Ok(())
}

fn apply_overrides(settings: &mut Settings, args: ScanArgs) {
    if !args.dirs.is_empty() {
        settings.directories = args.dirs;
    }
    if let Some(epsilon) = args.epsilon {
        settings.epsilon = epsilon;
    }
    if let Some(min_points) = args.min_points {
        settings.min_points = min_points;
    }
}

fn open_store(settings: &Settings, model_id: &str) -> Result<IncrementalStore> {
    IncrementalStore::open(&settings.store_path, model_id)
        .with_context(|| format!("Failed to open store {:?}", settings.store_path))
}

/// Run a full scan with a progress bar. `None` if the scan was cancelled.
fn scan_for_duplicates(settings: &Settings) -> Result<Option<(ScanReport, Arc<IncrementalStore>)>> {
    if settings.directories.is_empty() {
        anyhow::bail!("No directories to scan; pass --dir or set `directories` in the config");
    }

    let extractor = settings.build_extractor().context("Failed to set up feature extractor")?;
    let store = Arc::new(open_store(settings, extractor.model_id())?);
    let (tx, rx) = crossbeam_channel::unbounded();

    let pipeline = ScanPipeline::new(store, extractor)
        .with_clusterer(settings.clusterer()?)
        .with_workers(settings.workers)
        .with_supported_formats(&settings.extensions)
        .with_progress_sender(tx);
    let runner = ScanRunner::new(Arc::new(pipeline));

    for dir in &settings.directories {
        println!("▶ Scanning for duplicates in: {}", dir.display());
    }

    let outcome = benchmark("scan", || -> Result<ScanOutcome> {
        runner.start(settings.directories.clone())?;
        follow_progress(&runner, &rx)?;
        runner
            .wait()
            .context("Scan was never started")?
            .context("Scan failed")
    })?;

    match outcome {
        ScanOutcome::Completed(report) => {
            let store = runner.pipeline().store().clone();
            store.flush()?;
            Ok(Some((report, store)))
        }
        ScanOutcome::Cancelled { committed, total } => {
            println!("⚠️  Scan cancelled after {} of {} new images.", committed, total);
            Ok(None)
        }
    }
}

/// Draw progress events until the scan thread finishes.
fn follow_progress(runner: &ScanRunner, rx: &Receiver<ScanProgress>) -> Result<()> {
    let bar = ProgressBar::new(0);
    bar.set_style(ProgressStyle::with_template(
        "{spinner:.green} {msg:12} [{bar:40.cyan/blue}] {pos}/{len}",
    )?);
    bar.enable_steady_tick(Duration::from_millis(100));

    let apply = |progress: ScanProgress| {
        bar.set_message(format!("{:?}", progress.phase));
        bar.set_length(progress.total as u64);
        bar.set_position(progress.processed as u64);
        progress.phase
    };

    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(progress) => {
                if matches!(
                    apply(progress),
                    ScanPhase::Done | ScanPhase::Cancelled | ScanPhase::Failed
                ) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) if runner.is_running() => {}
            Err(_) => break,
        }
    }
    for progress in rx.try_iter() {
        apply(progress);
    }

    bar.finish_with_message("Scan complete");
    Ok(())
}

fn print_skipped(report: &ScanReport) {
    if report.skipped.is_empty() {
        return;
    }
    eprintln!("\n⚠️  {} file(s) could not be read:", report.skipped.len());
    for skipped in &report.skipped {
        eprintln!("   {} ({})", skipped.identity, skipped.reason);
    }
}

fn format_capture_time(millis: i64) -> Option<String> {
    if millis == 0 {
        return None;
    }
    DateTime::<Utc>::from_timestamp_millis(millis).map(|t| t.to_rfc3339())
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
