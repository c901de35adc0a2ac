use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use logodedup::config::{Config, StrategyKind};
use logodedup::pipeline::{Pipeline, RunOptions};
use logodedup::services::fetch::{read_domain_list, FetchService};
use logodedup::services::normalize::{discover_assets, NormalizerService};
use logodedup::services::report::{self, RunSummary};
use logodedup::services::cull::CullFailure;
use logodedup::services::{CullService, Failure, ProgressCallback};

#[derive(Parser, Debug)]
#[command(name = "logodedup", version, about = "Group company logos that look alike")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Feature extractor to cluster with
    #[arg(long, global = true, value_enum)]
    strategy: Option<StrategyKind>,

    /// Neighbourhood radius for the chosen strategy
    #[arg(long, global = true)]
    eps: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download each domain's logo or favicon
    Fetch {
        /// Domain list, one per line (a CSV's first column also works)
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
        /// Directory to save logos into
        #[arg(short, long, value_name = "DIR", default_value = "logos")]
        out: PathBuf,
        /// Skip domains whose prefix already has a logo
        #[arg(long)]
        prefix_prefilter: bool,
    },

    /// Crop and letterbox logos onto a fixed transparent canvas
    Normalize {
        /// Directory of fetched logos
        #[arg(short, long, value_name = "DIR")]
        input: PathBuf,
        /// Directory for the normalized PNGs
        #[arg(short, long, value_name = "DIR", default_value = "normalized")]
        out: PathBuf,
    },

    /// Cluster a directory of normalized logos
    Cluster {
        /// Directory of normalized logos
        #[arg(short, long, value_name = "DIR")]
        input: PathBuf,
        /// Text report destination
        #[arg(long, value_name = "FILE", default_value = report::DEFAULT_REPORT_FILE)]
        report: PathBuf,
        /// Copy each cluster into its own directory under DIR
        #[arg(long, value_name = "DIR")]
        copy_to: Option<PathBuf>,
        /// Also write assignments and failures as JSON
        #[arg(long, value_name = "FILE")]
        json: Option<PathBuf>,
    },

    /// Fetch, normalize and cluster in one go
    Run {
        /// Domain list, one per line
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
        /// Directory that receives every intermediate and result
        #[arg(short, long, value_name = "DIR", default_value = "work")]
        work_dir: PathBuf,
        /// Skip domains whose prefix already has a logo
        #[arg(long)]
        prefix_prefilter: bool,
        /// Do not copy clusters into per-cluster directories
        #[arg(long)]
        no_copy: bool,
    },

    /// Name-prefix duplicate workflows
    Prefix {
        #[command(subcommand)]
        command: PrefixCmd,
    },
}

#[derive(Subcommand, Debug)]
enum PrefixCmd {
    /// List groups of logos sharing a name prefix
    Scan {
        /// Directory to scan
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },

    /// Move duplicates into `<dir>/duplicates`
    Cull {
        /// Directory to cull
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Only show what would be moved
        #[arg(long)]
        dry_run: bool,
        /// Directory to move duplicates into (default: `<dir>/duplicates`)
        #[arg(long, value_name = "DIR")]
        target_dir: Option<PathBuf>,
    },

    /// Permanently delete duplicate logos
    Delete {
        /// Directory to clean up
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Fetch {
            input,
            out,
            prefix_prefilter,
        } => {
            let domains = read_domain_list(&input)
                .with_context(|| format!("Failed to read domain list {:?}", input))?;
            println!("▶ Fetching logos for {} domains into {}", domains.len(), out.display());

            let bar = progress_bar(domains.len() as u64)?;
            let fetcher = FetchService::new(&config.fetch)
                .context("Failed to build HTTP client")?
                .with_progress(tick(&bar));
            let fetched = benchmark("fetching logos", || {
                fetcher.fetch_all(&domains, &out, prefix_prefilter)
            })?;
            bar.finish_and_clear();

            println!(
                "✅ {} logos available, {} skipped by prefix",
                fetched.assets.len(),
                fetched.skipped.len()
            );
            print_failures(&fetched.failures);
        }

        Commands::Normalize { input, out } => {
            let (assets, mut failures) = discover_assets(&input)
                .with_context(|| format!("Failed to list {:?}", input))?;
            println!("▶ Normalizing {} logos into {}", assets.len(), out.display());

            let bar = progress_bar(assets.len() as u64)?;
            let normalizer = NormalizerService::from_config(&config).with_progress(tick(&bar));
            let normalized = benchmark("normalizing", || normalizer.normalize_all(&assets, &out))?;
            bar.finish_and_clear();

            println!("✅ Normalized {} logos", normalized.images.len());
            failures.extend(normalized.failures);
            print_failures(&failures);
        }

        Commands::Cluster {
            input,
            report: report_path,
            copy_to,
            json,
        } => {
            println!(
                "▶ Clustering {} with {:?} features (eps {})",
                input.display(),
                config.strategy,
                config.epsilon()
            );
            let spinner = spinner("Extracting features…")?;
            let pipeline = Pipeline::new(config.clone())?;
            let outcome = benchmark("clustering", || pipeline.cluster_directory(&input))?;
            spinner.finish_and_clear();

            report::write_cluster_report(&report_path, &outcome.partition, &outcome.paths)
                .with_context(|| format!("Failed to write report {:?}", report_path))?;
            let clusters = outcome.partition.clusters();
            let duplicated = clusters.iter().filter(|c| c.members.len() > 1).count();
            println!(
                "✨ {} logos in {} clusters ({} with more than one member)",
                outcome.partition.len(),
                clusters.len(),
                duplicated
            );
            println!("✅ Clustering results written to {}", report_path.display());

            if let Some(base) = copy_to {
                report::materialize_clusters(&base, &outcome.partition, &outcome.paths)
                    .with_context(|| format!("Failed to copy clusters into {:?}", base))?;
                println!("📦 Clustered images copied to {}", base.display());
            }
            if let Some(json) = json {
                let mut summary = RunSummary::new(config.strategy, config.epsilon(), &outcome.partition);
                summary.failures = outcome.failures.clone();
                summary
                    .write_json(&json)
                    .with_context(|| format!("Failed to write {:?}", json))?;
            }
            print_failures(&outcome.failures);
        }

        Commands::Run {
            input,
            work_dir,
            prefix_prefilter,
            no_copy,
        } => {
            let domains = read_domain_list(&input)
                .with_context(|| format!("Failed to read domain list {:?}", input))?;
            println!("▶ Running the full pipeline on {} domains", domains.len());

            let spinner = spinner("Working…")?;
            let pipeline = Pipeline::new(config)?.with_progress(tick(&spinner));
            let options = RunOptions {
                prefix_prefilter,
                copy_clusters: !no_copy,
            };
            let run = benchmark("full run", || pipeline.run(&domains, &work_dir, options))?;
            spinner.finish_and_clear();

            println!(
                "✨ {} logos in {} clusters, {} prefix groups with duplicates",
                run.partition.len(),
                run.partition.clusters().len(),
                run.summary.prefix_groups.len()
            );
            println!("✅ Report written to {}", run.report_path.display());
            print_failures(&run.summary.failures);
        }

        Commands::Prefix { command } => match command {
            PrefixCmd::Scan { path } => {
                println!("▶ Scanning for prefix duplicates in: {}", path.display());
                let sets = CullService::new().scan(&path)?;
                if sets.is_empty() {
                    println!("No duplicates found.");
                } else {
                    println!("Found {} duplicate group(s):", sets.len());
                    for set in &sets {
                        println!(" Prefix {}:", set.key);
                        println!("   🏆 {}", set.keep.display());
                        for dup in &set.duplicates {
                            println!("   ▶ {}", dup.display());
                        }
                    }
                }
            }

            PrefixCmd::Cull {
                path,
                dry_run,
                target_dir,
            } => {
                println!("▶ Culling prefix duplicates in: {}", path.display());
                let dup_dir = target_dir.unwrap_or_else(|| path.join("duplicates"));
                let outcome = CullService::new()
                    .cull(&path, Some(&dup_dir), dry_run)
                    .with_context(|| format!("Failed to cull {:?}", path))?;
                if outcome.sets.is_empty() {
                    println!("No duplicates found.");
                    return Ok(());
                }
                for set in &outcome.sets {
                    println!("\n✨ Prefix {}:", set.key);
                    println!("   🏆 Keeping → {}", set.keep.display());
                    for dup in &set.duplicates {
                        if dry_run {
                            println!("   📦 [dry-run] MOVE {} → {}", dup.display(), dup_dir.display());
                        } else if outcome.removed.contains(dup) {
                            println!("   📦 Moved {} → {}", dup.display(), dup_dir.display());
                        }
                    }
                }
                if dry_run {
                    println!("\n⚠️  Dry-run only; no files were changed.");
                } else {
                    println!("\n✅ Moved {} file(s)", outcome.removed.len());
                    print_cull_failures(&outcome.failures);
                }
            }

            PrefixCmd::Delete { path, yes } => {
                let service = CullService::new();
                let sets = service.scan(&path)?;
                if sets.is_empty() {
                    println!("No duplicates found.");
                    return Ok(());
                }
                let count: usize = sets.iter().map(|s| s.duplicates.len()).sum();
                if !yes
                    && !Confirm::new()
                        .with_prompt(format!("Permanently delete {} file(s)?", count))
                        .default(false)
                        .interact()?
                {
                    println!("Aborted.");
                    return Ok(());
                }
                // Only the files the user confirmed are touched.
                let outcome = service.delete_sets(sets);
                for removed in &outcome.removed {
                    println!("   🗑️  Deleted {}", removed.display());
                }
                println!("\n✅ Deleted {} file(s)", outcome.removed.len());
                print_cull_failures(&outcome.failures);
            }
        },
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())
        .with_context(|| format!("Failed to load configuration {:?}", cli.config))?;
    if let Some(strategy) = cli.strategy {
        config.strategy = strategy;
    }
    if let Some(eps) = cli.eps {
        config.set_epsilon(eps);
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn progress_bar(len: u64) -> Result<ProgressBar> {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    Ok(bar)
}

fn spinner(message: &'static str) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(100));
    Ok(spinner)
}

/// Progress callback that advances `bar` and shows the item just finished.
fn tick(bar: &ProgressBar) -> ProgressCallback {
    let bar = bar.clone();
    Arc::new(move |id: &str| {
        bar.set_message(id.to_string());
        bar.inc(1);
    })
}

fn print_failures(failures: &[Failure]) {
    if failures.is_empty() {
        return;
    }
    println!("⚠️  {} item(s) dropped:", failures.len());
    for failure in failures {
        println!("   {:?} {}: {}", failure.stage, failure.id, failure.reason);
    }
}

fn print_cull_failures(failures: &[CullFailure]) {
    if failures.is_empty() {
        return;
    }
    println!("⚠️  {} file(s) left in place:", failures.len());
    for failure in failures {
        println!("   {}: {}", failure.path.display(), failure.reason);
    }
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
