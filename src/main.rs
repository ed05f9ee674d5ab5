use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use versiontracker::{Config, InstalledApp, Orchestrator, TrackerError, apps};

#[derive(Parser)]
#[command(name = "versiontracker")]
#[command(author, version, about = "Find installed applications that Homebrew casks can manage or update", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List installed apps that could be installed through a cask
    Candidates {
        /// JSON file of apps to check (defaults to scanning /Applications)
        #[arg(long)]
        apps: Option<PathBuf>,

        /// Skip the lookup cache
        #[arg(long)]
        no_cache: bool,

        /// Seconds between Homebrew calls
        #[arg(long)]
        rate_limit: Option<f64>,
    },

    /// List installed apps with a newer cask version
    Updates {
        /// JSON file of apps to check (defaults to scanning /Applications)
        #[arg(long)]
        apps: Option<PathBuf>,

        /// Seconds between Homebrew calls
        #[arg(long)]
        rate_limit: Option<f64>,
    },

    /// Inspect or clear the lookup cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cache location and usage
    Info,
    /// Remove cached entries
    Clear {
        /// Only remove entries from this source (e.g. "lookup", "brew-list")
        #[arg(long)]
        source: Option<String>,
    },
}

fn load_apps(path: Option<&Path>) -> anyhow::Result<Vec<InstalledApp>> {
    match path {
        Some(path) => apps::load_apps_file(path),
        None => apps::scan_applications(Path::new("/Applications")),
    }
}

fn spinner(message: &str) -> ProgressBar {
    let is_tty = std::io::IsTerminal::is_terminal(&std::io::stdout());
    if !is_tty {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Print whatever an aborted run managed to gather before failing.
fn report_partial(err: &TrackerError) {
    if let Some(partial) = err.partial_results()
        && !partial.is_empty()
    {
        println!("{}", "==> Partial results".bold().yellow());
        for result in partial {
            let status = match result.error {
                Some(kind) => kind.to_string().red(),
                None if result.is_installable() => "installable".green(),
                None => "not found".dimmed(),
            };
            println!("{} ({})", result.name.bold(), status);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Candidates {
            apps,
            no_cache,
            rate_limit,
        } => {
            let installed = load_apps(apps.as_deref())?;
            let orchestrator = Orchestrator::from_config(config)?;

            let pb = spinner(&format!("Checking {} applications...", installed.len()));
            let result = orchestrator.check_brew_install_candidates(&installed, rate_limit, !no_cache);
            pb.finish_and_clear();

            let candidates = result.inspect_err(report_partial)?;
            let installable: Vec<_> = candidates.iter().filter(|(_, _, ok)| *ok).collect();
            if installable.is_empty() {
                println!("{} No installable applications found", "✓".green());
                return Ok(());
            }

            println!("{}", "==> Installable with Homebrew".bold().green());
            for (name, version, _) in installable {
                println!("{} {}", name.bold(), version.dimmed());
            }
        }
        Commands::Updates { apps, rate_limit } => {
            let installed = load_apps(apps.as_deref())?;
            let orchestrator = Orchestrator::from_config(config)?;

            let pb = spinner(&format!("Checking {} applications for updates...", installed.len()));
            let result = orchestrator.check_brew_update_candidates(&installed, rate_limit);
            pb.finish_and_clear();

            let updates = result.inspect_err(report_partial)?;
            if updates.is_empty() {
                println!("{} All applications are up to date", "✓".green());
                return Ok(());
            }

            println!("{}", "==> Updates available".bold().green());
            for (name, update) in &updates {
                println!(
                    "{} {} → {} ({}, {}% match)",
                    name.bold(),
                    update.version.dimmed(),
                    update.latest_version.green(),
                    update.cask.cyan(),
                    update.similarity
                );
            }
        }
        Commands::Cache { action } => {
            config.validate()?;
            let cache = versiontracker::TieredCache::from_config(&config.cache)?;
            match action {
                CacheAction::Info => {
                    let stats = cache.stats();
                    println!("{}", "==> Lookup Cache".bold().green());
                    println!("{}: {}", "Location".bold(), cache.dir().display().to_string().cyan());
                    println!("{}: {}", "Entries".bold(), stats.disk_entries.to_string().cyan());
                    println!("{}: {} bytes", "Size".bold(), stats.disk_bytes.to_string().cyan());
                }
                CacheAction::Clear { source } => {
                    let removed = cache.clear(source.as_deref())?;
                    println!(
                        "{} Removed {} cache entries",
                        "✓".green().bold(),
                        removed.to_string().bold()
                    );
                }
            }
        }
    }

    Ok(())
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}
