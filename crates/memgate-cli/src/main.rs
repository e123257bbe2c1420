//! memgate - build-and-verify gate for C exercise trees
//!
//! ## Commands
//!
//! - `run`: build every unit under every profile, verify the executables and
//!   print a summary; the exit status is the verdict
//! - `discover`: list the candidate units and their artifact stems
//! - `profiles`: print the effective profiles as TOML
//!
//! Exit status: 0 when every profile passes, 1 when any profile fails
//! (including a systemic build failure), 2 on configuration or internal
//! errors.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::io::AsyncWriteExt;
use tracing::{info, Level};

use memgate_ci::{
    discover, profiles_to_toml, scan, Pipeline, ProcessAnalyzer, ProcessCompiler, RunConfig,
    RunManifest, SummaryFormat, UnitBuilder, VerificationRunner,
};

#[derive(Parser)]
#[command(name = "memgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    about = "Build C units under memory checkers and gate CI on the result",
    long_about = None
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and verify every unit, then print the summary
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Summary format printed on stdout
        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,

        /// Also append a Markdown summary to this file (e.g. a CI step summary)
        #[arg(long, env = "MEMGATE_SUMMARY")]
        summary_file: Option<PathBuf>,
    },

    /// List candidate source units
    Discover {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Print the effective profiles as TOML
    Profiles {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct ConfigArgs {
    /// Source root to scan
    #[arg(default_value = ".")]
    root: PathBuf,

    /// Configuration file (default: <root>/memgate.toml when present)
    #[arg(short, long, env = "MEMGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Artifact directory
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Maximum concurrent compiler and checker processes
    #[arg(short, long, env = "MEMGATE_JOBS")]
    jobs: Option<usize>,

    /// Profiles to run (comma-separated; default: all configured)
    #[arg(short, long, value_delimiter = ',')]
    profile: Vec<String>,

    /// Additional path prefixes to exclude
    #[arg(short, long)]
    exclude: Vec<PathBuf>,

    /// Pass when no source units are found
    #[arg(long)]
    allow_empty: bool,
}

impl ConfigArgs {
    /// Load the configuration and apply command-line overrides.
    fn load(&self) -> Result<RunConfig> {
        let mut config = RunConfig::locate(&self.root, self.config.as_deref())
            .context("Failed to load configuration")?;

        if let Some(output_dir) = &self.output_dir {
            config.output_dir = output_dir.clone();
        }
        if let Some(jobs) = self.jobs {
            config.jobs = Some(jobs);
        }
        config.exclude.extend(self.exclude.iter().cloned());
        config.allow_empty |= self.allow_empty;
        config
            .select_profiles(&self.profile)
            .context("Invalid profile selection")?;
        Ok(config)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Markdown,
    Json,
}

impl From<Format> for SummaryFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Text => SummaryFormat::Text,
            Format::Markdown => SummaryFormat::Markdown,
            Format::Json => SummaryFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    memgate_ci::init_tracing(cli.json, level);

    let result = match cli.command {
        Commands::Run {
            config,
            format,
            summary_file,
        } => cmd_run(&config, format, summary_file.as_deref()).await,
        Commands::Discover { config } => cmd_discover(&config).map(|_| true),
        Commands::Profiles { config } => cmd_profiles(&config).map(|_| true),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

/// Run the full pipeline. Returns the combined verdict.
async fn cmd_run(args: &ConfigArgs, format: Format, summary_file: Option<&Path>) -> Result<bool> {
    let started_at = Utc::now();
    let config = args.load()?;
    let root = args.root.as_path();
    let profiles = config.to_profiles(root).context("Invalid configuration")?;
    let output_root = config.output_root(root);

    let rules = config.discovery_rules(root).context("Invalid configuration")?;
    let units = discover(root, &rules)
        .with_context(|| format!("Failed to scan {}", root.display()))?;
    info!(root = %root.display(), units = units.len(), "Discovered units");

    let pipeline = Pipeline::new(
        UnitBuilder::new(Arc::new(ProcessCompiler), root),
        VerificationRunner::new(Arc::new(ProcessAnalyzer)),
        config.jobs(),
    )
    .allow_empty(config.allow_empty);
    let report = pipeline
        .run(&units, &profiles)
        .await
        .context("Pipeline failed to run")?;

    let rendered = SummaryFormat::from(format).render(&report)?;
    print!("{rendered}");

    let mut manifest = RunManifest::new(root, units.len(), &report, started_at, Utc::now());
    if let Some(path) = summary_file {
        let markdown = SummaryFormat::Markdown.render(&report)?;
        append_summary(path, &markdown).await?;
        manifest = manifest.with_summary_path(path);
    }
    let manifest_path = manifest
        .write(&output_root)
        .await
        .context("Failed to write run manifest")?;
    info!(
        run_id = %manifest.run_id,
        manifest = %manifest_path.display(),
        passed = report.passed,
        "Run recorded"
    );

    Ok(report.passed)
}

async fn append_summary(path: &Path, markdown: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open summary file {}", path.display()))?;
    file.write_all(markdown.as_bytes())
        .await
        .with_context(|| format!("Failed to write summary file {}", path.display()))?;
    Ok(())
}

fn cmd_discover(args: &ConfigArgs) -> Result<()> {
    let config = args.load()?;
    let root = args.root.as_path();
    let rules = config.discovery_rules(root).context("Invalid configuration")?;
    let units = scan(root, &rules)
        .with_context(|| format!("Failed to scan {}", root.display()))?;

    if units.is_empty() {
        println!("No source units under {}", root.display());
        return Ok(());
    }

    for unit in &units {
        if unit.eligible {
            println!("  ✓ {} -> {}", unit.path, unit.artifact_stem);
        } else {
            println!("  - {} (excluded)", unit.path);
        }
    }
    let eligible = units.iter().filter(|u| u.eligible).count();
    println!();
    println!("{eligible}/{} units eligible", units.len());
    Ok(())
}

fn cmd_profiles(args: &ConfigArgs) -> Result<()> {
    let config = args.load()?;
    let profiles = config
        .to_profiles(&args.root)
        .context("Invalid configuration")?;
    print!("{}", profiles_to_toml(&profiles)?);
    Ok(())
}
