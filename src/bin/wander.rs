use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wander::cache::DownloadCache;
use wander::config::{BuildConfig, PipelineDefinition, StageDefinition, ROOT_ENV};
use wander::executor::{Chroot, ShellExecutor};
use wander::pipeline::{self, AssumeNo, AssumeYes, PipelineOutcome, Prompt, TerminalPrompt};
use wander::preflight;
use wander::stage::StageRunner;
use wander::status::Console;

/// Build a Linux distribution from source, stage by stage
#[derive(Parser)]
#[command(name = "wander")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Root of the build tree (default: $WANDER)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Shared download cache (default: $WANDER_CACHE, then the user cache dir)
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    /// Transcript directory (default: ./logs)
    #[arg(long, global = true)]
    logs: Option<PathBuf>,

    /// Shell used to run commands
    #[arg(long, global = true)]
    shell: Option<String>,

    /// Login name of the unprivileged build user
    #[arg(long, global = true)]
    build_user: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage of a pipeline document
    Run {
        /// Pipeline document (.yaml, .yml or .toml)
        pipeline: PathBuf,

        /// Continue past failed stages without asking
        #[arg(long, conflicts_with = "no")]
        yes: bool,

        /// Abort at the first failed stage without asking
        #[arg(long)]
        no: bool,
    },

    /// Run a single stage document
    Stage {
        /// Stage document (.yaml, .yml or .toml)
        document: PathBuf,
    },

    /// Inspect the download cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Check that the host has the tools a build needs
    Check,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List verified archives
    List,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_env("WANDER_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { pipeline, yes, no } => {
            let config = build_config(&cli.global, true)?;
            let mut prompt: Box<dyn Prompt> = if yes {
                Box::new(AssumeYes)
            } else if no {
                Box::new(AssumeNo)
            } else {
                Box::new(TerminalPrompt)
            };
            let code = cmd_run(&config, &pipeline, prompt.as_mut())?;
            std::process::exit(code);
        }
        Commands::Stage { document } => {
            let config = build_config(&cli.global, true)?;
            let passed = cmd_stage(&config, &document)?;
            std::process::exit(if passed { 0 } else { 1 });
        }
        Commands::Cache {
            command: CacheCommands::List,
        } => cmd_cache_list(&build_config(&cli.global, false)?),
        Commands::Check => {
            preflight::check_host_tools(&build_config(&cli.global, false)?)?;
            println!("All required host tools are present.");
            Ok(())
        }
    }
}

fn build_config(args: &GlobalArgs, require_root: bool) -> Result<BuildConfig> {
    let mut config = match &args.root {
        Some(root) => BuildConfig::new(root),
        None if require_root => BuildConfig::from_env()?,
        None => BuildConfig::from_env().unwrap_or_else(|_| BuildConfig::new("/")),
    };
    if require_root && !config.build_root.is_dir() {
        bail!(
            "build root {} does not exist (set {ROOT_ENV} or pass --root)",
            config.build_root.display()
        );
    }
    if let Some(cache) = &args.cache {
        config = config.with_cache_dir(cache);
    }
    if let Some(logs) = &args.logs {
        config = config.with_log_dir(logs);
    }
    if let Some(shell) = &args.shell {
        config = config.with_shell(shell);
    }
    if let Some(user) = &args.build_user {
        config = config.with_build_user(user);
    }
    Ok(config)
}

fn cmd_run(config: &BuildConfig, document: &Path, prompt: &mut dyn Prompt) -> Result<i32> {
    preflight::check_host_tools(config)?;
    let definition = PipelineDefinition::load(document)?;

    let cache = DownloadCache::http(&config.cache_dir);
    let (mut shell, mut chroot, mut console) = (ShellExecutor, Chroot, Console);
    let mut stages = StageRunner::new(config, &mut shell, &cache, &mut chroot, &mut console);

    let outcome = pipeline::run(&definition, &mut stages, prompt)
        .with_context(|| format!("Pipeline {} failed to load a stage", document.display()))?;
    match &outcome {
        PipelineOutcome::Completed { failed_stages } if failed_stages.is_empty() => {
            println!("All stages passed.");
        }
        PipelineOutcome::Completed { failed_stages } => {
            println!("Completed with failed stages: {}", failed_stages.join(", "));
        }
        PipelineOutcome::Aborted { stage, exit_code } => {
            println!("Aborted after stage {stage} (exit code {exit_code}).");
        }
    }
    Ok(outcome.exit_code())
}

fn cmd_stage(config: &BuildConfig, document: &Path) -> Result<bool> {
    preflight::check_host_tools(config)?;
    let definition = StageDefinition::load(document)?;

    let cache = DownloadCache::http(&config.cache_dir);
    let (mut shell, mut chroot, mut console) = (ShellExecutor, Chroot, Console);
    let report = StageRunner::new(config, &mut shell, &cache, &mut chroot, &mut console)
        .run(&definition);
    if !report.failed_modules.is_empty() {
        println!("Failed: {}", report.failed_modules.join(", "));
    }
    Ok(report.passed)
}

fn cmd_cache_list(config: &BuildConfig) -> Result<()> {
    let cache = DownloadCache::http(&config.cache_dir);
    let records = cache.records()?;
    if records.is_empty() {
        println!("No verified archives in {}", config.cache_dir.display());
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {}  -> {}",
            record.checksum,
            record.cache_path.display(),
            record.target_path.display()
        );
    }
    Ok(())
}
