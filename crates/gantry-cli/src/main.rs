use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use gantry::config::{self, ConfigFile};
use gantry::environment;
use gantry::image::{self, ImageSpec};
use gantry::pipeline::{self, Reporter};
use gantry::runner::SystemRunner;
use gantry::secrets::DeploySecrets;
use gantry::types::{PipelineOptions, RunReceipt};

#[derive(Parser, Debug)]
#[command(name = "gantry", version)]
#[command(about = "Build-and-deploy orchestrator: compile, gate on the release ref, ship")]
struct Cli {
    /// Project root (where .gantry.toml is looked up)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Directory for state, receipts, events, and the artifact store
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Ref that gates the Deploy job (exact match)
    #[arg(long)]
    release_ref: Option<String>,

    /// Binary (and artifact) name
    #[arg(long)]
    binary: Option<String>,

    /// Feature flag passed to the build
    #[arg(long)]
    features: Option<String>,

    /// Source tree the Build job compiles
    #[arg(long)]
    context: Option<PathBuf>,

    /// Best-effort build cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Artifact store directory (default: <state-dir>/artifacts)
    #[arg(long)]
    artifacts_dir: Option<PathBuf>,

    /// Container engine program
    #[arg(long)]
    engine: Option<String>,

    /// Secure-copy program
    #[arg(long)]
    transfer: Option<String>,

    /// Wall-clock limit per external command (e.g. 90s, 10m)
    #[arg(long)]
    step_timeout: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the pipeline plan and configured image digests without executing anything.
    Plan,
    /// Print the containerfile for a configured image spec.
    Render {
        /// Image name from .gantry.toml
        #[arg(long)]
        image: String,
    },
    /// Build a configured image through the container engine.
    BuildImage {
        /// Image name from .gantry.toml
        #[arg(long)]
        image: String,
        /// Build context directory (default: the pipeline context)
        #[arg(long)]
        context: Option<PathBuf>,
    },
    /// Run the Build job only; Deploy is recorded as skipped.
    Build {
        /// Triggering ref (e.g. refs/heads/feature/x)
        #[arg(long = "ref")]
        git_ref: String,
    },
    /// Run the full pipeline: Build, branch guard, Deploy.
    Run {
        /// Triggering ref (e.g. refs/heads/main)
        #[arg(long = "ref")]
        git_ref: String,
    },
    /// Print the most recent run receipt as JSON.
    Receipt,
    /// Print environment and secret diagnostics (names only, never values).
    Doctor,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::load_config(&cli.root)?;
    let opts = resolve_options(&cli, config.as_ref())?;

    let mut reporter = CliReporter;
    let mut runner = SystemRunner::new(opts.step_timeout);

    match &cli.cmd {
        Commands::Plan => {
            print_plan(&opts, config.as_ref());
        }
        Commands::Render { image } => {
            let spec = lookup_image(config.as_ref(), image)?;
            print!("{}", spec.render_containerfile());
        }
        Commands::BuildImage { image, context } => {
            let spec = lookup_image(config.as_ref(), image)?;
            let context = context.as_ref().unwrap_or(&opts.context_dir);
            let built = image::build_image(spec, context, &opts.engine, &mut runner)?;
            println!("built {} ({})", built.tag, built.digest);
        }
        Commands::Build { git_ref } => {
            let receipt = pipeline::run_build(git_ref, &opts, &mut runner, &mut reporter)?;
            print_receipt(&receipt, &opts);
            ensure_success(&receipt)?;
        }
        Commands::Run { git_ref } => {
            let receipt = pipeline::run_pipeline(git_ref, &opts, &mut runner, &mut reporter)?;
            print_receipt(&receipt, &opts);
            ensure_success(&receipt)?;
        }
        Commands::Receipt => {
            let receipt = gantry::state::load_receipt(&opts.state_dir)?
                .context("no receipt found; run a pipeline first")?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Commands::Doctor => {
            run_doctor(&opts);
        }
    }

    Ok(())
}

/// Defaults < config file < CLI flags.
fn resolve_options(cli: &Cli, config: Option<&ConfigFile>) -> Result<PipelineOptions> {
    let mut opts = PipelineOptions::default();
    if let Some(config) = config {
        config.apply(&mut opts);
    }

    if let Some(state_dir) = &cli.state_dir {
        opts.state_dir = state_dir.clone();
    }
    if let Some(release_ref) = &cli.release_ref {
        opts.release_ref = release_ref.clone();
    }
    if let Some(binary) = &cli.binary {
        opts.binary = binary.clone();
    }
    if let Some(features) = &cli.features {
        opts.features = features.clone();
    }
    if let Some(context) = &cli.context {
        opts.context_dir = context.clone();
    }
    if let Some(cache_dir) = &cli.cache_dir {
        opts.cache_dir = Some(cache_dir.clone());
    }
    if let Some(artifacts_dir) = &cli.artifacts_dir {
        opts.artifacts_dir = Some(artifacts_dir.clone());
    }
    if let Some(engine) = &cli.engine {
        opts.engine = engine.clone();
    }
    if let Some(transfer) = &cli.transfer {
        opts.transfer = transfer.clone();
    }
    if let Some(timeout) = &cli.step_timeout {
        opts.step_timeout = Some(parse_duration(timeout)?);
    }

    Ok(opts)
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))
}

fn lookup_image<'a>(config: Option<&'a ConfigFile>, name: &str) -> Result<&'a ImageSpec> {
    config
        .and_then(|c| c.image_spec(name))
        .with_context(|| format!("image `{name}` is not configured in {}", config::CONFIG_FILE))
}

fn print_plan(opts: &PipelineOptions, config: Option<&ConfigFile>) {
    println!("release_ref: {}", opts.release_ref);
    println!("binary: {} (features: {})", opts.binary, opts.features);
    println!("context: {}", opts.context_dir.display());
    println!("artifacts: {}", opts.artifacts_root().display());
    println!();
    println!("jobs:");
    println!("  1. build   — compile, publish artifact `{}`", opts.binary);
    println!("  2. deploy  — guarded: ref must equal {}", opts.release_ref);

    if let Some(config) = config {
        if !config.image.is_empty() {
            println!();
            println!("images:");
            for (name, spec) in &config.image {
                println!("  {name}: {}", &spec.digest()[..12]);
            }
        }
    }
}

fn print_receipt(receipt: &RunReceipt, opts: &PipelineOptions) {
    println!("run_id: {}", receipt.run_id);
    println!("ref: {}", receipt.ref_name);
    println!("deploy_allowed: {}", receipt.deploy_allowed);
    println!(
        "receipt: {}",
        gantry::state::receipt_path(&opts.state_dir).display()
    );
    println!();

    for job in &receipt.jobs {
        println!("{}: {:?} ({}ms)", job.name, job.state, job.duration_ms);
    }
}

fn ensure_success(receipt: &RunReceipt) -> Result<()> {
    if !receipt.success() {
        bail!("pipeline run {} failed", receipt.run_id);
    }
    Ok(())
}

fn run_doctor(opts: &PipelineOptions) {
    let fp = environment::collect_fingerprint(&opts.engine, &opts.transfer);
    println!("gantry: {}", fp.gantry_version);
    println!("host: {} ({} {})", fp.hostname, fp.os, fp.arch);
    println!("toolchain: {}", fp.toolchain_version.as_deref().unwrap_or("not found"));
    println!(
        "engine ({}): {}",
        opts.engine,
        fp.engine_version.as_deref().unwrap_or("not found")
    );
    println!(
        "transfer ({}): {}",
        opts.transfer,
        fp.transfer_version.as_deref().unwrap_or("not found")
    );
    println!();
    println!("secrets:");
    for (var, present) in DeploySecrets::present_vars() {
        println!("  {var}: {}", if present { "set" } else { "missing" });
    }
}
