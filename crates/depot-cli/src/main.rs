//! Depot - hermetic workspace build and check orchestration CLI
//!
//! The `depot` command builds workspace packages against a shared
//! dependency bundle and runs quality checks over the whole workspace.
//!
//! ## Commands
//!
//! - `build`: Build packages (all buildable packages by default)
//! - `run`: Build one package and run its executable
//! - `check`: Run quality checks
//! - `fmt`: Format the workspace, or check formatting
//! - `audit`: Run the security, license and dependency-consistency audits
//! - `key`: Show the dependency cache key
//! - `sources`: List a package's source file set
//! - `env`: Show the provisioned environment
//! - `plan`: Show the task graph

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, Level};

use depot_ci::{
    apply_fix, select_checks, CheckKind, CheckSpec, Orchestrator, RunReport, RunRequest,
};
use depot_core::{
    CacheKey, DepotConfig, SourceFileSetResolver, TaskGraph, Workspace, WorkspaceDescriptor,
};

#[derive(Parser)]
#[command(name = "depot")]
#[command(author = "Depot Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Hermetic workspace build and check orchestration", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    /// Workspace root
    #[arg(long, global = true, env = "DEPOT_WORKSPACE", default_value = ".")]
    workspace: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build packages against the shared dependency bundle
    Build {
        /// Packages to build (default: every buildable package)
        packages: Vec<String>,

        /// Build every buildable package
        #[arg(long, conflicts_with = "packages")]
        all: bool,
    },

    /// Build a package and run its executable
    Run {
        /// Package to run
        package: String,

        /// Arguments passed to the executable
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Run quality checks over the workspace
    Check {
        /// Only run these checks (comma-separated)
        #[arg(long, value_delimiter = ',')]
        only: Vec<CheckKind>,

        /// Number of test shards (default: checks.test_shards)
        #[arg(long)]
        shards: Option<u32>,
    },

    /// Format the workspace in place
    Fmt {
        /// Only report non-conforming files
        #[arg(long)]
        check: bool,
    },

    /// Run the security, license and dependency-consistency audits
    Audit,

    /// Show the dependency cache key and whether its bundle is published
    Key,

    /// List the source file set of a package
    Sources {
        /// Package name
        package: String,
    },

    /// Show the provisioned build/run environment
    Env {
        /// Print POSIX shell export lines
        #[arg(long)]
        exports: bool,
    },

    /// Show the task graph for building everything and running every check
    Plan,
}

/// Loaded workspace plus its configuration.
struct Session {
    root: PathBuf,
    config: DepotConfig,
    workspace: Workspace,
}

impl Session {
    fn open(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("Workspace root {} not found", root.display()))?;
        let config = DepotConfig::discover(&root).context("Failed to load depot configuration")?;
        let workspace = WorkspaceDescriptor::load(&root, &config.workspace)
            .with_context(|| format!("Failed to load workspace at {}", root.display()))?;
        debug!(root = %root.display(), packages = workspace.packages().len(), "Loaded workspace");
        Ok(Self {
            root,
            config,
            workspace,
        })
    }

    fn orchestrator(&self) -> Result<Orchestrator> {
        Orchestrator::from_config(&self.root, &self.config)
            .context("Failed to prepare the build environment")
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    depot_core::init_tracing(cli.json, level);

    let session = Session::open(&cli.workspace)?;
    match cli.command {
        Commands::Build { packages, all } => cmd_build(&session, packages, all, cli.json).await,
        Commands::Run { package, args } => cmd_run(&session, &package, &args).await,
        Commands::Check { only, shards } => {
            let shards = shards.unwrap_or(session.config.checks.test_shards);
            if shards == 0 {
                bail!("--shards must be at least 1");
            }
            cmd_checks(&session, select_checks(&only, shards), cli.json).await
        }
        Commands::Fmt { check: true } => {
            cmd_checks(&session, vec![CheckSpec::new(CheckKind::Format)], cli.json).await
        }
        Commands::Fmt { check: false } => cmd_fmt(&session).await,
        Commands::Audit => {
            cmd_checks(&session, CheckSpec::plan(&CheckKind::AUDITS, 1), cli.json).await
        }
        Commands::Key => cmd_key(&session, cli.json),
        Commands::Sources { package } => cmd_sources(&session, &package, cli.json),
        Commands::Env { exports } => cmd_env(&session, exports, cli.json),
        Commands::Plan => cmd_plan(&session, cli.json),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print the report and turn its verdict into the exit code.
fn finish(report: &RunReport, json: bool) -> Result<ExitCode> {
    if json {
        print_json(report)?;
    } else {
        print!("{}", report.render());
    }
    let verdict = report.verdict();
    if verdict.passed {
        return Ok(ExitCode::SUCCESS);
    }
    eprintln!("{}", verdict.message);
    for violation in &verdict.violations {
        eprintln!("  {}", violation);
    }
    Ok(ExitCode::from(report.exit_code().clamp(1, 255) as u8))
}

async fn cmd_build(
    session: &Session,
    packages: Vec<String>,
    all: bool,
    json: bool,
) -> Result<ExitCode> {
    let request = if all || packages.is_empty() {
        RunRequest::all_packages(&session.workspace)
    } else {
        RunRequest::builds(packages)
    };
    let report = session
        .orchestrator()?
        .run(&session.workspace, &request)
        .await
        .context("Build aborted")?;
    finish(&report, json)
}

async fn cmd_run(session: &Session, package: &str, args: &[String]) -> Result<ExitCode> {
    let orchestrator = session.orchestrator()?;
    let report = orchestrator
        .run(&session.workspace, &RunRequest::builds([package]))
        .await
        .context("Build aborted")?;
    let record = report
        .build(package)
        .with_context(|| format!("No build recorded for {}", package))?;
    let executable = match &record.status {
        depot_ci::BuildStatus::Built {
            executable: Some(path),
            ..
        } => path.clone(),
        depot_ci::BuildStatus::Built { .. } => bail!("Package {} has no executable", package),
        depot_ci::BuildStatus::Failed { .. } => return finish(&report, false),
    };

    let code = orchestrator.launch(&executable, args).await?;
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

async fn cmd_checks(session: &Session, checks: Vec<CheckSpec>, json: bool) -> Result<ExitCode> {
    let report = session
        .orchestrator()?
        .run(&session.workspace, &RunRequest::checks(checks))
        .await
        .context("Checks aborted")?;
    finish(&report, json)
}

async fn cmd_fmt(session: &Session) -> Result<ExitCode> {
    let env = session.orchestrator()?.env().process_env_vars();
    let output = apply_fix(CheckKind::Format, &session.root, env).await?;
    if output.success {
        println!("Formatted {}", session.root.display());
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("{}", output.combined());
        Ok(ExitCode::FAILURE)
    }
}

#[derive(Serialize)]
struct KeyInfo {
    key: String,
    published: bool,
    bundle: Option<PathBuf>,
}

fn cmd_key(session: &Session, json: bool) -> Result<ExitCode> {
    let key = CacheKey::for_workspace(&session.workspace);
    let store = depot_core::ArtifactStore::open(session.config.store_root(&session.root))?;
    let bundle = store.lookup(key.digest())?.map(|a| a.path);
    let info = KeyInfo {
        key: key.to_hex(),
        published: bundle.is_some(),
        bundle,
    };

    if json {
        print_json(&info)?;
    } else {
        println!("Cache key: {}", info.key);
        match &info.bundle {
            Some(path) => println!("Bundle: {}", path.display()),
            None => println!("Bundle: (not built)"),
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_sources(session: &Session, package: &str, json: bool) -> Result<ExitCode> {
    let set = SourceFileSetResolver::new(&session.workspace).resolve(package)?;
    let digest = set.digest(&session.root)?;
    if json {
        print_json(&serde_json::json!({
            "package": package,
            "digest": digest.to_hex(),
            "files": set.files,
        }))?;
    } else {
        for file in &set.files {
            println!("{}", file.display());
        }
        eprintln!("{} files, digest {}", set.len(), digest.short());
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_env(session: &Session, exports: bool, json: bool) -> Result<ExitCode> {
    let orchestrator = session.orchestrator()?;
    if let Some(err) = orchestrator.provisioning_error() {
        eprintln!("Environment not provisioned: {}", err);
        return Ok(ExitCode::FAILURE);
    }
    let env = orchestrator.env();
    if exports {
        print!("{}", env.to_shell_exports());
    } else if json {
        print_json(env)?;
    } else {
        println!("Platform: {}", env.platform);
        println!(
            "Coverage supported: {}",
            if env.platform.supports_coverage() { "yes" } else { "no" }
        );
        println!("Libraries:");
        if env.libraries.is_empty() {
            println!("  (none)");
        }
        for lib in &env.libraries {
            println!("  {:<16} {}", lib.name, lib.file.display());
        }
        println!("Variables:");
        for (name, value) in env.process_env_vars() {
            println!("  {}={}", name, value);
        }
        println!(
            "cargo installed: {}",
            if depot_env::is_cargo_available() { "yes" } else { "no" }
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_plan(session: &Session, json: bool) -> Result<ExitCode> {
    let request = RunRequest {
        checks: select_checks(&[], session.config.checks.test_shards),
        ..RunRequest::all_packages(&session.workspace)
    };
    let graph: TaskGraph = session.orchestrator()?.plan(&session.workspace, &request)?;
    let levels = graph.levels();

    if json {
        print_json(&levels)?;
        return Ok(ExitCode::SUCCESS);
    }
    for (index, level) in levels.iter().enumerate() {
        println!("level {}", index);
        for node in level {
            println!("  {:<28} {}", node.kind.label(), node.inputs.short());
        }
    }
    Ok(ExitCode::SUCCESS)
}
