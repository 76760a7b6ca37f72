//! Patchwise CLI
//!
//! The `patchwise` command checks one commit the way a subsystem maintainer
//! would before applying it.
//!
//! ## Commands
//!
//! - `review`: run the selected checks and print the merged report
//! - `list-checks`: show every registered check
//! - `prepare`: build the environments the selected checks need

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use patchwise_ci::{
    render, Aggregation, CheckGroup, CheckRegistry, CheckRunner, Pipeline, ReportFormat,
    Scheduler,
};
use patchwise_core::{
    patch_reference, CheckPolicy, CheckSpec, Execution, OutputKind, PatchwiseConfig,
    ProviderKind, ReviewKind,
};
use patchwise_env::{
    DockerConfig, DockerProvider, EnvironmentCache, EnvironmentProvider, GitMaterializer,
    LocalProvider,
};
use patchwise_review::{OpenAiBackend, Reviewer};

#[derive(Parser)]
#[command(name = "patchwise")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Static analysis and AI review for a single kernel patch", long_about = None)]
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
    /// Check a commit and print the report
    Review(ReviewArgs),

    /// List registered checks
    ListChecks {
        /// Configuration file (default: ./patchwise.toml if present)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Build the environments for the selected checks without running them
    Prepare {
        #[command(flatten)]
        env: EnvArgs,

        #[command(flatten)]
        selection: SelectionArgs,
    },
}

#[derive(Args)]
struct EnvArgs {
    /// Repository holding the commit
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Configuration file (default: ./patchwise.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where checks run
    #[arg(long, value_enum, ignore_case = true)]
    provider: Option<ProviderKind>,
}

#[derive(Args)]
struct SelectionArgs {
    /// Checks to run, by id (case-insensitive)
    #[arg(long, num_args = 1..)]
    checks: Vec<String>,

    /// Add the quick checks
    #[arg(long)]
    short: bool,

    /// Add the slow checks
    #[arg(long)]
    long: bool,

    /// Add the language-model reviews
    #[arg(long)]
    llm: bool,

    /// Add the static analyzers
    #[arg(long)]
    static_analysis: bool,

    /// Run everything
    #[arg(long)]
    all: bool,
}

impl SelectionArgs {
    fn groups(&self) -> Vec<CheckGroup> {
        [
            (self.short, CheckGroup::Short),
            (self.long, CheckGroup::Long),
            (self.llm, CheckGroup::Llm),
            (self.static_analysis, CheckGroup::StaticAnalysis),
            (self.all, CheckGroup::All),
        ]
        .into_iter()
        .filter_map(|(on, group)| on.then_some(group))
        .collect()
    }
}

#[derive(Args)]
struct ReviewArgs {
    #[command(flatten)]
    env: EnvArgs,

    #[command(flatten)]
    selection: SelectionArgs,

    /// Commit to check
    #[arg(long, default_value = "HEAD")]
    commit: String,

    /// Revision the commit applies on (default: its parent)
    #[arg(long)]
    base: Option<String>,

    /// Maximum number of checks running at once
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Timeout in seconds applied to every check instead of its own
    #[arg(long)]
    timeout: Option<u64>,

    /// Report format
    #[arg(long, value_enum, ignore_case = true, default_value = "text")]
    format: ReportFormat,

    /// Model used by the reviewers
    #[arg(long)]
    model: Option<String>,

    /// Base URL of an OpenAI-compatible API
    #[arg(long)]
    api_base: Option<String>,

    /// API key (default: OPENAI_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Replace the commit message audit prompt
    #[arg(long)]
    commit_audit_prompt: Option<PathBuf>,

    /// Replace the code review prompt
    #[arg(long)]
    code_review_prompt: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    patchwise_core::init_tracing(cli.json, level);

    let code = match cli.command {
        Commands::Review(args) => cmd_review(args).await?,
        Commands::ListChecks { config } => cmd_list_checks(config.as_deref())?,
        Commands::Prepare { env, selection } => cmd_prepare(&env, &selection).await?,
    };
    std::process::exit(code);
}

fn load_config(env: &EnvArgs) -> Result<PatchwiseConfig> {
    let mut config = PatchwiseConfig::load(env.config.as_deref()).context("Failed to load configuration")?;
    if let Some(kind) = env.provider {
        config.provider.kind = kind;
    }
    Ok(config)
}

fn build_provider(
    config: &PatchwiseConfig,
    registry: &CheckRegistry,
    repo: &Path,
) -> Result<Arc<dyn EnvironmentProvider>> {
    let cache = Arc::new(
        EnvironmentCache::open(&config.provider.cache_dir).with_context(|| {
            format!(
                "Failed to open environment cache at {}",
                config.provider.cache_dir.display()
            )
        })?,
    );

    let provider: Arc<dyn EnvironmentProvider> = match config.provider.kind {
        ProviderKind::Local => {
            let mut local = LocalProvider::new(cache);
            for (environment, tools) in registry.tool_requirements() {
                local = local.with_requirement(&environment, &tools);
            }
            Arc::new(local)
        }
        ProviderKind::Docker => {
            let dockerfiles = config
                .provider
                .dockerfiles_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("dockerfiles"));
            let mut docker = DockerConfig::new(dockerfiles).with_mount(repo);
            docker.docker_bin = config.provider.docker_bin.clone();
            Arc::new(DockerProvider::new(docker, cache))
        }
    };
    info!(provider = provider.name(), "environment provider ready");
    Ok(provider)
}

fn build_runner(config: &PatchwiseConfig, args: &ReviewArgs, specs: &[CheckSpec]) -> Result<CheckRunner> {
    let needs_reviewer = specs
        .iter()
        .any(|s| matches!(s.execution, Execution::Review { .. }));
    if !needs_reviewer {
        return Ok(CheckRunner::new());
    }

    let backend = OpenAiBackend::new(config.backend.clone()).context("Failed to set up review backend")?;
    let mut reviewer = Reviewer::new(Arc::new(backend))?;
    if let Some(path) = &args.commit_audit_prompt {
        reviewer = reviewer.with_template_file(ReviewKind::CommitAudit, path)?;
    }
    if let Some(path) = &args.code_review_prompt {
        reviewer = reviewer.with_template_file(ReviewKind::CodeReview, path)?;
    }
    if config.backend.api_key.is_none() {
        warn!("no API key configured; review checks will report the backend as unavailable");
    }
    Ok(CheckRunner::new().with_reviewer(Arc::new(reviewer)))
}

/// Run a review and return the exit code for its verdict.
async fn cmd_review(args: ReviewArgs) -> Result<i32> {
    let mut config = load_config(&args.env)?;
    if let Some(n) = args.max_concurrency {
        config.run.max_concurrency = n.max(1);
    }
    if let Some(secs) = args.timeout {
        config.run.timeout_secs = Some(secs);
    }
    if let Some(model) = &args.model {
        config.backend.model = model.clone();
    }
    if let Some(base) = &args.api_base {
        config.backend.api_base = base.clone();
    }
    if let Some(key) = &args.api_key {
        config.backend.api_key = Some(key.clone());
    }

    let registry = CheckRegistry::builtin().with_overrides(&config.checks)?;
    let specs = registry.select(&args.selection.checks, &args.selection.groups())?;
    let patch = patch_reference(&args.env.repo, Some(&args.commit), args.base.as_deref())
        .with_context(|| format!("Failed to resolve {} in {}", args.commit, args.env.repo.display()))?;

    let provider = build_provider(&config, &registry, &patch.repo_path)?;
    let runner = build_runner(&config, &args, &specs)?;
    let scheduler = Scheduler::new(
        provider,
        Arc::new(GitMaterializer::new()),
        Arc::new(runner),
        config.run.max_concurrency,
    )
    .with_timeout_override(config.run.timeout_secs.map(Duration::from_secs));
    let pipeline = Pipeline::new(scheduler).with_aggregation(Aggregation {
        equivalence: config.run.equivalence,
        order: config.run.order,
    });

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling remaining checks");
            trigger.cancel();
        }
    });

    let report = pipeline.run(&patch, &specs, &cancel).await?;
    println!("{}", render(&report, args.format)?);
    Ok(report.verdict.exit_code())
}

fn describe_output(spec: &CheckSpec) -> String {
    match &spec.output {
        OutputKind::StructuredDiagnostics { format } => {
            format!("structured/{}", format!("{format:?}").to_lowercase())
        }
        OutputKind::FreeTextReview => match &spec.execution {
            Execution::Review { kind } => format!("free-text/{}", kind.name()),
            Execution::Command { .. } => "free-text".to_string(),
        },
    }
}

fn cmd_list_checks(config: Option<&Path>) -> Result<i32> {
    let config = PatchwiseConfig::load(config).context("Failed to load configuration")?;
    let registry = CheckRegistry::builtin().with_overrides(&config.checks)?;

    let width = registry.specs().iter().map(|s| s.id.len()).max().unwrap_or(0);
    for spec in registry.specs() {
        let policy = match spec.policy {
            CheckPolicy::Mandatory => "mandatory",
            CheckPolicy::Advisory => "advisory",
        };
        println!(
            "{:<width$}  {:<12} {:<24} {:<9}  {}",
            spec.id,
            spec.environment_id,
            describe_output(spec),
            policy,
            spec.tags.join(","),
        );
    }
    Ok(0)
}

async fn cmd_prepare(env: &EnvArgs, selection: &SelectionArgs) -> Result<i32> {
    let config = load_config(env)?;
    let registry = CheckRegistry::builtin().with_overrides(&config.checks)?;
    let specs = registry.select(&selection.checks, &selection.groups())?;
    let repo = env.repo.canonicalize().unwrap_or_else(|_| env.repo.clone());
    let provider = build_provider(&config, &registry, &repo)?;

    let environments: BTreeSet<&str> = specs.iter().map(|s| s.environment_id.as_str()).collect();
    let mut failed = 0;
    for environment in environments {
        match provider.acquire(environment).await {
            Ok(handle) => {
                println!("  ✓ {environment} ({})", handle.digest);
                if let Err(e) = provider.release(handle).await {
                    warn!(environment = %environment, error = %e, "failed to release environment");
                }
            }
            Err(e) => {
                println!("  ✗ {environment}: {e}");
                failed += 1;
            }
        }
    }
    Ok(if failed == 0 { 0 } else { 1 })
}
