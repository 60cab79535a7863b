//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Value, json};
use storycrew_core::{
    Dispatcher, OfflineExecutor, PipelineCatalog, RetentionPolicy, StageExecutor,
    executor_from_config,
};
use storycrew_services::Services;
use storycrew_shared::{
    AppConfig, DispatcherConfig, ExecutionMode, JobConfig, JobId, JobStatus, JobView,
    SubmitRequest, init_config, load_config, load_config_from,
};
use storycrew_storage::LibsqlQueue;
use tracing::info;

/// Interval between status polls while waiting on a job.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// StoryCrew: orchestrate story-analysis pipelines.
#[derive(Parser)]
#[command(
    name = "storycrew",
    version,
    about = "Run architect and director story pipelines against external story services",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.storycrew/storycrew.toml).
    #[arg(long, env = "STORYCREW_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Never contact external services; use deterministic fallbacks.
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a pipeline in this process and wait for its result.
    Run {
        #[command(flatten)]
        job: JobArgs,

        /// Print the final job view as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Enqueue a job in the durable queue for a worker to pick up.
    Submit {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Show the status of a job.
    Status {
        /// Job ID returned by `submit` or `run`.
        job_id: String,

        /// Print the job view as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Execute queued jobs until interrupted.
    Worker {
        /// Number of worker loops (defaults to dispatcher.max_concurrent_jobs).
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// List registered pipelines.
    Pipelines,

    /// Report liveness and check external services.
    Health {
        #[arg(long)]
        json: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Job submission arguments shared by `run` and `submit`.
#[derive(Args)]
pub(crate) struct JobArgs {
    /// Pipeline type: architect or director.
    pub pipeline: String,

    #[arg(short, long)]
    pub project: String,

    #[arg(short, long)]
    pub user: String,

    /// Input data as a JSON object.
    #[arg(long)]
    pub input: Option<String>,

    /// Read `story_text` from a file.
    #[arg(long)]
    pub story_file: Option<PathBuf>,

    /// Model override for every stage.
    #[arg(long)]
    pub model: Option<String>,

    #[arg(long)]
    pub temperature: Option<f64>,

    /// Attempts per stage when a stage returns empty output.
    #[arg(long)]
    pub max_iter: Option<u32>,

    /// Log stage output sizes at info level.
    #[arg(long)]
    pub verbose_stages: bool,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr so command
/// output on stdout stays parseable.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "storycrew=info",
        1 => "storycrew=debug",
        _ => "storycrew=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let ctx = Context {
        config_path: cli.config,
        offline: cli.offline,
    };
    match cli.command {
        Command::Run { job, json } => cmd_run(&ctx, job, json).await,
        Command::Submit { job } => cmd_submit(&ctx, job).await,
        Command::Status { job_id, json } => cmd_status(&ctx, &job_id, json).await,
        Command::Worker { workers } => cmd_worker(&ctx, workers).await,
        Command::Pipelines => cmd_pipelines(),
        Command::Health { json } => cmd_health(&ctx, json).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&ctx),
        },
    }
}

/// Global flags every command needs.
struct Context {
    config_path: Option<PathBuf>,
    offline: bool,
}

impl Context {
    fn load_config(&self) -> Result<AppConfig> {
        let config = match &self.config_path {
            Some(path) => load_config_from(path)?,
            None => load_config()?,
        };
        Ok(config)
    }

    fn services(&self, config: &AppConfig) -> Result<Services> {
        if self.offline {
            return Ok(Services::offline());
        }
        Ok(Services::from_config(config)?)
    }

    fn executor(&self, config: &AppConfig) -> Result<Arc<dyn StageExecutor>> {
        if self.offline {
            return Ok(Arc::new(OfflineExecutor));
        }
        Ok(executor_from_config(&config.openrouter)?)
    }

    async fn open_queue(&self, config: &AppConfig) -> Result<Arc<LibsqlQueue>> {
        let path = config.queue.resolve_path()?;
        let queue = LibsqlQueue::open(&path)
            .await
            .wrap_err_with(|| format!("opening queue at {}", path.display()))?;
        info!(path = %path.display(), "durable queue opened");
        Ok(Arc::new(queue))
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(ctx: &Context, args: JobArgs, as_json: bool) -> Result<()> {
    let config = ctx.load_config()?;
    let request = args.into_request()?;

    let dispatcher = Dispatcher::builder(ctx.services(&config)?, ctx.executor(&config)?)
        .config(DispatcherConfig {
            mode: ExecutionMode::Immediate,
            ..config.dispatcher.clone()
        })
        .start()?;

    let job_id = dispatcher.submit(request).await?;
    info!(job_id = %job_id, "job submitted");

    let progress = CliProgress::new();
    let view = loop {
        let view = dispatcher.get_status(&job_id).await?;
        progress.update(&view);
        if view.status.is_terminal() {
            break view;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };
    progress.finish();
    dispatcher.shutdown().await;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_view(&view);
    }
    match view.status {
        JobStatus::Failed => Err(eyre!(
            "job {} failed: {}",
            view.job_id,
            view.error.as_deref().unwrap_or("unknown error")
        )),
        _ => Ok(()),
    }
}

async fn cmd_submit(ctx: &Context, args: JobArgs) -> Result<()> {
    let config = ctx.load_config()?;
    let request = args.into_request()?;
    let queue = ctx.open_queue(&config).await?;

    // Submit-only: the job runs in a `storycrew worker` process.
    let dispatcher = Dispatcher::builder(ctx.services(&config)?, ctx.executor(&config)?)
        .config(DispatcherConfig {
            mode: ExecutionMode::Queued,
            ..config.dispatcher.clone()
        })
        .queue(queue)
        .worker_loops(0)
        .start()?;

    let response = dispatcher.submit_response(request).await;
    dispatcher.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.success {
        return Err(eyre!(
            "submission rejected: {}",
            response.error.as_deref().unwrap_or("unknown error")
        ));
    }
    Ok(())
}

async fn cmd_status(ctx: &Context, job_id: &str, as_json: bool) -> Result<()> {
    let config = ctx.load_config()?;
    let queue = ctx.open_queue(&config).await?;
    let dispatcher = Dispatcher::builder(Services::offline(), Arc::new(OfflineExecutor))
        .queue(queue)
        .start()?;

    let view = dispatcher.get_status(&JobId::from(job_id)).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_view(&view);
    }
    Ok(())
}

async fn cmd_worker(ctx: &Context, workers: Option<usize>) -> Result<()> {
    let config = ctx.load_config()?;
    let queue = ctx.open_queue(&config).await?;

    let mut builder = Dispatcher::builder(ctx.services(&config)?, ctx.executor(&config)?)
        .config(DispatcherConfig {
            mode: ExecutionMode::Queued,
            ..config.dispatcher.clone()
        })
        .queue(queue)
        .retention(RetentionPolicy::from(&config.retention));
    if let Some(workers) = workers {
        if workers == 0 {
            return Err(eyre!("--workers must be at least 1"));
        }
        builder = builder.worker_loops(workers);
    }
    let dispatcher = builder.start()?;

    println!("Worker running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c()
        .await
        .wrap_err("waiting for Ctrl-C")?;

    println!("Stopping; waiting for in-flight jobs...");
    dispatcher.shutdown().await;
    let stats = dispatcher.stats();
    println!(
        "  Completed: {}  Failed: {}  Total: {}",
        stats.completed, stats.failed, stats.total
    );
    Ok(())
}

fn cmd_pipelines() -> Result<()> {
    let catalog = PipelineCatalog::default();
    println!();
    for kind in catalog.kinds() {
        let stages: Vec<&str> = kind.stages().iter().map(|s| s.as_str()).collect();
        println!("  {:<10} {}", kind.as_str(), kind.description());
        println!("  {:<10} stages: {}", "", stages.join(", "));
        println!("  {:<10} next:   {}", "", kind.next_phase());
        println!();
    }
    Ok(())
}

async fn cmd_health(ctx: &Context, as_json: bool) -> Result<()> {
    let config = ctx.load_config()?;
    let dispatcher = Dispatcher::builder(ctx.services(&config)?, ctx.executor(&config)?)
        .start()?;

    let report = dispatcher.health();
    let services = dispatcher.check_services().await;

    if as_json {
        let body = json!({ "dispatcher": report, "services": services });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!();
        println!("  Service:         {} {}", report.service, report.version);
        println!("  Status:          {}", report.status);
        println!("  Knowledge graph: {}", up_down(services.knowledge_graph));
        println!("  Content:         {}", up_down(services.content));
        println!();
    }
    if !services.all_healthy() {
        return Err(eyre!("one or more services are unreachable"));
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(ctx: &Context) -> Result<()> {
    let config = ctx.load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

impl JobArgs {
    fn into_request(self) -> Result<SubmitRequest> {
        let mut input = match &self.input {
            Some(raw) => serde_json::from_str::<Value>(raw).wrap_err("--input is not valid JSON")?,
            None => json!({}),
        };
        if let Some(path) = &self.story_file {
            let text = read_story(path)?;
            let fields = input
                .as_object_mut()
                .ok_or_else(|| eyre!("--input must be a JSON object"))?;
            fields.insert("story_text".into(), Value::String(text));
        }

        let config = JobConfig {
            model: self.model,
            verbose: self.verbose_stages.then_some(true),
            temperature: self.temperature,
            max_iter: self.max_iter,
            ..JobConfig::default()
        };
        Ok(SubmitRequest::new(self.pipeline, self.project, self.user, input).with_config(config))
    }
}

fn read_story(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).wrap_err_with(|| format!("reading {}", path.display()))
}

fn print_view(view: &JobView) {
    println!();
    println!("  Job:      {}", view.job_id);
    println!("  Pipeline: {}", view.pipeline_type);
    println!("  Project:  {}", view.project_id);
    println!("  Status:   {}", view.status);
    println!("  Progress: {}%", view.progress);
    if let (Some(started), Some(completed)) = (view.started_at, view.completed_at) {
        let elapsed = (completed - started).num_milliseconds() as f64 / 1000.0;
        println!("  Time:     {elapsed:.1}s");
    }
    if let Some(result) = &view.result {
        if let Some(next) = &result.next_phase {
            println!("  Next:     {next}");
        }
        if let Some(summary) = &result.summary {
            println!();
            println!("  {summary}");
        }
    }
    if let Some(error) = &view.error {
        println!("  Error:    {error}");
    }
    println!();
}

fn up_down(healthy: bool) -> &'static str {
    if healthy { "reachable" } else { "unreachable" }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Spinner showing the status of the job being waited on.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn update(&self, view: &JobView) {
        self.spinner.set_message(format!(
            "{} [{}] {}%",
            view.pipeline_type, view.status, view.progress
        ));
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}
