//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use kbforge_core::{
    BatchedGraphWriter, ConversionFlow, ConversionMode, ConversionReport, GraphBuildOptions,
    GraphBuildReport, GraphExtractionStage, OutputLayout, PollPolicy, ProgressReporter,
    ResultMaterializer, run_conversion, run_graph_build,
};
use kbforge_extract::{ChatExtractorOptions, ChatGraphExtractor, GraphExtractor};
use kbforge_remote::{BatchClientOptions, MineruClient, build_http_client};
use kbforge_shared::{
    AppConfig, MergePolicyKind, TaskStoreKind, init_config, load_config, load_config_from,
    resolve_api_key,
};
use kbforge_storage::{JsonTaskStore, Storage, TaskStore};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// kbforge: raw documents in, knowledge graph out.
#[derive(Parser)]
#[command(
    name = "kbforge",
    version,
    about = "Convert raw documents through a batch service and build a knowledge graph.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.kbforge/kbforge.toml).
    #[arg(long, global = true, env = "KBFORGE_CONFIG")]
    pub config: Option<PathBuf>,

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
    /// Submit raw files for conversion, poll until results are downloaded and
    /// unpack them into markdown.
    Convert {
        /// Only submit new files; do not poll.
        #[arg(long, conflicts_with = "poll_only")]
        submit_only: bool,

        /// Only poll tasks that were already submitted.
        #[arg(long)]
        poll_only: bool,

        /// Stop polling after this many seconds (tasks stay queued).
        #[arg(long)]
        deadline: Option<u64>,
    },

    /// Show conversion task counts and failed tasks.
    Status,

    /// Knowledge graph operations.
    Graph {
        #[command(subcommand)]
        action: GraphAction,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Graph subcommands.
#[derive(Subcommand)]
pub(crate) enum GraphAction {
    /// Extract a checkpoint for every split document that has none.
    Extract,
    /// Extract, aggregate all checkpoints, and load the graph store.
    Build {
        /// Clear the graph store before loading.
        #[arg(long)]
        fresh: bool,

        /// Aggregate existing checkpoints only.
        #[arg(long)]
        skip_extract: bool,

        /// Items per graph store write.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Node conflict policy.
        #[arg(long)]
        merge_policy: Option<MergePolicyArg>,
    },
    /// Node and relationship counts by type.
    Stats,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum MergePolicyArg {
    FirstWins,
    LastWins,
    MergeProperties,
}

impl From<MergePolicyArg> for MergePolicyKind {
    fn from(arg: MergePolicyArg) -> Self {
        match arg {
            MergePolicyArg::FirstWins => Self::FirstWins,
            MergePolicyArg::LastWins => Self::LastWins,
            MergePolicyArg::MergeProperties => Self::MergeProperties,
        }
    }
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. `RUST_LOG` takes precedence.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "kbforge=info",
        1 => "kbforge=debug",
        _ => "kbforge=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
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
    let config_path = cli.config;
    match cli.command {
        Command::Convert {
            submit_only,
            poll_only,
            deadline,
        } => {
            let mode = if submit_only {
                ConversionMode::SubmitOnly
            } else if poll_only {
                ConversionMode::PollOnly
            } else {
                ConversionMode::Full
            };
            let mut config = resolve_config(config_path)?;
            if deadline.is_some() {
                config.polling.deadline_secs = deadline;
            }
            cmd_convert(&config, mode).await
        }
        Command::Status => cmd_status(&resolve_config(config_path)?).await,
        Command::Graph { action } => {
            let mut config = resolve_config(config_path)?;
            match action {
                GraphAction::Extract => cmd_graph_extract(&config).await,
                GraphAction::Build {
                    fresh,
                    skip_extract,
                    batch_size,
                    merge_policy,
                } => {
                    if let Some(size) = batch_size {
                        config.graph.batch_size = size;
                    }
                    if let Some(policy) = merge_policy {
                        config.graph.merge_policy = policy.into();
                    }
                    config.validate()?;
                    cmd_graph_build(&config, fresh, skip_extract).await
                }
                GraphAction::Stats => cmd_graph_stats(&config).await,
            }
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&resolve_config(config_path)?).await,
        },
    }
}

fn resolve_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(&path)?,
        None => load_config()?,
    };
    Ok(config)
}

// ---------------------------------------------------------------------------
// Task store selection
// ---------------------------------------------------------------------------

/// The task store chosen by `[tasks] store`.
enum TaskStoreHandle {
    Sqlite(Storage),
    Json(JsonTaskStore),
}

impl TaskStoreHandle {
    async fn open(config: &AppConfig) -> Result<Self> {
        let db = config.paths.state_db();
        let handle = match config.tasks.store {
            TaskStoreKind::Sqlite => Self::Sqlite(Storage::open(&db).await?),
            TaskStoreKind::Json => Self::Json(JsonTaskStore::open(&json_store_path(config))?),
        };
        Ok(handle)
    }

    fn as_store(&self) -> &dyn TaskStore {
        match self {
            Self::Sqlite(storage) => storage,
            Self::Json(store) => store,
        }
    }
}

fn json_store_path(config: &AppConfig) -> PathBuf {
    config.paths.state_db().with_file_name("conversion_tasks.json")
}

// ---------------------------------------------------------------------------
// Conversion commands
// ---------------------------------------------------------------------------

async fn cmd_convert(config: &AppConfig, mode: ConversionMode) -> Result<()> {
    let token = resolve_api_key(&config.remote.api_key_env, "MinerU")?;
    let api = MineruClient::new(BatchClientOptions::from_config(&config.remote, token))?;
    let store = TaskStoreHandle::open(config).await?;
    let materializer = ResultMaterializer::new(
        build_http_client(config.remote.timeout_secs)?,
        OutputLayout::new(config.paths.converted_dir()),
    );

    let flow = ConversionFlow {
        api: &api,
        store: store.as_store(),
        materializer: &materializer,
        raw_dir: config.paths.raw_dir(),
        metadata_file: config.paths.metadata_file(),
        policy: PollPolicy::from_config(&config.polling),
    };

    info!(?mode, store = ?config.tasks.store, "starting conversion");
    let reporter = CliProgress::new();
    let report = run_conversion(&flow, mode, &reporter).await?;
    print_conversion_report(&report);
    Ok(())
}

fn print_conversion_report(report: &ConversionReport) {
    println!();
    if let Some(submit) = &report.submit {
        println!("  Submission");
        println!("    Submitted:            {}", submit.submitted);
        println!("    Already converted:    {}", submit.already_materialized);
        println!("    Already tracked:      {}", submit.already_tracked);
        println!(
            "    Markdown copied:      {} ({} already present)",
            submit.markdown_copied, submit.markdown_present
        );
        print_failures("    Failed", &submit.failed);
        for (id, owner) in &submit.output_conflicts {
            println!("    Skipped {id}: same output name as {owner}");
        }
    }
    if let Some(poll) = &report.poll {
        println!("  Polling");
        println!("    Cycles:               {}", poll.cycles);
        println!("    Downloaded:           {}", poll.downloaded);
        println!("    Already present:      {}", poll.already_present);
        println!("    Download retries:     {}", poll.download_retries);
        println!("    Still active:         {}", poll.still_active);
        if poll.deadline_reached {
            println!("    Deadline reached; re-run `kbforge convert --poll-only` to continue.");
        }
        print_failures("    Failed remotely", &poll.failed);
    }
    if let Some(unpack) = &report.unpack {
        println!("  Unpacking");
        println!("    Unpacked:             {}", unpack.unpacked);
        println!("    Already unpacked:     {}", unpack.already_unpacked);
        print_failures("    Failed", &unpack.failed);
    }
    println!("  Time: {:.1}s", report.elapsed.as_secs_f64());
    println!();
}

async fn cmd_status(config: &AppConfig) -> Result<()> {
    let store = TaskStoreHandle::open(config).await?;
    let counts = store.as_store().counts_by_state().await?;
    let tasks = store.as_store().list().await?;

    println!();
    println!("  Tasks: {}", counts.values().sum::<u64>());
    for (state, count) in &counts {
        println!("    {state:<10} {count}");
    }

    let failed: Vec<(String, String)> = tasks
        .iter()
        .filter_map(|t| {
            t.state
                .last_error()
                .map(|e| (format!("{} ({})", t.id, t.file_name), e.to_string()))
        })
        .collect();
    print_failures("  Failed", &failed);
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Graph commands
// ---------------------------------------------------------------------------

fn chat_extractor(config: &AppConfig) -> Result<ChatGraphExtractor> {
    let key = resolve_api_key(&config.extraction.api_key_env, "Extraction model")?;
    Ok(ChatGraphExtractor::new(ChatExtractorOptions::from_config(
        &config.extraction,
        key,
    ))?)
}

async fn cmd_graph_extract(config: &AppConfig) -> Result<()> {
    let extractor = chat_extractor(config)?;
    let stage = GraphExtractionStage::new(
        &extractor,
        config.paths.chunks_dir(),
        config.paths.checkpoint_dir(),
    );

    let reporter = CliProgress::new();
    reporter.phase("Extracting graph units");
    let report = stage.run(&reporter).await?;
    reporter.finish("extraction finished");

    println!();
    println!("  Extracted:            {}", report.processed);
    println!("  Already checkpointed: {}", report.already_checkpointed);
    print_failures("  Skipped", &report.skipped);
    println!();
    Ok(())
}

async fn cmd_graph_build(config: &AppConfig, fresh: bool, skip_extract: bool) -> Result<()> {
    let extractor = if skip_extract {
        None
    } else {
        Some(chat_extractor(config)?)
    };

    let store = Storage::open(&config.paths.graph_db()).await?;
    if fresh {
        info!(path = %config.paths.graph_db().display(), "clearing graph store");
        store.clear_graph().await?;
    }

    let options = GraphBuildOptions {
        source_root: config.paths.chunks_dir(),
        checkpoint_root: config.paths.checkpoint_dir(),
        merge_policy: config.graph.merge_policy.into(),
        writer: BatchedGraphWriter::from_config(&config.graph),
    };

    let reporter = CliProgress::new();
    let report = run_graph_build(
        &options,
        extractor.as_ref().map(|e| e as &dyn GraphExtractor),
        &store,
        &reporter,
    )
    .await?;
    print_graph_report(&report);
    Ok(())
}

fn print_graph_report(report: &GraphBuildReport) {
    println!();
    if let Some(extraction) = &report.extraction {
        println!("  Extraction");
        println!("    Extracted:            {}", extraction.processed);
        println!("    Already checkpointed: {}", extraction.already_checkpointed);
        print_failures("    Skipped", &extraction.skipped);
    }
    let stats = &report.aggregation;
    println!("  Aggregation");
    println!("    Checkpoints:          {}", stats.units_visited);
    println!("    Unreadable:           {}", stats.units_unreadable);
    println!("    Nodes:                {} ({} seen)", report.nodes, stats.nodes_seen);
    println!("    Conflicting nodes:    {}", stats.node_conflicts);
    println!(
        "    Relationships:        {} ({} duplicates dropped)",
        report.relationships, stats.duplicate_relationships
    );
    println!("  Write");
    println!(
        "    Batches:              {}/{} written",
        report.write.batches_written, report.write.batches_total
    );
    if report.write.batches_failed > 0 {
        println!("    Failed batches:       {}", report.write.batches_failed);
    }
    println!("  Time: {:.1}s", report.elapsed.as_secs_f64());
    println!();
}

async fn cmd_graph_stats(config: &AppConfig) -> Result<()> {
    let path = config.paths.graph_db();
    let store = Storage::open_readonly(&path).await.map_err(|e| {
        eyre!("cannot open graph store at '{}': {e}", path.display())
    })?;
    let stats = store.graph_stats().await?;

    println!();
    println!("  Nodes: {}", stats.node_count());
    for (node_type, count) in &stats.nodes_by_type {
        println!("    {node_type:<24} {count}");
    }
    println!("  Relationships: {}", stats.relationship_count());
    for (rel_type, count) in &stats.relationships_by_type {
        println!("    {rel_type:<24} {count}");
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn print_failures(label: &str, failures: &[(String, String)]) {
    if failures.is_empty() {
        return;
    }
    println!("{label}: {}", failures.len());
    for (item, error) in failures {
        println!("      {item}: {error}");
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold} {msg}")
                .expect("valid progress template")
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_prefix(name.to_string());
        self.spinner.set_message(String::new());
    }

    fn item(&self, current: usize, total: usize, detail: &str) {
        self.spinner.set_message(format!("[{current}/{total}] {detail}"));
    }

    fn finish(&self, _summary: &str) {
        self.spinner.finish_and_clear();
    }
}
