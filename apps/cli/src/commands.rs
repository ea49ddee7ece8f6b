//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lexiforge_ai::{ChatClient, ChatModel, RetryClient};
use lexiforge_core::{
    CheckRequest, Checker, Cleanup, CraftRequest, Crafter, Dispatcher, ProgressReporter,
    PromptLibrary, Promoter, StagingTarget, drain_changes, forge_and_stage,
};
use lexiforge_shared::{
    AppConfig, CheckConfig, CraftConfig, DictionaryId, HttpConfig, INDEX_LEVEL_PUBLIC,
    INDEX_LEVEL_SUBCATEGORY_PUBLIC, Language, Level, PromotionConfig, PublishedRecord,
    StagingRecord, StoreConfig, TriggerConfig, catalog_index_keys, init_config, load_config,
    load_config_from, validate_api_key,
};
use lexiforge_storage::{Condition, FsBlobStore, KeyValueStore, PageRequest, SqlStore};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Lexiforge: AI-generated vocabulary dictionaries, reviewed and published.
#[derive(Parser)]
#[command(
    name = "lexiforge",
    version,
    about = "Generate, review and publish vocabulary dictionaries.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.lexiforge/lexiforge.toml).
    #[arg(long, global = true, env = "LEXIFORGE_CONFIG")]
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
    /// Generate dictionaries and stage them for review.
    Forge {
        /// Number of dictionaries to generate.
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,

        /// Generations in flight at once (defaults to craft.concurrency).
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Dictionary name (only sensible with --count 1).
        #[arg(long)]
        name: Option<String>,

        /// Topic name or subcategory code.
        #[arg(long)]
        topic: Option<String>,

        /// Style description.
        #[arg(long)]
        overview: Option<String>,

        /// CEFR level (A1..C2).
        #[arg(long)]
        level: Option<Level>,

        /// Source language code.
        #[arg(long = "source")]
        source_language: Option<Language>,

        /// Target language code.
        #[arg(long = "target")]
        target_language: Option<Language>,

        /// Number of words per dictionary (at most 500).
        #[arg(long)]
        words: Option<u32>,

        /// Prompt template name.
        #[arg(long)]
        prompt: Option<String>,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        temperature: Option<f32>,
    },

    /// Drain the staging change feed: review, promote and clean up.
    Trigger {
        /// Concurrent change handlers.
        #[arg(long)]
        workers: Option<usize>,

        /// Minimum review score that promotes a dictionary.
        #[arg(long)]
        threshold: Option<i64>,

        /// Changes per batch.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Stop after this many batches.
        #[arg(long)]
        max_batches: Option<usize>,
    },

    /// Review a staged dictionary and print the result without storing it.
    Check {
        /// Dictionary id.
        id: String,

        #[arg(long)]
        prompt: Option<String>,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        temperature: Option<f32>,
    },

    /// Request publication of a staged dictionary regardless of its score.
    Approve {
        /// Dictionary id.
        id: String,
    },

    /// List published dictionaries.
    Catalog {
        #[arg(long)]
        level: Level,

        #[arg(long)]
        subcategory: Option<String>,

        /// Maximum number of rows.
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Prompt template management.
    Prompts {
        #[command(subcommand)]
        action: PromptsAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Prompt subcommands.
#[derive(Subcommand)]
pub(crate) enum PromptsAction {
    /// Store a Handlebars template under `name`.
    Put {
        /// Template name, e.g. `craft/basic.hbs`.
        name: String,
        /// Template file.
        file: PathBuf,
    },
    /// List stored templates.
    List {
        #[arg(long, default_value = "")]
        prefix: String,
    },
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

const CRATES: [&str; 5] = [
    "lexiforge_cli",
    "lexiforge_core",
    "lexiforge_ai",
    "lexiforge_storage",
    "lexiforge_shared",
];

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let directives = CRATES
        .iter()
        .map(|c| format!("{c}={level}"))
        .collect::<Vec<_>>()
        .join(",");

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

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
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(cli.config.as_deref()),
        };
    }

    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    match cli.command {
        Command::Forge {
            count,
            concurrency,
            name,
            topic,
            overview,
            level,
            source_language,
            target_language,
            words,
            prompt,
            model,
            temperature,
        } => {
            let request = CraftRequest {
                name,
                prompt,
                model,
                topic,
                overview,
                level,
                source_language,
                target_language,
                words,
                temperature,
            };
            let concurrency = concurrency.unwrap_or(config.craft.concurrency);
            cmd_forge(&config, request, count, concurrency).await
        }
        Command::Trigger {
            workers,
            threshold,
            batch_size,
            max_batches,
        } => {
            let mut trigger = TriggerConfig::from(&config);
            if let Some(workers) = workers {
                trigger.workers = workers.max(1);
            }
            if let Some(threshold) = threshold {
                trigger.promotion_threshold = threshold;
            }
            if let Some(batch_size) = batch_size {
                trigger.batch_size = batch_size.max(1);
            }
            cmd_trigger(&config, trigger, max_batches).await
        }
        Command::Check {
            id,
            prompt,
            model,
            temperature,
        } => {
            let request = CheckRequest {
                prompt,
                model,
                temperature,
            };
            cmd_check(&config, &id, &request).await
        }
        Command::Approve { id } => cmd_approve(&config, &id).await,
        Command::Catalog {
            level,
            subcategory,
            limit,
        } => cmd_catalog(&config, level, subcategory.as_deref(), limit).await,
        Command::Prompts { action } => match action {
            PromptsAction::Put { name, file } => cmd_prompts_put(&config, &name, &file).await,
            PromptsAction::List { prefix } => cmd_prompts_list(&config, &prefix).await,
        },
        Command::Config { .. } => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Local store bindings shared by every command.
struct Stores {
    records: Arc<SqlStore>,
    blobs: Arc<FsBlobStore>,
    config: StoreConfig,
}

impl Stores {
    async fn open(config: &AppConfig) -> Result<Self> {
        let store_config = StoreConfig::from(config);
        let records = SqlStore::open(&store_config.database_path).await?;
        Ok(Self {
            records: Arc::new(records),
            blobs: Arc::new(FsBlobStore::new(&store_config.blob_root)),
            config: store_config,
        })
    }

    fn staging(&self) -> Arc<dyn KeyValueStore<StagingRecord>> {
        self.records.clone()
    }

    fn prompts(&self) -> PromptLibrary {
        PromptLibrary::new(self.blobs.clone(), &self.config.prompt_namespace)
    }
}

fn chat_model(config: &AppConfig) -> Result<Arc<dyn ChatModel>> {
    let api_key = validate_api_key(config)?;
    let http = RetryClient::new(&HttpConfig::from(config))?;
    Ok(Arc::new(ChatClient::new(http, &config.ai.base_url, api_key)?))
}

fn checker(config: &AppConfig, stores: &Stores, model: Arc<dyn ChatModel>) -> Checker {
    Checker::new(
        model,
        stores.prompts(),
        stores.blobs.clone(),
        &stores.config.staging_namespace,
        CheckConfig::from(config),
    )
}

/// A token cancelled on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            token.cancel();
        }
    });
    cancel
}

fn parse_id(id: &str) -> Result<DictionaryId> {
    id.parse::<DictionaryId>()
        .map_err(|e| eyre!("invalid dictionary id '{id}': {e}"))
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using indicatif bars.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn bar(len: u64) -> Self {
        let bar = ProgressBar::new(len);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    fn spinner() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {pos} changes {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn generated(&self, _task: usize, _ok: bool) {
        self.bar.inc(1);
    }

    fn staged(&self, record: &StagingRecord) {
        self.bar.set_message(format!("staged {}", record.name));
    }

    fn batch(&self, changes: usize, ok: bool) {
        self.bar.inc(changes as u64);
        if !ok {
            self.bar.set_message("batch failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_forge(
    config: &AppConfig,
    request: CraftRequest,
    count: usize,
    concurrency: usize,
) -> Result<()> {
    let model = chat_model(config)?;
    let stores = Stores::open(config).await?;
    let crafter = Crafter::new(model, stores.prompts(), CraftConfig::from(config));
    let target = StagingTarget {
        records: stores.staging(),
        blobs: stores.blobs.clone(),
        namespace: stores.config.staging_namespace.clone(),
    };
    let cancel = cancel_on_interrupt();

    info!(count, concurrency, "forging dictionaries");
    let progress = Arc::new(CliProgress::bar(count as u64));
    let report = forge_and_stage(
        &crafter,
        &target,
        &cancel,
        &request,
        count,
        concurrency,
        progress.clone(),
    )
    .await;
    progress.finish();

    println!();
    for record in &report.staged {
        println!(
            "  staged  {}  {} ({} {}→{}, {} words)",
            record.id,
            record.name,
            record.level,
            record.source_language,
            record.target_language,
            record.word_count
        );
    }
    for failure in &report.generation_errors {
        println!("  failed  task {}: {}", failure.index, failure.error);
    }
    for error in &report.stage_errors {
        println!("  failed  {error}");
    }
    println!();
    println!(
        "  {} staged, {} failed in {:.1}s",
        report.staged.len(),
        report.failed(),
        report.elapsed.as_secs_f64()
    );
    println!();

    match report.failed() {
        0 => Ok(()),
        failed => Err(eyre!("{failed} of {count} dictionaries failed")),
    }
}

async fn cmd_trigger(
    config: &AppConfig,
    trigger: TriggerConfig,
    max_batches: Option<usize>,
) -> Result<()> {
    let model = chat_model(config)?;
    let stores = Stores::open(config).await?;
    let batch_size = trigger.batch_size;
    let dispatcher = Dispatcher::new(
        checker(config, &stores, model),
        Promoter::new(
            stores.records.clone(),
            stores.blobs.clone(),
            PromotionConfig::from(config),
        ),
        Cleanup::new(stores.blobs.clone(), &stores.config.staging_namespace),
        stores.staging(),
        trigger,
    );
    let cancel = cancel_on_interrupt();

    let progress = CliProgress::spinner();
    let result = drain_changes(
        &*stores.records,
        &dispatcher,
        &cancel,
        batch_size,
        max_batches,
        &progress,
    )
    .await;
    progress.finish();

    let report = result?;
    println!(
        "  {} changes handled in {} batches",
        report.changes, report.batches
    );
    Ok(())
}

async fn cmd_check(config: &AppConfig, id: &str, request: &CheckRequest) -> Result<()> {
    let id = parse_id(id)?;
    let model = chat_model(config)?;
    let stores = Stores::open(config).await?;
    let record = stores
        .staging()
        .get(id.as_str())
        .await?
        .ok_or_else(|| eyre!("no staged dictionary '{id}'"))?;

    let review = checker(config, &stores, model)
        .review(&cancel_on_interrupt(), request, &record)
        .await?;

    println!();
    println!("  Dictionary: {} ({})", record.name, record.id);
    println!("  Score:      {}", review.score);
    if !review.reason.is_empty() {
        println!("  Reason:     {}", review.reason);
    }
    println!();
    Ok(())
}

async fn cmd_approve(config: &AppConfig, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let stores = Stores::open(config).await?;
    let record = stores
        .staging()
        .update(
            id.as_str(),
            Box::new(|record: &mut StagingRecord| record.upload = true),
            Condition::Exists,
        )
        .await
        .map_err(|e| {
            if e.is_condition_failed() {
                eyre!("no staged dictionary '{id}'")
            } else {
                e.into()
            }
        })?;
    info!(id = %record.id, "approved for publication");
    println!("Approved {} ({}); run `lexiforge trigger` to publish.", record.name, record.id);
    Ok(())
}

async fn cmd_catalog(
    config: &AppConfig,
    level: Level,
    subcategory: Option<&str>,
    limit: usize,
) -> Result<()> {
    let store_config = StoreConfig::from(config);
    if !store_config.database_path.exists() {
        return Err(eyre!(
            "no database at '{}'; run `lexiforge forge` first",
            store_config.database_path.display()
        ));
    }
    let published: Arc<dyn KeyValueStore<PublishedRecord>> =
        Arc::new(SqlStore::open_readonly(&store_config.database_path).await?);

    let (index, value) = match subcategory {
        Some(sub) => (
            INDEX_LEVEL_SUBCATEGORY_PUBLIC,
            catalog_index_keys(level, sub, true).0,
        ),
        None => (INDEX_LEVEL_PUBLIC, catalog_index_keys(level, "", true).2),
    };

    let mut rows = Vec::new();
    let mut page = PageRequest::first(limit);
    loop {
        let result = published.query(index, &value, None, page).await?;
        rows.extend(result.items);
        match result.next {
            Some(token) if rows.len() < limit => {
                page = PageRequest::after(limit - rows.len(), token);
            }
            _ => break,
        }
    }

    if rows.is_empty() {
        println!("No published dictionaries for {value}.");
        return Ok(());
    }
    for row in &rows {
        println!(
            "  {:<3} {:<5} {}  {:<32} {:>3} words  {}",
            row.level, row.subcategory, row.id, row.name, row.word_count, row.topic
        );
    }
    Ok(())
}

async fn cmd_prompts_put(config: &AppConfig, name: &str, file: &Path) -> Result<()> {
    let source = std::fs::read_to_string(file)
        .map_err(|e| eyre!("cannot read '{}': {e}", file.display()))?;
    let stores = Stores::open(config).await?;
    stores.prompts().put(name, &source).await?;
    println!("Stored prompt {name}");
    Ok(())
}

async fn cmd_prompts_list(config: &AppConfig, prefix: &str) -> Result<()> {
    let stores = Stores::open(config).await?;
    for name in stores.prompts().list(prefix).await? {
        println!("{name}");
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config: AppConfig = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
