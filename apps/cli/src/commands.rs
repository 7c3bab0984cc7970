//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use councilgen_core::batch::REPORT_FILE;
use councilgen_core::{
    ArtifactStore, BatchConfig, BatchOrchestrator, BatchProgress, CheckpointStore,
    EnrichmentCache, EntityGenerator, LlmWriter, PageGenerator, PageWriter, RunReport,
    TemplateWriter,
};
use councilgen_extraction::{ChatClient, ExtractionClient, HttpRenderer, PageRenderer};
use councilgen_shared::{
    AppConfig, CacheBackendKind, Checkpoint, Entity, ExtractionRequest, ExtractionSettings,
    GenerationResult, RendererKind, init_config, load_config, resolve_api_key,
};
use councilgen_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// councilgen: enriched pages for public bodies, generated in bulk.
#[derive(Parser)]
#[command(
    name = "councilgen",
    version,
    about = "Extract contact facts from public-body portals and generate one page per entity.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// How page bodies are composed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum WriterKind {
    /// Deterministic Markdown template; no model calls.
    Template,
    /// Model-written page from the extracted facts.
    Llm,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Generate pages for every entity not already completed.
    Run {
        /// JSON file holding an array of entities.
        #[arg(long)]
        entities: PathBuf,

        /// Output directory (defaults to `defaults.output_dir`).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Entities per checkpointed batch.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Concurrent generations within a batch.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Stop after this many remaining entities.
        #[arg(long)]
        limit: Option<usize>,

        /// Discard the checkpoint before starting.
        #[arg(long)]
        reset: bool,

        /// Page writer.
        #[arg(long, value_enum, default_value = "template")]
        writer: WriterKind,
    },

    /// Run the extraction ladder against one URL and print the result.
    Extract {
        #[arg(long)]
        url: String,

        /// Field to extract (repeatable). Defaults to `defaults.required_fields`.
        #[arg(long = "field")]
        fields: Vec<String>,

        /// Skip the static tier.
        #[arg(long)]
        render: bool,

        /// CSS selector the rendered tier waits for.
        #[arg(long)]
        wait_for: Option<String>,
    },

    /// Inspect or invalidate cached enrichment.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show checkpoint, artifact and cache state for an output directory.
    Status {
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Cache subcommands, keyed by entity id.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Print the cached record.
    Get { id: String },
    /// Print the remaining time to live.
    Ttl { id: String },
    /// Drop the cached record.
    Invalidate { id: String },
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

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "councilgen=info",
        1 => "councilgen=debug",
        _ => "councilgen=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // Logs go to stderr so `extract` and `cache get` output stays pipeable.
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
    match cli.command {
        Command::Run {
            entities,
            out,
            batch_size,
            concurrency,
            limit,
            reset,
            writer,
        } => {
            let options = RunOptions {
                entities,
                out,
                batch_size,
                concurrency,
                limit,
                reset,
                writer,
            };
            cmd_run(options).await
        }
        Command::Extract {
            url,
            fields,
            render,
            wait_for,
        } => cmd_extract(&url, fields, render, wait_for).await,
        Command::Cache { action } => match action {
            CacheAction::Get { id } => cmd_cache_get(&id).await,
            CacheAction::Ttl { id } => cmd_cache_ttl(&id).await,
            CacheAction::Invalidate { id } => cmd_cache_invalidate(&id).await,
        },
        Command::Status { out } => cmd_status(out).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring helpers
// ---------------------------------------------------------------------------

fn output_dir(config: &AppConfig, out: Option<PathBuf>) -> PathBuf {
    out.unwrap_or_else(|| PathBuf::from(&config.defaults.output_dir))
}

/// Read a JSON array of entities.
fn load_entities(path: &Path) -> Result<Vec<Entity>> {
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("cannot read entity file '{}'", path.display()))?;
    let entities: Vec<Entity> = serde_json::from_str(&raw)
        .wrap_err_with(|| format!("invalid entity file '{}'", path.display()))?;
    if entities.iter().any(|e| e.id.trim().is_empty()) {
        return Err(eyre!("entity file '{}' contains an empty id", path.display()));
    }
    Ok(entities)
}

/// Build the rendered-tier backend named in config, if any.
async fn build_renderer(settings: &ExtractionSettings) -> Result<Option<Arc<dyn PageRenderer>>> {
    match settings.renderer {
        RendererKind::None => Ok(None),
        RendererKind::Http => {
            let endpoint = settings
                .render_endpoint
                .as_deref()
                .ok_or_else(|| eyre!("extraction.renderer = \"http\" needs extraction.render_endpoint"))?;
            Ok(Some(Arc::new(HttpRenderer::new(endpoint)?)))
        }
        #[cfg(feature = "chromium")]
        RendererKind::Chromium => {
            let renderer =
                councilgen_extraction::ChromiumRenderer::launch(settings.chrome_executable.as_deref())
                    .await?;
            Ok(Some(Arc::new(renderer)))
        }
        #[cfg(not(feature = "chromium"))]
        RendererKind::Chromium => Err(eyre!(
            "extraction.renderer = \"chromium\" requires building with the `chromium` feature"
        )),
    }
}

async fn build_extractor(config: &AppConfig) -> Result<ExtractionClient> {
    let renderer = build_renderer(&config.extraction).await?;
    let api_key = resolve_api_key(&config.openrouter);
    if api_key.is_none() {
        warn!(
            env = %config.openrouter.api_key_env,
            "no API key set, semantic extraction is disabled"
        );
    }
    Ok(ExtractionClient::from_settings(
        &config.extraction,
        &config.openrouter,
        api_key,
        renderer,
    )?)
}

fn build_writer(config: &AppConfig, kind: WriterKind) -> Result<Arc<dyn PageWriter>> {
    match kind {
        WriterKind::Template => Ok(Arc::new(TemplateWriter)),
        WriterKind::Llm => {
            let api_key = resolve_api_key(&config.openrouter).ok_or_else(|| {
                eyre!(
                    "--writer llm needs an API key in ${}",
                    config.openrouter.api_key_env
                )
            })?;
            let chat = ChatClient::new(&config.openrouter, Some(api_key))?;
            Ok(Arc::new(LlmWriter::new(chat, config.extraction.semantic_timeout())))
        }
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct RunOptions {
    entities: PathBuf,
    out: Option<PathBuf>,
    batch_size: Option<usize>,
    concurrency: Option<usize>,
    limit: Option<usize>,
    reset: bool,
    writer: WriterKind,
}

async fn cmd_run(options: RunOptions) -> Result<()> {
    let config = load_config()?;
    let entities = load_entities(&options.entities)?;
    let out = output_dir(&config, options.out);

    let batch_config = BatchConfig {
        batch_size: options.batch_size.unwrap_or(config.defaults.batch_size),
        concurrency: options.concurrency.unwrap_or(config.defaults.concurrency),
        limit: options.limit,
    };
    batch_config.validate()?;

    let extractor = build_extractor(&config).await?;
    let cache = EnrichmentCache::from_config(&config.cache).await?;
    let writer = build_writer(&config, options.writer)?;
    let generator = Arc::new(PageGenerator::new(
        extractor,
        cache,
        writer,
        config.defaults.required_fields.clone(),
    ));

    let as_dyn: Arc<dyn EntityGenerator> = generator.clone();
    let orchestrator = BatchOrchestrator::new(as_dyn, &out, batch_config);
    if options.reset && orchestrator.checkpoints().reset().await? {
        println!("Checkpoint reset.");
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the current batch");
            on_signal.cancel();
        }
    });

    info!(
        entities = entities.len(),
        out = %out.display(),
        batch_size = batch_config.batch_size,
        concurrency = batch_config.concurrency,
        "starting run"
    );

    let progress = CliProgress::new();
    let report = orchestrator.run(entities, &progress, &cancel).await?;

    let stats = generator.cache().stats();
    info!(
        backend = generator.cache().backend_name(),
        hits = stats.hits,
        misses = stats.misses,
        errors = stats.errors,
        "cache stats"
    );

    print_report(&report, &out);
    Ok(())
}

fn print_report(report: &RunReport, out: &Path) {
    println!();
    if report.cancelled {
        println!("  Run interrupted; rerun to resume.");
    } else {
        println!("  Run complete.");
    }
    println!("  Entities:   {}", report.total_entities);
    println!("  Skipped:    {} (already done)", report.skipped_already_done);
    println!("  Generated:  {}", report.generated);
    println!("  Failed:     {}", report.failed);
    println!("  Success:    {:.1}%", report.success_rate * 100.0);
    println!(
        "  Cost:       ${:.4} this run, ${:.4} cumulative",
        report.total_cost, report.cumulative_cost
    );
    println!(
        "  Time:       {} ({:.0} pages/hour)",
        format_duration(Duration::from_secs_f64(report.wall_clock_seconds.max(0.0))),
        report.throughput_per_hour
    );
    if !report.failures.is_empty() {
        println!("  Failures:");
        for failure in report.failures.iter().take(10) {
            println!("    {}: {}", failure.entity_id, failure.error);
        }
        if report.failures.len() > 10 {
            println!("    ... and {} more", report.failures.len() - 10);
        }
    }
    println!("  Report:     {}", out.join(REPORT_FILE).display());
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Batch progress as an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg} ({eta})",
            )
            .unwrap()
            .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }
}

impl BatchProgress for CliProgress {
    fn run_started(&self, total: usize, remaining: usize) {
        self.bar.set_length(remaining as u64);
        self.bar
            .println(format!("{remaining} of {total} entities to generate"));
    }

    fn batch_started(&self, index: u64, size: usize) {
        self.bar.set_message(format!("batch {index} ({size})"));
    }

    fn entity_finished(&self, result: &GenerationResult) {
        self.bar.inc(1);
        if let Some(error) = &result.error {
            self.bar
                .println(format!("  failed {}: {error}", result.entity_id));
        }
    }

    fn batch_finished(&self, index: u64, checkpoint: &Checkpoint) {
        self.bar.set_message(format!(
            "batch {index} saved, {} done, ${:.4}",
            checkpoint.completed.len(),
            checkpoint.total_cost
        ));
    }

    fn done(&self, _report: &RunReport) {
        self.bar.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// extract
// ---------------------------------------------------------------------------

async fn cmd_extract(
    url: &str,
    fields: Vec<String>,
    render: bool,
    wait_for: Option<String>,
) -> Result<()> {
    let config = load_config()?;
    let target = Url::parse(url).map_err(|e| eyre!("invalid URL '{url}': {e}"))?;
    let fields = if fields.is_empty() {
        config.defaults.required_fields.clone()
    } else {
        fields
    };

    let extractor = build_extractor(&config).await?;
    let mut request = ExtractionRequest::new(target, fields).rendered(render);
    if let Some(selector) = wait_for {
        request = request.wait_for(selector);
    }

    let result = extractor.extract(&request).await?;
    info!(tier = %result.tier_used, found = result.found_count(), cost = result.cost, "extracted");
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// cache
// ---------------------------------------------------------------------------

async fn cmd_cache_get(id: &str) -> Result<()> {
    let config = load_config()?;
    let cache = EnrichmentCache::from_config(&config.cache).await?;
    match cache.get(id).await {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => println!("No cached enrichment for '{id}'."),
    }
    Ok(())
}

async fn cmd_cache_ttl(id: &str) -> Result<()> {
    let config = load_config()?;
    let cache = EnrichmentCache::from_config(&config.cache).await?;
    match cache.remaining_ttl(id).await {
        Some(ttl) => println!("{} ({}s)", format_duration(ttl), ttl.as_secs()),
        None => println!("No cached enrichment for '{id}'."),
    }
    Ok(())
}

async fn cmd_cache_invalidate(id: &str) -> Result<()> {
    let config = load_config()?;
    let cache = EnrichmentCache::from_config(&config.cache).await?;
    if cache.invalidate(id).await {
        println!("Invalidated '{}'.", cache.key(id));
    } else {
        println!("No cached enrichment for '{id}'.");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

async fn cmd_status(out: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let out = output_dir(&config, out);

    let checkpoint = CheckpointStore::new(&out).load().await?;
    let artifacts = ArtifactStore::new(&out).count();

    println!();
    println!("  Output:     {}", out.display());
    println!("  Completed:  {}", checkpoint.completed.len());
    println!("  Failed:     {}", checkpoint.failed.len());
    println!("  Artifacts:  {artifacts}");
    println!("  Batches:    {}", checkpoint.next_batch_index());
    println!("  Cost:       ${:.4}", checkpoint.total_cost);
    if let Some(updated) = checkpoint.updated_at {
        println!("  Updated:    {}", updated.to_rfc3339());
    }

    let report_path = out.join(REPORT_FILE);
    if let Ok(raw) = std::fs::read_to_string(&report_path) {
        match serde_json::from_str::<RunReport>(&raw) {
            Ok(report) => println!(
                "  Last run:   {} generated, {} failed, finished {}",
                report.generated,
                report.failed,
                report.finished_at.to_rfc3339()
            ),
            Err(e) => warn!(path = %report_path.display(), error = %e, "unreadable run report"),
        }
    }

    if config.cache.backend == CacheBackendKind::Sqlite {
        let path = Path::new(&config.cache.sqlite_path);
        if path.exists() {
            let storage = Storage::open_readonly(path).await?;
            let live = storage
                .count_cache_entries(&format!("{}:", config.cache.namespace), Utc::now())
                .await?;
            println!("  Cached:     {live} live entries ({})", path.display());
        }
    }

    for (id, error) in checkpoint.errors.iter().take(10) {
        println!("    {id}: {error}");
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
