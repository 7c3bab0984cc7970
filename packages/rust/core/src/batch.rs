//! Resumable batch runs with bounded concurrency.
//!
//! Batches run strictly in sequence. Within a batch, entities run
//! concurrently behind a semaphore, and the whole batch is awaited before the
//! checkpoint is replaced. A crash loses at most the in-flight batch.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use councilgen_shared::{Checkpoint, CouncilgenError, Entity, GenerationResult, Result};

use crate::artifacts::ArtifactStore;
use crate::checkpoint::{CheckpointStore, write_atomic};
use crate::generator::{EntityGenerator, GenerationOutcome};

pub const REPORT_FILE: &str = "run_report.json";

/// Batch sizing and admission limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    /// Attempt at most this many remaining entities.
    pub limit: Option<usize>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            concurrency: 3,
            limit: None,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.concurrency == 0 {
            return Err(CouncilgenError::config(
                "batch_size and concurrency must be at least 1",
            ));
        }
        Ok(())
    }
}

/// A failed entity as listed in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub entity_id: String,
    pub error: String,
}

/// Summary of one orchestrator run, including partial (cancelled) runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub total_entities: usize,
    pub skipped_already_done: usize,
    pub attempted: usize,
    pub generated: usize,
    pub failed: usize,
    /// `generated / attempted`, 0 when nothing was attempted.
    pub success_rate: f64,
    /// USD spent in this run.
    pub total_cost: f64,
    pub average_cost: f64,
    /// Sum of per-entity elapsed time.
    pub total_elapsed_seconds: f64,
    pub average_elapsed_seconds: f64,
    pub wall_clock_seconds: f64,
    /// Generated entities per wall-clock hour.
    pub throughput_per_hour: f64,
    /// USD across all runs, from the checkpoint.
    pub cumulative_cost: f64,
    pub batches_run: usize,
    pub cancelled: bool,
    pub failures: Vec<FailureEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    fn build(
        stats: RunStats,
        results: &[GenerationResult],
        checkpoint: &Checkpoint,
        started_at: DateTime<Utc>,
        wall_clock_seconds: f64,
    ) -> Self {
        let attempted = results.len();
        let generated = results.iter().filter(|r| r.is_success()).count();
        let total_cost: f64 = results.iter().map(|r| r.cost).sum();
        let total_elapsed: f64 = results.iter().map(|r| r.elapsed_seconds).sum();
        let per = |total: f64| if attempted == 0 { 0.0 } else { total / attempted as f64 };

        Self {
            total_entities: stats.total_entities,
            skipped_already_done: stats.skipped,
            attempted,
            generated,
            failed: attempted - generated,
            success_rate: per(generated as f64),
            total_cost,
            average_cost: per(total_cost),
            total_elapsed_seconds: total_elapsed,
            average_elapsed_seconds: per(total_elapsed),
            wall_clock_seconds,
            throughput_per_hour: if wall_clock_seconds > 0.0 {
                generated as f64 * 3600.0 / wall_clock_seconds
            } else {
                0.0
            },
            cumulative_cost: checkpoint.total_cost,
            batches_run: stats.batches_run,
            cancelled: stats.cancelled,
            failures: results
                .iter()
                .filter(|r| !r.is_success())
                .map(|r| FailureEntry {
                    entity_id: r.entity_id.clone(),
                    error: r.error.clone().unwrap_or_default(),
                })
                .collect(),
            started_at,
            finished_at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct RunStats {
    total_entities: usize,
    skipped: usize,
    batches_run: usize,
    cancelled: bool,
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for batch runs.
pub trait BatchProgress: Send + Sync {
    /// Called once remaining work is known.
    fn run_started(&self, total: usize, remaining: usize);
    fn batch_started(&self, index: u64, size: usize);
    /// Called as each entity finishes, in completion order.
    fn entity_finished(&self, result: &GenerationResult);
    /// Called after the batch's checkpoint is persisted.
    fn batch_finished(&self, index: u64, checkpoint: &Checkpoint);
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl BatchProgress for SilentProgress {
    fn run_started(&self, _total: usize, _remaining: usize) {}
    fn batch_started(&self, _index: u64, _size: usize) {}
    fn entity_finished(&self, _result: &GenerationResult) {}
    fn batch_finished(&self, _index: u64, _checkpoint: &Checkpoint) {}
    fn done(&self, _report: &RunReport) {}
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drop repeated ids, keeping the first occurrence.
pub fn dedupe_entities(entities: Vec<Entity>) -> Vec<Entity> {
    let mut seen = HashSet::new();
    entities
        .into_iter()
        .filter(|e| {
            let fresh = seen.insert(e.id.clone());
            if !fresh {
                warn!(entity = %e.id, "duplicate entity id, keeping first");
            }
            fresh
        })
        .collect()
}

/// Runs an [`EntityGenerator`] over an entity list, resumably.
pub struct BatchOrchestrator {
    generator: Arc<dyn EntityGenerator>,
    checkpoints: CheckpointStore,
    artifacts: ArtifactStore,
    output_dir: PathBuf,
    config: BatchConfig,
}

impl BatchOrchestrator {
    pub fn new(generator: Arc<dyn EntityGenerator>, output_dir: &Path, config: BatchConfig) -> Self {
        Self {
            generator,
            checkpoints: CheckpointStore::new(output_dir),
            artifacts: ArtifactStore::new(output_dir),
            output_dir: output_dir.to_path_buf(),
            config,
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Generate every entity not already done. Per-entity failures are
    /// data in the report; only persistence failures return `Err`.
    #[instrument(skip_all, fields(output = %self.output_dir.display(), entities = entities.len()))]
    pub async fn run(
        &self,
        entities: Vec<Entity>,
        progress: &dyn BatchProgress,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        self.config.validate()?;
        let started = Instant::now();
        let started_at = Utc::now();

        let entities = dedupe_entities(entities);
        let mut checkpoint = self.reconcile(&entities).await?;

        let mut remaining: Vec<Entity> = entities
            .iter()
            .filter(|e| !checkpoint.is_completed(&e.id))
            .cloned()
            .collect();
        let mut stats = RunStats {
            total_entities: entities.len(),
            skipped: entities.len() - remaining.len(),
            ..Default::default()
        };
        if let Some(limit) = self.config.limit {
            remaining.truncate(limit);
        }

        info!(
            total = stats.total_entities,
            skipped = stats.skipped,
            remaining = remaining.len(),
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "starting run"
        );
        progress.run_started(stats.total_entities, remaining.len());

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut results: Vec<GenerationResult> = Vec::with_capacity(remaining.len());

        for batch in remaining.chunks(self.config.batch_size) {
            if cancel.is_cancelled() {
                warn!(batches_run = stats.batches_run, "run cancelled before next batch");
                stats.cancelled = true;
                break;
            }

            let index = checkpoint.next_batch_index();
            progress.batch_started(index, batch.len());

            let outcomes = self.run_batch(batch, &semaphore, progress).await;
            let mut batch_results = Vec::with_capacity(outcomes.len());
            for outcome in outcomes {
                if let Some(page) = &outcome.page {
                    self.artifacts.write(page).await.inspect_err(|e| {
                        error!(entity = %page.entity_id, error = %e, "artifact write failed, aborting run");
                    })?;
                }
                batch_results.push(outcome.result);
            }

            // Mutate, persist, then replace.
            let next = checkpoint.with_batch(index, &batch_results);
            self.checkpoints.save(&next).await.inspect_err(|e| {
                error!(batch = index, error = %e, "checkpoint write failed, aborting run");
            })?;
            checkpoint = next;

            let ok = batch_results.iter().filter(|r| r.is_success()).count();
            info!(
                batch = index,
                generated = ok,
                failed = batch_results.len() - ok,
                cumulative_cost = checkpoint.total_cost,
                "batch complete"
            );
            progress.batch_finished(index, &checkpoint);

            results.extend(batch_results);
            stats.batches_run += 1;
        }

        let report = RunReport::build(
            stats,
            &results,
            &checkpoint,
            started_at,
            started.elapsed().as_secs_f64(),
        );
        self.write_report(&report).await?;

        info!(
            attempted = report.attempted,
            generated = report.generated,
            failed = report.failed,
            skipped = report.skipped_already_done,
            cost = report.total_cost,
            cancelled = report.cancelled,
            "run complete"
        );
        progress.done(&report);
        Ok(report)
    }

    /// Load the checkpoint and mark entities whose artifact already exists
    /// as completed.
    async fn reconcile(&self, entities: &[Entity]) -> Result<Checkpoint> {
        let checkpoint = self.checkpoints.load().await?;
        let mut found: Vec<&str> = Vec::new();
        for entity in entities.iter().filter(|e| !checkpoint.is_completed(&e.id)) {
            match self.artifacts.read(&entity.id).await {
                Ok(Some(page)) if page.entity_id == entity.id => found.push(entity.id.as_str()),
                Ok(Some(page)) => warn!(
                    entity = %entity.id,
                    owner = %page.entity_id,
                    "artifact belongs to another entity, regenerating"
                ),
                Ok(None) => {}
                Err(e) => warn!(entity = %entity.id, error = %e, "unreadable artifact, regenerating"),
            }
        }

        if found.is_empty() {
            return Ok(checkpoint);
        }

        info!(count = found.len(), "artifacts without checkpoint entry, marking completed");
        let reconciled = checkpoint.with_completed(found);
        self.checkpoints.save(&reconciled).await?;
        Ok(reconciled)
    }

    /// Run one batch to completion. Each task holds a semaphore permit for
    /// the duration of its generation.
    async fn run_batch(
        &self,
        batch: &[Entity],
        semaphore: &Arc<Semaphore>,
        progress: &dyn BatchProgress,
    ) -> Vec<GenerationOutcome> {
        let mut tasks = JoinSet::new();
        let mut ids = HashMap::new();

        for entity in batch {
            let generator = Arc::clone(&self.generator);
            let semaphore = Arc::clone(semaphore);
            let entity = entity.clone();
            let id = entity.id.clone();

            let handle = tasks.spawn(async move {
                let started = Instant::now();
                match semaphore.acquire_owned().await {
                    Ok(_permit) => generator.generate(&entity).await,
                    Err(_) => GenerationOutcome {
                        result: GenerationResult::failed(
                            &entity.id,
                            "admission semaphore closed",
                            0.0,
                            started.elapsed(),
                        ),
                        page: None,
                    },
                }
            });
            ids.insert(handle.id(), id);
        }

        let mut outcomes = Vec::with_capacity(batch.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            let outcome = match joined {
                Ok((_, outcome)) => outcome,
                Err(e) => {
                    let entity_id = ids.remove(&e.id()).unwrap_or_default();
                    error!(entity = %entity_id, error = %e, "generation task panicked");
                    GenerationOutcome {
                        result: GenerationResult::failed(
                            entity_id,
                            format!("generation task failed: {e}"),
                            0.0,
                            std::time::Duration::ZERO,
                        ),
                        page: None,
                    }
                }
            };
            progress.entity_finished(&outcome.result);
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn write_report(&self, report: &RunReport) -> Result<()> {
        let path = self.output_dir.join(REPORT_FILE);
        let bytes = serde_json::to_vec_pretty(report)
            .map_err(|e| CouncilgenError::persistence(&path, e.to_string()))?;
        write_atomic(&path, &bytes).await
    }
}
