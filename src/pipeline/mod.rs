// src/pipeline/mod.rs

use arrow::record_batch::RecordBatch;
use rayon::prelude::*;
use serde::Serialize;
use std::{path::Path, path::PathBuf, sync::Arc, time::Instant};
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

use crate::config::{PipelineConfig, WriteMode};
use crate::entity::{Entity, EntitySchema};
use crate::error::{CoercionTally, PipelineError, Result, Warning};
use crate::extract::{self, to_record_batch};
use crate::normalize::normalize;
use crate::unify::{self, Partition};
use crate::write::write_table;

/// Outcome of one successful entity chain.
#[derive(Debug, Clone, Serialize)]
pub struct EntityReport {
    pub entity: Entity,
    pub rows: usize,
    /// Source partitions in the order their rows were written.
    pub partitions: Vec<String>,
    pub output: String,
    pub file: PathBuf,
    pub mode: WriteMode,
    pub warnings: Vec<Warning>,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityFailure {
    pub entity: Entity,
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl EntityFailure {
    fn from_error(entity: Entity, e: &PipelineError) -> Self {
        Self {
            entity,
            kind: e.kind().to_string(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RunReport {
    pub succeeded: Vec<EntityReport>,
    pub failed: Vec<EntityFailure>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_entities(&self) -> Vec<Entity> {
        self.failed.iter().map(|f| f.entity).collect()
    }
}

/// Read, type and normalize one source file.
fn load_partition(
    entity: Entity,
    path: &Path,
    schema: &EntitySchema,
) -> Result<(Partition, CoercionTally)> {
    let raw = extract::read_raw_table(path)?;
    let mut tally = CoercionTally::default();
    let batch = to_record_batch(entity.name(), &raw, schema, &mut tally)?;
    let batch = normalize(entity, batch)?;
    Ok((Partition::new(raw.partition, batch), tally))
}

/// Extract → normalize → (unify) for one entity, without writing.
pub fn build_entity(
    config: &PipelineConfig,
    entity: Entity,
) -> Result<(RecordBatch, Vec<String>, Vec<Warning>)> {
    let schema = entity.schema(&config.sales);
    let files = extract::resolve_sources(config, &config.source_locators(entity))?;

    // partitions load concurrently; ordering is restored by the unifier
    let loaded: Vec<(Partition, CoercionTally)> = files
        .par_iter()
        .map(|f| load_partition(entity, f, &schema))
        .collect::<Result<Vec<_>>>()?;

    let mut tally = CoercionTally::default();
    let mut partitions = Vec::with_capacity(loaded.len());
    for (p, t) in loaded {
        tally.merge(t);
        partitions.push(p);
    }
    let mut warnings = tally.into_warnings();

    let (batch, order) = if entity.is_partitioned() {
        let unified = unify::unify(entity, partitions, &config.sales)?;
        warnings.extend(unified.warnings);
        (unified.batch, unified.order)
    } else {
        unify::concat_partitions(entity, partitions)?
    };
    Ok((batch, order, warnings))
}

/// The whole chain for one entity, ending in a committed write.
#[instrument(level = "info", skip_all, fields(entity = %entity))]
pub fn run_entity(config: &PipelineConfig, entity: Entity) -> Result<EntityReport> {
    let start = Instant::now();
    let (batch, partitions, warnings) = build_entity(config, entity)?;
    for w in &warnings {
        warn!(entity = %entity, "{}", w);
    }

    let locator = config.output_locator(entity);
    let target = config.resolve(&locator)?;
    let mode = config.write_mode(entity);
    let outcome = write_table(
        entity,
        &batch,
        &target,
        &locator,
        mode,
        config.lock_stale_after(),
    )?;

    let elapsed = start.elapsed();
    info!(entity = %entity, rows = outcome.rows, elapsed = ?elapsed, "entity complete");
    Ok(EntityReport {
        entity,
        rows: outcome.rows,
        partitions,
        output: locator.to_string(),
        file: outcome.file,
        mode,
        warnings,
        elapsed_ms: elapsed.as_millis(),
    })
}

/// Run every entity in `entities` independently, at most `config.workers`
/// at a time. One entity failing never stops the others.
pub async fn run(config: Arc<PipelineConfig>, entities: &[Entity]) -> RunReport {
    let mut unique: Vec<Entity> = Vec::with_capacity(entities.len());
    for e in entities {
        if !unique.contains(e) {
            unique.push(*e);
        }
    }

    let sem = Arc::new(Semaphore::new(config.workers.max(1)));
    let mut handles = Vec::with_capacity(unique.len());
    for entity in unique {
        let config = Arc::clone(&config);
        let sem = Arc::clone(&sem);
        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();
            let res = tokio::task::spawn_blocking(move || run_entity(&config, entity)).await;
            (entity, res)
        }));
    }

    let mut report = RunReport::default();
    for joined in futures::future::join_all(handles).await {
        match joined {
            Ok((_, Ok(Ok(done)))) => report.succeeded.push(done),
            Ok((entity, Ok(Err(e)))) => {
                error!(entity = %entity, kind = e.kind(), "entity failed: {}", e);
                report.failed.push(EntityFailure::from_error(entity, &e));
            }
            Ok((entity, Err(join_err))) => {
                error!(entity = %entity, "entity task aborted: {}", join_err);
                report.failed.push(EntityFailure {
                    entity,
                    kind: "Aborted".into(),
                    message: join_err.to_string(),
                    retryable: false,
                });
            }
            Err(join_err) => error!("scheduler task aborted: {}", join_err),
        }
    }
    report
}
