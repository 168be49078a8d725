//! The per-worker serving loop: load, optional preheat, then batch
//! inference until the pool shuts down.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::batch::{Assembly, BatchAssembler};
use crate::channel::TaskReceiver;
use crate::config::PoolTiming;
use crate::engine::ModelEngine;
use crate::error::ServingError;
use crate::loader::ModelLoader;
use crate::outlet::OutletSet;
use crate::status::{StatusCell, WorkerStatus};
use crate::task::{ImagePool, Task};

/// Everything one worker needs, cloned per worker at `run()` time.
pub struct WorkerContext {
    pub backend_id: String,
    pub index: usize,
    /// Pool-wide status cell; `Exited` here tells every worker to stop.
    pub pool_status: StatusCell,
    /// This worker's own status cell, read by `report()`.
    pub self_status: StatusCell,
    pub receiver: TaskReceiver,
    pub images: ImagePool,
    pub outlets: Arc<OutletSet>,
    pub loader: Arc<ModelLoader>,
    pub timing: PoolTiming,
    /// Process-wide token, cancelled on fatal device loss.
    pub shutdown: CancellationToken,
    pub preheat: Option<PathBuf>,
    pub batch_size: usize,
}

/// Drive one worker to completion. Terminal status is written before
/// returning: `Exited` on orderly shutdown, `ErrorLabels` for value errors,
/// `Error` otherwise. A `DeviceFatal` failure additionally cancels the
/// process-wide shutdown token.
pub async fn run_worker(ctx: WorkerContext, mut engine: Box<dyn ModelEngine>) {
    match serve(&ctx, engine.as_mut()).await {
        Ok(()) => {
            ctx.self_status.store(WorkerStatus::Exited);
            info!(backend = %ctx.backend_id, worker = ctx.index, "worker exited");
        }
        Err(err) => {
            error!(
                backend = %ctx.backend_id,
                worker = ctx.index,
                code = err.code(),
                error = %err,
                "worker failed"
            );
            ctx.self_status.store(WorkerStatus::Cleaning);
            if matches!(err, ServingError::DeviceFatal(_)) {
                ctx.shutdown.cancel();
            }
            let terminal = if err.is_value_error() {
                WorkerStatus::ErrorLabels
            } else {
                WorkerStatus::Error
            };
            ctx.self_status.store(terminal);
        }
    }
}

async fn serve(ctx: &WorkerContext, engine: &mut dyn ModelEngine) -> Result<(), ServingError> {
    ctx.self_status.store(WorkerStatus::Loading);
    ctx.loader.stage_and_load(ctx.index, engine).await?;

    if let Some(sample) = &ctx.preheat {
        ctx.self_status.store(WorkerStatus::Preheating);
        // Preheat failures block the Running transition as load errors;
        // only device loss keeps its own classification.
        if let Err(err) = preheat(ctx, engine, sample).await {
            return Err(match err {
                fatal @ ServingError::DeviceFatal(_) => fatal,
                other => ServingError::ReloadModel(format!(": preheat: {other}")),
            });
        }
    }

    ctx.self_status.store(WorkerStatus::Running);
    info!(backend = %ctx.backend_id, worker = ctx.index, "worker running");

    let assembler = BatchAssembler::new(
        ctx.receiver.clone(),
        ctx.pool_status.clone(),
        ctx.batch_size,
        ctx.timing.clone(),
    );
    loop {
        match assembler.next_batch().await {
            Assembly::Shutdown => return Ok(()),
            Assembly::Full(batch) => {
                let results = infer_deadline(ctx, engine, &batch).await?;
                if results.len() != batch.len() {
                    return Err(ServingError::InvalidLabels(format!(
                        ": engine returned {} results for {} tasks",
                        results.len(),
                        batch.len()
                    )));
                }
                for (task, result) in batch.iter().zip(&results) {
                    ctx.outlets.post(task, result).await?;
                }
                debug!(
                    backend = %ctx.backend_id,
                    worker = ctx.index,
                    batch = batch.len(),
                    "batch served"
                );
            }
        }
    }
}

/// One synthetic inference pass over the configured sample payload. The
/// result is discarded; only the side effect of warming the engine counts.
async fn preheat(
    ctx: &WorkerContext,
    engine: &mut dyn ModelEngine,
    sample: &PathBuf,
) -> Result<(), ServingError> {
    let payload = tokio::fs::read(sample)
        .await
        .map_err(|e| ServingError::ReloadModel(format!(": read preheat sample: {e}")))?;
    let image_id = format!("preheat-{}-{}", ctx.index, uuid::Uuid::new_v4().simple());
    ctx.images.put(&image_id, payload.into())?;
    let batch = vec![Task::new(format!("preheat-{}", ctx.index), &image_id)];
    let results = infer_deadline(ctx, engine, &batch).await?;
    // Engines that ignore the batch leave the payload behind.
    ctx.images.take(&image_id);
    debug!(
        backend = %ctx.backend_id,
        worker = ctx.index,
        results = results.len(),
        "preheat pass done"
    );
    Ok(())
}

async fn infer_deadline(
    ctx: &WorkerContext,
    engine: &mut dyn ModelEngine,
    batch: &[Task],
) -> Result<Vec<serde_json::Value>, ServingError> {
    timeout(ctx.timing.infer_deadline, engine.infer(batch, &ctx.images))
        .await
        .map_err(|_| ServingError::InferTimeout)?
}
