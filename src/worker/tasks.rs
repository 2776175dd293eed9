use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::catalog;
use crate::engine::{CommandCompiler, CompiledCommand, Operation};
use crate::offload::BlockingPool;
use crate::queue::WorkUnit;
use crate::reconcile::ERROR_EXCERPT_LIMIT;
use crate::sandbox::{excerpt, SandboxError, SharedCommandRunner};
use crate::storage::SharedFileProvider;

const UNKNOWN_ERROR: &str = "Unknown error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub file: String,
    pub error: String,
}

/// Per-batch result stored on the queue record and, after reconciliation,
/// on the job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub success: Vec<String>,
    pub failed: Vec<FailedItem>,
    pub output_files: Vec<String>,
}

impl BatchOutcome {
    pub fn all_failed(&self) -> bool {
        self.success.is_empty() && !self.failed.is_empty()
    }

    /// `All N inputs failed: <first error>` when nothing succeeded.
    pub fn failure_message(&self) -> Option<String> {
        if !self.all_failed() {
            return None;
        }
        let first = self
            .failed
            .first()
            .map(|item| item.error.as_str())
            .unwrap_or(UNKNOWN_ERROR);
        Some(format!("All {} inputs failed: {first}", self.failed.len()))
    }
}

/// Where a running batch reports progress and learns about cancellation.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: u8, current_item: Option<String>);
    async fn is_cancelled(&self) -> bool;
}

/// Sink for callers that do not track progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _progress: u8, _current_item: Option<String>) {}

    async fn is_cancelled(&self) -> bool {
        false
    }
}

enum Plan<'a> {
    Pipeline(&'a [Operation]),
    Raw(&'a str),
}

struct PreparedItem {
    input: PathBuf,
    output: PathBuf,
}

/// Runs one work unit item by item. A failing item is recorded and the batch
/// moves on.
#[derive(Clone)]
pub struct BatchExecutor {
    compiler: Arc<CommandCompiler>,
    runner: SharedCommandRunner,
    files: SharedFileProvider,
    pool: BlockingPool,
}

impl BatchExecutor {
    pub fn new(
        compiler: Arc<CommandCompiler>,
        runner: SharedCommandRunner,
        files: SharedFileProvider,
        pool: BlockingPool,
    ) -> Self {
        Self {
            compiler,
            runner,
            files,
            pool,
        }
    }

    pub async fn execute(&self, work: &WorkUnit, sink: &dyn ProgressSink) -> BatchOutcome {
        let (inputs, plan, format, owner) = match work {
            WorkUnit::ProcessImages {
                input_files,
                operations,
                output_format,
                owner,
            } => (
                input_files,
                Plan::Pipeline(operations.as_slice()),
                output_format,
                owner,
            ),
            WorkUnit::ProcessRawCommand {
                input_files,
                raw_command,
                output_format,
                owner,
            } => (
                input_files,
                Plan::Raw(raw_command.as_str()),
                output_format,
                owner,
            ),
        };

        let mut outcome = BatchOutcome::default();
        let total = inputs.len().max(1);
        for (index, reference) in inputs.iter().enumerate() {
            if sink.is_cancelled().await {
                debug!(remaining = inputs.len() - index, "batch cancelled, stopping early");
                break;
            }
            let progress = (index * 100 / total) as u8;
            sink.report(progress, Some(display_name(reference))).await;

            match self
                .process_item(reference, &plan, format.as_str(), owner.as_deref())
                .await
            {
                Ok(output) => {
                    outcome.success.push(reference.clone());
                    outcome.output_files.push(output);
                }
                Err(error) => {
                    warn!(input = %reference, error = %error, "batch item failed");
                    outcome.failed.push(FailedItem {
                        file: reference.clone(),
                        error,
                    });
                }
            }
        }
        sink.report(100, None).await;
        outcome
    }

    async fn process_item(
        &self,
        reference: &str,
        plan: &Plan<'_>,
        format: &str,
        owner: Option<&str>,
    ) -> Result<String, String> {
        let prepared = self.prepare(reference, format, owner).await?;
        let command = self.compile(&prepared, plan)?;
        match self.runner.run(&command).await {
            Ok(result) if result.success => {
                if prepared.output.is_file() {
                    Ok(prepared.output.to_string_lossy().to_string())
                } else {
                    Err(String::from("Engine reported success but produced no output file"))
                }
            }
            Ok(result) => {
                let stderr = result.stderr.trim();
                if stderr.is_empty() {
                    Err(String::from(UNKNOWN_ERROR))
                } else {
                    Err(excerpt(stderr, ERROR_EXCERPT_LIMIT))
                }
            }
            Err(error @ SandboxError::TimedOut { .. }) => Err(error.to_string()),
            Err(error) => Err(excerpt(error.to_string().as_str(), ERROR_EXCERPT_LIMIT)),
        }
    }

    async fn prepare(
        &self,
        reference: &str,
        format: &str,
        owner: Option<&str>,
    ) -> Result<PreparedItem, String> {
        let files = self.files.clone();
        let reference = reference.to_string();
        let format = format.to_string();
        let owner = owner.map(str::to_string);
        self.pool
            .run_blocking("batch.prepare", move || -> Result<PreparedItem, String> {
                let input = files
                    .resolve_input(reference.as_str())
                    .map_err(|error| error.to_string())?;
                catalog::validate_input_file(input.as_path()).map_err(|error| error.to_string())?;
                let output = files
                    .output_path(owner.as_deref(), input.as_path(), format.as_str())
                    .map_err(|error| error.to_string())?;
                Ok(PreparedItem { input, output })
            })
            .await
            .map_err(|error| error.to_string())?
    }

    fn compile(&self, item: &PreparedItem, plan: &Plan<'_>) -> Result<CompiledCommand, String> {
        let compiled = match plan {
            Plan::Pipeline(operations) => {
                self.compiler
                    .compile(item.input.as_path(), item.output.as_path(), operations)
            }
            Plan::Raw(raw) => {
                self.compiler
                    .compile_raw(item.input.as_path(), item.output.as_path(), raw)
            }
        };
        compiled.map_err(|error| error.to_string())
    }
}

fn display_name(reference: &str) -> String {
    Path::new(reference)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| reference.to_string())
}
