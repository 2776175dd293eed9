use std::sync::Arc;

use tracing::info;

use crate::db::jobs::JobStore;
use crate::engine::{CommandCompiler, EngineLimits};
use crate::error::CoreError;
use crate::offload::BlockingPool;
use crate::queue::{QueueAdapter, SqliteQueueBackend};
use crate::reconcile::StateReconciler;
use crate::sandbox::{ExecutionSandbox, SandboxConfig};
use crate::service::{EditService, ServiceOptions};
use crate::settings::Settings;
use crate::storage::LocalFileStorage;
use crate::worker::tasks::BatchExecutor;
use crate::worker::{QueueWorker, WorkerConfig};

/// Every long-lived component, built once from settings and shared by the
/// request side and the worker.
#[derive(Clone)]
pub struct AppComponents {
    pub settings: Settings,
    pub pool: BlockingPool,
    pub compiler: Arc<CommandCompiler>,
    pub sandbox: Arc<ExecutionSandbox>,
    pub files: Arc<LocalFileStorage>,
    pub queue: QueueAdapter,
    pub store: JobStore,
    pub reconciler: StateReconciler,
    pub service: EditService,
}

impl AppComponents {
    /// Opens both SQLite databases (creating their schemas) and wires the
    /// components together. No engine probe happens here.
    pub fn from_settings(settings: Settings) -> Result<Self, CoreError> {
        let pool = BlockingPool::new(settings.blocking_pool_size);
        let compiler = Arc::new(CommandCompiler::new(
            EngineLimits {
                memory: settings.engine_memory_limit.clone(),
                time_secs: settings.engine_timeout_secs,
            },
            settings.engine_search_path.clone(),
        ));
        let sandbox = Arc::new(ExecutionSandbox::new(
            SandboxConfig::from_settings(&settings),
            pool.clone(),
        ));
        let files = Arc::new(LocalFileStorage::from_settings(&settings));

        let backend = SqliteQueueBackend::with_retention(
            settings.queue_db_path.clone(),
            settings.queue_retention(),
        );
        backend.initialize()?;
        let queue = QueueAdapter::new(Arc::new(backend), pool.clone());

        let store = JobStore::new(settings.jobs_db_path.clone());
        store.initialize()?;
        let reconciler = StateReconciler::new(store.clone(), queue.clone(), pool.clone());

        let service = EditService::new(
            compiler.clone(),
            sandbox.clone(),
            files.clone(),
            queue.clone(),
            reconciler.clone(),
            pool.clone(),
            ServiceOptions::from_settings(&settings),
        );

        info!(
            jobs_db = %settings.jobs_db_path.display(),
            queue_db = %settings.queue_db_path.display(),
            pool_size = pool.size(),
            "components ready"
        );

        Ok(Self {
            settings,
            pool,
            compiler,
            sandbox,
            files,
            queue,
            store,
            reconciler,
            service,
        })
    }

    pub fn executor(&self) -> BatchExecutor {
        BatchExecutor::new(
            self.compiler.clone(),
            self.sandbox.clone(),
            self.files.clone(),
            self.pool.clone(),
        )
    }

    pub fn worker(&self, config: WorkerConfig) -> QueueWorker {
        QueueWorker::new(self.queue.clone(), self.executor(), config)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.settings.max_concurrent_jobs,
            poll_interval: self.settings.worker_poll_interval(),
        }
    }
}
