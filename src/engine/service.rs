//! Run service — launches detection runs on their own tasks.
//!
//! The caller gets a `RunHandle` back immediately. The handle carries the
//! run's cancel flag and its join handle; nothing else is shared between
//! the caller and the running traversal.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::backend::QueryExecutor;
use crate::config::{AppConfig, DetectionSettings, SchemaConfig};
use crate::engine::context::CancelFlag;
use crate::engine::controller::TraversalController;
use crate::storage::{self, ConfigStore};
use crate::types::{DetectionError, DetectionReport, SeedRequest};

pub struct DetectionService {
    executor: Arc<dyn QueryExecutor>,
    backend_id: String,
    schema: SchemaConfig,
    settings: DetectionSettings,
    seed_template: Option<String>,
}

impl DetectionService {
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        backend_id: &str,
        schema: SchemaConfig,
        settings: DetectionSettings,
    ) -> Self {
        Self {
            executor,
            backend_id: backend_id.to_string(),
            schema,
            settings,
            seed_template: None,
        }
    }

    /// Build from the file config with the config store's overrides and
    /// saved seed query layered on top.
    pub fn from_config(
        executor: Arc<dyn QueryExecutor>,
        config: &AppConfig,
        store: &dyn ConfigStore,
    ) -> Result<Self, DetectionError> {
        let mut settings = config.detection.clone();
        settings.apply_overrides(store)?;

        Ok(Self::new(executor, &config.backend.id, config.schema.clone(), settings)
            .with_seed_template(storage::seed_query(store)))
    }

    pub fn with_seed_template(mut self, template: Option<String>) -> Self {
        self.seed_template = template;
        self
    }

    pub fn settings(&self) -> &DetectionSettings {
        &self.settings
    }

    fn controller(
        &self,
        settings: Option<DetectionSettings>,
    ) -> Result<TraversalController, DetectionError> {
        TraversalController::new(
            self.executor.clone(),
            &self.backend_id,
            &self.schema,
            settings.unwrap_or_else(|| self.settings.clone()),
            self.seed_template.as_deref(),
        )
    }

    /// Validate the request and launch the run on a new task.
    ///
    /// `settings` replaces the service defaults for this run only.
    pub fn start(
        &self,
        request: SeedRequest,
        settings: Option<DetectionSettings>,
    ) -> Result<RunHandle, DetectionError> {
        request.validated_accounts()?;
        let controller = self.controller(settings)?;

        let id = Uuid::new_v4();
        let cancel = CancelFlag::new();
        let flag = cancel.clone();
        let task = tokio::spawn(async move { controller.run(&request, id, flag).await });

        info!(run_id = %id, "Run launched");
        Ok(RunHandle { id, cancel, task })
    }

    pub fn cancel(&self, handle: &RunHandle) {
        handle.cancel();
    }

    /// Run inline on the current task.
    pub async fn run(
        &self,
        request: &SeedRequest,
        settings: Option<DetectionSettings>,
        cancel: CancelFlag,
    ) -> Result<DetectionReport, DetectionError> {
        self.controller(settings)?
            .run(request, Uuid::new_v4(), cancel)
            .await
    }
}

/// Handle to a launched run.
pub struct RunHandle {
    id: Uuid,
    cancel: CancelFlag,
    task: JoinHandle<Result<DetectionReport, DetectionError>>,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Ask the run to stop after its in-flight round.
    pub fn cancel(&self) {
        info!(run_id = %self.id, "Cancellation requested");
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Wait for the run's report.
    pub async fn wait(self) -> Result<DetectionReport, DetectionError> {
        self.task
            .await
            .map_err(|e| DetectionError::Task(e.to_string()))?
    }
}
