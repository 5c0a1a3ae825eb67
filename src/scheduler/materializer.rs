//! Turns one job firing into tasks.

use std::sync::Arc;
use thiserror::Error;

use crate::core::clock::Clock;
use crate::core::job::{Target, TaskTemplate};
use crate::core::task::Task;
use crate::storage::{ProbeRegistry, StorageError, TaskStore};

/// What a firing selected and created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterializeOutcome {
    /// Probes the target filter selected.
    pub matched: usize,
    /// Tasks inserted.
    pub created: usize,
}

/// Errors that can occur while materializing a firing.
#[derive(Debug, Error)]
pub enum MaterializeError {
    /// The probe population could not be resolved; nothing was created.
    #[error("failed to resolve target probes: {0}")]
    Registry(#[source] StorageError),

    /// Some inserts failed. The tasks that were created stay.
    #[error("created {created} of {matched} tasks: {source}")]
    Partial {
        matched: usize,
        created: usize,
        #[source]
        source: StorageError,
    },
}

/// Creates one `ready` task per probe matching a job's target.
///
/// Inserts are independent: a failing insert does not stop the others and
/// nothing is rolled back. Existing tasks are never touched.
pub struct TaskMaterializer<S> {
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for TaskMaterializer<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: TaskStore + ProbeRegistry> TaskMaterializer<S> {
    pub fn new(storage: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Resolve the target and insert a task for every selected probe.
    pub async fn materialize(
        &self,
        target: &Target,
        template: &TaskTemplate,
    ) -> Result<MaterializeOutcome, MaterializeError> {
        let probes = self
            .storage
            .resolve_targets(target)
            .await
            .map_err(MaterializeError::Registry)?;

        let matched = probes.len();
        tracing::debug!(
            matched,
            countries = ?target.countries,
            platforms = ?target.platforms,
            test_name = %template.test_name,
            "resolved target probes"
        );

        let creation_time = self.clock.now();
        let mut created = 0;
        let mut first_error = None;

        for probe_id in probes {
            let task = Task::new(
                probe_id,
                template.test_name.clone(),
                template.arguments.clone(),
                creation_time,
            );
            match self.storage.insert_task(&task).await {
                Ok(()) => created += 1,
                Err(e) => {
                    tracing::warn!(
                        probe_id = %task.probe_id,
                        task_id = %task.id,
                        error = %e,
                        "failed to insert task"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => Ok(MaterializeOutcome { matched, created }),
            Some(source) => {
                tracing::warn!(matched, created, "partial materialization");
                Err(MaterializeError::Partial {
                    matched,
                    created,
                    source,
                })
            }
        }
    }
}
