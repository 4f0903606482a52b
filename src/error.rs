use thiserror::Error;

/// Failures the pipeline distinguishes so callers can pick a recovery.
///
/// Values are raised into `anyhow::Error`; use `downcast_ref::<PipelineError>()`
/// to inspect them.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network or service problem; re-running the whole listing may succeed.
    #[error("transient failure fetching {url}: {reason}")]
    TransientFetch { url: String, reason: String },

    /// The queue answered 404 for a resource.
    #[error("resource not found: {url}")]
    NotFound { url: String },

    #[error("task group {0} does not exist")]
    TaskGroupNotFound(String),

    #[error("no run {} found for task group {task_group_id}", describe_run(.run))]
    RunNotFound {
        task_group_id: String,
        run: Option<u32>,
    },

    #[error("no data for artifact {artifact} in run {run}")]
    ArtifactNotFound { artifact: String, run: u32 },

    #[error("no artifacts retrieved for task group {task_group_id} ({failed} downloads failed)")]
    NoArtifactsRetrieved { task_group_id: String, failed: usize },
}

impl PipelineError {
    /// Whether re-running the same invocation is a sensible recovery.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientFetch { .. })
    }
}

fn describe_run(run: &Option<u32>) -> String {
    match run {
        Some(number) => number.to_string(),
        None => "directories".into(),
    }
}

/// Find a [`PipelineError`] anywhere in an `anyhow` chain.
pub fn pipeline_error(err: &anyhow::Error) -> Option<&PipelineError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
}
