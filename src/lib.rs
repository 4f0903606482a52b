pub mod archive;
pub mod config;
pub mod data;
pub mod download;
pub mod error;
pub mod filter;
pub mod logging;
pub mod runs;
pub mod taskcluster;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, info_span, warn};

use crate::config::{DownloadRequest, DownloaderSettings, RunConfig};
use crate::download::{DownloadFailure, DownloadOptions, DownloadStage};
use crate::error::PipelineError;
use crate::filter::TaskFilter;
use crate::runs::{Manifest, RunDirectory, assign_chunks};
use crate::taskcluster::{BlockingQueueHttp, QueueHttp, TaskClusterClient};

pub use crate::data::{
    TaskData, TaskDataQuery, TaskDataRecord, get_task_data, get_task_data_paths, match_fetched_tasks,
};

/// Fetches, filters, downloads and organizes the artifacts of one task group.
pub struct ArtifactDownloader<H: QueueHttp> {
    settings: DownloaderSettings,
    client: TaskClusterClient<H>,
}

impl ArtifactDownloader<BlockingQueueHttp> {
    /// Construct a downloader talking to the configured queue over HTTP.
    pub fn from_settings(settings: DownloaderSettings) -> Result<Self> {
        let http = BlockingQueueHttp::from_settings(&settings)?;
        Self::with_http(settings, http)
    }
}

impl<H: QueueHttp> ArtifactDownloader<H> {
    pub fn with_http(settings: DownloaderSettings, http: H) -> Result<Self> {
        let client = TaskClusterClient::new(http, &settings.root_url, settings.page_limit)?;
        Ok(Self { settings, client })
    }

    /// Execute one invocation. Returns a summary of what was retrieved.
    ///
    /// Listing failures abort the run; per-task download failures are only
    /// recorded. Fails with [`PipelineError::NoArtifactsRetrieved`] when
    /// nothing at all could be retrieved.
    pub fn run(&self, request: &DownloadRequest) -> Result<DownloadOutcome> {
        let span = info_span!(
            "downloader.run",
            task_group = %request.task_group_id,
            platform = ?request.platform,
            resume = request.resume,
            unzip = request.unzip
        );
        let _span_guard = span.enter();

        let run = RunDirectory::allocate(&request.output, &request.task_group_id, request.resume)?;
        run.write_config(&RunConfig::from_request(request))?;

        info!("getting task group information");
        let group = self.client.list_task_group(&request.task_group_id)?;
        info!(tasks = group.tasks.len(), "obtained task group");

        let filter = TaskFilter::new(
            request.platform.as_deref(),
            &request.suites,
            request.include_failures,
        );
        let mut tasks = filter.apply(&group.tasks);
        info!(selected = tasks.len(), "filtered tasks");
        let head_rev = tasks.iter().rev().find_map(|task| task.head_rev.clone());
        let chunks = assign_chunks(&tasks);

        let options = DownloadOptions {
            artifacts: request.artifacts.clone(),
            unzip: request.unzip,
            keep_archives: self.settings.keep_archives,
            screen_error_logs: !request.include_failures,
        };
        let report =
            DownloadStage::new(&self.client, &options).run(&mut tasks, |suite| run.bucket(suite));

        let mut manifest = Manifest {
            task_group_information: group.raw.clone(),
            ..Manifest::default()
        };
        let mut files = Vec::with_capacity(report.artifacts.len());
        for artifact in &report.artifacts {
            let chunk = chunks
                .get(&artifact.task_id)
                .copied()
                .with_context(|| format!("no chunk assigned to {}", artifact.task_id))?;
            let bucket = run.bucket(&artifact.suite);
            let placed = bucket.partition(&artifact.pattern, chunk, &artifact.path)?;
            if let Some(name) = artifact.path.file_name().and_then(|name| name.to_str()) {
                manifest
                    .taskid_to_file_map
                    .insert(name.to_string(), artifact.task_id.clone());
            }
            files.push(placed);
        }
        run.write_manifest(&manifest)?;
        if !report.failures.is_empty() {
            run.write_failures(&report.failures)?;
        }

        let passed = report.succeeded_tasks().len();
        let failed_tasks: Vec<String> = report
            .failed_tasks()
            .into_iter()
            .map(str::to_string)
            .collect();
        let partial_tasks: Vec<String> = report
            .partial_tasks()
            .into_iter()
            .map(str::to_string)
            .collect();
        info!(
            passed,
            failed = failed_tasks.len(),
            total = tasks.len(),
            run = run.number,
            "finished processing"
        );
        if !failed_tasks.is_empty() {
            warn!(tasks = ?failed_tasks, "tasks that failed to have their artifact downloaded");
        }
        if !partial_tasks.is_empty() {
            warn!(tasks = ?partial_tasks, "tasks missing some of their artifacts");
        }

        if report.artifacts.is_empty() {
            return Err(PipelineError::NoArtifactsRetrieved {
                task_group_id: request.task_group_id.clone(),
                failed: report.failures.len(),
            }
            .into());
        }

        Ok(DownloadOutcome {
            run_number: run.number,
            run_dir: run.path.clone(),
            head_rev,
            new_files: report.artifacts.iter().filter(|a| a.fresh).count(),
            files,
            passed,
            total: tasks.len(),
            failed_tasks,
            partial_tasks,
            failures: report.failures,
        })
    }
}

/// Summary of one downloader invocation.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub run_number: u32,
    pub run_dir: PathBuf,
    /// `GECKO_HEAD_REV` of the selected tasks, when present.
    pub head_rev: Option<String>,
    /// Partitioned files and directories under `<artifact>_data/<chunk>/`.
    pub files: Vec<PathBuf>,
    /// Artifacts fetched by this invocation rather than found on disk.
    pub new_files: usize,
    pub passed: usize,
    pub total: usize,
    /// Tasks with no retrieved artifact and at least one failure.
    pub failed_tasks: Vec<String>,
    /// Tasks that passed but lost some artifacts; see `failures`.
    pub partial_tasks: Vec<String>,
    pub failures: Vec<DownloadFailure>,
}
