use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::archive::{self, ArchiveKind};
use crate::filter::pattern_match;
use crate::runs::SuiteBucket;
use crate::taskcluster::{QueueHttp, Task, TaskClusterClient};

const ERROR_LOG_MARKER: &str = "log_error";

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Artifact-name substrings to fetch.
    pub artifacts: Vec<String>,
    pub unzip: bool,
    pub keep_archives: bool,
    /// Skip tasks whose `log_error` artifact is non-empty.
    pub screen_error_logs: bool,
}

/// A retrieved artifact sitting in a suite's `downloads` folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedArtifact {
    pub task_id: String,
    pub suite: String,
    /// Requested pattern this artifact matched.
    pub pattern: String,
    /// Downloaded file, or the directory an archive was extracted into.
    pub path: PathBuf,
    /// False when the artifact was already on disk from an earlier attempt.
    pub fresh: bool,
}

/// A per-task download problem. Recorded, never fatal to the batch.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadFailure {
    pub task_id: String,
    pub suite: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct DownloadReport {
    pub artifacts: Vec<DownloadedArtifact>,
    pub failures: Vec<DownloadFailure>,
    /// Tasks passed over: no matching artifact, or a non-empty error log.
    pub skipped: Vec<String>,
}

impl DownloadReport {
    /// Tasks that produced at least one artifact.
    pub fn succeeded_tasks(&self) -> BTreeSet<&str> {
        self.artifacts
            .iter()
            .map(|artifact| artifact.task_id.as_str())
            .collect()
    }

    /// Tasks with failures and no retrieved artifact.
    pub fn failed_tasks(&self) -> BTreeSet<&str> {
        let succeeded = self.succeeded_tasks();
        self.failures
            .iter()
            .map(|failure| failure.task_id.as_str())
            .filter(|task_id| !succeeded.contains(task_id))
            .collect()
    }

    /// Tasks that produced artifacts but lost at least one along the way.
    pub fn partial_tasks(&self) -> BTreeSet<&str> {
        let succeeded = self.succeeded_tasks();
        self.failures
            .iter()
            .map(|failure| failure.task_id.as_str())
            .filter(|task_id| succeeded.contains(task_id))
            .collect()
    }
}

enum TaskDisposition {
    Retrieved,
    Skipped,
    Failed,
}

/// Fetches the matching artifacts of each task into its suite bucket.
pub struct DownloadStage<'a, H: QueueHttp> {
    client: &'a TaskClusterClient<H>,
    options: &'a DownloadOptions,
}

impl<'a, H: QueueHttp> DownloadStage<'a, H> {
    pub fn new(client: &'a TaskClusterClient<H>, options: &'a DownloadOptions) -> Self {
        Self { client, options }
    }

    /// Download every task sequentially. `bucket_for` maps a suite to its bucket.
    pub fn run<F>(&self, tasks: &mut [Task], bucket_for: F) -> DownloadReport
    where
        F: Fn(&str) -> SuiteBucket,
    {
        let mut report = DownloadReport::default();
        let total = tasks.len();
        for (index, task) in tasks.iter_mut().enumerate() {
            let span = info_span!("download.task", task_id = %task.id, suite = %task.suite);
            let _guard = span.enter();
            info!(current = index + 1, total, name = %task.name, "processing task");

            let bucket = bucket_for(&task.suite);
            let result = match bucket.ensure(&self.options.artifacts) {
                Ok(()) => self.download_task(task, &bucket, &mut report),
                Err(err) => Err(err),
            };
            match result {
                Ok(TaskDisposition::Retrieved) => {
                    info!(current = index + 1, total, "finished task");
                }
                Ok(TaskDisposition::Skipped) => report.skipped.push(task.id.clone()),
                Ok(TaskDisposition::Failed) => {}
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to get artifacts");
                    report.failures.push(DownloadFailure {
                        task_id: task.id.clone(),
                        suite: task.suite.clone(),
                        artifact: None,
                        reason: format!("{err:#}"),
                    });
                }
            }
        }
        report
    }

    fn download_task(
        &self,
        task: &mut Task,
        bucket: &SuiteBucket,
        report: &mut DownloadReport,
    ) -> Result<TaskDisposition> {
        let downloads = bucket.downloads();
        debug!("listing task artifacts");
        self.client.populate_artifacts(task)?;

        if !task
            .artifacts
            .iter()
            .any(|name| pattern_match(name, &self.options.artifacts).is_some())
        {
            info!(wanted = ?self.options.artifacts, "no matching artifact");
            return Ok(TaskDisposition::Skipped);
        }

        if self.options.screen_error_logs {
            if let Some(log) = self.failing_error_log(task, &downloads)? {
                info!(log = %log, "skipping a failed test");
                return Ok(TaskDisposition::Skipped);
            }
        }

        let mut retrieved = false;
        let mut failed = false;
        for name in task.artifacts.clone() {
            let Some(pattern) = pattern_match(&name, &self.options.artifacts) else {
                continue;
            };
            match self.retrieve(&task.id, &name, &downloads) {
                Ok((path, fresh)) => {
                    push_unique(report, task, pattern.to_string(), path, fresh);
                    retrieved = true;
                }
                Err(err) => {
                    warn!(artifact = %name, error = %format!("{err:#}"), "failed to retrieve artifact");
                    report.failures.push(DownloadFailure {
                        task_id: task.id.clone(),
                        suite: task.suite.clone(),
                        artifact: Some(name.clone()),
                        reason: format!("{err:#}"),
                    });
                    failed = true;
                }
            }
        }

        Ok(match (retrieved, failed) {
            (true, _) => TaskDisposition::Retrieved,
            (false, true) => TaskDisposition::Failed,
            (false, false) => TaskDisposition::Skipped,
        })
    }

    /// Fetch and unpack one artifact, reusing whatever an earlier attempt left on disk.
    fn retrieve(&self, task_id: &str, name: &str, downloads: &Path) -> Result<(PathBuf, bool)> {
        let dest = downloads.join(download_name(task_id, name));
        if let Some((_, target)) = self.extraction_target(task_id, &dest) {
            if target.is_dir() && !dest.exists() {
                info!(path = %target.display(), "already extracted");
                return Ok((target, false));
            }
        }
        let (path, fresh) = self.fetch(task_id, name, downloads)?;
        Ok((self.unpack(task_id, &path)?, fresh))
    }

    /// Fetch `name` unless a previous attempt already stored it.
    fn fetch(&self, task_id: &str, name: &str, downloads: &Path) -> Result<(PathBuf, bool)> {
        let dest = downloads.join(download_name(task_id, name));
        if dest.exists() {
            info!(path = %dest.display(), "file already exists");
            return Ok((dest, false));
        }
        info!(artifact = %name, path = %dest.display(), "downloading");
        let bytes = self.client.fetch_artifact(task_id, name, &dest)?;
        debug!(bytes, "downloaded");
        Ok((dest, true))
    }

    /// Archive kind and extraction directory for `path`, when unpacking is enabled.
    fn extraction_target(&self, task_id: &str, path: &Path) -> Option<(ArchiveKind, PathBuf)> {
        if !self.options.unzip {
            return None;
        }
        let kind = ArchiveKind::detect(path)?;
        let file_name = path.file_name()?.to_str()?;
        let stem = kind.stem(file_name);
        let stem = stem.strip_prefix(&format!("{task_id}_")).unwrap_or(stem);
        Some((kind, path.with_file_name(format!("{task_id}_{stem}"))))
    }

    /// Extract archives when asked to, returning the path that holds the data.
    fn unpack(&self, task_id: &str, path: &Path) -> Result<PathBuf> {
        if path.is_dir() {
            return Ok(path.to_path_buf());
        }
        let Some((kind, target)) = self.extraction_target(task_id, path) else {
            return Ok(path.to_path_buf());
        };
        if !target.exists() {
            info!(archive = %path.display(), target = %target.display(), "extracting");
            if let Err(err) = archive::extract(path, kind, &target) {
                // Drop the bad archive so a resumed run fetches it again.
                let _ = fs::remove_dir_all(&target);
                let _ = fs::remove_file(path);
                return Err(err);
            }
        }
        if !self.options.keep_archives {
            fs::remove_file(path)
                .with_context(|| format!("failed to remove archive {}", path.display()))?;
        }
        Ok(target)
    }

    /// Download error-log artifacts and return the first non-empty one.
    fn failing_error_log(&self, task: &Task, downloads: &Path) -> Result<Option<String>> {
        for name in task.artifacts.iter().filter(|name| name.contains(ERROR_LOG_MARKER)) {
            let (path, _) = self.fetch(&task.id, name, downloads)?;
            let size = fs::metadata(&path)
                .with_context(|| format!("failed to stat {}", path.display()))?
                .len();
            if size != 0 {
                return Ok(Some(name.clone()));
            }
        }
        Ok(None)
    }
}

fn push_unique(
    report: &mut DownloadReport,
    task: &Task,
    pattern: String,
    path: PathBuf,
    fresh: bool,
) {
    if report
        .artifacts
        .iter()
        .any(|artifact| artifact.task_id == task.id && artifact.path == path)
    {
        return;
    }
    report.artifacts.push(DownloadedArtifact {
        task_id: task.id.clone(),
        suite: task.suite.clone(),
        pattern,
        path,
        fresh,
    });
}

/// `<task-id>_<artifact-basename>`.
pub fn download_name(task_id: &str, artifact: &str) -> String {
    let basename = artifact.rsplit('/').next().unwrap_or(artifact);
    format!("{task_id}_{basename}")
}
