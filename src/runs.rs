use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::RunConfig;
use crate::taskcluster::Task;

pub const TASK_GROUP_INFORMATION: &str = "task-group-information.json";
pub const TASKID_TO_FILE_MAP: &str = "taskid_to_file_map.json";
pub const RUN_CONFIG: &str = "config.json";
pub const DOWNLOAD_FAILURES: &str = "download-failures.json";
pub const DOWNLOADS_DIR: &str = "downloads";

/// Numbered run directories that exist under `task_dir`, ascending.
///
/// Entries whose names are not plain numbers are ignored.
pub fn scan_runs(task_dir: &Path) -> Result<Vec<u32>> {
    let mut runs = Vec::new();
    if !task_dir.exists() {
        return Ok(runs);
    }
    for entry in fs::read_dir(task_dir)
        .with_context(|| format!("failed to list runs in {}", task_dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(number) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        {
            runs.push(number);
        }
    }
    runs.sort_unstable();
    Ok(runs)
}

pub fn latest_run(task_dir: &Path) -> Result<Option<u32>> {
    Ok(scan_runs(task_dir)?.last().copied())
}

/// `<artifact>_data` folder name for an artifact pattern, dots removed.
pub fn data_dir_name(artifact: &str) -> String {
    format!("{}_data", artifact.replace('.', ""))
}

/// One numbered run under `<output>/<task-group-id>/`.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    pub number: u32,
    pub path: PathBuf,
    /// Whether this invocation reopened an existing run.
    pub resumed: bool,
}

impl RunDirectory {
    /// Allocate the next run number, or reopen the newest run when `resume` is set.
    pub fn allocate(output: &Path, task_group_id: &str, resume: bool) -> Result<Self> {
        let task_dir = output.join(task_group_id);
        fs::create_dir_all(&task_dir)
            .with_context(|| format!("failed to create {}", task_dir.display()))?;

        let latest = latest_run(&task_dir)?;
        let (number, resumed) = match (resume, latest) {
            (true, Some(latest)) => (latest, true),
            (_, latest) => (latest.unwrap_or(0) + 1, false),
        };

        let path = task_dir.join(number.to_string());
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create run directory {}", path.display()))?;
        info!(run = number, resumed, path = %path.display(), "artifacts will be stored in run directory");
        Ok(Self {
            number,
            path,
            resumed,
        })
    }

    pub fn bucket(&self, suite: &str) -> SuiteBucket {
        SuiteBucket {
            root: self.path.join(suite),
        }
    }

    pub fn write_config(&self, config: &RunConfig) -> Result<()> {
        write_json(&self.path.join(RUN_CONFIG), config)
    }

    /// Persist both manifest files. A resumed run keeps earlier file mappings.
    pub fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        write_json(
            &self.path.join(TASK_GROUP_INFORMATION),
            &manifest.task_group_information,
        )?;

        let map_path = self.path.join(TASKID_TO_FILE_MAP);
        let mut files = if self.resumed {
            load_file_map(&map_path)?
        } else {
            BTreeMap::new()
        };
        files.extend(
            manifest
                .taskid_to_file_map
                .iter()
                .map(|(file, task)| (file.clone(), task.clone())),
        );
        write_json(&map_path, &files)
    }

    pub fn write_failures<T: Serialize>(&self, failures: &[T]) -> Result<()> {
        write_json(&self.path.join(DOWNLOAD_FAILURES), &failures)
    }
}

pub fn load_file_map(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("malformed file map {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))
}

/// The two records written once per run.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub task_group_information: Vec<Value>,
    /// Downloaded file name to originating task id.
    pub taskid_to_file_map: BTreeMap<String, String>,
}

/// Per-suite folder holding `downloads/` and the `<artifact>_data/` partitions.
#[derive(Debug, Clone)]
pub struct SuiteBucket {
    pub root: PathBuf,
}

impl SuiteBucket {
    pub fn downloads(&self) -> PathBuf {
        self.root.join(DOWNLOADS_DIR)
    }

    pub fn data_dir(&self, artifact: &str) -> PathBuf {
        self.root.join(data_dir_name(artifact))
    }

    pub fn chunk_dir(&self, artifact: &str, chunk: usize) -> PathBuf {
        self.data_dir(artifact).join(chunk.to_string())
    }

    pub fn ensure(&self, artifacts: &[String]) -> Result<()> {
        fs::create_dir_all(self.downloads())
            .with_context(|| format!("failed to create {}", self.downloads().display()))?;
        for artifact in artifacts {
            let dir = self.data_dir(artifact);
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Copy a downloaded file or extracted directory into its chunk folder.
    ///
    /// Entries already present are left untouched.
    pub fn partition(&self, artifact: &str, chunk: usize, source: &Path) -> Result<PathBuf> {
        let chunk_dir = self.chunk_dir(artifact, chunk);
        fs::create_dir_all(&chunk_dir)
            .with_context(|| format!("failed to create {}", chunk_dir.display()))?;
        let name = source
            .file_name()
            .with_context(|| format!("{} has no file name", source.display()))?;
        let target = chunk_dir.join(name);
        copy_missing(source, &target)?;
        debug!(source = %source.display(), target = %target.display(), "partitioned artifact");
        Ok(target)
    }
}

fn copy_missing(source: &Path, target: &Path) -> Result<()> {
    if source.is_dir() {
        fs::create_dir_all(target)
            .with_context(|| format!("failed to create {}", target.display()))?;
        for entry in fs::read_dir(source)
            .with_context(|| format!("failed to read {}", source.display()))?
        {
            let entry = entry?;
            copy_missing(&entry.path(), &target.join(entry.file_name()))?;
        }
        return Ok(());
    }
    if target.exists() {
        return Ok(());
    }
    fs::copy(source, target).with_context(|| {
        format!(
            "failed to copy {} to {}",
            source.display(),
            target.display()
        )
    })?;
    Ok(())
}

/// Chunk index per task id: repeated suites count up from 0 in listing order.
pub fn assign_chunks(tasks: &[Task]) -> HashMap<String, usize> {
    let mut counters: HashMap<&str, usize> = HashMap::new();
    let mut chunks = HashMap::new();
    for task in tasks {
        let counter = counters.entry(task.suite.as_str()).or_insert(0);
        chunks.insert(task.id.clone(), *counter);
        *counter += 1;
    }
    chunks
}
