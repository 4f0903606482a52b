use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::runs::{DOWNLOADS_DIR, TASK_GROUP_INFORMATION, data_dir_name, scan_runs};
use crate::taskcluster::Task;

/// Parsed content of one data file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TaskData {
    Json(Value),
    Raw(#[serde(serialize_with = "lossy_text")] Vec<u8>),
}

fn lossy_text<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskDataRecord {
    pub file: PathBuf,
    pub data: TaskData,
}

/// Locates the organized data of one artifact inside a run.
#[derive(Debug, Clone)]
pub struct TaskDataQuery {
    output: PathBuf,
    task_group_id: String,
    artifact: String,
    run: Option<u32>,
    suite_matcher: Option<String>,
}

impl TaskDataQuery {
    pub fn new(
        output: impl Into<PathBuf>,
        task_group_id: impl Into<String>,
        artifact: impl Into<String>,
    ) -> Self {
        Self {
            output: output.into(),
            task_group_id: task_group_id.into(),
            artifact: artifact.into(),
            run: None,
            suite_matcher: None,
        }
    }

    /// Read a specific run instead of the latest one.
    pub fn run(mut self, run: Option<u32>) -> Self {
        self.run = run;
        self
    }

    /// Only consider suites whose name contains `matcher`.
    pub fn suite_matcher(mut self, matcher: impl Into<String>) -> Self {
        self.suite_matcher = Some(matcher.into());
        self
    }

    fn task_dir(&self) -> PathBuf {
        self.output.join(&self.task_group_id)
    }

    /// The requested run, or the newest run that holds suite data.
    pub fn resolve_run(&self) -> Result<u32> {
        let task_dir = self.task_dir();
        let runs = scan_runs(&task_dir)?;
        let not_found = |run| PipelineError::RunNotFound {
            task_group_id: self.task_group_id.clone(),
            run,
        };

        if let Some(run) = self.run {
            return if runs.contains(&run) {
                Ok(run)
            } else {
                Err(not_found(Some(run)).into())
            };
        }

        let Some(&newest) = runs.last() else {
            return Err(not_found(None).into());
        };
        for &run in runs.iter().rev() {
            if !suite_dirs(&task_dir.join(run.to_string()))?.is_empty() {
                info!(run, "no run number supplied, using the latest populated run");
                return Ok(run);
            }
        }
        Ok(newest)
    }

    /// Suite name to naturally ordered data files.
    pub fn paths(&self) -> Result<BTreeMap<String, Vec<PathBuf>>> {
        let run = self.resolve_run()?;
        let run_dir = self.task_dir().join(run.to_string());
        let mut data = BTreeMap::new();

        for (suite, suite_dir) in suite_dirs(&run_dir)? {
            if let Some(matcher) = &self.suite_matcher {
                if !suite.contains(matcher.as_str()) {
                    continue;
                }
            }
            let Some(data_dir) = self.find_data_dir(&suite_dir)? else {
                debug!(suite = %suite, "no data directory, skipping");
                continue;
            };
            let mut files = Vec::new();
            collect_files(&data_dir, &data_dir, &self.artifact, &mut files)?;
            if files.is_empty() {
                debug!(suite = %suite, "data directory is empty, skipping");
                continue;
            }
            files.sort_by(|a, b| natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()));
            data.insert(suite, files);
        }

        if data.is_empty() {
            return Err(PipelineError::ArtifactNotFound {
                artifact: self.artifact.clone(),
                run,
            }
            .into());
        }
        Ok(data)
    }

    /// Suite name to files with their parsed contents.
    pub fn load(&self) -> Result<BTreeMap<String, Vec<TaskDataRecord>>> {
        let mut data = BTreeMap::new();
        for (suite, paths) in self.paths()? {
            let mut records = Vec::with_capacity(paths.len());
            for file in paths {
                debug!(path = %file.display(), "opening");
                let data = read_data(&file)?;
                records.push(TaskDataRecord { file, data });
            }
            data.insert(suite, records);
        }
        Ok(data)
    }

    /// Map each task id to the task it fetched a matching artifact from.
    pub fn fetched_from(&self, task_ids: &[String]) -> Result<BTreeMap<String, Option<String>>> {
        let run = self.resolve_run()?;
        let path = self
            .task_dir()
            .join(run.to_string())
            .join(TASK_GROUP_INFORMATION);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let entries: Vec<Value> = serde_json::from_str(&raw)
            .with_context(|| format!("malformed task-group information {}", path.display()))?;

        let wanted: HashSet<&str> = task_ids.iter().map(String::as_str).collect();
        let mut mapping: BTreeMap<String, Option<String>> =
            task_ids.iter().map(|id| (id.clone(), None)).collect();
        for entry in &entries {
            let task = Task::from_entry(entry)?;
            if !wanted.contains(task.id.as_str()) {
                continue;
            }
            let Some(fetches) = task.fetches.as_deref() else {
                continue;
            };
            let fetches: Vec<Fetch> = serde_json::from_str(fetches)
                .with_context(|| format!("malformed MOZ_FETCHES on {}", task.id))?;
            if let Some(fetch) = fetches
                .into_iter()
                .find(|fetch| fetch.artifact.contains(self.artifact.as_str()))
            {
                mapping.insert(task.id.clone(), Some(fetch.task));
            }
            if mapping.values().all(Option::is_some) {
                break;
            }
        }
        Ok(mapping)
    }

    fn find_data_dir(&self, suite_dir: &Path) -> Result<Option<PathBuf>> {
        let exact = data_dir_name(&self.artifact);
        let mut fallback = None;
        for (name, path) in subdirectories(suite_dir)? {
            if name == DOWNLOADS_DIR {
                continue;
            }
            if name == exact {
                return Ok(Some(path));
            }
            if fallback.is_none() && name.contains(self.artifact.as_str()) {
                fallback = Some(path);
            }
        }
        Ok(fallback)
    }
}

#[derive(Debug, Deserialize)]
struct Fetch {
    artifact: String,
    task: String,
}

/// Data files for `artifact` in a run, keyed by suite. `None` picks the latest run.
pub fn get_task_data_paths(
    task_group_id: &str,
    output: &Path,
    artifact: &str,
    run: Option<u32>,
) -> Result<BTreeMap<String, Vec<PathBuf>>> {
    TaskDataQuery::new(output, task_group_id, artifact)
        .run(run)
        .paths()
}

/// Like [`get_task_data_paths`] with each file's parsed content.
pub fn get_task_data(
    task_group_id: &str,
    output: &Path,
    artifact: &str,
    run: Option<u32>,
) -> Result<BTreeMap<String, Vec<TaskDataRecord>>> {
    TaskDataQuery::new(output, task_group_id, artifact)
        .run(run)
        .load()
}

/// For each task id, the upstream task it fetched `artifact` from, if any.
pub fn match_fetched_tasks(
    output: &Path,
    task_group_id: &str,
    run: Option<u32>,
    task_ids: &[String],
    artifact: &str,
) -> Result<BTreeMap<String, Option<String>>> {
    TaskDataQuery::new(output, task_group_id, artifact)
        .run(run)
        .fetched_from(task_ids)
}

fn read_data(path: &Path) -> Result<TaskData> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("malformed JSON in {}", path.display()))?;
        Ok(TaskData::Json(value))
    } else {
        Ok(TaskData::Raw(bytes))
    }
}

fn subdirectories(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            found.push((name, entry.path()));
        }
    }
    found.sort();
    Ok(found)
}

fn suite_dirs(run_dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    subdirectories(run_dir)
}

/// Files under `dir` whose path relative to `root` mentions `artifact`.
fn collect_files(root: &Path, dir: &Path, artifact: &str, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, artifact, files)?;
            continue;
        }
        let relative = path.strip_prefix(root).unwrap_or(&path);
        if relative.to_string_lossy().contains(artifact) {
            files.push(path);
        }
    }
    Ok(())
}

/// Compare strings the way humans expect: digit runs compare by value.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = chunks(a);
    let mut right = chunks(b);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let order = match (is_digits(x), is_digits(y)) {
                    (true, true) => compare_numeric(x, y),
                    _ => x.cmp(y),
                };
                if order != Ordering::Equal {
                    return order;
                }
            }
        }
    }
}

fn is_digits(chunk: &str) -> bool {
    chunk.starts_with(|c: char| c.is_ascii_digit())
}

fn compare_numeric(x: &str, y: &str) -> Ordering {
    let x = x.trim_start_matches('0');
    let y = y.trim_start_matches('0');
    x.len().cmp(&y.len()).then_with(|| x.cmp(y))
}

/// Split into alternating runs of ASCII digits and everything else.
fn chunks(value: &str) -> impl Iterator<Item = &str> {
    let mut rest = value;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let digits = rest.starts_with(|c: char| c.is_ascii_digit());
        let end = rest
            .find(|c: char| c.is_ascii_digit() != digits)
            .unwrap_or(rest.len());
        let (chunk, tail) = rest.split_at(end);
        rest = tail;
        Some(chunk)
    })
}
