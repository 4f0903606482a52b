use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::DownloaderSettings;
use crate::error::{PipelineError, pipeline_error};

/// Transport used to talk to the queue service.
pub trait QueueHttp {
    fn get_json(&self, url: &str) -> Result<Value>;
    /// Stream the body at `url` into `dest`, returning the number of bytes written.
    fn download(&self, url: &str, dest: &mut dyn Write) -> Result<u64>;
}

impl<T: QueueHttp> QueueHttp for &T {
    fn get_json(&self, url: &str) -> Result<Value> {
        (**self).get_json(url)
    }

    fn download(&self, url: &str, dest: &mut dyn Write) -> Result<u64> {
        (**self).download(url, dest)
    }
}

pub struct BlockingQueueHttp {
    client: Client,
}

impl BlockingQueueHttp {
    pub fn from_settings(settings: &DownloaderSettings) -> Result<Self> {
        let mut builder = Client::builder().user_agent(settings.user_agent.clone());
        if let Some(secs) = settings.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder.build().context("failed to build reqwest client")?;
        Ok(Self { client })
    }

    fn send(&self, url: &str) -> Result<reqwest::blocking::Response> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| PipelineError::TransientFetch {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(PipelineError::NotFound {
                url: url.to_string(),
            }
            .into());
        }
        if !status.is_success() {
            return Err(PipelineError::TransientFetch {
                url: url.to_string(),
                reason: format!("status {status}"),
            }
            .into());
        }
        Ok(response)
    }
}

impl QueueHttp for BlockingQueueHttp {
    fn get_json(&self, url: &str) -> Result<Value> {
        let response = self.send(url)?;
        response
            .json()
            .map_err(|err| PipelineError::TransientFetch {
                url: url.to_string(),
                reason: format!("non-JSON payload: {err}"),
            })
            .map_err(Into::into)
    }

    fn download(&self, url: &str, dest: &mut dyn Write) -> Result<u64> {
        let mut response = self.send(url)?;
        std::io::copy(&mut response, dest)
            .map_err(|err| PipelineError::TransientFetch {
                url: url.to_string(),
                reason: err.to_string(),
            })
            .map_err(Into::into)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Succeeded,
    Failed,
    Other,
}

impl TaskState {
    fn from_queue(state: &str) -> Self {
        match state {
            "completed" | "succeeded" => TaskState::Succeeded,
            "failed" => TaskState::Failed,
            _ => TaskState::Other,
        }
    }
}

/// One task of a task group, as seen by the downstream stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub suite: String,
    pub platform: String,
    pub state: TaskState,
    /// Artifact names; empty until [`TaskClusterClient::populate_artifacts`] runs.
    pub artifacts: Vec<String>,
    pub head_rev: Option<String>,
    pub fetches: Option<String>,
}

impl Task {
    pub(crate) fn from_entry(entry: &Value) -> Result<Self> {
        let parsed: TaskEntry =
            serde_json::from_value(entry.clone()).context("malformed task-group entry")?;
        let (platform, suite) = split_task_name(&parsed.task.metadata.name);
        let env = &parsed.task.payload.env;
        let env_str = |key: &str| env.get(key).and_then(Value::as_str).map(str::to_string);
        Ok(Self {
            id: parsed.status.task_id,
            state: TaskState::from_queue(&parsed.status.state),
            head_rev: env_str("GECKO_HEAD_REV"),
            fetches: env_str("MOZ_FETCHES"),
            name: parsed.task.metadata.name,
            suite,
            platform,
            artifacts: Vec::new(),
        })
    }
}

/// Split `<platform-prefix>/<build>-<suite>` into `(platform, suite)`.
///
/// `test-linux64/opt-browsertime-tp6-1` yields `("test-linux64/opt", "browsertime-tp6-1")`.
pub fn split_task_name(name: &str) -> (String, String) {
    let (head, tail) = match name.rfind('/') {
        Some(index) => name.split_at(index + 1),
        None => ("", name),
    };
    match tail.split_once('-') {
        Some((build, suite)) => (format!("{head}{build}"), suite.to_string()),
        None => (name.to_string(), tail.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct TaskEntry {
    status: StatusRecord,
    task: TaskDefinition,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusRecord {
    task_id: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct TaskDefinition {
    metadata: TaskMetadata,
    #[serde(default)]
    payload: TaskPayload,
}

#[derive(Debug, Deserialize)]
struct TaskMetadata {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct TaskPayload {
    #[serde(default)]
    env: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    #[serde(default)]
    tasks: Vec<Value>,
    #[serde(default)]
    artifacts: Vec<ArtifactEntry>,
    continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArtifactEntry {
    name: String,
}

/// Tasks of one group in the order the queue listed them.
#[derive(Debug, Clone)]
pub struct TaskGroup {
    pub tasks: Vec<Task>,
    /// Entries exactly as returned, persisted as `task-group-information.json`.
    pub raw: Vec<Value>,
}

/// Read-only client for the queue's task-group and artifact endpoints.
pub struct TaskClusterClient<H: QueueHttp> {
    http: H,
    root: Url,
    page_limit: u32,
}

impl<H: QueueHttp> TaskClusterClient<H> {
    pub fn new(http: H, root_url: &str, page_limit: u32) -> Result<Self> {
        let mut root = root_url.to_string();
        if !root.ends_with('/') {
            root.push('/');
        }
        let root = Url::parse(&root).with_context(|| format!("invalid queue root {root_url}"))?;
        Ok(Self {
            http,
            root,
            page_limit,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.root
            .join(path)
            .with_context(|| format!("invalid queue path {path}"))
    }

    fn page_url(&self, path: &str, token: Option<&str>) -> Result<String> {
        let mut url = self.endpoint(path)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &self.page_limit.to_string());
            if let Some(token) = token {
                query.append_pair("continuationToken", token);
            }
        }
        Ok(url.into())
    }

    /// Follow `continuationToken` until the listing at `path` is exhausted.
    fn paginate(&self, path: &str) -> Result<Vec<ListPage>> {
        let mut pages = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let url = self.page_url(path, token.as_deref())?;
            debug!(url = %url, "fetching listing page");
            let value = self.http.get_json(&url)?;
            let page: ListPage = serde_json::from_value(value)
                .with_context(|| format!("unexpected listing payload from {url}"))?;
            token = page.continuation_token.clone();
            pages.push(page);
            if token.is_none() {
                return Ok(pages);
            }
        }
    }

    pub fn list_task_group(&self, group_id: &str) -> Result<TaskGroup> {
        let pages = match self.paginate(&format!("task-group/{group_id}/list")) {
            Ok(pages) => pages,
            Err(err) => {
                if let Some(PipelineError::NotFound { .. }) = pipeline_error(&err) {
                    return Err(PipelineError::TaskGroupNotFound(group_id.to_string()).into());
                }
                return Err(err.context(format!("failed to list task group {group_id}")));
            }
        };

        let raw: Vec<Value> = pages.into_iter().flat_map(|page| page.tasks).collect();
        let tasks = raw.iter().map(Task::from_entry).collect::<Result<Vec<_>>>()?;
        Ok(TaskGroup {
            tasks,
            raw,
        })
    }

    pub fn list_artifacts(&self, task_id: &str) -> Result<Vec<String>> {
        let pages = self
            .paginate(&format!("task/{task_id}/artifacts"))
            .with_context(|| format!("failed to list artifacts of {task_id}"))?;
        Ok(pages
            .into_iter()
            .flat_map(|page| page.artifacts)
            .map(|artifact| artifact.name)
            .collect())
    }

    pub fn populate_artifacts(&self, task: &mut Task) -> Result<()> {
        task.artifacts = self.list_artifacts(&task.id)?;
        Ok(())
    }

    pub fn artifact_url(&self, task_id: &str, name: &str) -> Result<String> {
        Ok(self
            .endpoint(&format!("task/{task_id}/artifacts/{name}"))?
            .into())
    }

    /// Download an artifact to `dest` through a `.part` file renamed on success.
    pub fn fetch_artifact(&self, task_id: &str, name: &str, dest: &Path) -> Result<u64> {
        let url = self.artifact_url(task_id, name)?;
        let partial = partial_path(dest);
        let mut file = File::create(&partial)
            .with_context(|| format!("failed to create {}", partial.display()))?;
        let written = match self.http.download(&url, &mut file) {
            Ok(written) => written,
            Err(err) => {
                drop(file);
                let _ = fs::remove_file(&partial);
                return Err(err);
            }
        };
        file.flush()?;
        drop(file);
        fs::rename(&partial, dest)
            .with_context(|| format!("failed to finalize {}", dest.display()))?;
        Ok(written)
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[cfg(test)]
pub(crate) mod stub {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::io::Write;

    use anyhow::Result;
    use serde_json::{Value, json};

    use super::QueueHttp;
    use crate::error::PipelineError;

    pub(crate) const ROOT: &str = "https://queue.test/api/queue/v1/";

    /// In-memory queue keyed by full URL; unknown URLs answer 404.
    #[derive(Default)]
    pub(crate) struct StubQueueHttp {
        json: RefCell<HashMap<String, Value>>,
        bodies: RefCell<HashMap<String, Vec<u8>>>,
        failing: RefCell<Vec<String>>,
        calls: RefCell<Vec<String>>,
    }

    impl StubQueueHttp {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn json(&self, url: impl Into<String>, value: Value) {
            self.json.borrow_mut().insert(url.into(), value);
        }

        pub(crate) fn body(&self, url: impl Into<String>, bytes: impl Into<Vec<u8>>) {
            self.bodies.borrow_mut().insert(url.into(), bytes.into());
        }

        /// Make `url` fail with a transient error.
        pub(crate) fn fail(&self, url: impl Into<String>) {
            self.failing.borrow_mut().push(url.into());
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }

        /// Register a single-page group listing.
        pub(crate) fn group(&self, group_id: &str, tasks: Vec<Value>) {
            self.json(
                format!("{ROOT}task-group/{group_id}/list?limit=200"),
                json!({ "taskGroupId": group_id, "tasks": tasks }),
            );
        }

        /// Register a task's artifact listing and each artifact's body.
        pub(crate) fn artifacts(&self, task_id: &str, artifacts: &[(&str, &[u8])]) {
            let names: Vec<Value> = artifacts
                .iter()
                .map(|(name, _)| json!({ "name": name }))
                .collect();
            self.json(
                format!("{ROOT}task/{task_id}/artifacts?limit=200"),
                json!({ "artifacts": names }),
            );
            for (name, bytes) in artifacts {
                self.body(format!("{ROOT}task/{task_id}/artifacts/{name}"), bytes.to_vec());
            }
        }

        fn check(&self, url: &str) -> Result<()> {
            self.calls.borrow_mut().push(url.to_string());
            if self.failing.borrow().iter().any(|entry| entry == url) {
                return Err(PipelineError::TransientFetch {
                    url: url.to_string(),
                    reason: "stubbed failure".into(),
                }
                .into());
            }
            Ok(())
        }
    }

    impl QueueHttp for StubQueueHttp {
        fn get_json(&self, url: &str) -> Result<Value> {
            self.check(url)?;
            self.json.borrow().get(url).cloned().ok_or_else(|| {
                PipelineError::NotFound {
                    url: url.to_string(),
                }
                .into()
            })
        }

        fn download(&self, url: &str, dest: &mut dyn Write) -> Result<u64> {
            self.check(url)?;
            let bodies = self.bodies.borrow();
            let bytes = bodies.get(url).ok_or_else(|| PipelineError::NotFound {
                url: url.to_string(),
            })?;
            dest.write_all(bytes)?;
            Ok(bytes.len() as u64)
        }
    }

    /// A task-group entry shaped like the queue's listing output.
    pub(crate) fn task_entry(task_id: &str, name: &str, state: &str) -> Value {
        json!({
            "status": { "taskId": task_id, "state": state },
            "task": {
                "metadata": { "name": name },
                "payload": { "env": { "GECKO_HEAD_REV": "abc123" } }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::stub::{ROOT, StubQueueHttp, task_entry};
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn split_task_name_extracts_platform_and_suite() {
        assert_eq!(
            split_task_name("test-linux64/opt-browsertime-tp6-1"),
            ("test-linux64/opt".to_string(), "browsertime-tp6-1".to_string())
        );
        assert_eq!(
            split_task_name("linux/opt-raptor-tp6m-1"),
            ("linux/opt".to_string(), "raptor-tp6m-1".to_string())
        );
        assert_eq!(
            split_task_name("standalone"),
            ("standalone".to_string(), "standalone".to_string())
        );
    }

    #[test]
    fn listing_follows_continuation_tokens() {
        let stub = StubQueueHttp::new();
        stub.json(
            format!("{ROOT}task-group/G1/list?limit=200"),
            json!({
                "tasks": [task_entry("t1", "linux/opt-suite-a", "completed")],
                "continuationToken": "next page"
            }),
        );
        stub.json(
            format!("{ROOT}task-group/G1/list?limit=200&continuationToken=next+page"),
            json!({ "tasks": [task_entry("t2", "linux/opt-suite-b", "failed")] }),
        );
        let client = TaskClusterClient::new(&stub, ROOT, 200).unwrap();

        let group = client.list_task_group("G1").unwrap();
        let ids: Vec<&str> = group.tasks.iter().map(|task| task.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
        assert_eq!(group.raw.len(), 2);
        assert_eq!(group.tasks[0].state, TaskState::Succeeded);
        assert_eq!(group.tasks[1].state, TaskState::Failed);
        assert_eq!(group.tasks[0].head_rev.as_deref(), Some("abc123"));
    }

    #[test]
    fn unknown_group_is_not_found() {
        let stub = StubQueueHttp::new();
        let client = TaskClusterClient::new(&stub, ROOT, 200).unwrap();
        let err = client.list_task_group("missing").unwrap_err();
        assert!(matches!(
            pipeline_error(&err),
            Some(PipelineError::TaskGroupNotFound(id)) if id == "missing"
        ));
    }

    #[test]
    fn service_failure_is_transient() {
        let stub = StubQueueHttp::new();
        stub.group("G1", vec![]);
        stub.fail(format!("{ROOT}task-group/G1/list?limit=200"));
        let client = TaskClusterClient::new(&stub, ROOT, 200).unwrap();
        let err = client.list_task_group("G1").unwrap_err();
        assert!(pipeline_error(&err).is_some_and(PipelineError::is_transient));
    }

    #[test]
    fn fetch_artifact_writes_destination_and_no_partial() {
        let stub = StubQueueHttp::new();
        stub.artifacts("t1", &[("public/perfherder-data.json", b"{\"a\":1}")]);
        let client = TaskClusterClient::new(&stub, ROOT.trim_end_matches('/'), 200).unwrap();
        let dir = tempdir().unwrap();
        let dest = dir.path().join("t1_perfherder-data.json");

        let written = client
            .fetch_artifact("t1", "public/perfherder-data.json", &dest)
            .unwrap();

        assert_eq!(written, 7);
        assert_eq!(fs::read(&dest).unwrap(), b"{\"a\":1}");
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn failed_fetch_leaves_nothing_behind() {
        let stub = StubQueueHttp::new();
        let client = TaskClusterClient::new(&stub, ROOT, 200).unwrap();
        let dir = tempdir().unwrap();
        let dest = dir.path().join("t1_missing.json");

        assert!(client.fetch_artifact("t1", "public/missing.json", &dest).is_err());
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }
}
