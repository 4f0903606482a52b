use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ROOT_URL: &str = "https://firefox-ci-tc.services.mozilla.com/api/queue/v1/";
pub const DEFAULT_ARTIFACT: &str = "grcov";

/// Settings shared by every invocation, persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloaderSettings {
    /// Base URL of the queue API, including the version segment.
    #[serde(default = "default_root_url")]
    pub root_url: String,
    /// Page size requested from the task-group listing endpoint.
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Request timeout in seconds. Unset leaves the client default in place.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Keep archives in `downloads` after extracting them.
    #[serde(default = "bool_true")]
    pub keep_archives: bool,
    /// Output directory used when the request does not name one.
    #[serde(default)]
    pub default_output: Option<PathBuf>,
    #[serde(default)]
    pub logging: LogSettings,
}

fn default_root_url() -> String {
    DEFAULT_ROOT_URL.into()
}

fn default_page_limit() -> u32 {
    200
}

fn default_user_agent() -> String {
    format!("perftest-tools/{}", env!("CARGO_PKG_VERSION"))
}

fn bool_true() -> bool {
    true
}

impl Default for DownloaderSettings {
    fn default() -> Self {
        Self {
            root_url: default_root_url(),
            page_limit: default_page_limit(),
            user_agent: default_user_agent(),
            timeout_secs: None,
            keep_archives: true,
            default_output: None,
            logging: LogSettings::default(),
        }
    }
}

impl DownloaderSettings {
    /// Load settings from disk, writing defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Unable to read config at {}", path.display()))?;
            let parsed: Self = serde_json::from_str(&raw)
                .with_context(|| format!("Malformed config at {}", path.display()))?;
            Ok(parsed)
        } else {
            let settings = Self::default();
            settings.save(path)?;
            Ok(settings)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        let serialised = serde_json::to_string_pretty(self)?;
        fs::write(path, serialised)
            .with_context(|| format!("Failed to persist config to {}", path.display()))
    }

    /// Resolve the output directory for a request that left it unset.
    pub fn resolve_output(&self) -> Result<PathBuf> {
        if let Some(path) = &self.default_output {
            return Ok(path.clone());
        }
        std::env::current_dir().context("Unable to resolve current directory")
    }
}

/// Trace-file export for the tracing subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// Mirror log events as JSON lines into a trace file.
    #[serde(default)]
    pub trace_file: bool,
    /// Directory for trace files; defaults to the platform cache dir.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "LogSettings::default_max_files")]
    pub max_files: usize,
}

impl LogSettings {
    const fn default_max_files() -> usize {
        10
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            trace_file: false,
            directory: None,
            max_files: Self::default_max_files(),
        }
    }
}

/// One invocation of the artifact downloader.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub task_group_id: String,
    pub output: PathBuf,
    /// Suite substrings, or the single token `all`.
    pub suites: Vec<String>,
    /// Artifact-name substrings.
    pub artifacts: Vec<String>,
    /// Exact platform to keep. `None` keeps every platform.
    pub platform: Option<String>,
    pub include_failures: bool,
    pub unzip: bool,
    /// Reuse the newest run directory instead of allocating a new one.
    pub resume: bool,
}

impl DownloadRequest {
    pub fn new(task_group_id: impl Into<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            task_group_id: task_group_id.into(),
            output: output.into(),
            suites: vec!["all".into()],
            artifacts: vec![DEFAULT_ARTIFACT.into()],
            platform: None,
            include_failures: false,
            unzip: false,
            resume: false,
        }
    }
}

/// Snapshot of a request stored as `config.json` in its run directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub test_suites: Vec<String>,
    pub platform: Option<String>,
    pub artifact: Vec<String>,
    pub download_failures: bool,
    pub task_group_id: String,
    pub created_at: DateTime<Utc>,
}

impl RunConfig {
    pub fn from_request(request: &DownloadRequest) -> Self {
        Self {
            test_suites: request.suites.clone(),
            platform: request.platform.clone(),
            artifact: request.artifacts.clone(),
            download_failures: request.include_failures,
            task_group_id: request.task_group_id.clone(),
            created_at: Utc::now(),
        }
    }
}

pub(crate) fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("org", "mozilla", "perftest-tools")
        .context("Unable to resolve platform data directory")
}

/// Compute the default path to the settings file.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_config_is_written_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let settings = DownloaderSettings::load_or_default(&path).unwrap();
        assert!(path.exists());
        assert_eq!(settings.root_url, DEFAULT_ROOT_URL);
        assert_eq!(settings.page_limit, 200);
        assert!(settings.keep_archives);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"page_limit": 50, "keep_archives": false}"#).unwrap();
        let settings = DownloaderSettings::load_or_default(&path).unwrap();
        assert_eq!(settings.page_limit, 50);
        assert!(!settings.keep_archives);
        assert_eq!(settings.logging.max_files, 10);
        assert!(settings.user_agent.starts_with("perftest-tools/"));
    }

    #[test]
    fn request_defaults_to_all_suites_and_grcov() {
        let request = DownloadRequest::new("G1", "/tmp/out");
        assert_eq!(request.suites, vec!["all".to_string()]);
        assert_eq!(request.artifacts, vec![DEFAULT_ARTIFACT.to_string()]);
        assert!(!request.resume);
    }
}
