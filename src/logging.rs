use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt};

use crate::config::{LogSettings, project_dirs};

const TRACE_SUFFIX: &str = ".trace.jsonl";
const CRATE_TARGETS: [&str; 3] = ["perftest_tools", "artifact_downloader", "task_data"];

/// Set once the subscriber is installed; holds the trace file path, if any.
static INSTALLED: OnceCell<Option<PathBuf>> = OnceCell::new();
static TRACE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

struct TraceFile {
    path: PathBuf,
    writer: NonBlocking,
    guard: WorkerGuard,
}

/// Install the global subscriber: human output on stderr, plus JSON lines
/// into a trace file when `settings.trace_file` is on. Later calls are no-ops.
pub fn init_tracing(service: &str, verbose: bool, settings: &LogSettings) -> Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    let level = if verbose { "debug" } else { "info" };
    let directives = CRATE_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",");
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&directives))
        .context("invalid log filter")?;

    let trace = if settings.trace_file {
        Some(open_trace(service, settings)?)
    } else {
        None
    };
    let trace_path = trace.as_ref().map(|trace| trace.path.clone());
    let json_layer = trace.map(|TraceFile { writer, guard, .. }| {
        let _ = TRACE_GUARD.set(guard);
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(writer)
            .with_filter(LevelFilter::DEBUG)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(json_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;
    let _ = INSTALLED.set(trace_path);
    Ok(())
}

/// Trace file written by the current process, if any.
pub fn current_trace_file() -> Option<&'static Path> {
    INSTALLED.get().and_then(|path| path.as_deref())
}

fn open_trace(service: &str, settings: &LogSettings) -> Result<TraceFile> {
    let directory = match &settings.directory {
        Some(dir) => dir.clone(),
        None => project_dirs()?.cache_dir().join("traces"),
    };
    fs::create_dir_all(&directory)
        .with_context(|| format!("failed to create trace directory {}", directory.display()))?;

    let path = next_trace_path(service, &directory)?;
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("failed to open trace file {}", path.display()))?;
    if settings.max_files > 0 {
        prune_traces(&directory, settings.max_files - 1, &path)?;
    }

    let (writer, guard) = tracing_appender::non_blocking(file);
    Ok(TraceFile {
        path,
        writer,
        guard,
    })
}

/// `<service>-<timestamp>[-n].trace.jsonl`, skipping names already taken.
fn next_trace_path(service: &str, directory: &Path) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    (0u32..)
        .map(|attempt| match attempt {
            0 => directory.join(format!("{service}-{stamp}{TRACE_SUFFIX}")),
            n => directory.join(format!("{service}-{stamp}-{n}{TRACE_SUFFIX}")),
        })
        .find(|candidate| !candidate.exists())
        .context("no free trace file name")
}

/// Remove trace files beyond the `keep` newest, never touching `current`.
fn prune_traces(directory: &Path, keep: usize, current: &Path) -> Result<()> {
    let entries = fs::read_dir(directory)
        .with_context(|| format!("failed to read trace directory {}", directory.display()))?;
    let mut traces: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path != current && path.is_file())
        .filter(|path| path.to_string_lossy().ends_with(TRACE_SUFFIX))
        .filter_map(|path| {
            let modified = path.metadata().and_then(|meta| meta.modified()).ok()?;
            Some((modified, path))
        })
        .collect();

    traces.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, stale) in traces.into_iter().skip(keep) {
        let _ = fs::remove_file(stale);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn prune_keeps_newest_files() {
        let dir = tempdir().unwrap();
        for index in 0..4 {
            let path = dir.path().join(format!("svc-{index}{TRACE_SUFFIX}"));
            fs::write(&path, "{}").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        let current = dir.path().join(format!("svc-current{TRACE_SUFFIX}"));
        fs::write(&current, "{}").unwrap();
        fs::write(dir.path().join("unrelated.txt"), "x").unwrap();

        prune_traces(dir.path(), 2, &current).unwrap();

        let mut remaining: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec![
                format!("svc-2{TRACE_SUFFIX}"),
                format!("svc-3{TRACE_SUFFIX}"),
                format!("svc-current{TRACE_SUFFIX}"),
                "unrelated.txt".to_string(),
            ]
        );
    }

    #[test]
    fn trace_names_skip_taken_paths() {
        let dir = tempdir().unwrap();
        let first = next_trace_path("svc", dir.path()).unwrap();
        fs::write(&first, "").unwrap();
        let second = next_trace_path("svc", dir.path()).unwrap();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with(TRACE_SUFFIX));
    }
}
