use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser};
use perftest_tools::TaskDataQuery;
use perftest_tools::config::{DownloaderSettings, default_config_path};
use perftest_tools::logging::{current_trace_file, init_tracing};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(
    name = "task-data",
    version,
    about = "Print the organized data of a downloaded task group run as JSON",
    long_about = None
)]
struct Args {
    #[arg(long)]
    task_group_id: String,

    /// Artifact pattern used when the data was downloaded.
    #[arg(long)]
    artifact: String,

    /// Directory the downloader wrote into.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Run number to read; defaults to the latest populated run.
    #[arg(long)]
    run: Option<u32>,

    /// Only include suites containing this substring.
    #[arg(long)]
    suite: Option<String>,

    /// Include parsed file contents instead of paths only.
    #[arg(long, action = ArgAction::SetTrue)]
    with_data: bool,

    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = match args.config.clone() {
        Some(path) => path,
        None => default_config_path()?,
    };
    let settings = DownloaderSettings::load_or_default(&config_path)?;
    init_tracing("task-data", args.verbose, &settings.logging)?;
    if let Some(trace) = current_trace_file() {
        debug!(path = %trace.display(), "writing trace file");
    }

    let output = match args.output {
        Some(path) => path,
        None => settings.resolve_output()?,
    };
    let mut query = TaskDataQuery::new(output, args.task_group_id, args.artifact).run(args.run);
    if let Some(suite) = args.suite {
        query = query.suite_matcher(suite);
    }

    let rendered = if args.with_data {
        serde_json::to_string_pretty(&query.load()?)?
    } else {
        serde_json::to_string_pretty(&query.paths()?)?
    };
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_options() {
        let args = Args::parse_from([
            "task-data",
            "--task-group-id",
            "G1",
            "--artifact",
            "perfherder-data",
            "--run",
            "3",
            "--with-data",
        ]);
        assert_eq!(args.run, Some(3));
        assert!(args.with_data);
        assert!(args.suite.is_none());
    }
}
