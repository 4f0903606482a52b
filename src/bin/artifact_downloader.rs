use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser};
use perftest_tools::ArtifactDownloader;
use perftest_tools::config::{
    DEFAULT_ARTIFACT, DownloadRequest, DownloaderSettings, default_config_path,
};
use perftest_tools::logging::{current_trace_file, init_tracing};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "artifact-downloader",
    version,
    about = "Download, extract and organize artifacts from a group of Taskcluster tasks",
    long_about = None
)]
struct Args {
    /// Task group whose tasks should be searched for artifacts.
    #[arg(long)]
    task_group_id: String,

    /// Suites to look at (substring match). `all` processes every suite.
    #[arg(long, num_args = 1.., default_value = "all")]
    test_suites_list: Vec<String>,

    /// Pattern matcher for the artifacts to download.
    #[arg(long, num_args = 1.., default_value = DEFAULT_ARTIFACT)]
    artifact_to_get: Vec<String>,

    /// Extract downloaded archives.
    #[arg(long, action = ArgAction::SetTrue)]
    unzip_artifact: bool,

    /// Exact platform to obtain data from, e.g. `test-linux1804-64-shippable-qr/opt`.
    #[arg(long)]
    platform: Option<String>,

    /// Download data from failed tasks too.
    #[arg(long, action = ArgAction::SetTrue)]
    download_failures: bool,

    /// Continue the latest run instead of starting a new one.
    #[arg(long, action = ArgAction::SetTrue)]
    ingest_continue: bool,

    /// Directory where downloaded and organized data will reside.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Override the default settings path.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase logging verbosity.
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

impl Args {
    fn into_request(self, settings: &DownloaderSettings) -> Result<DownloadRequest> {
        let output = match self.output {
            Some(path) => path,
            None => settings.resolve_output()?,
        };
        Ok(DownloadRequest {
            suites: self.test_suites_list,
            artifacts: self.artifact_to_get,
            platform: self.platform,
            include_failures: self.download_failures,
            unzip: self.unzip_artifact,
            resume: self.ingest_continue,
            ..DownloadRequest::new(self.task_group_id, output)
        })
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match args.config.clone() {
        Some(path) => path,
        None => default_config_path()?,
    };
    let settings = DownloaderSettings::load_or_default(&config_path)?;
    init_tracing("artifact-downloader", args.verbose, &settings.logging)?;
    info!(path = %config_path.display(), "using settings");
    if let Some(trace) = current_trace_file() {
        info!(path = %trace.display(), "writing trace file");
    }

    let request = args.into_request(&settings)?;
    let downloader = ArtifactDownloader::from_settings(settings)?;
    let outcome = downloader.run(&request)?;

    println!(
        "Stats: {} PASSED, {} FAILED, {} TOTAL",
        outcome.passed,
        outcome.failed_tasks.len(),
        outcome.total
    );
    if !outcome.failed_tasks.is_empty() {
        println!(
            "Tasks that failed to have their artifact downloaded:\n\t{}",
            outcome.failed_tasks.join("\n\t")
        );
    }
    if !outcome.partial_tasks.is_empty() {
        println!(
            "Tasks missing some of their artifacts:\n\t{}",
            outcome.partial_tasks.join("\n\t")
        );
    }
    println!("{}", outcome.run_dir.display());
    Ok(())
}
