use std::{fmt, path::PathBuf};

use chrono::Local;
use clap::ValueEnum;
use common::config::Catalog;
use console::style;
use eyre::{Context, Result};
use fio::{Experiment, Workload, report::GroupMetrics};
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::fs::{create_dir_all, read_to_string, write};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Preset {
    /// Block size x job count grid with latency figures
    #[default]
    BlockSize,
    /// How many jobs it takes to saturate 4k random reads
    Max4kRead,
    /// Large buffered reads over a job count ladder
    NoDirect,
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_possible_value()
            .expect("no skipped variants")
            .get_name()
            .fmt(f)
    }
}

/// One parameter sweep: every job count is run against every block size.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepSpec {
    pub name: String,
    pub workload: Workload,
    pub job_counts: Vec<usize>,
    pub block_sizes: Vec<String>,
    pub num_ssds: usize,
    pub round_robin: bool,
    pub file_system: bool,
    pub direct: bool,
    pub latency: bool,
    pub queue_depth: usize,
    pub file_size: String,
    pub runtime_secs: u64,
}

impl Default for SweepSpec {
    fn default() -> Self {
        Preset::BlockSize.spec()
    }
}

impl Preset {
    pub fn spec(self) -> SweepSpec {
        match self {
            Preset::BlockSize => SweepSpec {
                name: "ssd_block_size".to_owned(),
                workload: Workload::Read,
                job_counts: vec![2, 4, 8, 16],
                block_sizes: ["16k", "64k", "256k", "1m", "4m", "16m"]
                    .map(str::to_owned)
                    .to_vec(),
                num_ssds: 28,
                round_robin: true,
                file_system: false,
                direct: true,
                latency: true,
                queue_depth: 64,
                file_size: "100g".to_owned(),
                runtime_secs: 20,
            },
            Preset::Max4kRead => SweepSpec {
                name: "ssd_4k_read".to_owned(),
                job_counts: vec![32, 40, 50, 64, 80, 96],
                block_sizes: vec!["4k".to_owned()],
                latency: false,
                ..Preset::BlockSize.spec()
            },
            Preset::NoDirect => SweepSpec {
                name: "ssd_no_direct".to_owned(),
                job_counts: vec![4, 8, 16, 32, 64],
                block_sizes: vec!["4m".to_owned()],
                direct: false,
                latency: false,
                ..Preset::BlockSize.spec()
            },
        }
    }
}

pub async fn load_spec(config_file: Option<&str>, preset: Preset) -> Result<SweepSpec> {
    match config_file {
        Some(path) => {
            let text = read_to_string(path)
                .await
                .context(format!("read sweep spec {path}"))?;
            Ok(serde_yml::from_str(&text)?)
        }
        None => Ok(preset.spec()),
    }
}

#[derive(Debug, Serialize)]
struct RunInfo {
    jobs: usize,
    block_size: String,
    metrics: GroupMetrics,
}

#[derive(Debug, Serialize)]
struct SweepInfo {
    started: String,
    interrupted: bool,
    spec: SweepSpec,
    runs: Vec<RunInfo>,
}

/// Drive the sweep: run fio for every combination, parse each report, and
/// write the summary table followed by the raw reports.
pub async fn run_sweep(
    catalog: &Catalog,
    spec: SweepSpec,
    out: Option<String>,
    no_progress: bool,
) -> Result<()> {
    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let results_path = PathBuf::from("results").join(format!("{}-{stamp}", spec.name));
    create_dir_all(&results_path).await?;
    println!(
        "Results created in folder: {}",
        style(results_path.display()).bold()
    );

    let total = (spec.job_counts.len() * spec.block_sizes.len()) as u64;
    let progress = if no_progress {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(total)
    };
    progress.set_style(ProgressStyle::with_template(
        "{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}",
    )?);

    let mut summaries: Vec<String> = Vec::new();
    let mut raw_reports: Vec<String> = Vec::new();
    let mut runs = Vec::new();
    let mut interrupted = false;

    'sweep: for &jobs in &spec.job_counts {
        summaries.push(format!("j={jobs}"));
        for size in &spec.block_sizes {
            progress.set_message(format!("j={jobs} bs={size}"));
            let targets = crate::select_targets(
                catalog,
                spec.file_system,
                Some(spec.num_ssds),
                spec.round_robin,
                &[],
            )?;
            let experiment = Experiment {
                workload: spec.workload,
                jobs,
                block_size: size.clone(),
                queue_depth: spec.queue_depth,
                direct: spec.direct,
                latency: spec.latency,
                file_size: spec.file_size.clone(),
                runtime_secs: spec.runtime_secs,
                extra_options: Vec::new(),
            };
            let outcome = experiment
                .run(&catalog.program, &targets, !spec.file_system)
                .await?;
            let metrics = fio::report::parse_group(&outcome.report, true);
            summaries.push(summary_line(size, &metrics));
            raw_reports.push(outcome.report);
            runs.push(RunInfo {
                jobs,
                block_size: size.clone(),
                metrics,
            });
            progress.inc(1);

            if outcome.interrupted {
                warn!("sweep interrupted, writing partial results");
                interrupted = true;
                break 'sweep;
            }
        }
        summaries.push(String::new());
    }
    progress.finish_and_clear();
    debug!("{} of {total} runs finished", runs.len());

    let out_path = out
        .map(PathBuf::from)
        .unwrap_or_else(|| results_path.join("summary.txt"));
    let mut body = summaries.join("\n");
    body.push_str("\n\n");
    body.push_str(&raw_reports.join("\n"));
    write(&out_path, body)
        .await
        .context(format!("write summary {}", out_path.display()))?;

    let info = SweepInfo {
        started: stamp,
        interrupted,
        spec,
        runs,
    };
    write(
        results_path.join("info.json"),
        serde_json::to_string_pretty(&info)?,
    )
    .await?;
    println!("Summary written to {}", style(out_path.display()).bold());
    Ok(())
}

fn summary_line(block_size: &str, metrics: &GroupMetrics) -> String {
    std::iter::once(block_size.to_owned())
        .chain(metrics.values())
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_match_the_shipped_sweeps() {
        let spec = Preset::BlockSize.spec();
        assert_eq!(spec.job_counts, vec![2, 4, 8, 16]);
        assert_eq!(spec.block_sizes.len(), 6);
        assert!(spec.latency && spec.direct && spec.round_robin);
        assert_eq!(spec.num_ssds, 28);

        let spec = Preset::Max4kRead.spec();
        assert_eq!(spec.block_sizes, vec!["4k"]);
        assert!(!spec.latency && spec.direct);

        let spec = Preset::NoDirect.spec();
        assert_eq!(spec.block_sizes, vec!["4m"]);
        assert!(!spec.direct);
    }

    #[test]
    fn summary_lines_hold_present_fields_only() {
        let metrics = GroupMetrics {
            throughput: Some("3071MB".to_owned()),
            latency: Some("25.61usec".to_owned()),
            cpu: Some("14.21".to_owned()),
        };
        assert_eq!(summary_line("16k", &metrics), "16k,3071MB,25.61usec,14.21");

        let metrics = GroupMetrics {
            throughput: Some("3071MB".to_owned()),
            latency: None,
            cpu: None,
        };
        assert_eq!(summary_line("4m", &metrics), "4m,3071MB");
    }

    #[test]
    fn sweep_spec_from_partial_yaml() {
        let spec: SweepSpec =
            serde_yml::from_str("name: quick\njob_counts: [1]\nblock_sizes: [\"4m\"]\nruntime_secs: 5\n")
                .unwrap();
        assert_eq!(spec.name, "quick");
        assert_eq!(spec.job_counts, vec![1]);
        assert_eq!(spec.runtime_secs, 5);
        // unset fields fall back to the block size preset
        assert_eq!(spec.num_ssds, 28);
        assert!(spec.round_robin);
    }
}
