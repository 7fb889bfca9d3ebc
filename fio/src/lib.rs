use std::{fmt, process::Stdio, str::FromStr};

use common::{
    device::join_targets,
    util::{parse_data_size, require_root},
};
use eyre::{Context, Result, bail};
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{io::AsyncReadExt, process::Command, signal::ctrl_c, task::JoinHandle};
use tracing::{debug, warn};

pub mod report;

#[derive(Debug, Error)]
#[error("unknown workload {0:?}, expected read/write/randread/randwrite/rw")]
pub struct ParseWorkloadError(String);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workload {
    #[default]
    Read,
    Write,
    Randread,
    Randwrite,
    Rw,
}

impl Workload {
    pub fn as_str(&self) -> &'static str {
        match self {
            Workload::Read => "read",
            Workload::Write => "write",
            Workload::Randread => "randread",
            Workload::Randwrite => "randwrite",
            Workload::Rw => "rw",
        }
    }

    /// Whether fio will issue writes for this workload.
    pub fn writes(&self) -> bool {
        matches!(self, Workload::Write | Workload::Randwrite | Workload::Rw)
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Workload {
    type Err = ParseWorkloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Workload::Read),
            "write" => Ok(Workload::Write),
            "randread" => Ok(Workload::Randread),
            "randwrite" => Ok(Workload::Randwrite),
            "rw" => Ok(Workload::Rw),
            other => Err(ParseWorkloadError(other.to_owned())),
        }
    }
}

/// One fio invocation worth of parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Experiment {
    pub workload: Workload,
    pub jobs: usize,
    pub block_size: String,
    pub queue_depth: usize,
    pub direct: bool,
    /// Collect per-request latency figures. Costs a little CPU, so off by
    /// default.
    pub latency: bool,
    pub file_size: String,
    pub runtime_secs: u64,
    /// Passed through to fio verbatim, after everything else.
    pub extra_options: Vec<String>,
}

impl Default for Experiment {
    fn default() -> Self {
        Experiment {
            workload: Workload::Read,
            jobs: 1,
            block_size: "4M".to_owned(),
            queue_depth: 64,
            direct: true,
            latency: false,
            file_size: "100g".to_owned(),
            runtime_secs: 20,
            extra_options: Vec::new(),
        }
    }
}

fn int(item: bool) -> u8 {
    if item { 1 } else { 0 }
}

impl Experiment {
    /// Build the fio argument vector for `targets`. `raw` means raw block
    /// devices rather than files on mounted file systems.
    pub fn args(&self, targets: &[String], raw: bool) -> Result<Vec<String>> {
        if targets.is_empty() {
            bail!("no target devices selected");
        }
        if self.jobs == 0 {
            bail!("job count must be at least 1");
        }
        parse_data_size(&self.block_size).context("block size")?;
        parse_data_size(&self.file_size).context("file size")?;

        let mut args = vec![
            "--name=all_ssd".to_owned(),
            format!("--filename={}", join_targets(targets)),
            format!("--filesize={}", self.file_size),
            format!("--rw={}", self.workload),
            format!("--bs={}", self.block_size),
            "--group_reporting".to_owned(),
            "--time_based=1".to_owned(),
            format!("--runtime={}", self.runtime_secs),
            format!("--numjobs={}", self.jobs),
            "--overwrite=0".to_owned(),
        ];
        if raw && !self.workload.writes() {
            // keeps an open-for-write from ever touching the raw devices
            args.push("--readonly".to_owned());
        }
        if !self.latency {
            args.push("--gtod_reduce=1".to_owned());
        }
        args.push(format!("--direct={}", int(self.direct)));
        args.push("--ioengine=io_uring".to_owned());
        args.push("--registerfiles".to_owned());
        if raw {
            // pinned buffers need root, which raw mode already has
            args.push("--fixedbufs".to_owned());
        }
        args.push(format!("--iodepth={}", self.queue_depth));
        args.extend(self.extra_options.iter().cloned());
        Ok(args)
    }

    /// Run fio once against `targets` and return its captured report.
    pub async fn run(&self, program: &str, targets: &[String], raw: bool) -> Result<RunOutcome> {
        if raw {
            require_root("read raw block devices")?;
        }
        let args = self.args(targets, raw)?;
        debug!("{program} {}", args.join(" "));
        launch(program, &args).await
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    /// Combined stdout/stderr text of the benchmark process.
    pub report: String,
    /// The run was cut short by Ctrl-C; the report holds fio's partial
    /// figures.
    pub interrupted: bool,
}

fn drain(mut pipe: impl AsyncReadExt + Unpin + Send + 'static) -> JoinHandle<std::io::Result<Vec<u8>>> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).await?;
        Ok(buf)
    })
}

/// Spawn the benchmark process and wait for it. A Ctrl-C while it runs is
/// forwarded as SIGINT so fio still emits the report for the work done so
/// far.
pub async fn launch(program: &str, args: &[String]) -> Result<RunOutcome> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context(format!("spawn {program}"))?;

    let pid = child.id().map(|id| Pid::from_raw(id as i32));
    let stdout = drain(child.stdout.take().expect("stdout is piped"));
    let stderr = drain(child.stderr.take().expect("stderr is piped"));

    let mut interrupted = false;
    let status = tokio::select! {
        status = child.wait() => Some(status?),
        _ = ctrl_c() => {
            interrupted = true;
            warn!("interrupt received, {program} will be stopped");
            if let Some(pid) = pid {
                kill(pid, Signal::SIGINT).context("forward SIGINT")?;
            }
            None
        }
    };
    let status = match status {
        Some(status) => status,
        None => child.wait().await?,
    };

    let mut report = String::from_utf8_lossy(&stdout.await??).into_owned();
    let err_text = String::from_utf8_lossy(&stderr.await??).into_owned();
    if !err_text.is_empty() {
        if !report.is_empty() && !report.ends_with('\n') {
            report.push('\n');
        }
        report.push_str(&err_text);
    }

    if !status.success() && !interrupted {
        let tail = report
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        bail!("{program} exited with {status}:\n{tail}");
    }
    Ok(RunOutcome {
        report,
        interrupted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets() -> Vec<String> {
        vec!["/mnt/ssd0/fio".to_owned(), "/mnt/ssd1/fio".to_owned()]
    }

    #[test]
    fn default_read_on_raw_devices() {
        let args = Experiment::default().args(&targets(), true).unwrap();
        assert_eq!(args[0], "--name=all_ssd");
        assert_eq!(args[1], "--filename=/mnt/ssd0/fio:/mnt/ssd1/fio");
        assert!(args.contains(&"--rw=read".to_owned()));
        assert!(args.contains(&"--readonly".to_owned()));
        assert!(args.contains(&"--gtod_reduce=1".to_owned()));
        assert!(args.contains(&"--direct=1".to_owned()));
        assert!(args.contains(&"--ioengine=io_uring".to_owned()));
        assert!(args.contains(&"--fixedbufs".to_owned()));
        assert!(args.contains(&"--iodepth=64".to_owned()));
        assert!(args.contains(&"--runtime=20".to_owned()));
    }

    #[test]
    fn write_workloads_are_never_readonly() {
        for workload in [Workload::Write, Workload::Randwrite, Workload::Rw] {
            let experiment = Experiment {
                workload,
                ..Default::default()
            };
            let args = experiment.args(&targets(), true).unwrap();
            assert!(!args.contains(&"--readonly".to_owned()), "{workload}");
        }
    }

    #[test]
    fn file_system_mode_skips_raw_only_flags() {
        let args = Experiment::default().args(&targets(), false).unwrap();
        assert!(!args.contains(&"--readonly".to_owned()));
        assert!(!args.contains(&"--fixedbufs".to_owned()));
        assert!(args.contains(&"--registerfiles".to_owned()));
    }

    #[test]
    fn latency_disables_gtod_reduce() {
        let experiment = Experiment {
            latency: true,
            ..Default::default()
        };
        let args = experiment.args(&targets(), false).unwrap();
        assert!(!args.contains(&"--gtod_reduce=1".to_owned()));
    }

    #[test]
    fn buffered_io_is_explicit() {
        let experiment = Experiment {
            direct: false,
            ..Default::default()
        };
        let args = experiment.args(&targets(), false).unwrap();
        assert!(args.contains(&"--direct=0".to_owned()));
    }

    #[test]
    fn extra_options_come_last() {
        let experiment = Experiment {
            extra_options: vec!["--unit_base=0".to_owned()],
            ..Default::default()
        };
        let args = experiment.args(&targets(), false).unwrap();
        assert_eq!(args.last().unwrap(), "--unit_base=0");
    }

    #[test]
    fn rejects_bad_parameters() {
        let experiment = Experiment {
            block_size: "huge".to_owned(),
            ..Default::default()
        };
        assert!(experiment.args(&targets(), false).is_err());
        assert!(Experiment::default().args(&[], false).is_err());
        let experiment = Experiment {
            jobs: 0,
            ..Default::default()
        };
        assert!(experiment.args(&targets(), false).is_err());
    }

    #[test]
    fn workload_round_trips() {
        for name in ["read", "write", "randread", "randwrite", "rw"] {
            assert_eq!(Workload::from_str(name).unwrap().as_str(), name);
        }
        assert!(Workload::from_str("readwrite").is_err());
    }

    #[tokio::test]
    async fn launch_captures_output() {
        let outcome = Experiment::default()
            .run("echo", &targets(), false)
            .await
            .unwrap();
        assert!(!outcome.interrupted);
        assert!(outcome.report.contains("--rw=read"));
        assert!(
            outcome
                .report
                .contains("--filename=/mnt/ssd0/fio:/mnt/ssd1/fio")
        );
    }

    #[tokio::test]
    async fn launch_surfaces_failures() {
        let err = launch("false", &[]).await.unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }
}
