use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use eyre::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs::read_to_string;

// the run status aggregate; per-job figures are preceded by `, ` and must
// not match
static THROUGHPUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:^|[^,]) bw=([0-9.gmkib]+)/s \(([0-9.gmkib]+)/s\)").unwrap()
});
// total latency only; `slat`/`clat` lines have no space before `lat (`
static LATENCY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" lat \(([^)]+)\).*avg=([0-9.]+),").unwrap());
static CPU: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"cpu.*usr=([\d.]+)%.*sys=([\d.]+)%").unwrap());

/// Fields pulled out of one fio report group.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMetrics {
    /// Aggregate bandwidth in fio's SI rendering, e.g. `3071MB`.
    pub throughput: Option<String>,
    /// Mean total latency with its unit, e.g. `364.32usec`.
    pub latency: Option<String>,
    /// usr + sys CPU usage in percent, two decimals.
    pub cpu: Option<String>,
}

impl GroupMetrics {
    /// Present fields in table column order.
    pub fn values(&self) -> Vec<String> {
        [&self.throughput, &self.latency, &self.cpu]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

/// Scan report text line by line for the aggregate bandwidth, mean latency
/// and CPU usage figures. Later matches win, so text holding several groups
/// yields the last one. Lines that match nothing are skipped, never an
/// error.
pub fn parse_group(group: &str, measure_cpu: bool) -> GroupMetrics {
    let mut metrics = GroupMetrics::default();
    for line in group.lines() {
        if let Some(caps) = THROUGHPUT.captures(line) {
            metrics.throughput = Some(caps[2].to_owned());
        }
        if let Some(caps) = LATENCY.captures(line) {
            metrics.latency = Some(format!("{}{}", &caps[2], &caps[1]));
        }
        if measure_cpu
            && let Some(caps) = CPU.captures(line)
            && let (Ok(usr), Ok(sys)) = (caps[1].parse::<f64>(), caps[2].parse::<f64>())
        {
            metrics.cpu = Some(format!("{:.2}", usr + sys));
        }
    }
    metrics
}

/// Split captured output into report groups. fio closes each group's run
/// status with a `run=` line; trailing lines without one are dropped.
pub fn split_groups(text: &str) -> Vec<String> {
    let mut groups = Vec::new();
    let mut current = Vec::new();
    for line in text.lines() {
        current.push(line);
        if line.contains("run=") {
            groups.push(current.join("\n"));
            current.clear();
        }
    }
    groups
}

/// Parse every group in the captured output.
pub fn parse_report(text: &str, measure_cpu: bool) -> Vec<GroupMetrics> {
    split_groups(text)
        .iter()
        .map(|group| parse_group(group, measure_cpu))
        .collect()
}

/// Parse each result file and arrange the metrics as table rows: one row per
/// group position, one column set per file in argument order.
pub async fn convert_files(files: &[String], measure_cpu: bool) -> Result<Vec<Vec<GroupMetrics>>> {
    let mut rows: Vec<Vec<GroupMetrics>> = Vec::new();
    for file in files {
        let path = resolve(file)?;
        let text = read_to_string(&path)
            .await
            .context(format!("read {}", path.display()))?;
        for (idx, group) in split_groups(&text).iter().enumerate() {
            if rows.len() <= idx {
                rows.push(Vec::new());
            }
            rows[idx].push(parse_group(group, measure_cpu));
        }
    }
    Ok(rows)
}

// bare file names may refer to the results folder
fn resolve(file: &str) -> Result<PathBuf> {
    let direct = PathBuf::from(file);
    if direct.exists() {
        return Ok(direct);
    }
    let fallback = Path::new("results").join(file);
    if fallback.exists() {
        return Ok(fallback);
    }
    bail!("result file {file:?} not found (also tried {})", fallback.display());
}
