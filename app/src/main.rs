use std::str::FromStr;

use clap::{Args, Parser, Subcommand};
use common::{config::Catalog, device};
use eyre::{Context, Result, bail};
use fio::{Experiment, Workload, report};
use itertools::Itertools;
use tokio::fs::read_to_string;
use tracing::error;
use tracing_subscriber::{
    EnvFilter,
    fmt::{layer, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod sweep;

#[derive(Parser)]
#[command(name = "baldr-bench", about = "fio sweep harness for multi-SSD machines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(long, default_value_t = false)]
    no_progress: bool,
    /// Extra log filter directives
    #[arg(short, long)]
    log: Vec<String>,
    /// Device catalog override (YAML)
    #[arg(short, long)]
    catalog: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a balanced device index assignment across root complexes
    Assign { count: usize },
    /// Run a single fio experiment and print the raw report
    Run(RunArgs),
    /// Run a parameter sweep and tabulate the parsed results
    Sweep {
        /// Sweep spec override (YAML)
        #[arg(short = 'f', long)]
        config_file: Option<String>,
        #[arg(short, long, value_enum, default_value_t = sweep::Preset::BlockSize)]
        preset: sweep::Preset,
        /// Summary file override; defaults into the results folder
        #[arg(short, long)]
        out: Option<String>,
    },
    /// Extract throughput/latency/CPU fields into a comparison table
    Convert {
        /// Also tabulate CPU usage
        #[arg(long, default_value_t = false)]
        cpu: bool,
        #[arg(required = true)]
        files: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// fio workload (read/write/randread/randwrite/rw)
    #[arg(long, default_value = "read")]
    rw: String,
    /// Number of jobs. Should not affect the result as long as the block
    /// size is large
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,
    #[arg(short, long, default_value = "4M")]
    block_size: String,
    /// Number of SSDs to test; use -s to pick specific devices instead
    #[arg(short, long)]
    num_ssds: Option<usize>,
    /// With -n, assign SSDs round robin so no single root complex is
    /// saturated when the count is small
    #[arg(short, long, default_value_t = false)]
    round_robin: bool,
    /// Device numbers, single indices or inclusive ranges like 7-10
    #[arg(short, long, num_args = 1..)]
    ssd: Vec<String>,
    /// Use mounted SSDs via the file system instead of raw block devices
    #[arg(long, visible_alias = "fs", default_value_t = false)]
    file_system: bool,
    /// Measure request latency; slightly increases CPU overhead
    #[arg(long, default_value_t = false)]
    latency: bool,
    #[arg(long, default_value = "100g")]
    file_size: String,
    /// Use buffered I/O instead of O_DIRECT
    #[arg(long, default_value_t = false)]
    no_direct: bool,
    /// io_uring queue depth
    #[arg(long, default_value_t = 64)]
    depth: usize,
    /// Runtime in seconds
    #[arg(long, default_value_t = 20)]
    runtime: u64,
    /// Do not echo the fio command line
    #[arg(long, default_value_t = false)]
    silent: bool,
    /// Extra fio options, passed through verbatim
    #[arg(last = true)]
    extra: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or("warn".to_owned());
    let args = Cli::parse();
    let file_appender = tracing_appender::rolling::never(".", "log.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let mut env_filter = EnvFilter::new(format!("baldr_bench={log_level}"));
    for module in ["common", "fio"] {
        if !args.log.iter().any(|x| x.starts_with(module)) {
            env_filter = env_filter.add_directive(format!("{module}={log_level}").parse()?);
        }
    }
    for log in &args.log {
        env_filter = env_filter.add_directive(log.parse()?);
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            layer()
                .with_timer(ChronoLocal::new("%v %k:%M:%S %z".to_owned()))
                .compact(),
        )
        .with(layer().with_writer(non_blocking))
        .init();

    let catalog = load_catalog(args.catalog.as_deref()).await?;

    match args.command {
        Commands::Assign { count } => {
            let indices = device::assignment(
                catalog.raw_devices.len(),
                &catalog.root_complex_sizes,
                count,
                &mut rand::rng(),
            )?;
            println!("{}", indices.iter().join(","));
        }
        Commands::Run(run) => run_experiment(&catalog, run).await?,
        Commands::Sweep {
            config_file,
            preset,
            out,
        } => {
            let spec = sweep::load_spec(config_file.as_deref(), preset).await?;
            if let Err(err) = sweep::run_sweep(&catalog, spec, out, args.no_progress).await {
                error!("{err:#?}");
                return Err(err);
            }
        }
        Commands::Convert { cpu, files } => convert(&files, cpu).await?,
    }
    Ok(())
}

async fn load_catalog(path: Option<&str>) -> Result<Catalog> {
    match path {
        Some(path) => {
            let text = read_to_string(path)
                .await
                .context(format!("read catalog {path}"))?;
            Ok(serde_yml::from_str(&text)?)
        }
        None => Ok(Catalog::default()),
    }
}

/// Resolve the target list for one experiment: a device count (optionally
/// spread round robin over the root complexes) or explicit device numbers.
fn select_targets(
    catalog: &Catalog,
    file_system: bool,
    num_ssds: Option<usize>,
    round_robin: bool,
    ssd: &[String],
) -> Result<Vec<String>> {
    let names = catalog.targets(file_system);
    if let Some(count) = num_ssds {
        if round_robin {
            Ok(device::round_robin(
                names,
                &catalog.root_complex_sizes,
                count,
                &mut rand::rng(),
            )?)
        } else {
            Ok(device::first_n(names, count)?)
        }
    } else if !ssd.is_empty() {
        Ok(device::by_spec(names, ssd)?)
    } else {
        bail!("specify either a device count (-n) or explicit device numbers (-s)");
    }
}

async fn run_experiment(catalog: &Catalog, args: RunArgs) -> Result<()> {
    let targets = select_targets(
        catalog,
        args.file_system,
        args.num_ssds,
        args.round_robin,
        &args.ssd,
    )?;
    let experiment = Experiment {
        workload: Workload::from_str(&args.rw)?,
        jobs: args.jobs,
        block_size: args.block_size,
        queue_depth: args.depth,
        direct: !args.no_direct,
        latency: args.latency,
        file_size: args.file_size,
        runtime_secs: args.runtime,
        extra_options: args.extra,
    };

    let raw = !args.file_system;
    if !args.silent {
        println!(
            "fio command: {} {}",
            catalog.program,
            experiment.args(&targets, raw)?.join(" ")
        );
    }
    let outcome = experiment.run(&catalog.program, &targets, raw).await?;
    println!("{}", outcome.report);
    Ok(())
}

async fn convert(files: &[String], cpu: bool) -> Result<()> {
    let rows = report::convert_files(files, cpu).await?;
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(std::io::stdout());
    for (idx, row) in rows.iter().enumerate() {
        let mut record = vec![(idx + 1).to_string()];
        for metrics in row {
            record.extend(metrics.values());
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
