use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{Level, info};

use goodput_lab_abstract::{
    CongestionControl, EmulatorKind, ExperimentConfig, ExperimentOverride,
};
use goodput_lab_core::{ClientConfig, LoadClient};
use goodput_lab_emulation::TraceGenerator;
use goodput_lab_runner::{SweepReport, TrialOrchestrator, run_sweep};

#[derive(Parser, Debug)]
#[command(author, version, about = "TCP goodput under emulated network conditions")]
struct Cli {
    /// Log at DEBUG instead of INFO.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every trial of the parameter grid.
    Sweep(SweepArgs),
    /// Saturate a TCP connection to the measuring server. Runs until killed.
    Client(ClientArgs),
    /// Write a delivery trace pair for one bandwidth.
    Trace(TraceArgs),
}

#[derive(Args, Debug)]
struct SweepArgs {
    /// TOML file of experiment settings; flags given here take precedence.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Duration of each trial in seconds.
    #[arg(short, long)]
    time: Option<u64>,

    /// Uplink loss in percent (0-100). Repeat for a sweep.
    #[arg(short, long, value_parser = parse_loss_percent)]
    loss: Vec<f64>,

    /// Congestion control algorithm. Repeat for a sweep.
    #[arg(long)]
    cc: Vec<CongestionControl>,

    /// Round-trip time in ms. Repeat for a sweep.
    #[arg(long)]
    rtt: Vec<u64>,

    /// Link bandwidth in Mbps. Repeat for a sweep.
    #[arg(long)]
    bw: Vec<f64>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Bytes per send and per receive.
    #[arg(long)]
    size: Option<usize>,

    /// Uplink trace to use instead of generating one.
    #[arg(long, requires = "tracedown")]
    traceup: Option<PathBuf>,

    /// Downlink trace to use instead of generating one.
    #[arg(long, requires = "traceup")]
    tracedown: Option<PathBuf>,

    /// Do not open the emulator's live uplink graph.
    #[arg(long)]
    headless: bool,

    /// Append results to this CSV file.
    #[arg(short, long)]
    output_file: Option<PathBuf>,

    #[arg(long, value_parser = parse_emulator)]
    emulator: Option<EmulatorKind>,

    /// Directory for generated traces and emulator logs.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Write a JSON report of every trial, failed ones included.
    #[arg(long)]
    report_json: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ClientArgs {
    #[arg(long, default_value = "cubic")]
    cc: CongestionControl,

    #[arg(short, long, default_value_t = 5050)]
    port: u16,

    #[arg(long, default_value_t = 1024)]
    size: usize,

    /// Server address. Inside a mahimahi shell this is the host side of the link.
    #[arg(long, env = "MAHIMAHI_BASE", default_value = "127.0.0.1")]
    addr: IpAddr,
}

#[derive(Args, Debug)]
struct TraceArgs {
    /// Trace length in seconds.
    #[arg(short, long, default_value_t = 60)]
    time: u64,

    /// Target bandwidth in Mbps.
    #[arg(long)]
    bw: f64,

    #[arg(long, default_value = ".")]
    dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Sweep(args) => sweep(args).await,
        Command::Client(args) => client(args).await,
        Command::Trace(args) => trace(args),
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn sweep(args: SweepArgs) -> Result<()> {
    let report_path = args.report_json.clone();
    let config = args.into_config()?;
    config.validate().context("Invalid experiment configuration")?;
    fs::create_dir_all(&config.work_dir).with_context(|| {
        format!("Failed to create work directory {}", config.work_dir.display())
    })?;

    let client_program = std::env::current_exe().context("Cannot locate own executable")?;
    let orchestrator = TrialOrchestrator::new(&config, client_program);
    let report = run_sweep(&orchestrator, |record| println!("{record}"))
        .await
        .context("Sweep aborted")?;

    info!(
        "Sweep complete: {} trials, {} failed",
        report.trials.len(),
        report.failed()
    );
    if let Some(path) = &report_path {
        write_report(path, &report)?;
    }
    Ok(())
}

async fn client(args: ClientArgs) -> Result<()> {
    let client = LoadClient::new(ClientConfig {
        congestion_control: args.cc,
        packet_size: args.size,
        address: args.addr,
        port: args.port,
    });
    client.run().await.context("Client stopped")?;
    Ok(())
}

fn trace(args: TraceArgs) -> Result<()> {
    if !(args.bw.is_finite() && args.bw > 0.0) {
        bail!("--bw must be a positive number of Mbps, got {}", args.bw);
    }
    let pair = TraceGenerator::new(&args.dir).generate(args.time, args.bw)?;
    println!("{}", pair.uplink.display());
    println!("{}", pair.downlink.display());
    Ok(())
}

impl SweepArgs {
    /// Defaults, then the TOML file, then flags.
    fn into_config(self) -> Result<ExperimentConfig> {
        let mut config = ExperimentConfig::default();
        if let Some(path) = &self.config {
            ExperimentOverride::load(path)?.apply_to(&mut config);
        }
        self.into_override().apply_to(&mut config);
        Ok(config)
    }

    fn into_override(self) -> ExperimentOverride {
        ExperimentOverride {
            duration_secs: self.time,
            loss_rates: (!self.loss.is_empty()).then_some(self.loss),
            congestion_controls: (!self.cc.is_empty()).then_some(self.cc),
            rtts_ms: (!self.rtt.is_empty()).then_some(self.rtt),
            bandwidths_mbps: (!self.bw.is_empty()).then_some(self.bw),
            packet_size: self.size,
            port: self.port,
            trace_uplink: self.traceup,
            trace_downlink: self.tracedown,
            headless: self.headless.then_some(true),
            output_file: self.output_file,
            work_dir: self.work_dir,
            emulator: self.emulator,
            ..Default::default()
        }
    }
}

/// Loss on the command line is a percentage; the experiment works in fractions.
fn parse_loss_percent(raw: &str) -> Result<f64, String> {
    let percent: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("'{raw}' is not a number"))?;
    if !(0.0..=100.0).contains(&percent) {
        return Err(format!("loss must be between 0 and 100 percent, got {percent}"));
    }
    Ok(percent / 100.0)
}

fn parse_emulator(raw: &str) -> Result<EmulatorKind, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "mahimahi" => Ok(EmulatorKind::Mahimahi),
        "loopback" => Ok(EmulatorKind::Loopback),
        other => Err(format!("unknown emulator '{other}' (expected mahimahi or loopback)")),
    }
}

fn write_report(path: &Path, report: &SweepReport) -> Result<()> {
    let data = serde_json::to_vec_pretty(report).context("Failed to serialize sweep report")?;
    fs::write(path, &data)
        .with_context(|| format!("Failed to write report file {}", path.display()))?;
    Ok(())
}
