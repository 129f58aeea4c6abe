//! The external link emulator that wraps the load client.

use crate::summary::{EmulatorSummary, parse_throughput_summary};
use crate::trace::TracePair;
use goodput_lab_abstract::{EmulatorKind, ExperimentConfig, TrialParameters};
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Smallest bottleneck queue handed to the emulator.
pub const MIN_QUEUE_BYTES: u64 = 30 * 1024;

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}")]
    Status { program: String, status: ExitStatus },
    #[error("could not find a throughput summary in the output of {0}")]
    Unparseable(String),
    #[error("failed to clear emulator log {path}: {source}")]
    ClearLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How the client process is started; the emulator runs it as its inner command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInvocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl fmt::Display for ClientInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Bottleneck queue size: one RTT worth of bandwidth, floored at 30 KiB.
pub fn bottleneck_queue_bytes(params: &TrialParameters) -> u64 {
    let bdp = params.round_trip_ms as f64 * params.bandwidth_bytes_per_sec() / 1000.0;
    (bdp as u64).max(MIN_QUEUE_BYTES)
}

/// A way of running the load client under controlled link conditions.
pub trait LinkEmulator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `command` consumes trace files.
    fn uses_traces(&self) -> bool;

    /// Builds the process that runs `client` under the emulated link.
    fn command(
        &self,
        params: &TrialParameters,
        traces: Option<&TracePair>,
        client: &ClientInvocation,
    ) -> Command;

    /// How long to let the process run before killing it, if the emulator does
    /// not bound the run itself.
    fn deadline(&self, params: &TrialParameters) -> Option<Duration>;

    /// Command whose output summarises the last run, if the emulator keeps logs.
    fn summary_command(&self) -> Option<Command>;

    /// Removes logs left by an earlier run so the summary only covers the next.
    fn clear_logs(&self) -> Result<(), EmulatorError> {
        Ok(())
    }
}

/// Runs a summary command and parses its report from stderr.
pub async fn collect_summary(mut command: Command) -> Result<EmulatorSummary, EmulatorError> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();
    let output = command
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| EmulatorError::Spawn {
            program: program.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(EmulatorError::Status {
            program,
            status: output.status,
        });
    }
    let report = String::from_utf8_lossy(&output.stderr);
    debug!("{} reported:\n{}", program, report);
    parse_throughput_summary(&report).ok_or(EmulatorError::Unparseable(program))
}

/// mahimahi: `mm-delay` → `mm-loss uplink` → `mm-link`, run once over the trace.
#[derive(Debug, Clone)]
pub struct Mahimahi {
    pub uplink_log: PathBuf,
    /// Skips `--meter-uplink`, which opens a live graph window.
    pub headless: bool,
}

impl LinkEmulator for Mahimahi {
    fn name(&self) -> &'static str {
        "mahimahi"
    }

    fn uses_traces(&self) -> bool {
        true
    }

    fn command(
        &self,
        params: &TrialParameters,
        traces: Option<&TracePair>,
        client: &ClientInvocation,
    ) -> Command {
        let mut cmd = Command::new("mm-delay");
        cmd.arg(params.one_way_delay_ms().to_string())
            .args(["mm-loss", "uplink"])
            .arg(params.loss_rate.to_string())
            .arg("mm-link");
        if let Some(traces) = traces {
            cmd.arg(&traces.uplink).arg(&traces.downlink);
        }

        let mut log_flag = OsString::from("--uplink-log=");
        log_flag.push(&self.uplink_log);
        cmd.arg(log_flag);
        if !self.headless {
            cmd.arg("--meter-uplink");
        }
        cmd.arg("--once")
            .arg("--uplink-queue=droptail")
            .arg(format!(
                "--uplink-queue-args=bytes={}",
                bottleneck_queue_bytes(params)
            ))
            .arg("--")
            .arg(&client.program)
            .args(&client.args)
            .kill_on_drop(true);
        cmd
    }

    fn deadline(&self, _params: &TrialParameters) -> Option<Duration> {
        // `--once` ends the shell when the trace runs out.
        None
    }

    fn summary_command(&self) -> Option<Command> {
        let mut cmd = Command::new("mm-throughput-graph");
        cmd.arg("10").arg(&self.uplink_log);
        Some(cmd)
    }

    fn clear_logs(&self) -> Result<(), EmulatorError> {
        match std::fs::remove_file(&self.uplink_log) {
            Ok(()) => {
                debug!("Removed stale {}", self.uplink_log.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(EmulatorError::ClearLog {
                path: self.uplink_log.clone(),
                source,
            }),
        }
    }
}

/// No shaping: the client runs directly and is stopped after the trial duration.
#[derive(Debug, Clone, Default)]
pub struct Loopback;

impl LinkEmulator for Loopback {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn uses_traces(&self) -> bool {
        false
    }

    fn command(
        &self,
        _params: &TrialParameters,
        _traces: Option<&TracePair>,
        client: &ClientInvocation,
    ) -> Command {
        let mut cmd = Command::new(&client.program);
        cmd.args(&client.args)
            .env_remove("MAHIMAHI_BASE")
            .kill_on_drop(true);
        cmd
    }

    fn deadline(&self, params: &TrialParameters) -> Option<Duration> {
        Some(Duration::from_secs(params.duration_secs))
    }

    fn summary_command(&self) -> Option<Command> {
        None
    }
}

/// Picks the emulator named by the experiment.
pub fn emulator_for(config: &ExperimentConfig) -> Box<dyn LinkEmulator> {
    match config.emulator {
        EmulatorKind::Mahimahi => Box::new(Mahimahi {
            uplink_log: config.work_dir.join("uplink.log"),
            headless: config.headless,
        }),
        EmulatorKind::Loopback => Box::new(Loopback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goodput_lab_abstract::CongestionControl;

    fn params() -> TrialParameters {
        TrialParameters {
            round_trip_ms: 100,
            loss_rate: 0.01,
            bandwidth_mbps: 10.0,
            packet_size: 1024,
            congestion_control: CongestionControl::Bbr,
            port: 5050,
            duration_secs: 20,
        }
    }

    fn client() -> ClientInvocation {
        ClientInvocation {
            program: PathBuf::from("/usr/bin/goodput-lab"),
            args: ["client", "--cc", "bbr", "--port", "5050", "--size", "1024"]
                .into_iter()
                .map(OsString::from)
                .collect(),
        }
    }

    fn argv(cmd: &Command) -> Vec<String> {
        let std = cmd.as_std();
        std::iter::once(std.get_program())
            .chain(std.get_args())
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn queue_is_one_bdp() {
        // 100 ms * 1.25 MB/s = 125 000 bytes
        assert_eq!(bottleneck_queue_bytes(&params()), 125_000);
    }

    #[test]
    fn queue_has_a_floor() {
        let p = TrialParameters {
            round_trip_ms: 0,
            ..params()
        };
        assert_eq!(bottleneck_queue_bytes(&p), MIN_QUEUE_BYTES);
    }

    #[test]
    fn mahimahi_command_shape() {
        let emulator = Mahimahi {
            uplink_log: PathBuf::from("/tmp/lab/uplink.log"),
            headless: true,
        };
        let traces = TracePair {
            uplink: PathBuf::from("/tmp/lab/10Mbps.up"),
            downlink: PathBuf::from("/tmp/lab/10Mbps.down"),
        };
        let cmd = emulator.command(&params(), Some(&traces), &client());
        assert_eq!(
            argv(&cmd),
            vec![
                "mm-delay",
                "50",
                "mm-loss",
                "uplink",
                "0.01",
                "mm-link",
                "/tmp/lab/10Mbps.up",
                "/tmp/lab/10Mbps.down",
                "--uplink-log=/tmp/lab/uplink.log",
                "--once",
                "--uplink-queue=droptail",
                "--uplink-queue-args=bytes=125000",
                "--",
                "/usr/bin/goodput-lab",
                "client",
                "--cc",
                "bbr",
                "--port",
                "5050",
                "--size",
                "1024",
            ]
        );
        assert_eq!(emulator.deadline(&params()), None);
    }

    #[test]
    fn stale_uplink_log_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let emulator = Mahimahi {
            uplink_log: dir.path().join("uplink.log"),
            headless: true,
        };
        std::fs::write(&emulator.uplink_log, "# base timestamp: 0\n").unwrap();

        emulator.clear_logs().unwrap();
        assert!(!emulator.uplink_log.exists());
        // Nothing left to remove on the next trial.
        emulator.clear_logs().unwrap();
        assert!(Loopback.clear_logs().is_ok());
    }

    #[test]
    fn mahimahi_meters_the_uplink_unless_headless() {
        let emulator = Mahimahi {
            uplink_log: PathBuf::from("log"),
            headless: false,
        };
        let cmd = emulator.command(&params(), None, &client());
        assert!(argv(&cmd).contains(&"--meter-uplink".to_string()));
    }

    #[test]
    fn loopback_runs_the_client_directly() {
        let cmd = Loopback.command(&params(), None, &client());
        let args = argv(&cmd);
        assert_eq!(args[0], "/usr/bin/goodput-lab");
        assert_eq!(args[1], "client");
        assert_eq!(Loopback.deadline(&params()), Some(Duration::from_secs(20)));
        assert!(!Loopback.uses_traces());
        assert!(Loopback.summary_command().is_none());
    }

    #[test]
    fn emulator_follows_the_config() {
        let config = ExperimentConfig {
            emulator: EmulatorKind::Loopback,
            ..Default::default()
        };
        assert_eq!(emulator_for(&config).name(), "loopback");
        assert_eq!(emulator_for(&ExperimentConfig::default()).name(), "mahimahi");
    }

    #[tokio::test]
    async fn missing_summary_tool_is_a_spawn_error() {
        let cmd = Command::new("/nonexistent/mm-throughput-graph");
        let err = collect_summary(cmd).await.unwrap_err();
        assert!(matches!(err, EmulatorError::Spawn { .. }));
    }
}
