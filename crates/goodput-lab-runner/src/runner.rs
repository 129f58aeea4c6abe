//! Runs one trial end to end: traces, server, emulated client, result.

use crate::result_log::{ResultLog, ResultLogError};
use goodput_lab_abstract::{ExperimentConfig, ResultRecord, TrialParameters};
use goodput_lab_core::{
    ChannelError, GoodputServer, ResultReceiver, ServerConfig, ServerError, ShutdownSignal,
    result_channel,
};
use goodput_lab_emulation::{
    ClientInvocation, EmulatorError, EmulatorSummary, LinkEmulator, TraceError, TraceGenerator,
    TracePair, collect_summary, emulator_for,
};
use std::ffi::OsString;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum TrialError {
    #[error("trace generation failed: {0}")]
    Trace(#[from] TraceError),
    #[error("server failed: {0}")]
    Server(#[source] ServerError),
    #[error("emulator failed: {0}")]
    Emulator(#[from] EmulatorError),
    #[error("lost track of the client process: {0}")]
    ClientWait(#[source] io::Error),
    #[error("result handoff failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("server neither stopped nor reported within {0:?} of shutdown")]
    ServerStuck(Duration),
    #[error("{0}")]
    ResultLog(#[from] ResultLogError),
}

impl TrialError {
    /// Fatal errors abort the sweep. The rest only lose the current trial.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TrialError::Server(
                ServerError::NoConnection | ServerError::Accept(_) | ServerError::Io(_)
            ) | TrialError::ServerStuck(_)
        )
    }
}

/// Builds the command line that starts the load client for `params`.
pub fn client_invocation(program: impl Into<PathBuf>, params: &TrialParameters) -> ClientInvocation {
    let args = [
        "client".to_string(),
        "--cc".to_string(),
        params.congestion_control.to_string(),
        "--port".to_string(),
        params.port.to_string(),
        "--size".to_string(),
        params.packet_size.to_string(),
    ];
    ClientInvocation {
        program: program.into(),
        args: args.into_iter().map(OsString::from).collect(),
    }
}

pub struct TrialOrchestrator<'a> {
    config: &'a ExperimentConfig,
    emulator: Box<dyn LinkEmulator>,
    client_program: PathBuf,
    result_log: Option<ResultLog>,
}

impl<'a> TrialOrchestrator<'a> {
    /// `client_program` is an executable that understands the `client`
    /// subcommand, normally the current binary.
    pub fn new(config: &'a ExperimentConfig, client_program: impl Into<PathBuf>) -> Self {
        Self {
            config,
            emulator: emulator_for(config),
            client_program: client_program.into(),
            result_log: config.output_file.clone().map(ResultLog::new),
        }
    }

    pub fn with_emulator(mut self, emulator: Box<dyn LinkEmulator>) -> Self {
        self.emulator = emulator;
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        self.config
    }

    pub async fn run_trial(&self, params: &TrialParameters) -> Result<ResultRecord, TrialError> {
        info!("Running experiment [{}] via {}", params, self.emulator.name());

        let (traces, generated) = self.prepare_traces(params)?;
        let outcome = self.execute(params, traces.as_ref()).await;

        if let Some(traces) = traces.filter(|_| generated) {
            if let Err(e) = traces.remove() {
                warn!("{}", e);
            }
        }

        let record = outcome?;
        if let Some(log) = &self.result_log {
            log.append(&record)?;
        }
        Ok(record)
    }

    /// Returns the trace pair for this trial and whether it was generated here.
    fn prepare_traces(
        &self,
        params: &TrialParameters,
    ) -> Result<(Option<TracePair>, bool), TrialError> {
        if !self.emulator.uses_traces() {
            return Ok((None, false));
        }
        if let Some((uplink, downlink)) = self.config.supplied_traces() {
            debug!("Using supplied traces {} / {}", uplink.display(), downlink.display());
            return Ok((Some(TracePair { uplink, downlink }), false));
        }
        let pair = TraceGenerator::new(&self.config.work_dir)
            .generate(params.duration_secs, params.bandwidth_mbps)?;
        Ok((Some(pair), true))
    }

    async fn execute(
        &self,
        params: &TrialParameters,
        traces: Option<&TracePair>,
    ) -> Result<ResultRecord, TrialError> {
        let stop_timeout = self.config.server_stop_timeout();
        let shutdown = ShutdownSignal::new();
        let (result_tx, result_rx) = result_channel();
        let (listening_tx, listening_rx) = oneshot::channel();

        let server_config = ServerConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            recv_buffer_bytes: self.config.recv_buffer_bytes,
            ..ServerConfig::new(params.port, params.packet_size, params.congestion_control)
        };
        let server = tokio::spawn(GoodputServer::run(
            result_tx,
            shutdown.clone(),
            listening_tx,
            server_config,
        ));

        match listening_rx.await {
            Ok(addr) => debug!(%addr, "server listening"),
            Err(_) => {
                // The server gave up before listening and has published why.
                let published = result_rx.recv_timeout(stop_timeout).await?;
                let _ = server.await;
                return match published {
                    Err(e) => Err(TrialError::Server(e)),
                    Ok(_) => Err(TrialError::Channel(ChannelError::Closed)),
                };
            }
        }

        let client = client_invocation(&self.client_program, params);
        let mut command = self.emulator.command(params, traces, &client);
        debug!("Executing command: {:?}", command.as_std());
        let program = command.as_std().get_program().to_string_lossy().into_owned();
        let spawned = self.emulator.clear_logs().and_then(|()| {
            command.spawn().map_err(|source| EmulatorError::Spawn {
                program: program.clone(),
                source,
            })
        });
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                stop_server(&shutdown, server, stop_timeout).await;
                return Err(e.into());
            }
        };

        let status = match wait_for_client(&mut child, self.emulator.deadline(params)).await {
            Ok(status) => status,
            Err(e) => {
                stop_server(&shutdown, server, stop_timeout).await;
                return Err(e);
            }
        };
        if !status.success() {
            debug!("{} exited with {}", program, status);
        }
        if server.is_finished() {
            debug!("Server finished before shutdown was raised");
        }

        shutdown.raise();
        let (goodput, suspect) = collect_result(server, result_rx, stop_timeout).await?;

        let summary = self.emulator_summary().await;
        let mut record = ResultRecord::new(params, goodput, summary.map(|s| s.capacity_mbps));
        record.suspect = suspect;
        Ok(record)
    }

    async fn emulator_summary(&self) -> Option<EmulatorSummary> {
        let command = self.emulator.summary_command()?;
        match collect_summary(command).await {
            Ok(summary) => {
                info!(
                    capacity = summary.capacity_mbps,
                    throughput = summary.throughput_mbps,
                    queueing_p95_ms = summary.queueing_delay_p95_ms,
                    signal_p95_ms = summary.signal_delay_p95_ms,
                    "Emulator summary"
                );
                Some(summary)
            }
            Err(e) => {
                warn!("No emulator summary: {}", e);
                None
            }
        }
    }
}

/// Stops a server whose trial is being abandoned, releasing its port.
async fn stop_server(
    shutdown: &ShutdownSignal,
    mut server: JoinHandle<()>,
    stop_timeout: Duration,
) {
    shutdown.raise();
    if tokio::time::timeout(stop_timeout, &mut server).await.is_err() {
        server.abort();
    }
}

/// Waits for the server to stop after shutdown was raised, then reads its
/// single result. Returns the goodput and whether the stop overran its bound.
///
/// A server that overruns gets a second bounded wait for its result before it
/// is aborted; a value arriving then is kept but marked suspect.
async fn collect_result(
    mut server: JoinHandle<()>,
    result: ResultReceiver,
    stop_timeout: Duration,
) -> Result<(f64, bool), TrialError> {
    let stopped = match tokio::time::timeout(stop_timeout, &mut server).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("Server task failed: {}", e);
            true
        }
        Err(_) => {
            warn!("Server did not stop within {:?}", stop_timeout);
            false
        }
    };

    let published = result.recv_timeout(stop_timeout).await;
    if !stopped {
        server.abort();
    }
    match published {
        Ok(outcome) => outcome.map(|g| (g, !stopped)).map_err(TrialError::Server),
        Err(_) if !stopped => Err(TrialError::ServerStuck(stop_timeout)),
        Err(e) => Err(e.into()),
    }
}

async fn wait_for_client(
    child: &mut Child,
    deadline: Option<Duration>,
) -> Result<ExitStatus, TrialError> {
    let Some(limit) = deadline else {
        return child.wait().await.map_err(TrialError::ClientWait);
    };
    match tokio::time::timeout(limit, child.wait()).await {
        Ok(status) => status.map_err(TrialError::ClientWait),
        Err(_) => {
            debug!("Trial duration elapsed, stopping client");
            child.kill().await.map_err(TrialError::ClientWait)?;
            child.wait().await.map_err(TrialError::ClientWait)
        }
    }
}
