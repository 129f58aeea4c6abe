use crate::params::CongestionControl;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Which link emulator wraps the load client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmulatorKind {
    /// mahimahi shells: `mm-delay`, `mm-loss`, `mm-link`.
    #[default]
    Mahimahi,
    /// No shaping at all; the client talks to the server over loopback.
    Loopback,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    EmptyGrid(&'static str),
    #[error("loss rate {0} is outside [0, 1]")]
    LossOutOfRange(f64),
    #[error("bandwidth must be a positive number of Mbps, got {0}")]
    InvalidBandwidth(f64),
    #[error("packet size must be greater than zero")]
    ZeroPacketSize,
    #[error("duration must be greater than zero")]
    ZeroDuration,
    #[error("uplink and downlink traces must be supplied together")]
    UnpairedTraces,
    #[error("trace file {0} does not exist")]
    MissingTrace(PathBuf),
    #[error("failed to read experiment file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse experiment file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Immutable description of a whole sweep, built once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub duration_secs: u64,
    pub loss_rates: Vec<f64>,
    pub congestion_controls: Vec<CongestionControl>,
    pub rtts_ms: Vec<u64>,
    pub bandwidths_mbps: Vec<f64>,
    pub packet_size: usize,
    pub port: u16,
    pub trace_uplink: Option<PathBuf>,
    pub trace_downlink: Option<PathBuf>,
    pub headless: bool,
    pub output_file: Option<PathBuf>,
    pub work_dir: PathBuf,
    pub server_stop_timeout_ms: u64,
    pub emulator: EmulatorKind,
    pub recv_buffer_bytes: usize,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            duration_secs: 60,
            loss_rates: vec![0.001],
            congestion_controls: vec![CongestionControl::Cubic],
            rtts_ms: vec![100],
            bandwidths_mbps: vec![100.0],
            packet_size: 1024,
            port: 5050,
            trace_uplink: None,
            trace_downlink: None,
            headless: false,
            output_file: None,
            work_dir: std::env::temp_dir().join("goodput-lab"),
            server_stop_timeout_ms: 5000,
            emulator: EmulatorKind::default(),
            recv_buffer_bytes: 6_553_600,
        }
    }
}

impl ExperimentConfig {
    pub fn server_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.server_stop_timeout_ms)
    }

    /// Both trace paths, when the experiment runs on externally supplied traces.
    pub fn supplied_traces(&self) -> Option<(PathBuf, PathBuf)> {
        match (&self.trace_uplink, &self.trace_downlink) {
            (Some(up), Some(down)) => Some((up.clone(), down.clone())),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.loss_rates.is_empty() {
            return Err(ConfigError::EmptyGrid("loss_rates"));
        }
        if self.congestion_controls.is_empty() {
            return Err(ConfigError::EmptyGrid("congestion_controls"));
        }
        if self.rtts_ms.is_empty() {
            return Err(ConfigError::EmptyGrid("rtts_ms"));
        }
        if self.bandwidths_mbps.is_empty() {
            return Err(ConfigError::EmptyGrid("bandwidths_mbps"));
        }
        if let Some(&loss) = self
            .loss_rates
            .iter()
            .find(|l| !l.is_finite() || !(0.0..=1.0).contains(*l))
        {
            return Err(ConfigError::LossOutOfRange(loss));
        }
        if let Some(&bw) = self
            .bandwidths_mbps
            .iter()
            .find(|b| !b.is_finite() || **b <= 0.0)
        {
            return Err(ConfigError::InvalidBandwidth(bw));
        }
        if self.packet_size == 0 {
            return Err(ConfigError::ZeroPacketSize);
        }
        if self.duration_secs == 0 {
            return Err(ConfigError::ZeroDuration);
        }
        match (&self.trace_uplink, &self.trace_downlink) {
            (Some(up), Some(down)) => {
                for path in [up, down] {
                    if !path.exists() {
                        return Err(ConfigError::MissingTrace(path.clone()));
                    }
                }
            }
            (None, None) => {}
            _ => return Err(ConfigError::UnpairedTraces),
        }
        Ok(())
    }
}
