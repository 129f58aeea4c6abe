use crate::config::{ConfigError, EmulatorKind, ExperimentConfig};
use crate::params::CongestionControl;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Shape of an experiment TOML file. Every field is optional; present fields
/// replace the corresponding defaults.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ExperimentOverride {
    pub duration_secs: Option<u64>,
    pub loss_rates: Option<Vec<f64>>,
    pub congestion_controls: Option<Vec<CongestionControl>>,
    pub rtts_ms: Option<Vec<u64>>,
    pub bandwidths_mbps: Option<Vec<f64>>,
    pub packet_size: Option<usize>,
    pub port: Option<u16>,
    pub trace_uplink: Option<PathBuf>,
    pub trace_downlink: Option<PathBuf>,
    pub headless: Option<bool>,
    pub output_file: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub server_stop_timeout_ms: Option<u64>,
    pub emulator: Option<EmulatorKind>,
    pub recv_buffer_bytes: Option<usize>,
}

impl ExperimentOverride {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_to(self, config: &mut ExperimentConfig) {
        if let Some(v) = self.duration_secs {
            config.duration_secs = v;
        }
        if let Some(v) = self.loss_rates {
            config.loss_rates = v;
        }
        if let Some(v) = self.congestion_controls {
            config.congestion_controls = v;
        }
        if let Some(v) = self.rtts_ms {
            config.rtts_ms = v;
        }
        if let Some(v) = self.bandwidths_mbps {
            config.bandwidths_mbps = v;
        }
        if let Some(v) = self.packet_size {
            config.packet_size = v;
        }
        if let Some(v) = self.port {
            config.port = v;
        }
        if let Some(v) = self.trace_uplink {
            config.trace_uplink = Some(v);
        }
        if let Some(v) = self.trace_downlink {
            config.trace_downlink = Some(v);
        }
        if let Some(v) = self.headless {
            config.headless = v;
        }
        if let Some(v) = self.output_file {
            config.output_file = Some(v);
        }
        if let Some(v) = self.work_dir {
            config.work_dir = v;
        }
        if let Some(v) = self.server_stop_timeout_ms {
            config.server_stop_timeout_ms = v;
        }
        if let Some(v) = self.emulator {
            config.emulator = v;
        }
        if let Some(v) = self.recv_buffer_bytes {
            config.recv_buffer_bytes = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_replace_defaults() {
        let raw = r#"
            duration_secs = 20
            loss_rates = [0.0, 0.01, 0.1]
            congestion_controls = ["cubic", "bbr"]
            emulator = "loopback"
        "#;
        let overrides: ExperimentOverride = toml::from_str(raw).unwrap();
        let mut config = ExperimentConfig::default();
        overrides.apply_to(&mut config);

        assert_eq!(config.duration_secs, 20);
        assert_eq!(config.loss_rates, vec![0.0, 0.01, 0.1]);
        assert_eq!(
            config.congestion_controls,
            vec![CongestionControl::Cubic, CongestionControl::Bbr]
        );
        assert_eq!(config.emulator, EmulatorKind::Loopback);
        // untouched
        assert_eq!(config.port, 5050);
        assert_eq!(config.packet_size, 1024);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = toml::from_str::<ExperimentOverride>("bogus = 1").unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn load_reports_the_path_on_failure() {
        let err = ExperimentOverride::load(Path::new("/nonexistent/exp.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
