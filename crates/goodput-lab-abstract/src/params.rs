use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// TCP congestion-control algorithms the harness knows how to select.
///
/// The names match what the Linux TCP stack expects in `TCP_CONGESTION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionControl {
    Cubic,
    Bbr,
    Bic,
    Vegas,
    Westwood,
    Reno,
}

impl CongestionControl {
    pub const ALL: [CongestionControl; 6] = [
        CongestionControl::Cubic,
        CongestionControl::Bbr,
        CongestionControl::Bic,
        CongestionControl::Vegas,
        CongestionControl::Westwood,
        CongestionControl::Reno,
    ];

    /// Name understood by the kernel's congestion-control registry.
    pub fn as_str(&self) -> &'static str {
        match self {
            CongestionControl::Cubic => "cubic",
            CongestionControl::Bbr => "bbr",
            CongestionControl::Bic => "bic",
            CongestionControl::Vegas => "vegas",
            CongestionControl::Westwood => "westwood",
            CongestionControl::Reno => "reno",
        }
    }
}

impl fmt::Display for CongestionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is not a supported algorithm (expected one of cubic, bbr, bic, vegas, westwood, reno)")]
pub struct UnknownCongestionControl(pub String);

impl FromStr for CongestionControl {
    type Err = UnknownCongestionControl;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        CongestionControl::ALL
            .into_iter()
            .find(|cc| cc.as_str() == lowered)
            .ok_or_else(|| UnknownCongestionControl(s.to_string()))
    }
}

/// One point of the experiment grid. Built by the sweep before any worker is
/// started and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialParameters {
    pub round_trip_ms: u64,
    /// Fraction in `[0, 1]`, never a percentage.
    pub loss_rate: f64,
    pub bandwidth_mbps: f64,
    pub packet_size: usize,
    pub congestion_control: CongestionControl,
    pub port: u16,
    pub duration_secs: u64,
}

impl TrialParameters {
    /// Delay applied in each direction so that the round trip equals `round_trip_ms`.
    pub fn one_way_delay_ms(&self) -> u64 {
        self.round_trip_ms / 2
    }

    /// Bottleneck bandwidth in bytes per second.
    pub fn bandwidth_bytes_per_sec(&self) -> f64 {
        self.bandwidth_mbps * 1e6 / 8.0
    }
}

impl fmt::Display for TrialParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cc={} loss={} rtt={}ms bw={}Mbps size={}B",
            self.congestion_control,
            self.loss_rate,
            self.round_trip_ms,
            self.bandwidth_mbps,
            self.packet_size
        )
    }
}
