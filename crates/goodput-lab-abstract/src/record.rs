use crate::params::{CongestionControl, TrialParameters};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of one completed trial, as stored in the result log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub congestion_control: CongestionControl,
    pub loss_rate: f64,
    #[serde(rename = "goodput_Mbps")]
    pub goodput_mbps: f64,
    pub rtt_ms: u64,
    #[serde(rename = "bandwidth_Mbps")]
    pub specified_bandwidth_mbps: f64,
    /// Link capacity reported by the emulator, when it produced a summary.
    #[serde(rename = "capacity_Mbps")]
    pub capacity_mbps: Option<f64>,
    /// Set when the server did not stop within the bounded wait. Logs written
    /// before this column existed read back as `false`.
    #[serde(default)]
    pub suspect: bool,
}

impl ResultRecord {
    pub const HEADER: [&'static str; 7] = [
        "congestion_control",
        "loss_rate",
        "goodput_Mbps",
        "rtt_ms",
        "bandwidth_Mbps",
        "capacity_Mbps",
        "suspect",
    ];

    pub fn new(params: &TrialParameters, goodput_mbps: f64, capacity_mbps: Option<f64>) -> Self {
        Self {
            congestion_control: params.congestion_control,
            loss_rate: params.loss_rate,
            goodput_mbps,
            rtt_ms: params.round_trip_ms,
            specified_bandwidth_mbps: params.bandwidth_mbps,
            capacity_mbps,
            suspect: false,
        }
    }
}

/// The comma separated summary line printed after each trial.
impl fmt::Display for ResultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}, ",
            self.congestion_control, self.loss_rate, self.goodput_mbps, self.rtt_ms
        )?;
        match self.capacity_mbps {
            Some(capacity) => write!(f, "{capacity}")?,
            None => write!(f, "{}", self.specified_bandwidth_mbps)?,
        }
        if self.suspect {
            f.write_str(" (suspect)")?;
        }
        Ok(())
    }
}
