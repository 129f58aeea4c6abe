use serde::Serialize;

/// Figures `mm-throughput-graph` prints for an uplink log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EmulatorSummary {
    pub capacity_mbps: f64,
    pub throughput_mbps: f64,
    pub queueing_delay_p95_ms: Option<f64>,
    pub signal_delay_p95_ms: Option<f64>,
}

/// Parses the report `mm-throughput-graph` writes to stderr, e.g.
///
/// ```text
/// Average capacity: 10.00 Mbits/s
/// Average throughput: 9.12 Mbits/s (91.2% utilization)
/// 95th percentile per-packet queueing delay: 41 ms
/// 95th percentile signal delay: 87 ms
/// ```
///
/// Returns `None` unless both capacity and throughput are present.
pub fn parse_throughput_summary(report: &str) -> Option<EmulatorSummary> {
    let mut capacity = None;
    let mut throughput = None;
    let mut queueing = None;
    let mut signal = None;

    for line in report.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let number = value
            .split_whitespace()
            .next()
            .and_then(|token| token.parse::<f64>().ok());
        match key.trim() {
            "Average capacity" => capacity = number,
            "Average throughput" => throughput = number,
            "95th percentile per-packet queueing delay" => queueing = number,
            "95th percentile signal delay" => signal = number,
            _ => {}
        }
    }

    Some(EmulatorSummary {
        capacity_mbps: capacity?,
        throughput_mbps: throughput?,
        queueing_delay_p95_ms: queueing,
        signal_delay_p95_ms: signal,
    })
}
