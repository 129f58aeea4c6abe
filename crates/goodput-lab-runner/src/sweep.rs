use crate::report::{SweepReport, TrialOutcome};
use crate::runner::{TrialError, TrialOrchestrator};
use goodput_lab_abstract::{ExperimentConfig, ResultRecord, TrialParameters};
use tracing::{error, info, warn};

/// Expands the parameter grid. Congestion control varies slowest, then loss,
/// then RTT, then bandwidth.
pub fn trial_grid(config: &ExperimentConfig) -> Vec<TrialParameters> {
    let mut grid = Vec::with_capacity(
        config.congestion_controls.len()
            * config.loss_rates.len()
            * config.rtts_ms.len()
            * config.bandwidths_mbps.len(),
    );
    for &congestion_control in &config.congestion_controls {
        for &loss_rate in &config.loss_rates {
            for &round_trip_ms in &config.rtts_ms {
                for &bandwidth_mbps in &config.bandwidths_mbps {
                    grid.push(TrialParameters {
                        round_trip_ms,
                        loss_rate,
                        bandwidth_mbps,
                        packet_size: config.packet_size,
                        congestion_control,
                        port: config.port,
                        duration_secs: config.duration_secs,
                    });
                }
            }
        }
    }
    grid
}

/// Runs every trial in grid order, one at a time.
///
/// `on_record` sees each completed trial as soon as it finishes. A fatal
/// trial error stops the sweep and is returned; other failures are recorded
/// in the report and the sweep moves on.
pub async fn run_sweep<F>(
    orchestrator: &TrialOrchestrator<'_>,
    mut on_record: F,
) -> Result<SweepReport, TrialError>
where
    F: FnMut(&ResultRecord),
{
    let grid = trial_grid(orchestrator.config());
    let total = grid.len();
    info!("Sweep of {} trials", total);

    let mut report = SweepReport::default();
    for (idx, params) in grid.into_iter().enumerate() {
        info!("Trial {}/{}", idx + 1, total);
        match orchestrator.run_trial(&params).await {
            Ok(record) => {
                on_record(&record);
                report.trials.push(TrialOutcome::Completed { record });
            }
            Err(e) if !e.is_fatal() => {
                warn!("Trial [{}] failed: {}", params, e);
                report.trials.push(TrialOutcome::Failed {
                    params,
                    error: e.to_string(),
                });
            }
            Err(e) => {
                error!("Aborting sweep at trial [{}]: {}", params, e);
                return Err(e);
            }
        }
    }
    Ok(report)
}
