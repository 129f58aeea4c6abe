use goodput_lab_abstract::{ResultRecord, TrialParameters};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrialOutcome {
    Completed {
        #[serde(flatten)]
        record: ResultRecord,
    },
    Failed {
        #[serde(flatten)]
        params: TrialParameters,
        error: String,
    },
}

impl TrialOutcome {
    pub fn record(&self) -> Option<&ResultRecord> {
        match self {
            TrialOutcome::Completed { record } => Some(record),
            TrialOutcome::Failed { .. } => None,
        }
    }
}

/// Everything a sweep produced, in grid order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub trials: Vec<TrialOutcome>,
}

impl SweepReport {
    pub fn completed(&self) -> impl Iterator<Item = &ResultRecord> {
        self.trials.iter().filter_map(TrialOutcome::record)
    }

    pub fn failed(&self) -> usize {
        self.trials.len() - self.completed().count()
    }
}
