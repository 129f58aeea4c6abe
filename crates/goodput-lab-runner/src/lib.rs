pub mod report;
pub mod result_log;
pub mod runner;
pub mod sweep;

pub use report::{SweepReport, TrialOutcome};
pub use result_log::{ResultLog, ResultLogError};
pub use runner::{TrialError, TrialOrchestrator, client_invocation};
pub use sweep::{run_sweep, trial_grid};
