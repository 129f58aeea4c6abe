pub mod config;
pub mod experiment;
pub mod params;
pub mod record;

pub use config::{ConfigError, EmulatorKind, ExperimentConfig};
pub use experiment::ExperimentOverride;
pub use params::{CongestionControl, TrialParameters};
pub use record::ResultRecord;
