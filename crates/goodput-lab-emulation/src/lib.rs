pub mod emulator;
pub mod summary;
pub mod trace;

pub use emulator::{
    ClientInvocation, EmulatorError, LinkEmulator, Loopback, Mahimahi, bottleneck_queue_bytes,
    collect_summary, emulator_for,
};
pub use summary::{EmulatorSummary, parse_throughput_summary};
pub use trace::{DeliverySchedule, TraceError, TraceGenerator, TracePair};
