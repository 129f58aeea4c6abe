//! Worker side of a goodput trial: the draining server, the load client and
//! the two primitives that tie them to the orchestrator.

pub mod channel;
pub mod client;
pub mod server;
pub mod signal;

pub use channel::{ChannelError, ResultReceiver, ResultSender, result_channel};
pub use client::{ClientConfig, ClientError, LoadClient};
pub use server::{GoodputServer, Measurement, ServerConfig, ServerError, goodput_mbps};
pub use signal::ShutdownSignal;
