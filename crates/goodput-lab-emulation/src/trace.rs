//! Packet-delivery traces for `mm-link`.
//!
//! A trace lists, one line per delivery opportunity, the millisecond at which
//! the emulated link may release one MTU-sized packet. The schedule alternates
//! between two adjacent per-millisecond counts so that the running rate stays
//! within one packet of the target for the whole trace.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Bits carried by one delivery opportunity (a 1500-byte MTU).
pub const DELIVERY_BITS: f64 = 12_000.0;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to write trace {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove trace {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Per-millisecond packet counts approximating `target_mbps`.
#[derive(Debug, Clone)]
pub struct DeliverySchedule {
    low: u32,
    low_err: f64,
    high_err: f64,
    accumulated: f64,
    remaining_ms: u64,
}

impl DeliverySchedule {
    pub fn new(duration_secs: u64, target_mbps: f64) -> Self {
        // Mbps expressed per millisecond, in units of one delivery.
        let per_delivery = DELIVERY_BITS / 1000.0;
        let low = (target_mbps / per_delivery).floor() as u32;
        let high = low + 1;
        Self {
            low,
            low_err: target_mbps - f64::from(low) * per_delivery,
            high_err: target_mbps - f64::from(high) * per_delivery,
            accumulated: 0.0,
            remaining_ms: duration_secs * 1000,
        }
    }

    pub fn low_count(&self) -> u32 {
        self.low
    }

    pub fn high_count(&self) -> u32 {
        self.low + 1
    }
}

impl Iterator for DeliverySchedule {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.remaining_ms == 0 {
            return None;
        }
        self.remaining_ms -= 1;
        if self.accumulated >= self.high_err.abs() {
            self.accumulated += self.high_err;
            Some(self.low + 1)
        } else {
            self.accumulated += self.low_err;
            Some(self.low)
        }
    }
}

/// Uplink and downlink trace paths of one trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracePair {
    pub uplink: PathBuf,
    pub downlink: PathBuf,
}

impl TracePair {
    pub fn exists(&self) -> bool {
        self.uplink.exists() && self.downlink.exists()
    }

    pub fn remove(&self) -> Result<(), TraceError> {
        for path in [&self.uplink, &self.downlink] {
            fs::remove_file(path).map_err(|source| TraceError::Remove {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Writes `<bw>Mbps.up` / `<bw>Mbps.down` into a directory.
#[derive(Debug, Clone)]
pub struct TraceGenerator {
    dir: PathBuf,
}

impl TraceGenerator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn paths_for(&self, target_mbps: f64) -> TracePair {
        TracePair {
            uplink: self.dir.join(format!("{target_mbps}Mbps.up")),
            downlink: self.dir.join(format!("{target_mbps}Mbps.down")),
        }
    }

    /// Generates identical uplink and downlink traces.
    ///
    /// Each file is written under a temporary name and renamed into place, so a
    /// reader never sees a partially written trace.
    pub fn generate(&self, duration_secs: u64, target_mbps: f64) -> Result<TracePair, TraceError> {
        info!(
            "Creating {} sec trace @ {}Mbps in {}",
            duration_secs,
            target_mbps,
            self.dir.display()
        );
        fs::create_dir_all(&self.dir).map_err(|source| TraceError::Write {
            path: self.dir.clone(),
            source,
        })?;

        let schedule = DeliverySchedule::new(duration_secs, target_mbps);
        debug!(
            low = schedule.low_count(),
            high = schedule.high_count(),
            "delivery counts per ms"
        );

        let pair = self.paths_for(target_mbps);
        for path in [&pair.uplink, &pair.downlink] {
            write_atomically(path, schedule.clone()).map_err(|source| TraceError::Write {
                path: path.clone(),
                source,
            })?;
        }
        Ok(pair)
    }
}

/// Streams one line per delivery, the line holding its 1-based ms timestamp.
fn write_atomically(path: &Path, schedule: DeliverySchedule) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".partial");
    let tmp = PathBuf::from(tmp);

    let file = fs::File::create(&tmp)?;
    let mut writer = BufWriter::new(file);
    for (idx, count) in schedule.enumerate() {
        let line = format!("{}\n", idx + 1);
        for _ in 0..count {
            writer.write_all(line.as_bytes())?;
        }
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);
    fs::rename(&tmp, path)
}
