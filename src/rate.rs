//! Rate reading: one measurement per direction per cycle.
//!
//! The pipeline treats the measurement side as a narrow capability
//! ([`RateSource`]) so the orchestration can run against fakes. The production
//! implementation is [`crate::snmp::SnmpClient`].

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::snmp::Oid;

/// Traffic direction, as seen from the subscriber side of the DSL line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Downstream,
    Upstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Downstream => write!(f, "downstream"),
            Direction::Upstream => write!(f, "upstream"),
        }
    }
}

/// A fresh attainable-rate reading. Never persisted; lives for one cycle.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateSample {
    pub direction: Direction,
    pub bits_per_second: u64,
}

/// Capability to read a single counter from the measurement endpoint.
#[async_trait::async_trait]
pub trait RateSource: Send + Sync {
    /// One read attempt for `metric`, in bits per second. No internal retry.
    async fn read(&self, metric: &Oid) -> anyhow::Result<i64>;
}

#[derive(Debug, Error)]
pub enum MeasurementError {
    /// The endpoint could not be read at all (timeout, unreachable,
    /// authentication rejected, protocol error).
    #[error("{direction} attainable rate unavailable: {cause:#}")]
    Unavailable {
        direction: Direction,
        cause: anyhow::Error,
    },
    /// The endpoint answered, but with a value no shaping limit may be
    /// derived from.
    #[error("{direction} attainable rate reads {value} bps, refusing to act on it")]
    Invalid { direction: Direction, value: i64 },
}

impl MeasurementError {
    pub fn direction(&self) -> Direction {
        match self {
            MeasurementError::Unavailable { direction, .. }
            | MeasurementError::Invalid { direction, .. } => *direction,
        }
    }
}

/// Read one direction's rate and validate it.
///
/// Zero and negative readings are rejected here, before any limit math: a
/// line that reports no attainable rate must never have its queues clamped
/// to nothing.
pub async fn read_rate<S: RateSource + ?Sized>(
    source: &S,
    direction: Direction,
    metric: &Oid,
) -> Result<RateSample, MeasurementError> {
    let value = source
        .read(metric)
        .await
        .map_err(|cause| MeasurementError::Unavailable { direction, cause })?;
    if value <= 0 {
        return Err(MeasurementError::Invalid { direction, value });
    }
    Ok(RateSample {
        direction,
        bits_per_second: value as u64,
    })
}
