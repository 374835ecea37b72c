//! Queue reconciliation against the shaping device.
//!
//! [`ShapingTarget`] is the narrow capability the pipeline needs from the
//! router: look a queue up, set its limit, hang up. The production
//! implementation is [`crate::routeros::RouterOsClient`]; tests drive the
//! reconciler with in-memory fakes.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

/// A queue-tree entry as the device reports it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueState {
    /// Device-internal identifier (RouterOS `.id`, e.g. `*A0`).
    pub id: String,
    pub name: String,
    /// Current max-limit in bits per second; `None` when the entry has no
    /// limit attribute at all.
    pub max_limit_bits: Option<u64>,
}

/// Outcome of reconciling one queue.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedLimit {
    pub queue: String,
    /// Limit in effect before the change, if the device reported one.
    pub previous_bits: Option<u64>,
    pub desired_bits: u64,
    /// Limit in effect after the change, per the confirmation re-read.
    /// `None` under dry-run (nothing was written) or if the device dropped
    /// the attribute.
    pub applied_bits: Option<u64>,
    /// Whether the re-read limit matched the desired value exactly.
    pub verified: bool,
    /// True when dry-run stopped the pipeline short of the mutating call.
    pub staged: bool,
}

impl AppliedLimit {
    /// The limit to report in summaries: confirmed if we have it, otherwise
    /// the value we asked for.
    pub fn effective_bits(&self) -> u64 {
        self.applied_bits.unwrap_or(self.desired_bits)
    }
}

#[derive(Debug, Error)]
pub enum ShapingError {
    #[error("cannot reach shaping device at {target}: {source}")]
    Connection {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("shaping device rejected login for {username:?}: {message}")]
    AuthRejected { username: String, message: String },
    #[error("no reply from {target} within {timeout:?}")]
    Timeout { target: String, timeout: Duration },
    #[error("shaping device closed the connection")]
    ConnectionClosed,
    #[error("queue {0:?} not found on shaping device")]
    QueueNotFound(String),
    #[error("shaping device refused the command: {message}")]
    Trap { message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Capability to read and write shaping queues on the remote device.
#[async_trait::async_trait]
pub trait ShapingTarget: Send {
    /// Look up a queue by name. `Ok(None)` means the device has no queue with
    /// that name; that is the caller's problem, not an error here.
    async fn get_queue(&mut self, name: &str) -> Result<Option<QueueState>, ShapingError>;

    /// Set the queue's max-limit and return the state found by an immediate
    /// re-read. Implementations hide the lookup/update/re-read sequence
    /// behind this single call.
    async fn set_limit(&mut self, name: &str, limit_bits: u64)
        -> Result<QueueState, ShapingError>;

    /// Release the session. Must be safe to call after a failed command.
    async fn close(&mut self) -> Result<(), ShapingError>;
}

#[async_trait::async_trait]
impl<T: ShapingTarget + ?Sized> ShapingTarget for &mut T {
    async fn get_queue(&mut self, name: &str) -> Result<Option<QueueState>, ShapingError> {
        (**self).get_queue(name).await
    }

    async fn set_limit(
        &mut self,
        name: &str,
        limit_bits: u64,
    ) -> Result<QueueState, ShapingError> {
        (**self).set_limit(name, limit_bits).await
    }

    async fn close(&mut self) -> Result<(), ShapingError> {
        (**self).close().await
    }
}

/// Reconcile one queue to the desired limit.
///
/// A missing queue fails this direction only; the caller decides what that
/// means for the cycle. A confirmation mismatch is logged and reported but
/// never an error: the device is authoritative and the next scheduled run
/// re-derives everything anyway.
pub async fn reconcile<T: ShapingTarget + ?Sized>(
    target: &mut T,
    queue_name: &str,
    desired_bits: u64,
    dry_run: bool,
) -> Result<AppliedLimit, ShapingError> {
    let Some(current) = target.get_queue(queue_name).await? else {
        return Err(ShapingError::QueueNotFound(queue_name.to_string()));
    };

    match current.max_limit_bits {
        Some(bits) => info!(queue = %queue_name, current_max_limit = bits, "queue current max-limit"),
        None => info!(queue = %queue_name, "queue has no max-limit set"),
    }

    if dry_run {
        info!(queue = %queue_name, max_limit = desired_bits, "dry-run: would set max-limit");
        return Ok(AppliedLimit {
            queue: queue_name.to_string(),
            previous_bits: current.max_limit_bits,
            desired_bits,
            applied_bits: None,
            verified: false,
            staged: true,
        });
    }

    info!(queue = %queue_name, max_limit = desired_bits, "setting queue max-limit");
    let after = target.set_limit(queue_name, desired_bits).await?;

    let verified = after.max_limit_bits == Some(desired_bits);
    if !verified {
        warn!(
            queue = %queue_name,
            desired = desired_bits,
            applied = ?after.max_limit_bits,
            "applied max-limit does not match desired value, leaving it to the next cycle"
        );
    }

    Ok(AppliedLimit {
        queue: queue_name.to_string(),
        previous_bits: current.max_limit_bits,
        desired_bits,
        applied_bits: after.max_limit_bits,
        verified,
        staged: false,
    })
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::HashMap;

    /// In-memory shaping device. Set limits land in the map; queues the map
    /// does not contain do not exist.
    pub(crate) struct FakeTarget {
        pub queues: HashMap<String, Option<u64>>,
        pub set_calls: Vec<(String, u64)>,
        pub closed: bool,
        /// When set, the device silently clamps every write to this value.
        pub clamp_to: Option<u64>,
    }

    impl FakeTarget {
        pub fn with_queues(names: &[(&str, Option<u64>)]) -> Self {
            Self {
                queues: names
                    .iter()
                    .map(|(n, l)| (n.to_string(), *l))
                    .collect(),
                set_calls: Vec::new(),
                closed: false,
                clamp_to: None,
            }
        }

        fn state(&self, name: &str) -> Option<QueueState> {
            self.queues.get(name).map(|limit| QueueState {
                id: format!("*{}", name.len()),
                name: name.to_string(),
                max_limit_bits: *limit,
            })
        }
    }

    #[async_trait::async_trait]
    impl ShapingTarget for FakeTarget {
        async fn get_queue(&mut self, name: &str) -> Result<Option<QueueState>, ShapingError> {
            Ok(self.state(name))
        }

        async fn set_limit(
            &mut self,
            name: &str,
            limit_bits: u64,
        ) -> Result<QueueState, ShapingError> {
            if !self.queues.contains_key(name) {
                return Err(ShapingError::QueueNotFound(name.to_string()));
            }
            self.set_calls.push((name.to_string(), limit_bits));
            let stored = self.clamp_to.map_or(limit_bits, |c| limit_bits.min(c));
            self.queues.insert(name.to_string(), Some(stored));
            Ok(self.state(name).unwrap())
        }

        async fn close(&mut self) -> Result<(), ShapingError> {
            self.closed = true;
            Ok(())
        }
    }
}
