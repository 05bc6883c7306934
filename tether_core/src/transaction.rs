use crate::host::{HostError, PeerConnection};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Result of one write(+read) round trip against the target attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Both operations completed, including an empty read value.
    Success,
    /// The write did not complete within the per-operation bound.
    WriteTimeout,
    /// The read did not complete within the per-operation bound.
    ReadTimeout,
    /// The peer explicitly refused at least one operation. Expected fuzzing
    /// signal; does not end the session.
    PeerRejected,
}

impl Outcome {
    /// Timeouts are terminal for the session: a wedged peer is
    /// indistinguishable from a crashed one.
    pub fn is_timeout(self) -> bool {
        matches!(self, Outcome::WriteTimeout | Outcome::ReadTimeout)
    }
}

/// Performs a single bounded write-then-read round trip.
///
/// There are no retries. A retry on timeout would mask exactly the hang the
/// fuzzer is trying to detect.
#[derive(Debug, Clone)]
pub struct TransactionExecutor {
    op_timeout: Duration,
    read_after_write: bool,
    confirm_writes: bool,
}

impl TransactionExecutor {
    pub fn new(op_timeout: Duration, read_after_write: bool, confirm_writes: bool) -> Self {
        Self {
            op_timeout,
            read_after_write,
            confirm_writes,
        }
    }

    /// Run one transaction against `handle`.
    ///
    /// A peer rejection on the write still attempts the follow-up read (the
    /// peer is alive and may reveal more), and the round reports
    /// [`Outcome::PeerRejected`]. Transport-level failures are returned as
    /// `Err` and are fatal to the session.
    pub async fn run<C>(
        &self,
        conn: &mut C,
        handle: u16,
        body: &[u8],
    ) -> Result<Outcome, HostError>
    where
        C: PeerConnection + ?Sized,
    {
        let mut rejected = false;

        match timeout(self.op_timeout, conn.write(handle, body, self.confirm_writes)).await {
            Err(_elapsed) => return Ok(Outcome::WriteTimeout),
            Ok(Err(HostError::Protocol(reason))) => {
                debug!(handle, %reason, "peer rejected write");
                rejected = true;
            }
            Ok(Err(err)) => return Err(err),
            Ok(Ok(())) => {
                debug!(handle, bytes = body.len(), "write ok");
            }
        }

        if self.read_after_write {
            match timeout(self.op_timeout, conn.read(handle)).await {
                Err(_elapsed) => return Ok(Outcome::ReadTimeout),
                Ok(Err(HostError::Protocol(reason))) => {
                    debug!(handle, %reason, "peer rejected read");
                    rejected = true;
                }
                Ok(Err(err)) => return Err(err),
                Ok(Ok(value)) => {
                    // A zero-length value is a valid read result, not a retry
                    // condition.
                    debug!(handle, bytes = value.len(), "read ok");
                }
            }
        }

        Ok(if rejected {
            Outcome::PeerRejected
        } else {
            Outcome::Success
        })
    }
}
