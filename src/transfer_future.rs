use crate::completion_queue::WcError;
use crate::error::{Error, Result};
use num_traits::FromPrimitive;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State word: not resolved yet
const PENDING: i32 = 0;
/// State word: the transfer completed
const SUCCESS: i32 = 1;
/// State word: the transfer failed, details in the failure slot
const FAILED: i32 = -1;

/// Spins before the waiter starts yielding
const WAIT_SPINS: u32 = 64;
/// Yields before the waiter starts sleeping
const WAIT_YIELDS: u32 = 1024;
/// Sleep interval once the waiter has given up spinning
const WAIT_SLEEP: Duration = Duration::from_micros(50);

/// Why a transfer failed. `Copy` so workers can fan one fatal cause out to
/// every tracked future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureCause {
    /// Dropped before the transfer could run
    Cancelled,
    /// The engine was already finalized or poisoned
    InvalidState,
    /// The hardware reported this non-success completion status
    WcFailed(u32),
    /// Posting the work request failed with this errno
    PostFailed(i32),
    /// The paired requests disagreed on the length
    LengthMismatch {
        /// Stream the pairing happened on
        stream_id: u32,
        /// Length of the local request
        local: u32,
        /// Length of the remote request
        remote: u32,
    },
}

impl From<FailureCause> for Error {
    fn from(cause: FailureCause) -> Self {
        match cause {
            FailureCause::Cancelled => Error::Cancelled,
            FailureCause::InvalidState => {
                Error::InvalidState("the transfer engine is shut down".to_owned())
            }
            FailureCause::WcFailed(status) => {
                Error::WcFailed(WcError::from_u32(status).unwrap_or(WcError::UnexpectedErr))
            }
            FailureCause::PostFailed(errno) => Error::PostFailed(errno),
            FailureCause::LengthMismatch {
                stream_id,
                local,
                remote,
            } => Error::LengthMismatch {
                stream_id,
                local,
                remote,
            },
        }
    }
}

/// Shared state between the user handle and the resolving worker
#[derive(Debug)]
struct Inner {
    /// `PENDING`, `SUCCESS` or `FAILED`
    state: AtomicI32,
    /// Written exactly once, before `state` flips to `FAILED`
    failure: Mutex<Option<FailureCause>>,
}

/// Handle to the eventual outcome of one `send`/`recv` request.
///
/// Cloning yields another handle to the same outcome. The handle resolves
/// exactly once; waiting spins briefly, then yields, then micro-sleeps.
#[derive(Debug, Clone)]
pub struct TransferFuture {
    /// shared state
    inner: Arc<Inner>,
}

impl Default for TransferFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferFuture {
    /// A fresh pending future
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicI32::new(PENDING),
                failure: Mutex::new(None),
            }),
        }
    }

    /// Mark the transfer complete. Returns false if already resolved.
    pub(crate) fn resolve_success(&self) -> bool {
        // the lock serializes against a concurrent failure resolution so the
        // failure slot is never observed half-written
        let _guard = self.inner.failure.lock();
        self.inner
            .state
            .compare_exchange(PENDING, SUCCESS, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark the transfer failed. Returns false if already resolved.
    pub(crate) fn resolve_failure(&self, cause: FailureCause) -> bool {
        let mut slot = self.inner.failure.lock();
        if self.inner.state.load(Ordering::Acquire) != PENDING {
            return false;
        }
        *slot = Some(cause);
        self.inner.state.store(FAILED, Ordering::Release);
        true
    }

    /// Non-blocking check; `None` while the transfer is pending
    #[must_use]
    pub fn try_wait(&self) -> Option<Result<()>> {
        match self.inner.state.load(Ordering::Acquire) {
            PENDING => None,
            SUCCESS => Some(Ok(())),
            _ => Some(Err(self.failure_error())),
        }
    }

    /// Block until the transfer resolves
    pub fn wait(&self) -> Result<()> {
        let mut round: u32 = 0;
        loop {
            if let Some(res) = self.try_wait() {
                return res;
            }
            if round < WAIT_SPINS {
                std::hint::spin_loop();
            } else if round < WAIT_YIELDS {
                std::thread::yield_now();
            } else {
                std::thread::sleep(WAIT_SLEEP);
            }
            round = round.saturating_add(1);
        }
    }

    /// Block until the transfer resolves or `timeout` elapses; `None` on
    /// timeout
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let deadline = Instant::now().checked_add(timeout)?;
        let mut round: u32 = 0;
        loop {
            if let Some(res) = self.try_wait() {
                return Some(res);
            }
            if Instant::now() >= deadline {
                return None;
            }
            if round < WAIT_SPINS {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
            round = round.saturating_add(1);
        }
    }

    /// The stored failure as an `Error`
    fn failure_error(&self) -> Error {
        self.inner
            .failure
            .lock()
            .map_or(FailureCause::InvalidState.into(), Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_resolves_once() {
        let fut = TransferFuture::new();
        assert!(fut.try_wait().is_none());
        assert!(fut.resolve_success());
        assert!(!fut.resolve_success());
        assert!(!fut.resolve_failure(FailureCause::Cancelled));
        assert!(matches!(fut.try_wait(), Some(Ok(()))));
        assert!(fut.wait().is_ok());
    }

    #[test]
    fn failure_carries_its_cause() {
        let fut = TransferFuture::new();
        assert!(fut.resolve_failure(FailureCause::LengthMismatch {
            stream_id: 3,
            local: 1024,
            remote: 2048,
        }));
        match fut.wait() {
            Err(Error::LengthMismatch {
                stream_id,
                local,
                remote,
            }) => {
                assert_eq!(stream_id, 3);
                assert_eq!(local, 1024);
                assert_eq!(remote, 2048);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn cancelled_maps_to_cancelled() {
        let fut = TransferFuture::new();
        assert!(fut.resolve_failure(FailureCause::Cancelled));
        assert!(matches!(fut.wait(), Err(Error::Cancelled)));
    }

    #[test]
    fn clones_share_the_outcome() {
        let fut = TransferFuture::new();
        let waiter = fut.clone();
        let handle = std::thread::spawn(move || waiter.wait());
        std::thread::sleep(Duration::from_millis(10));
        assert!(fut.resolve_success());
        #[allow(clippy::unwrap_used)]
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn wait_timeout_times_out_while_pending() {
        let fut = TransferFuture::new();
        assert!(fut.wait_timeout(Duration::from_millis(5)).is_none());
        assert!(fut.resolve_success());
        assert!(matches!(
            fut.wait_timeout(Duration::from_millis(5)),
            Some(Ok(()))
        ));
    }
}
