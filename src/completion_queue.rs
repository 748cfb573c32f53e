use crate::context::{check_dev_cap, Context};
use crate::error::{Error, Result};
use crate::error_utilities::last_error;
use clippy_utilities::Cast;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use rdma_sys::{
    ibv_cq, ibv_create_cq, ibv_destroy_cq, ibv_poll_cq, ibv_wc, ibv_wc_flags, ibv_wc_status,
};
use std::{fmt::Debug, io, ptr::NonNull};
use thiserror::Error as ThisError;

/// Default maximum number of completion queue entries (CQE) to poll at a time
pub(crate) const DEFAULT_MAX_POLL_CQE: usize = 32;

/// Completion queue wrapper, drained by busy-polling only
pub struct CompletionQueue {
    /// Real Completion Queue
    inner_cq: NonNull<ibv_cq>,
    /// Number of entries the queue was created with
    capacity: u32,
}

impl Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("inner_cq", &self.inner_cq)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl CompletionQueue {
    /// Get the internal cq ptr
    pub(crate) const fn as_ptr(&self) -> *mut ibv_cq {
        self.inner_cq.as_ptr()
    }

    /// Create a completion queue with room for `capacity` entries.
    ///
    /// No completion channel is attached; the owner is expected to poll.
    pub(crate) fn create(ctx: &Context, capacity: u32) -> Result<Self> {
        check_dev_cap(&capacity, &ctx.dev_attr().max_cqe.cast(), "max_cqe")?;

        // SAFETY: ffi
        let inner_cq = NonNull::new(unsafe {
            ibv_create_cq(
                ctx.as_ptr(),
                capacity.cast(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                0_i32,
            )
        })
        .ok_or_else(|| Error::CqCreateFailed(last_error()))?;
        Ok(Self { inner_cq, capacity })
    }

    /// Poll up to `max` work completions without blocking. Returns an empty
    /// vector when nothing has completed.
    pub(crate) fn poll_once(&self, max: usize) -> Result<Vec<WorkCompletion>> {
        let mut wc_buf: Vec<ibv_wc> = Vec::with_capacity(max);
        // SAFETY: ffi, `wc_buf` has room for `max` entries
        let cqe_num = unsafe { ibv_poll_cq(self.as_ptr(), max.cast(), wc_buf.as_mut_ptr()) };
        if cqe_num < 0_i32 {
            return Err(Error::WcFailed(WcError::PollFailed));
        }
        // SAFETY: the hardware filled the first `cqe_num` entries
        unsafe {
            wc_buf.set_len(cqe_num.cast());
        }
        Ok(wc_buf.iter().map(WorkCompletion::from).collect())
    }

    /// Busy-poll until at least `num_expected` completions have been drained
    pub(crate) fn wait_until(&self, num_expected: usize) -> Result<Vec<WorkCompletion>> {
        let mut polled = Vec::with_capacity(num_expected);
        while polled.len() < num_expected {
            let batch = self.poll_once(DEFAULT_MAX_POLL_CQE)?;
            if batch.is_empty() {
                std::hint::spin_loop();
                continue;
            }
            polled.extend(batch);
        }
        Ok(polled)
    }
}

unsafe impl Sync for CompletionQueue {}

unsafe impl Send for CompletionQueue {}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        // SAFETY: ffi, the owning queue pair is destroyed first
        let errno = unsafe { ibv_destroy_cq(self.as_ptr()) };
        debug_assert_eq!(errno, 0_i32, "ibv_destroy_cq failed");
    }
}

/// A decoded completion queue entry
#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    /// The id of the completed work request, as posted
    pub wr_id: u64,
    /// Raw `ibv_wc_status`; zero means success
    pub status: u32,
    /// Number of bytes transferred
    pub byte_len: u32,
    /// Raw `ibv_wc_opcode` of the completed request
    pub opcode: u32,
    /// Immediate data, present for SEND_WITH_IMM / WRITE_WITH_IMM receives
    pub imm_data: Option<u32>,
}

impl WorkCompletion {
    /// Whether the hardware reported `IBV_WC_SUCCESS`
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ibv_wc_status::IBV_WC_SUCCESS
    }

    /// Map a non-success status to its error; `None` for a successful entry
    #[must_use]
    pub fn err(&self) -> Option<WcError> {
        if self.is_success() {
            None
        } else {
            Some(WcError::from_u32(self.status).unwrap_or(WcError::UnexpectedErr))
        }
    }
}

impl From<&ibv_wc> for WorkCompletion {
    fn from(wc: &ibv_wc) -> Self {
        let imm_data = if wc.wc_flags & ibv_wc_flags::IBV_WC_WITH_IMM.0 != 0 {
            // SAFETY: the imm flag was checked, the union holds imm_data
            Some(unsafe { wc.imm_data_invalidated_rkey_union.imm_data })
        } else {
            None
        };
        Self {
            wr_id: wc.wr_id,
            status: wc.status,
            byte_len: wc.byte_len,
            opcode: wc.opcode,
            imm_data,
        }
    }
}

/// Work completion error, mapped from `ibv_wc_status`
#[allow(missing_docs)] // the display messages say it all
#[derive(ThisError, Debug, FromPrimitive, Copy, Clone, PartialEq, Eq)]
pub enum WcError {
    #[error("local length error")]
    LocLenErr = 1,
    #[error("local QP operation error")]
    LocQpOpErr = 2,
    #[error("local EE context operation error")]
    LocEecOpErr = 3,
    #[error("local protection error")]
    LocProtErr = 4,
    #[error("work request flushed error")]
    WrFlushErr = 5,
    #[error("memory window binding error")]
    MwBindErr = 6,
    #[error("bad response error")]
    BadRespErr = 7,
    #[error("local access error")]
    LocAccessErr = 8,
    #[error("remote invalid request error")]
    RemInvReqErr = 9,
    #[error("remote access error")]
    RemAccessErr = 10,
    #[error("remote operation error")]
    RemOpErr = 11,
    #[error("transport retry counter exceeded")]
    RetryExc = 12,
    #[error("RNR retry counter exceeded")]
    RnrRetryExc = 13,
    #[error("local RDD violation error")]
    LocRddViolErr = 14,
    #[error("remote invalid RD request")]
    RemInvRdReq = 15,
    #[error("remote aborted error")]
    RemAbortErr = 16,
    #[error("invalid EE context number")]
    InvEecn = 17,
    #[error("invalid EE context state error")]
    InvEecState = 18,
    #[error("fatal error")]
    Fatal = 19,
    #[error("response timeout error")]
    RespTimeout = 20,
    #[error("general error")]
    GeneralErr = 21,
    #[error("unexpected error")]
    UnexpectedErr = 100,
    #[error("ibv_poll_cq failed")]
    PollFailed = 101,
}

impl From<WcError> for io::Error {
    #[inline]
    fn from(e: WcError) -> Self {
        Self::new(io::ErrorKind::Other, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_maps_to_wc_error() {
        let wc = WorkCompletion {
            wr_id: 9,
            status: 12,
            byte_len: 0,
            opcode: 0,
            imm_data: None,
        };
        assert!(!wc.is_success());
        assert_eq!(wc.err(), Some(WcError::RetryExc));
    }

    #[test]
    fn unknown_status_maps_to_unexpected() {
        let wc = WorkCompletion {
            wr_id: 0,
            status: 77,
            byte_len: 0,
            opcode: 0,
            imm_data: None,
        };
        assert_eq!(wc.err(), Some(WcError::UnexpectedErr));
    }

    #[test]
    fn success_has_no_error() {
        let wc = WorkCompletion {
            wr_id: 0,
            status: 0,
            byte_len: 16,
            opcode: 0,
            imm_data: Some(3),
        };
        assert!(wc.is_success());
        assert!(wc.err().is_none());
    }
}
