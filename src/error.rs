use crate::completion_queue::WcError;
use std::io;
use thiserror::Error;

/// Crate-level result alias
pub type Result<T> = std::result::Result<T, Error>;

/// The modify-QP stage that failed during `bring_up`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpStage {
    /// RESET -> INIT
    Init,
    /// INIT -> RTR
    ReadyToRecv,
    /// RTR -> RTS
    ReadyToSend,
}

impl std::fmt::Display for BringUpStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Init => write!(f, "RESET->INIT"),
            Self::ReadyToRecv => write!(f, "INIT->RTR"),
            Self::ReadyToSend => write!(f, "RTR->RTS"),
        }
    }
}

/// Errors surfaced by this crate
#[derive(Error, Debug)]
pub enum Error {
    /// No device with the requested name exists on this host
    #[error("rdma device {0:?} not found")]
    DeviceNotFound(String),
    /// The device exists but opening or querying it failed
    #[error("failed to open rdma device")]
    DeviceOpenFailed(#[source] io::Error),
    /// `ibv_alloc_pd` failed
    #[error("failed to allocate protection domain")]
    PdAllocFailed(#[source] io::Error),
    /// `ibv_reg_mr` failed
    #[error("failed to register memory region")]
    MrRegisterFailed(#[source] io::Error),
    /// `ibv_create_cq` failed
    #[error("failed to create completion queue")]
    CqCreateFailed(#[source] io::Error),
    /// `ibv_create_qp` failed
    #[error("failed to create queue pair")]
    QpCreateFailed(#[source] io::Error),
    /// A modify-QP call failed while driving the state machine
    #[error("queue pair bring-up failed at stage {stage}")]
    BringUpFailed {
        /// The transition that failed
        stage: BringUpStage,
        /// The underlying OS error
        #[source]
        source: io::Error,
    },
    /// `ibv_post_send`/`ibv_post_recv` returned a nonzero errno
    #[error("failed to post work request, errno {0}")]
    PostFailed(i32),
    /// The hardware reported a non-success work completion
    #[error("work completion failed")]
    WcFailed(#[source] WcError),
    /// A send and its paired recv disagreed on the transfer length
    #[error(
        "length mismatch on stream {stream_id}: local {local} bytes, remote {remote} bytes"
    )]
    LengthMismatch {
        /// The stream the pairing happened on
        stream_id: u32,
        /// Length of the local request
        local: u32,
        /// Length of the remote request
        remote: u32,
    },
    /// The request was dropped before the transfer could run
    #[error("transfer cancelled")]
    Cancelled,
    /// The operation is not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_display() {
        assert_eq!(BringUpStage::Init.to_string(), "RESET->INIT");
        assert_eq!(BringUpStage::ReadyToRecv.to_string(), "INIT->RTR");
        assert_eq!(BringUpStage::ReadyToSend.to_string(), "RTR->RTS");
    }

    #[test]
    fn length_mismatch_message_names_both_sides() {
        let err = Error::LengthMismatch {
            stream_id: 7,
            local: 1024,
            remote: 2048,
        };
        let msg = err.to_string();
        assert!(msg.contains("stream 7"));
        assert!(msg.contains("1024"));
        assert!(msg.contains("2048"));
    }
}
