//! Reliable, multi-stream, bidirectional point-to-point data channels on top
//! of an RDMA reliable-connection queue pair.
//!
//! The crate targets GPU-to-GPU and host-to-host bulk transfer between two
//! peers. Payload buffers may live in host DRAM or GPU device memory; the
//! registration and data paths do not care as long as the pointer is valid
//! for DMA.
//!
//! The per-stream API is symmetric: [`TcclContext::send`] and
//! [`TcclContext::recv`] complete asynchronously through a
//! [`TransferFuture`], and within one stream the N-th send on one side pairs
//! with the N-th recv on the other. Under the hood a small control protocol
//! over the shared queue pair lets the receiver advertise landing slots, so
//! the sender can RDMA-write payloads directly into the receiver's buffers.
//!
//! ```no_run
//! use tccl::{MemoryRegion, RcQueuePair, TcclContext};
//!
//! # fn main() -> tccl::Result<()> {
//! let qp_a = RcQueuePair::create_from_device_name("mlx5_0")?;
//! let qp_b = RcQueuePair::create_from_device_name("mlx5_1")?;
//!
//! // in a real deployment the handshake blobs travel out-of-band
//! qp_a.bring_up(&qp_b.handshake_data())?;
//! qp_b.bring_up(&qp_a.handshake_data())?;
//!
//! let mr_a = MemoryRegion::alloc_host(qp_a.pd(), 1024)?;
//! let mr_b = MemoryRegion::alloc_host(qp_b.pd(), 1024)?;
//!
//! let side_a = TcclContext::create_v1(qp_a)?;
//! let side_b = TcclContext::create_v1(qp_b)?;
//!
//! let recv = side_b.recv(0, mr_b.addr(), 1024, mr_b.rkey())?;
//! let send = side_a.send(0, mr_a.addr(), 1024, mr_a.lkey())?;
//! send.wait()?;
//! recv.wait()?;
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_qualifications,
    clippy::all,
    clippy::pedantic
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::similar_names
)]

/// Access-permission flags for memory regions and queue pairs
mod access;
/// The completion queue and decoded work completions
mod completion_queue;
/// The rdma device context
mod context;
/// Device enumeration
mod device;
/// Crate error types
mod error;
/// Helpers to log and propagate OS errors
mod error_utilities;
/// Gid for device
mod gid;
/// Memory region abstraction
mod memory_region;
/// Protection Domain
mod protection_domain;
/// Queue Pair
mod queue_pair;
/// The transfer-coordination engine
mod tccl;
/// Tickets and the control-frame wire codec
mod ticket;
/// The completion future handed to users
mod transfer_future;
/// Work request construction
mod work_request;

pub use access::AccessFlag;
pub use completion_queue::{WcError, WorkCompletion};
pub use context::Context;
pub use device::{Device, DeviceList, Guid};
pub use error::{BringUpStage, Error, Result};
pub use gid::Gid;
pub use memory_region::{BufferDeleter, MemoryRegion};
pub use protection_domain::ProtectionDomain;
pub use queue_pair::{
    HandshakeData, QueuePairCap, QueuePairCapBuilder, QueuePairState, RcQueuePair,
    HANDSHAKE_DATA_LEN,
};
pub use tccl::{MemCpyFn, TcclContext};
pub use ticket::Ticket;
pub use transfer_future::TransferFuture;

use rdma_sys::ibv_access_flags;

#[macro_use]
extern crate lazy_static;

lazy_static! {
    /// The access every queue pair and memory region of this crate uses:
    /// local write plus remote read and write, what the write-with-imm data
    /// path needs
    pub(crate) static ref DEFAULT_ACCESS: ibv_access_flags =
        ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
}
