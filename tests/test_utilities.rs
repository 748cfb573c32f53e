//! Shared helpers for the hardware-backed integration tests.
//!
//! The tests drive two RNICs on one host, named by `RNIC_NAME_A` and
//! `RNIC_NAME_B` (default `mlx5_0`/`mlx5_1`). `BUFFER_SIZE` and `CHUNK_SIZE`
//! scale the bulk scenarios.

use std::sync::Arc;
use tccl::{MemoryRegion, RcQueuePair, Result, TcclContext};

/// Env var override with a default
#[allow(unused)]
pub fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_owned())
}

/// Numeric env var override with a default
#[allow(unused)]
pub fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Device name of the first endpoint
#[allow(unused)]
pub fn rnic_a() -> String {
    env_string("RNIC_NAME_A", "mlx5_0")
}

/// Device name of the second endpoint
#[allow(unused)]
pub fn rnic_b() -> String {
    env_string("RNIC_NAME_B", "mlx5_1")
}

/// Bytes moved per bulk scenario
#[allow(unused)]
pub fn buffer_size() -> u64 {
    env_u64("BUFFER_SIZE", 64 * 1024 * 1024)
}

/// Bytes per send/recv call
#[allow(unused)]
pub fn chunk_size() -> u64 {
    env_u64("CHUNK_SIZE", 1024 * 1024)
}

/// Two connected engines plus a registered data buffer on each side
#[allow(unused)]
pub struct TransferPair {
    pub side_a: Arc<TcclContext>,
    pub side_b: Arc<TcclContext>,
    pub mr_a: MemoryRegion,
    pub mr_b: MemoryRegion,
}

/// Create two RTS queue pairs on the two test RNICs, register `len`-byte
/// host buffers and wrap everything in engines
#[allow(unused)]
pub fn transfer_pair(len: usize) -> Result<TransferPair> {
    let qp_a = RcQueuePair::create_from_device_name(&rnic_a())?;
    let qp_b = RcQueuePair::create_from_device_name(&rnic_b())?;

    qp_a.bring_up(&qp_b.handshake_data())?;
    qp_b.bring_up(&qp_a.handshake_data())?;

    let mr_a = MemoryRegion::alloc_host(qp_a.pd(), len)?;
    let mr_b = MemoryRegion::alloc_host(qp_b.pd(), len)?;

    let side_a = TcclContext::create_v1(qp_a)?;
    let side_b = TcclContext::create_v1(qp_b)?;

    Ok(TransferPair {
        side_a,
        side_b,
        mr_a,
        mr_b,
    })
}

/// Fill a registered buffer with a deterministic pattern
#[allow(unused)]
pub fn fill_pattern(mr: &MemoryRegion, seed: u8) {
    // SAFETY: the region owns its host buffer and no transfer references it
    unsafe {
        let base = mr.addr() as *mut u8;
        for i in 0..mr.length() {
            *base.add(i) = (i as u8).wrapping_mul(31).wrapping_add(seed);
        }
    }
}

/// Byte-compare two registered buffers
#[allow(unused)]
pub fn buffers_equal(lhs: &MemoryRegion, rhs: &MemoryRegion, len: usize) -> bool {
    // SAFETY: both regions own host buffers of at least `len` bytes
    unsafe {
        let l = std::slice::from_raw_parts(lhs.addr() as *const u8, len);
        let r = std::slice::from_raw_parts(rhs.addr() as *const u8, len);
        l == r
    }
}
