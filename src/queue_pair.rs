use crate::completion_queue::{CompletionQueue, WorkCompletion};
use crate::context::{check_dev_cap, Context, GID_INDEX, PORT_NUM};
use crate::error::{BringUpStage, Error, Result};
use crate::error_utilities::log_ret_last_os_err;
use crate::gid::Gid;
use crate::protection_domain::ProtectionDomain;
use crate::work_request::{RecvWr, SendWr};
use crate::DEFAULT_ACCESS;
use clippy_utilities::Cast;
use derive_builder::Builder;
use getset::Getters;
use parking_lot::RwLock;
use rdma_sys::{
    ibv_create_qp, ibv_destroy_qp, ibv_modify_qp, ibv_mtu, ibv_post_recv, ibv_post_send, ibv_qp,
    ibv_qp_attr, ibv_qp_attr_mask, ibv_qp_init_attr, ibv_qp_state, ibv_qp_type, ibv_query_qp,
    ibv_recv_wr, ibv_send_wr,
};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, io, ptr::NonNull, sync::Arc};
use tracing::debug;

/// Maximum number of outstanding send work requests
pub(crate) static MAX_SEND_WR: u32 = 128;
/// Maximum number of outstanding receive work requests
pub(crate) static MAX_RECV_WR: u32 = 1024;
/// Scatter-gather elements per send work request
pub(crate) static MAX_SEND_SGE: u32 = 1;
/// Scatter-gather elements per receive work request
pub(crate) static MAX_RECV_SGE: u32 = 1;
/// Largest payload that may be posted inline
pub(crate) static MAX_INLINE_DATA: u32 = 64;
/// Work requests are signaled individually, not queue-wide
pub(crate) static SQ_SIG_ALL: i32 = 0_i32;

/// `pkey_index` for the INIT transition
static PKEY_INDEX: u16 = 0;
/// Path MTU for the RTR transition
static PATH_MTU: u32 = ibv_mtu::IBV_MTU_4096;
/// Inbound RDMA read/atomic depth
static MAX_DEST_RD_ATOMIC: u8 = 16;
/// RNR NAK timer, 0 selects the hardware default (655.36 ms)
static MIN_RNR_TIMER: u8 = 0;
/// Hop limit for the address handle
static HOP_LIMIT: u8 = 0xff;
/// The address handle always carries a GRH
static IS_GLOBAL: u8 = 1;
/// ACK timeout exponent for the RTS transition (4.096 us * 2^14)
static TIMEOUT: u8 = 14;
/// Transport retry budget
static RETRY_CNT: u8 = 7;
/// RNR retry 7 retries forever
static RNR_RETRY: u8 = 7;
/// Outbound RDMA read/atomic depth
static MAX_RD_ATOMIC: u8 = 16;
/// Packet sequence numbers are 24 bits wide
static PSN_MASK: u32 = 0x00FF_FFFF;

/// The requested capacities of a newly created queue pair.
///
/// The defaults match what the transfer engine assumes: a deep receive queue
/// for pre-posted control slots and a moderate send queue that the engine
/// back-pressures against.
#[derive(Debug, Clone, Copy, Getters, Builder)]
#[builder(derive(Debug, Copy))]
#[getset(get = "pub")]
pub struct QueuePairCap {
    /// Maximum number of outstanding send-queue work requests
    #[builder(default = "MAX_SEND_WR")]
    max_send_wr: u32,
    /// Maximum number of outstanding receive-queue work requests
    #[builder(default = "MAX_RECV_WR")]
    max_recv_wr: u32,
    /// Maximum scatter/gather elements per send work request
    #[builder(default = "MAX_SEND_SGE")]
    max_send_sge: u32,
    /// Maximum scatter/gather elements per receive work request
    #[builder(default = "MAX_RECV_SGE")]
    max_recv_sge: u32,
    /// Maximum inline payload size in bytes
    #[builder(default = "MAX_INLINE_DATA")]
    max_inline_data: u32,
}

impl Default for QueuePairCap {
    fn default() -> Self {
        // the builder defaults are total, this cannot fail
        #[allow(clippy::unwrap_used)]
        QueuePairCapBuilder::default().build().unwrap()
    }
}

impl QueuePairCap {
    /// Reject capacities the device cannot provide
    pub(crate) fn check_dev_qp_cap(&self, ctx: &Context) -> Result<()> {
        let dev_attr = ctx.dev_attr();
        check_dev_cap(&self.max_send_sge, &dev_attr.max_sge.cast(), "max_send_sge")?;
        check_dev_cap(&self.max_recv_sge, &dev_attr.max_sge.cast(), "max_recv_sge")?;
        check_dev_cap(&self.max_send_wr, &dev_attr.max_qp_wr.cast(), "max_send_wr")?;
        check_dev_cap(&self.max_recv_wr, &dev_attr.max_qp_wr.cast(), "max_recv_wr")?;
        Ok(())
    }
}

/// The out-of-band blob one peer needs to bring the other's queue pair up.
///
/// The application exchanges it over any channel it likes (sockets, files,
/// an MPI barrier). The fixed wire form is 22 bytes:
/// `gid (16 B) | lid (u16 LE) | qp_num (u32 LE)`.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Getters)]
#[getset(get = "pub")]
pub struct HandshakeData {
    /// Port gid of the peer
    gid: Gid,
    /// Port lid of the peer
    lid: u16,
    /// Queue pair number of the peer
    qp_num: u32,
}

/// Byte length of the fixed handshake wire form
pub const HANDSHAKE_DATA_LEN: usize = 22;

impl HandshakeData {
    /// Pack into the fixed 22-byte wire form
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HANDSHAKE_DATA_LEN] {
        let mut buf = [0_u8; HANDSHAKE_DATA_LEN];
        buf[..16].copy_from_slice(self.gid.as_bytes());
        buf[16..18].copy_from_slice(&self.lid.to_le_bytes());
        buf[18..].copy_from_slice(&self.qp_num.to_le_bytes());
        buf
    }

    /// Unpack from the fixed 22-byte wire form
    #[must_use]
    pub fn from_bytes(buf: &[u8; HANDSHAKE_DATA_LEN]) -> Self {
        let mut gid = [0_u8; 16];
        gid.copy_from_slice(&buf[..16]);
        // the slices are exactly 2 and 4 bytes long
        #[allow(clippy::unwrap_used)]
        Self {
            gid: Gid::from_bytes(gid),
            lid: u16::from_le_bytes(buf[16..18].try_into().unwrap()),
            qp_num: u32::from_le_bytes(buf[18..].try_into().unwrap()),
        }
    }
}

/// The state of a queue pair
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePairState {
    /// IBV_QPS_RESET, the creation state
    Reset,
    /// IBV_QPS_INIT
    Init,
    /// IBV_QPS_RTR, ready to receive
    ReadyToRecv,
    /// IBV_QPS_RTS, ready to send
    ReadyToSend,
    /// Every other state, diagnostic only
    Unknown,
}

impl From<u32> for QueuePairState {
    #[inline]
    fn from(num: u32) -> Self {
        if num == ibv_qp_state::IBV_QPS_RESET {
            Self::Reset
        } else if num == ibv_qp_state::IBV_QPS_INIT {
            Self::Init
        } else if num == ibv_qp_state::IBV_QPS_RTR {
            Self::ReadyToRecv
        } else if num == ibv_qp_state::IBV_QPS_RTS {
            Self::ReadyToSend
        } else {
            Self::Unknown
        }
    }
}

/// A reliable-connection queue pair with dedicated send and receive
/// completion queues.
///
/// Created in RESET; `bring_up` drives it to RTS from the peer's
/// [`HandshakeData`]. A queue pair that has reached RTS is never reset by
/// this crate.
pub struct RcQueuePair {
    /// internal `ibv_qp` pointer, destroyed before the completion queues
    inner_qp: NonNull<ibv_qp>,
    /// completion queue for the send queue; declared before the protection
    /// domain so the context outlives both queues
    send_cq: CompletionQueue,
    /// completion queue for the receive queue
    recv_cq: CompletionQueue,
    /// protection domain it belongs to
    pd: Arc<ProtectionDomain>,
    /// requested capacities
    cap: QueuePairCap,
    /// cached state, kept in sync by `bring_up`
    cur_state: RwLock<QueuePairState>,
}

impl Debug for RcQueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RcQueuePair")
            .field("inner_qp", &self.inner_qp)
            .field("qp_num", &self.qp_num())
            .field("cap", &self.cap)
            .finish()
    }
}

impl RcQueuePair {
    /// get `ibv_qp` pointer
    pub(crate) fn as_ptr(&self) -> *mut ibv_qp {
        self.inner_qp.as_ptr()
    }

    /// Create a queue pair in RESET under `pd` with the default capacities
    pub fn create(pd: &Arc<ProtectionDomain>) -> Result<Self> {
        Self::create_with_cap(pd, QueuePairCap::default())
    }

    /// Create a queue pair under a fresh protection domain of `ctx`
    pub fn create_from_context(ctx: &Arc<Context>) -> Result<Self> {
        let pd = Arc::new(ProtectionDomain::create(ctx)?);
        Self::create(&pd)
    }

    /// Open `dev_name` and create a queue pair on it, owning the whole
    /// context chain
    pub fn create_from_device_name(dev_name: &str) -> Result<Self> {
        let ctx = Arc::new(Context::open(dev_name)?);
        Self::create_from_context(&ctx)
    }

    /// Create a queue pair in RESET under `pd` with explicit capacities
    pub fn create_with_cap(pd: &Arc<ProtectionDomain>, cap: QueuePairCap) -> Result<Self> {
        cap.check_dev_qp_cap(&pd.ctx)?;

        // CQs must exist before the QP and outlive it
        let send_cq = CompletionQueue::create(&pd.ctx, cap.max_send_wr)?;
        let recv_cq = CompletionQueue::create(&pd.ctx, cap.max_recv_wr)?;

        // SAFETY: POD FFI type
        let mut init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
        init_attr.send_cq = send_cq.as_ptr();
        init_attr.recv_cq = recv_cq.as_ptr();
        init_attr.cap.max_send_wr = cap.max_send_wr;
        init_attr.cap.max_recv_wr = cap.max_recv_wr;
        init_attr.cap.max_send_sge = cap.max_send_sge;
        init_attr.cap.max_recv_sge = cap.max_recv_sge;
        init_attr.cap.max_inline_data = cap.max_inline_data;
        init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        init_attr.sq_sig_all = SQ_SIG_ALL;

        // SAFETY: ffi
        let inner_qp = NonNull::new(unsafe { ibv_create_qp(pd.as_ptr(), &mut init_attr) })
            .ok_or_else(|| Error::QpCreateFailed(log_ret_last_os_err()))?;

        Ok(Self {
            inner_qp,
            send_cq,
            recv_cq,
            pd: Arc::<ProtectionDomain>::clone(pd),
            cap,
            cur_state: RwLock::new(QueuePairState::Reset),
        })
    }

    /// The protection domain this queue pair belongs to
    pub fn pd(&self) -> &Arc<ProtectionDomain> {
        &self.pd
    }

    /// The requested capacities
    pub fn cap(&self) -> &QueuePairCap {
        &self.cap
    }

    /// The queue pair number
    pub fn qp_num(&self) -> u32 {
        // SAFETY: valid while self is alive
        unsafe { (*self.as_ptr()).qp_num }
    }

    /// Query the hardware for the current state
    pub fn query_state(&self) -> Result<QueuePairState> {
        // SAFETY: POD FFI type
        let mut qp_attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        // SAFETY: POD FFI type
        let mut qp_init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
        let mask = ibv_qp_attr_mask::IBV_QP_STATE;
        // SAFETY: ffi
        let errno = unsafe {
            ibv_query_qp(self.as_ptr(), &mut qp_attr, mask.0.cast(), &mut qp_init_attr)
        };
        if errno != 0_i32 {
            return Err(Error::InvalidState(format!(
                "ibv_query_qp failed: {}",
                io::Error::from_raw_os_error(errno)
            )));
        }
        let state = QueuePairState::from(qp_attr.qp_state);
        *self.cur_state.write() = state;
        Ok(state)
    }

    /// The locally cached state, without touching the hardware
    pub fn cached_state(&self) -> QueuePairState {
        *self.cur_state.read()
    }

    /// The handshake blob this side must hand to its peer out-of-band
    pub fn handshake_data(&self) -> HandshakeData {
        HandshakeData {
            gid: self.pd.ctx.gid(),
            lid: self.pd.ctx.lid(),
            qp_num: self.qp_num(),
        }
    }

    /// Drive RESET -> INIT -> RTR -> RTS from the peer's handshake blob.
    ///
    /// Calling this on a queue pair that already reached RTS is a no-op.
    /// The packet sequence numbers follow a fixed convention: each side
    /// starts its send queue at its own `qp_num & 0xFFFFFF`, so the
    /// receive-queue PSN is the peer's masked queue pair number.
    ///
    /// # Errors
    ///
    /// `InvalidState` when the queue pair is neither RESET nor RTS,
    /// `BringUpFailed(stage)` when a modify-QP call fails; the queue pair is
    /// unusable afterwards.
    pub fn bring_up(&self, peer: &HandshakeData) -> Result<()> {
        match self.query_state()? {
            QueuePairState::ReadyToSend => {
                debug!(
                    "bring_up called on qp {} which is already RTS, nothing to do",
                    self.qp_num()
                );
                return Ok(());
            }
            QueuePairState::Reset => {}
            state => {
                return Err(Error::InvalidState(format!(
                    "bring_up requires a RESET queue pair, found {state:?}"
                )))
            }
        }

        self.modify_to_init().map_err(|source| Error::BringUpFailed {
            stage: BringUpStage::Init,
            source,
        })?;
        self.modify_to_rtr(peer)
            .map_err(|source| Error::BringUpFailed {
                stage: BringUpStage::ReadyToRecv,
                source,
            })?;
        self.modify_to_rts().map_err(|source| Error::BringUpFailed {
            stage: BringUpStage::ReadyToSend,
            source,
        })?;
        debug!(
            "qp {} is RTS, peer qp {} lid {}",
            self.qp_num(),
            peer.qp_num,
            peer.lid
        );
        Ok(())
    }

    /// RESET -> INIT
    fn modify_to_init(&self) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = PKEY_INDEX;
        attr.port_num = PORT_NUM;
        attr.qp_access_flags = DEFAULT_ACCESS.0;
        let flags = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT
            | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
        // SAFETY: ffi, the qp is not modified concurrently
        let errno = unsafe { ibv_modify_qp(self.as_ptr(), &mut attr, flags.0.cast()) };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err());
        }
        *self.cur_state.write() = QueuePairState::Init;
        Ok(())
    }

    /// INIT -> RTR
    fn modify_to_rtr(&self, peer: &HandshakeData) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = PATH_MTU;
        attr.dest_qp_num = peer.qp_num;
        attr.rq_psn = peer.qp_num & PSN_MASK;
        attr.max_dest_rd_atomic = MAX_DEST_RD_ATOMIC;
        attr.min_rnr_timer = MIN_RNR_TIMER;
        attr.ah_attr.grh.dgid = peer.gid.into();
        attr.ah_attr.grh.sgid_index = GID_INDEX.cast();
        attr.ah_attr.grh.hop_limit = HOP_LIMIT;
        attr.ah_attr.dlid = peer.lid;
        attr.ah_attr.is_global = IS_GLOBAL;
        attr.ah_attr.port_num = PORT_NUM;
        let flags = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_AV
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        // SAFETY: ffi, the qp is not modified concurrently
        let errno = unsafe { ibv_modify_qp(self.as_ptr(), &mut attr, flags.0.cast()) };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err());
        }
        *self.cur_state.write() = QueuePairState::ReadyToRecv;
        Ok(())
    }

    /// RTR -> RTS
    fn modify_to_rts(&self) -> io::Result<()> {
        // SAFETY: POD FFI type
        let mut attr = unsafe { std::mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.timeout = TIMEOUT;
        attr.retry_cnt = RETRY_CNT;
        attr.rnr_retry = RNR_RETRY;
        attr.sq_psn = self.qp_num() & PSN_MASK;
        attr.max_rd_atomic = MAX_RD_ATOMIC;
        let flags = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
        // SAFETY: ffi, the qp is not modified concurrently
        let errno = unsafe { ibv_modify_qp(self.as_ptr(), &mut attr, flags.0.cast()) };
        if errno != 0_i32 {
            return Err(log_ret_last_os_err());
        }
        *self.cur_state.write() = QueuePairState::ReadyToSend;
        Ok(())
    }

    /// Hand a built send work request to the hardware
    fn submit_send_wr(&self, wr: &mut SendWr) -> Result<()> {
        let mut bad_wr = std::ptr::null_mut::<ibv_send_wr>();
        // SAFETY: ffi, only one thread posts to the send queue
        let errno = unsafe { ibv_post_send(self.as_ptr(), wr.as_mut(), &mut bad_wr) };
        if errno != 0_i32 {
            return Err(Error::PostFailed(errno));
        }
        Ok(())
    }

    /// Post a SEND of `[laddr, laddr+length)`
    pub fn post_send(
        &self,
        wr_id: u64,
        laddr: u64,
        length: u32,
        lkey: u32,
        signaled: bool,
    ) -> Result<()> {
        let mut wr = SendWr::new_send(wr_id, laddr, length, lkey, None, signaled);
        self.submit_send_wr(&mut wr)
    }

    /// Post a SEND_WITH_IMM of `[laddr, laddr+length)`
    pub fn post_send_with_imm(
        &self,
        wr_id: u64,
        laddr: u64,
        length: u32,
        lkey: u32,
        imm: u32,
        signaled: bool,
    ) -> Result<()> {
        let mut wr = SendWr::new_send(wr_id, laddr, length, lkey, Some(imm), signaled);
        self.submit_send_wr(&mut wr)
    }

    /// Post an RDMA_WRITE of `[laddr, laddr+length)` into the peer's
    /// `[raddr, raddr+length)`
    #[allow(clippy::too_many_arguments)]
    pub fn post_write(
        &self,
        wr_id: u64,
        laddr: u64,
        raddr: u64,
        length: u32,
        lkey: u32,
        rkey: u32,
        signaled: bool,
    ) -> Result<()> {
        let mut wr = SendWr::new_write(wr_id, laddr, raddr, length, lkey, rkey, None, signaled);
        self.submit_send_wr(&mut wr)
    }

    /// Post an RDMA_WRITE_WITH_IMM; the peer consumes a receive work request
    /// and observes `imm` in its completion
    #[allow(clippy::too_many_arguments)]
    pub fn post_write_with_imm(
        &self,
        wr_id: u64,
        laddr: u64,
        raddr: u64,
        length: u32,
        imm: u32,
        lkey: u32,
        rkey: u32,
        signaled: bool,
    ) -> Result<()> {
        let mut wr =
            SendWr::new_write(wr_id, laddr, raddr, length, lkey, rkey, Some(imm), signaled);
        self.submit_send_wr(&mut wr)
    }

    /// Post an RDMA_READ of the peer's `[raddr, raddr+length)` into
    /// `[laddr, laddr+length)`
    #[allow(clippy::too_many_arguments)]
    pub fn post_read(
        &self,
        wr_id: u64,
        laddr: u64,
        raddr: u64,
        length: u32,
        lkey: u32,
        rkey: u32,
        signaled: bool,
    ) -> Result<()> {
        let mut wr = SendWr::new_read(wr_id, laddr, raddr, length, lkey, rkey, signaled);
        self.submit_send_wr(&mut wr)
    }

    /// Post a receive work request for `[addr, addr+length)`; matches an
    /// inbound SEND or is consumed by an inbound RDMA_WRITE_WITH_IMM
    pub fn post_recv(&self, wr_id: u64, addr: u64, length: u32, lkey: u32) -> Result<()> {
        let mut wr = RecvWr::new(wr_id, addr, length, lkey);
        let mut bad_wr = std::ptr::null_mut::<ibv_recv_wr>();
        // SAFETY: ffi, only one thread posts to the receive queue
        let errno = unsafe { ibv_post_recv(self.as_ptr(), wr.as_mut(), &mut bad_wr) };
        if errno != 0_i32 {
            return Err(Error::PostFailed(errno));
        }
        Ok(())
    }

    /// Poll the send completion queue once, returning `0..=max` entries
    pub fn poll_send_cq_once(&self, max: usize) -> Result<Vec<WorkCompletion>> {
        self.send_cq.poll_once(max)
    }

    /// Poll the receive completion queue once, returning `0..=max` entries
    pub fn poll_recv_cq_once(&self, max: usize) -> Result<Vec<WorkCompletion>> {
        self.recv_cq.poll_once(max)
    }

    /// Busy-poll the send completion queue until at least `num_expected`
    /// completions have been drained
    pub fn wait_until_send_completion(&self, num_expected: usize) -> Result<Vec<WorkCompletion>> {
        self.send_cq.wait_until(num_expected)
    }

    /// Busy-poll the receive completion queue until at least `num_expected`
    /// completions have been drained
    pub fn wait_until_recv_completion(&self, num_expected: usize) -> Result<Vec<WorkCompletion>> {
        self.recv_cq.wait_until(num_expected)
    }
}

impl Drop for RcQueuePair {
    fn drop(&mut self) {
        // SAFETY: ffi, runs before the member CQs drop
        let errno = unsafe { ibv_destroy_qp(self.as_ptr()) };
        debug_assert_eq!(errno, 0_i32, "ibv_destroy_qp failed");
    }
}

unsafe impl Send for RcQueuePair {}

unsafe impl Sync for RcQueuePair {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_defaults_match_engine_assumptions() {
        let cap = QueuePairCap::default();
        assert_eq!(*cap.max_send_wr(), 128);
        assert_eq!(*cap.max_recv_wr(), 1024);
        assert_eq!(*cap.max_send_sge(), 1);
        assert_eq!(*cap.max_recv_sge(), 1);
        assert_eq!(*cap.max_inline_data(), 64);
    }

    #[test]
    fn cap_builder_overrides() {
        #[allow(clippy::unwrap_used)]
        let cap = QueuePairCapBuilder::default()
            .max_send_wr(256)
            .build()
            .unwrap();
        assert_eq!(*cap.max_send_wr(), 256);
        assert_eq!(*cap.max_recv_wr(), 1024);
    }

    #[test]
    fn handshake_blob_round_trip() {
        let mut gid = [0_u8; 16];
        gid[15] = 0xfe;
        gid[0] = 0xab;
        let data = HandshakeData {
            gid: Gid::from_bytes(gid),
            lid: 0x1234,
            qp_num: 0xdead_beef,
        };
        let bytes = data.to_bytes();
        assert_eq!(bytes.len(), HANDSHAKE_DATA_LEN);
        assert_eq!(HandshakeData::from_bytes(&bytes), data);
    }

    #[test]
    fn qp_state_from_raw() {
        assert_eq!(
            QueuePairState::from(ibv_qp_state::IBV_QPS_RESET),
            QueuePairState::Reset
        );
        assert_eq!(
            QueuePairState::from(ibv_qp_state::IBV_QPS_RTS),
            QueuePairState::ReadyToSend
        );
        assert_eq!(
            QueuePairState::from(ibv_qp_state::IBV_QPS_ERR),
            QueuePairState::Unknown
        );
    }
}
