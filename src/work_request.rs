use clippy_utilities::Cast;
use rdma_sys::{ibv_recv_wr, ibv_send_flags, ibv_send_wr, ibv_sge, ibv_wr_opcode};

/// Send-queue work request over a single scatter-gather element.
///
/// The sge lives in a `Vec` so its address stays stable if the wrapper is
/// moved between construction and posting.
#[repr(C)]
pub(crate) struct SendWr {
    /// internal `ibv_send_wr`
    inner: ibv_send_wr,
    /// the single `ibv_sge` referenced by `inner.sg_list`
    sges: Vec<ibv_sge>,
}

impl SendWr {
    /// Build the common part: one sge, opcode and flags left for the callers
    fn with_sge(wr_id: u64, laddr: u64, length: u32, lkey: u32, signaled: bool) -> Self {
        let mut sges = vec![ibv_sge {
            addr: laddr,
            length,
            lkey,
        }];
        // SAFETY: POD FFI type
        let mut inner = unsafe { std::mem::zeroed::<ibv_send_wr>() };
        inner.next = std::ptr::null_mut();
        inner.wr_id = wr_id;
        inner.sg_list = sges.as_mut_ptr();
        inner.num_sge = sges.len().cast();
        if signaled {
            inner.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        }
        Self { inner, sges }
    }

    /// SEND, or SEND_WITH_IMM when `imm` is present
    pub(crate) fn new_send(
        wr_id: u64,
        laddr: u64,
        length: u32,
        lkey: u32,
        imm: Option<u32>,
        signaled: bool,
    ) -> Self {
        let mut sr = Self::with_sge(wr_id, laddr, length, lkey, signaled);
        match imm {
            None => sr.inner.opcode = ibv_wr_opcode::IBV_WR_SEND,
            Some(imm_num) => {
                sr.inner.opcode = ibv_wr_opcode::IBV_WR_SEND_WITH_IMM;
                sr.inner.imm_data_invalidated_rkey_union.imm_data = imm_num;
            }
        }
        sr
    }

    /// RDMA_WRITE, or RDMA_WRITE_WITH_IMM when `imm` is present
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_write(
        wr_id: u64,
        laddr: u64,
        raddr: u64,
        length: u32,
        lkey: u32,
        rkey: u32,
        imm: Option<u32>,
        signaled: bool,
    ) -> Self {
        let mut sr = Self::with_sge(wr_id, laddr, length, lkey, signaled);
        sr.inner.wr.rdma.remote_addr = raddr;
        sr.inner.wr.rdma.rkey = rkey;
        match imm {
            None => sr.inner.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            Some(imm_num) => {
                sr.inner.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM;
                sr.inner.imm_data_invalidated_rkey_union.imm_data = imm_num;
            }
        }
        sr
    }

    /// RDMA_READ from `raddr` into `laddr`
    pub(crate) fn new_read(
        wr_id: u64,
        laddr: u64,
        raddr: u64,
        length: u32,
        lkey: u32,
        rkey: u32,
        signaled: bool,
    ) -> Self {
        let mut sr = Self::with_sge(wr_id, laddr, length, lkey, signaled);
        sr.inner.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
        sr.inner.wr.rdma.remote_addr = raddr;
        sr.inner.wr.rdma.rkey = rkey;
        sr
    }
}

impl AsRef<ibv_send_wr> for SendWr {
    fn as_ref(&self) -> &ibv_send_wr {
        &self.inner
    }
}

impl AsMut<ibv_send_wr> for SendWr {
    fn as_mut(&mut self) -> &mut ibv_send_wr {
        &mut self.inner
    }
}

/// Receive-queue work request over a single scatter-gather element
#[repr(C)]
pub(crate) struct RecvWr {
    /// internal `ibv_recv_wr`
    inner: ibv_recv_wr,
    /// the single `ibv_sge` referenced by `inner.sg_list`
    sges: Vec<ibv_sge>,
}

impl RecvWr {
    /// Buffer `[addr, addr+length)` receives the next inbound SEND, or is
    /// consumed untouched by an inbound RDMA_WRITE_WITH_IMM
    pub(crate) fn new(wr_id: u64, addr: u64, length: u32, lkey: u32) -> Self {
        let mut sges = vec![ibv_sge { addr, length, lkey }];
        // SAFETY: POD FFI type
        let mut inner = unsafe { std::mem::zeroed::<ibv_recv_wr>() };
        inner.next = std::ptr::null_mut();
        inner.wr_id = wr_id;
        inner.sg_list = sges.as_mut_ptr();
        inner.num_sge = sges.len().cast();
        Self { inner, sges }
    }
}

impl AsRef<ibv_recv_wr> for RecvWr {
    fn as_ref(&self) -> &ibv_recv_wr {
        &self.inner
    }
}

impl AsMut<ibv_recv_wr> for RecvWr {
    fn as_mut(&mut self) -> &mut ibv_recv_wr {
        &mut self.inner
    }
}
