use crate::access::{flags_into_ibv_access, ibv_access_into_flags, AccessFlag};
use crate::error::{Error, Result};
use crate::error_utilities::{last_error, log_last_os_err};
use crate::protection_domain::ProtectionDomain;
use crate::DEFAULT_ACCESS;
use clippy_utilities::Cast;
use enumflags2::BitFlags;
use rdma_sys::{ibv_access_flags, ibv_dereg_mr, ibv_mr, ibv_reg_mr};
use std::fmt::Debug;
use std::ptr::NonNull;
use std::sync::Arc;

/// Type-erased deleter invoked after a memory region is deregistered
pub type BufferDeleter = Box<dyn FnOnce(*mut u8) + Send>;

/// How the registered buffer is owned
enum BufferOwnership {
    /// The region owns the buffer and frees it through the deleter.
    /// Required when the buffer came from an external allocator, e.g. GPU
    /// device memory.
    Owned(Option<BufferDeleter>),
    /// The caller keeps the buffer alive for at least as long as the region
    Borrowed,
}

impl Debug for BufferOwnership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Owned(_) => write!(f, "Owned"),
            Self::Borrowed => write!(f, "Borrowed"),
        }
    }
}

/// A pinned, DMA-registered buffer described by `{addr, length, lkey, rkey}`.
///
/// The buffer may live in host DRAM or in GPU device memory; the registration
/// path is the same as long as the pointer is valid for `ibv_reg_mr`.
#[derive(Debug)]
pub struct MemoryRegion {
    /// the internal `ibv_mr` pointer
    inner_mr: NonNull<ibv_mr>,
    /// start address of the registered buffer
    addr: *mut u8,
    /// length of the registered buffer
    len: usize,
    /// backing-buffer ownership
    buffer: BufferOwnership,
    /// the access flags the region registered with
    access: ibv_access_flags,
    /// the protection domain the region belongs to
    pd: Arc<ProtectionDomain>,
}

impl MemoryRegion {
    /// Register a buffer the region takes ownership of. The `deleter` is
    /// called with the buffer address after deregistration, so GPU memory
    /// managed by an external allocator can be handed over safely.
    ///
    /// # Errors
    ///
    /// `MrRegisterFailed` if `ibv_reg_mr` fails; the deleter is invoked
    /// before the error returns, the buffer is not leaked.
    pub fn create_owned(
        pd: &Arc<ProtectionDomain>,
        addr: NonNull<u8>,
        len: usize,
        deleter: impl FnOnce(*mut u8) + Send + 'static,
    ) -> Result<Self> {
        let deleter: BufferDeleter = Box::new(deleter);
        let access = *DEFAULT_ACCESS;
        match Self::register(pd, addr.as_ptr(), len, access) {
            Ok(inner_mr) => Ok(Self {
                inner_mr,
                addr: addr.as_ptr(),
                len,
                buffer: BufferOwnership::Owned(Some(deleter)),
                access,
                pd: Arc::<ProtectionDomain>::clone(pd),
            }),
            Err(err) => {
                deleter(addr.as_ptr());
                Err(err)
            }
        }
    }

    /// Register a buffer the caller keeps alive.
    ///
    /// # Safety
    ///
    /// The buffer `[addr, addr+len)` must stay valid and must not be freed
    /// until this region (and every work request referencing it) is gone.
    pub unsafe fn create_borrowed(
        pd: &Arc<ProtectionDomain>,
        addr: *mut u8,
        len: usize,
    ) -> Result<Self> {
        Self::create_borrowed_with_access(pd, addr, len, ibv_access_into_flags(*DEFAULT_ACCESS))
    }

    /// Register a caller-kept buffer with explicit access flags, for callers
    /// that need more than the default local-write/remote-read/remote-write.
    ///
    /// # Safety
    ///
    /// Same contract as [`MemoryRegion::create_borrowed`].
    pub unsafe fn create_borrowed_with_access(
        pd: &Arc<ProtectionDomain>,
        addr: *mut u8,
        len: usize,
        access: BitFlags<AccessFlag>,
    ) -> Result<Self> {
        let access = flags_into_ibv_access(access);
        let inner_mr = Self::register(pd, addr, len, access)?;
        Ok(Self {
            inner_mr,
            addr,
            len,
            buffer: BufferOwnership::Borrowed,
            access,
            pd: Arc::<ProtectionDomain>::clone(pd),
        })
    }

    /// Allocate a zero-initialized host buffer of `len` bytes and register
    /// it owned. Used for control staging rings and host-side data buffers.
    ///
    /// # Errors
    ///
    /// `MrRegisterFailed` on allocation or registration failure.
    pub fn alloc_host(pd: &Arc<ProtectionDomain>, len: usize) -> Result<Self> {
        // SAFETY: ffi, len is nonzero for every caller in this crate
        let buf = unsafe { libc::calloc(1, len) };
        let addr = NonNull::new(buf.cast::<u8>())
            .ok_or_else(|| Error::MrRegisterFailed(last_error()))?;
        // SAFETY: ffi, the pointer came from calloc
        Self::create_owned(pd, addr, len, |ptr| unsafe { libc::free(ptr.cast()) })
    }

    /// Do the `ibv_reg_mr` call
    fn register(
        pd: &Arc<ProtectionDomain>,
        addr: *mut u8,
        len: usize,
        access: ibv_access_flags,
    ) -> Result<NonNull<ibv_mr>> {
        // SAFETY: ffi
        NonNull::new(unsafe { ibv_reg_mr(pd.as_ptr(), addr.cast(), len, access.0.cast()) })
            .ok_or_else(|| Error::MrRegisterFailed(last_error()))
    }

    /// Start address of the registered buffer
    #[inline]
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.addr as u64
    }

    /// Length of the registered buffer in bytes
    #[inline]
    #[must_use]
    pub fn length(&self) -> usize {
        self.len
    }

    /// The local access key
    #[inline]
    #[must_use]
    pub fn lkey(&self) -> u32 {
        // SAFETY: valid while self is alive
        unsafe { self.inner_mr.as_ref() }.lkey
    }

    /// The remote access key
    #[inline]
    #[must_use]
    pub fn rkey(&self) -> u32 {
        // SAFETY: valid while self is alive
        unsafe { self.inner_mr.as_ref() }.rkey
    }

    /// The access flags the region registered with
    #[must_use]
    pub fn access(&self) -> BitFlags<AccessFlag> {
        ibv_access_into_flags(self.access)
    }

    /// The protection domain the region was registered under
    pub fn pd(&self) -> &Arc<ProtectionDomain> {
        &self.pd
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // SAFETY: ffi, deregister before the backing buffer is freed
        let errno = unsafe { ibv_dereg_mr(self.inner_mr.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err();
        }
        if let BufferOwnership::Owned(ref mut deleter) = self.buffer {
            if let Some(deleter) = deleter.take() {
                deleter(self.addr);
            }
        }
    }
}

unsafe impl Send for MemoryRegion {}

unsafe impl Sync for MemoryRegion {}
