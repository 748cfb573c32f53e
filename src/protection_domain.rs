use crate::context::Context;
use crate::error::{Error, Result};
use crate::error_utilities::{last_error, log_last_os_err};
use rdma_sys::{ibv_alloc_pd, ibv_dealloc_pd, ibv_pd};
use std::{ptr::NonNull, sync::Arc};

/// Protection Domain Wrapper
#[derive(Debug)]
pub struct ProtectionDomain {
    /// The device context
    pub(crate) ctx: Arc<Context>,
    /// Internal `ibv_pd` pointer
    inner_pd: NonNull<ibv_pd>,
}

impl ProtectionDomain {
    /// Get pointer to the internal `ibv_pd`
    pub(crate) fn as_ptr(&self) -> *mut ibv_pd {
        self.inner_pd.as_ptr()
    }

    /// Allocate a protection domain scoped to `ctx`.
    ///
    /// All memory regions and queue pairs that are ever to interact must be
    /// created under the same protection domain.
    ///
    /// # Errors
    ///
    /// `PdAllocFailed` if `ibv_alloc_pd` fails.
    pub fn create(ctx: &Arc<Context>) -> Result<Self> {
        // SAFETY: ffi
        let inner_pd = NonNull::new(unsafe { ibv_alloc_pd(ctx.as_ptr()) })
            .ok_or_else(|| Error::PdAllocFailed(last_error()))?;
        Ok(Self {
            ctx: Arc::<Context>::clone(ctx),
            inner_pd,
        })
    }

    /// The device context this protection domain belongs to
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_dealloc_pd(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err();
        }
    }
}

unsafe impl Send for ProtectionDomain {}

unsafe impl Sync for ProtectionDomain {}
