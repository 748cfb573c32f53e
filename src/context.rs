use crate::device::DeviceList;
use crate::error::{Error, Result};
use crate::error_utilities::{log_last_os_err, log_ret_last_os_err_with_note};
use crate::gid::Gid;
use rdma_sys::{
    ibv_close_device, ibv_context, ibv_device_attr, ibv_gid, ibv_open_device, ibv_port_attr,
    ibv_query_device, ibv_query_gid,
};
use std::mem::MaybeUninit;
use std::{fmt::Debug, ptr::NonNull};

/// The physical port every queue pair of this crate runs on
pub(crate) const PORT_NUM: u8 = 1;
/// The gid table index used for addressing
pub(crate) const GID_INDEX: i32 = 0;

/// RDMA device context
pub struct Context {
    /// internal ibv context
    inner_ctx: NonNull<ibv_context>,
    /// ibv port attribute of `PORT_NUM`
    inner_port_attr: ibv_port_attr,
    /// Gid of `PORT_NUM` at `GID_INDEX`
    gid: Gid,
    /// Device attributes
    dev_attr: ibv_device_attr,
}

impl Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("inner_ctx", &self.inner_ctx)
            .field("gid", &self.gid)
            .finish()
    }
}

impl Context {
    /// Get the internal context pointer
    pub(crate) const fn as_ptr(&self) -> *mut ibv_context {
        self.inner_ctx.as_ptr()
    }

    /// Open the device whose kernel name equals `dev_name` and query the
    /// attributes the handshake needs.
    ///
    /// Every call yields a fresh handle; the device is closed when the last
    /// clone of the handle drops. There is no global registry.
    ///
    /// # Errors
    ///
    /// `DeviceNotFound` if no device matches, `DeviceOpenFailed` if
    /// `ibv_open_device` or any of the attribute queries fail.
    pub fn open(dev_name: &str) -> Result<Self> {
        let dev_list = DeviceList::available().map_err(|err| {
            // check if the module ib_uverbs is loaded when this basic verb fails
            Error::DeviceOpenFailed(err)
        })?;

        let dev = dev_list
            .iter()
            .find(|&d| d.name() == dev_name)
            .ok_or_else(|| Error::DeviceNotFound(dev_name.to_owned()))?;

        // SAFETY: ffi
        // `*mut ibv_context` does not associate with the lifetime of `*mut ibv_device`
        let inner_ctx = NonNull::new(unsafe { ibv_open_device(dev.ffi_ptr()) }).ok_or_else(
            || Error::DeviceOpenFailed(log_ret_last_os_err_with_note("ibv_open_device failed")),
        )?;

        drop(dev_list);

        let gid = {
            let mut gid = MaybeUninit::<ibv_gid>::uninit();
            // SAFETY: ffi
            if unsafe { ibv_query_gid(inner_ctx.as_ptr(), PORT_NUM, GID_INDEX, gid.as_mut_ptr()) }
                != 0_i32
            {
                return Err(Error::DeviceOpenFailed(log_ret_last_os_err_with_note(
                    "ibv_query_gid failed",
                )));
            }
            // SAFETY: ffi init
            Gid::from(unsafe { gid.assume_init() })
        };

        // SAFETY: POD FFI type
        let mut inner_port_attr = unsafe { std::mem::zeroed() };
        // SAFETY: ffi
        if unsafe { rdma_sys::___ibv_query_port(inner_ctx.as_ptr(), PORT_NUM, &mut inner_port_attr) }
            != 0_i32
        {
            return Err(Error::DeviceOpenFailed(log_ret_last_os_err_with_note(
                "ibv_query_port failed",
            )));
        }

        let mut dev_attr = MaybeUninit::<ibv_device_attr>::uninit();
        // SAFETY: ffi
        if unsafe { ibv_query_device(inner_ctx.as_ptr(), dev_attr.as_mut_ptr()) } != 0_i32 {
            return Err(Error::DeviceOpenFailed(log_ret_last_os_err_with_note(
                "ibv_query_device failed",
            )));
        }

        Ok(Context {
            inner_ctx,
            inner_port_attr,
            gid,
            // SAFETY: ffi init
            dev_attr: unsafe { dev_attr.assume_init() },
        })
    }

    /// The port gid used for the handshake
    pub(crate) const fn gid(&self) -> Gid {
        self.gid
    }

    /// The port lid used for the handshake
    pub(crate) fn lid(&self) -> u16 {
        self.inner_port_attr.lid
    }

    /// Device attributes as queried at open time
    pub(crate) const fn dev_attr(&self) -> &ibv_device_attr {
        &self.dev_attr
    }
}

/// Check if the device capability meets the requirement of `attr_val`.
pub(crate) fn check_dev_cap<T: PartialOrd + std::fmt::Display>(
    attr_val: &T,
    dev_cap: &T,
    attr_name: &str,
) -> Result<()> {
    if attr_val > dev_cap {
        Err(Error::InvalidState(format!(
            "the value of {} is {}, which exceeds the hardware capability {}",
            attr_name, attr_val, dev_cap
        )))
    } else {
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // SAFETY: ffi
        let errno = unsafe { ibv_close_device(self.as_ptr()) };
        if errno != 0_i32 {
            log_last_os_err();
        }
    }
}

unsafe impl Send for Context {}

unsafe impl Sync for Context {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn open_unknown_device_is_not_found() {
        match Context::open("no-such-rnic") {
            Err(Error::DeviceNotFound(name)) => assert_eq!(name, "no-such-rnic"),
            // hosts without ib_uverbs cannot even enumerate
            Err(Error::DeviceOpenFailed(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn check_dev_cap_rejects_excess() {
        assert!(check_dev_cap(&128_u32, &1024_u32, "max_send_wr").is_ok());
        assert!(check_dev_cap(&2048_u32, &1024_u32, "max_send_wr").is_err());
    }
}
