use crate::error_utilities::last_error;

use rdma_sys::__be64;
use rdma_sys::ibv_device;
use rdma_sys::{ibv_free_device_list, ibv_get_device_list};
use rdma_sys::{ibv_get_device_guid, ibv_get_device_name};

use std::ffi::CStr;
use std::io;
use std::ops::Deref;
use std::os::raw::c_int;
use std::ptr::NonNull;
use std::{fmt, slice};

use numeric_cast::NumericCast;
use scopeguard::guard_on_unwind;

/// The list of RDMA devices present on this host, as reported by
/// `ibv_get_device_list`. Freed on drop.
pub struct DeviceList {
    /// first entry of the NULL-terminated ffi array
    head: NonNull<Device>,
    /// number of entries
    len: usize,
}

/// SAFETY: the list owns its ffi array
unsafe impl Send for DeviceList {}
/// SAFETY: the list owns its ffi array
unsafe impl Sync for DeviceList {}

/// One RDMA device entry, borrowed from a [`DeviceList`]
#[allow(missing_copy_implementations)] // a device entry is not freely copyable
#[repr(transparent)]
pub struct Device(NonNull<ibv_device>);

/// SAFETY: the wrapped handle is only read
unsafe impl Send for Device {}
/// SAFETY: the wrapped handle is only read
unsafe impl Sync for Device {}

impl DeviceList {
    /// Enumerate the available rdma devices
    #[inline]
    pub fn available() -> io::Result<Self> {
        let mut num_devices: c_int = 0;
        // SAFETY: ffi
        let arr = unsafe { ibv_get_device_list(&mut num_devices) };
        let Some(head) = NonNull::new(arr.cast::<Device>()) else {
            return Err(last_error());
        };
        // freed only if the cast below panics
        let _guard = guard_on_unwind((), |()| {
            // SAFETY: ffi
            unsafe { ibv_free_device_list(arr) }
        });
        let len: usize = num_devices.numeric_cast();
        Ok(Self { head, len })
    }

    /// The devices as a slice
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[Device] {
        // SAFETY: `head` points at `len` valid entries; `Device` is a
        // transparent wrapper over the ffi pointer
        unsafe { slice::from_raw_parts(self.head.as_ptr(), self.len) }
    }
}

impl Drop for DeviceList {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: ffi
        unsafe { ibv_free_device_list(self.head.as_ptr().cast()) }
    }
}

impl Deref for DeviceList {
    type Target = [Device];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl fmt::Debug for DeviceList {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <[Device] as fmt::Debug>::fmt(self, f)
    }
}

impl Device {
    /// The underlying `*mut ibv_device`
    pub(crate) fn ffi_ptr(&self) -> *mut ibv_device {
        self.0.as_ptr()
    }

    /// Kernel device name as a C string
    #[inline]
    #[must_use]
    pub fn c_name(&self) -> &CStr {
        // SAFETY: ffi
        unsafe { CStr::from_ptr(ibv_get_device_name(self.ffi_ptr())) }
    }

    /// Kernel device name, e.g. `mlx5_0`
    ///
    /// # Panics
    /// + if the device name is not a valid utf8 string
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        #[allow(clippy::expect_used)]
        self.c_name().to_str().expect("non-utf8 device name")
    }

    /// The device's node GUID
    #[inline]
    #[must_use]
    pub fn guid(&self) -> Guid {
        // SAFETY: ffi
        unsafe { Guid(ibv_get_device_guid(self.ffi_ptr())) }
    }
}

impl fmt::Debug for Device {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("guid", &self.guid())
            .finish()
    }
}

/// A device node GUID, kept in network byte order
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Guid(__be64);

impl Guid {
    /// A guid from its network-order bytes
    #[inline]
    #[must_use]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_ne_bytes(bytes))
    }

    /// The network-order bytes of this guid
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> [u8; 8] {
        self.0.to_ne_bytes()
    }
}

impl fmt::Debug for Guid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({:x})", self)
    }
}

impl fmt::LowerHex for Guid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <str as fmt::Display>::fmt(&hex::encode(self.as_bytes()), f)
    }
}

impl fmt::UpperHex for Guid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <str as fmt::Display>::fmt(&hex::encode_upper(self.as_bytes()), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_fmt() {
        let bytes = [0x26, 0x41, 0x8c, 0xff, 0xfe, 0x02, 0x1d, 0xf9];
        let guid = Guid::from_bytes(bytes);

        assert_eq!(format!("{:?}", guid), "Guid(26418cfffe021df9)");
        assert_eq!(format!("{:x}", guid), "26418cfffe021df9");
        assert_eq!(format!("{:X}", guid), "26418CFFFE021DF9");
        assert_eq!(guid.as_bytes(), bytes);
    }

    #[test]
    fn marker() {
        fn require_send_sync<T: Send + Sync>() {}

        require_send_sync::<Device>();
        require_send_sync::<DeviceList>();
        require_send_sync::<Guid>();
    }
}
