use std::ffi::CStr;
use std::io;
use std::mem::MaybeUninit;
use std::os::raw::{c_int, c_uint};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use libusb1_sys as libusb;
use libusb1_sys::constants::{
    LIBUSB_ERROR_INTERRUPTED, LIBUSB_ERROR_NO_DEVICE, LIBUSB_ERROR_NOT_FOUND, LIBUSB_ERROR_PIPE,
    LIBUSB_ERROR_TIMEOUT,
};

use super::constants::{USB_WRITE_TIMEOUT, UPV_OUT_EP, WRITE_CHUNK_SIZE, duration_to_timeout};

#[derive(Copy, Clone)]
pub(crate) struct LibusbCtxPtr(pub(crate) *mut libusb::libusb_context);

unsafe impl Send for LibusbCtxPtr {}
unsafe impl Sync for LibusbCtxPtr {}

/// RAII wrapper owning a libusb context.
///
/// There is no background event thread: the capture reader drives transfer
/// completion itself through [`LibusbContext::handle_events`], and everything
/// else uses blocking transfers.
pub(crate) struct LibusbContext {
    pub(crate) ptr: LibusbCtxPtr,
}

impl LibusbContext {
    pub(crate) fn new() -> io::Result<Arc<Self>> {
        let mut ctx = ptr::null_mut();
        let rc = unsafe { libusb::libusb_init(&mut ctx) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(Arc::new(LibusbContext {
            ptr: LibusbCtxPtr(ctx),
        }))
    }

    /// One synchronous step of the libusb event loop. Returns after pending
    /// events are dispatched or the timeout elapses.
    pub(crate) fn handle_events(&self, timeout: Duration) -> io::Result<()> {
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as _,
            tv_usec: timeout.subsec_micros() as _,
        };
        let rc = unsafe {
            libusb::libusb_handle_events_timeout_completed(self.ptr.0, &mut tv, ptr::null_mut())
        };
        if rc < 0 && rc != LIBUSB_ERROR_INTERRUPTED {
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }
}

impl Drop for LibusbContext {
    fn drop(&mut self) {
        unsafe { libusb::libusb_exit(self.ptr.0) };
    }
}

/// Wrapper around a libusb device handle with automatic close semantics.
/// Clones share the underlying handle, so a capture thread can keep the
/// device alive past an explicit driver close.
#[derive(Clone)]
pub(crate) struct LibusbDeviceHandle {
    pub(crate) _context: Arc<LibusbContext>,
    handle: Arc<LibusbHandleWrapper>,
}

struct LibusbHandleWrapper(*mut libusb::libusb_device_handle);

unsafe impl Send for LibusbHandleWrapper {}
unsafe impl Sync for LibusbHandleWrapper {}

impl Drop for LibusbHandleWrapper {
    fn drop(&mut self) {
        unsafe { libusb::libusb_close(self.0) };
    }
}

impl LibusbDeviceHandle {
    pub(crate) fn open(
        context: Arc<LibusbContext>,
        device: *mut libusb::libusb_device,
    ) -> io::Result<Self> {
        let mut handle = ptr::null_mut();
        let rc = unsafe { libusb::libusb_open(device, &mut handle) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(Self {
            _context: context,
            handle: Arc::new(LibusbHandleWrapper(handle)),
        })
    }

    pub(crate) fn raw(&self) -> *mut libusb::libusb_device_handle {
        self.handle.0
    }

    /// Detach a bound kernel driver. Returns the raw libusb code so the
    /// caller can distinguish permission problems from the benign cases.
    pub(crate) fn detach_kernel_driver(&self, interface: i32) -> c_int {
        unsafe { libusb::libusb_detach_kernel_driver(self.handle.0, interface) }
    }

    pub(crate) fn claim_interface(&self, interface: i32) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_claim_interface(self.handle.0, interface) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }

    pub(crate) fn get_configuration(&self) -> io::Result<i32> {
        let mut cfg: c_int = 0;
        let rc = unsafe { libusb::libusb_get_configuration(self.handle.0, &mut cfg) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(cfg)
    }

    pub(crate) fn set_configuration(&self, config: i32) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_set_configuration(self.handle.0, config) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }

    pub(crate) fn control_out_blocking(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> io::Result<usize> {
        let millis = duration_to_timeout(timeout);
        let rc = unsafe {
            libusb::libusb_control_transfer(
                self.handle.0,
                request_type,
                request,
                value,
                index,
                data.as_ptr() as *mut u8,
                data.len() as u16,
                millis,
            )
        };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(rc as usize)
    }

    pub(crate) fn control_in_blocking(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<usize> {
        let millis = duration_to_timeout(timeout);
        let rc = unsafe {
            libusb::libusb_control_transfer(
                self.handle.0,
                request_type,
                request,
                value,
                index,
                buf.as_mut_ptr(),
                buf.len() as u16,
                millis,
            )
        };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(rc as usize)
    }

    pub(crate) fn bulk_write_blocking(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> io::Result<usize> {
        let mut transferred: c_int = 0;
        let rc = unsafe {
            libusb::libusb_bulk_transfer(
                self.handle.0,
                endpoint,
                data.as_ptr() as *mut u8,
                data.len() as c_int,
                &mut transferred,
                duration_to_timeout(timeout) as c_uint,
            )
        };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(transferred as usize)
    }

    pub(crate) fn bulk_read_blocking(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<usize> {
        let mut transferred: c_int = 0;
        let rc = unsafe {
            libusb::libusb_bulk_transfer(
                self.handle.0,
                endpoint,
                buf.as_mut_ptr(),
                buf.len() as c_int,
                &mut transferred,
                duration_to_timeout(timeout) as c_uint,
            )
        };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(transferred as usize)
    }

    /// Bulk-OUT write chunked at the device's 4 KiB limit. Returns the total
    /// number of bytes transferred.
    pub(crate) fn bulk_write_chunked(&self, data: &[u8]) -> io::Result<usize> {
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + WRITE_CHUNK_SIZE).min(data.len());
            let written =
                self.bulk_write_blocking(UPV_OUT_EP, &data[offset..end], USB_WRITE_TIMEOUT)?;
            if written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "usb bulk write made no progress",
                ));
            }
            offset += written;
        }
        Ok(offset)
    }
}

pub(crate) fn libusb_error_string(code: i32) -> String {
    unsafe {
        let ptr = libusb::libusb_error_name(code);
        if ptr.is_null() {
            format!("libusb error {code}")
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

pub(crate) fn map_libusb_error(code: i32) -> io::Error {
    let kind = match code {
        LIBUSB_ERROR_TIMEOUT => io::ErrorKind::WouldBlock,
        LIBUSB_ERROR_PIPE => io::ErrorKind::BrokenPipe,
        LIBUSB_ERROR_NO_DEVICE => io::ErrorKind::NotConnected,
        LIBUSB_ERROR_NOT_FOUND => io::ErrorKind::NotFound,
        LIBUSB_ERROR_INTERRUPTED => io::ErrorKind::Interrupted,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, libusb_error_string(code))
}

pub(crate) fn get_device_descriptor(
    device: *mut libusb::libusb_device,
) -> io::Result<libusb::libusb_device_descriptor> {
    let mut desc = MaybeUninit::<libusb::libusb_device_descriptor>::uninit();
    let rc = unsafe { libusb::libusb_get_device_descriptor(device, desc.as_mut_ptr()) };
    if rc < 0 {
        return Err(map_libusb_error(rc));
    }
    Ok(unsafe { desc.assume_init() })
}

pub(crate) fn read_string_descriptor(handle: &LibusbDeviceHandle, index: u8) -> Option<String> {
    if index == 0 {
        return None;
    }
    let mut buf = vec![0u8; 255];
    let len = unsafe {
        libusb::libusb_get_string_descriptor_ascii(
            handle.raw(),
            index,
            buf.as_mut_ptr(),
            buf.len() as c_int,
        )
    };
    if len < 0 {
        return None;
    }
    buf.truncate(len as usize);
    String::from_utf8(buf).ok()
}
