use std::ptr;
use std::sync::Arc;

use libusb1_sys as libusb;
use libusb1_sys::constants::LIBUSB_ERROR_ACCESS;
use log::{debug, info};

use super::constants::{
    USB_WRITE_TIMEOUT, UPV_MANUFACTURER, UPV_PID, UPV_REQ_RESET, UPV_VID, request_type_out,
};
use super::context::{
    LibusbContext, LibusbDeviceHandle, get_device_descriptor, read_string_descriptor,
};
use super::error::UpvError;

/// Device list with libusb's refcounted unref-on-free semantics.
struct DeviceList {
    ptr: *const *mut libusb::libusb_device,
    count: usize,
}

impl DeviceList {
    fn enumerate(context: &LibusbContext) -> Option<Self> {
        let mut list = ptr::null();
        let count = unsafe { libusb::libusb_get_device_list(context.ptr.0, &mut list) };
        if count < 0 {
            return None;
        }
        Some(Self {
            ptr: list,
            count: count as usize,
        })
    }

    fn get(&self, index: usize) -> *mut libusb::libusb_device {
        unsafe { *self.ptr.add(index) }
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        unsafe { libusb::libusb_free_device_list(self.ptr, 1) };
    }
}

/// Enumerate attached analyzers by serial number. Devices whose serial cannot
/// be read appear as `"XXX"`.
pub fn list_devices() -> Vec<String> {
    let mut serials = Vec::new();
    let Ok(context) = LibusbContext::new() else {
        return serials;
    };
    let Some(list) = DeviceList::enumerate(&context) else {
        return serials;
    };

    for i in 0..list.count {
        let device = list.get(i);
        let Ok(desc) = get_device_descriptor(device) else {
            break;
        };
        if desc.idVendor != UPV_VID || desc.idProduct != UPV_PID {
            continue;
        }
        let Ok(handle) = LibusbDeviceHandle::open(context.clone(), device) else {
            continue;
        };
        match read_string_descriptor(&handle, desc.iManufacturer) {
            Some(manufacturer) if manufacturer == UPV_MANUFACTURER => {
                serials.push(
                    read_string_descriptor(&handle, desc.iSerialNumber)
                        .unwrap_or_else(|| "XXX".to_string()),
                );
            }
            _ => {}
        }
    }
    serials
}

pub(crate) struct OpenedDevice {
    pub(crate) handle: LibusbDeviceHandle,
    pub(crate) bcd_usb: u16,
}

/// First configuration value of the device, read without touching the handle.
fn first_config_value(device: *mut libusb::libusb_device) -> Result<i32, UpvError> {
    let mut cfg_desc = ptr::null();
    let rc = unsafe { libusb::libusb_get_config_descriptor(device, 0, &mut cfg_desc) };
    if rc < 0 {
        return Err(UpvError::DescriptorFetchFailed);
    }
    let value = unsafe { (*cfg_desc).bConfigurationValue };
    unsafe { libusb::libusb_free_config_descriptor(cfg_desc) };
    Ok(i32::from(value))
}

/// Locate the analyzer matching `serial` (any analyzer when empty), detach a
/// bound kernel driver, fix up the configuration, claim interface 0 and send
/// the vendor reset.
pub(crate) fn open_by_serial(
    context: &Arc<LibusbContext>,
    serial: &str,
) -> Result<OpenedDevice, UpvError> {
    let list = DeviceList::enumerate(context).ok_or(UpvError::DeviceNotFound)?;

    for i in 0..list.count {
        let device = list.get(i);
        let desc = get_device_descriptor(device).map_err(|_| UpvError::DescriptorFetchFailed)?;
        if desc.idVendor != UPV_VID || desc.idProduct != UPV_PID {
            continue;
        }

        // With several analyzers attached some may be busy; keep scanning.
        let Ok(handle) = LibusbDeviceHandle::open(context.clone(), device) else {
            continue;
        };

        let manufacturer = read_string_descriptor(&handle, desc.iManufacturer)
            .ok_or(UpvError::DescriptorFetchFailed)?;
        if manufacturer != UPV_MANUFACTURER {
            continue;
        }
        if !serial.is_empty() {
            let dev_serial = read_string_descriptor(&handle, desc.iSerialNumber)
                .ok_or(UpvError::DescriptorFetchFailed)?;
            if dev_serial != serial {
                continue;
            }
        }

        let cfg0 = first_config_value(device)?;

        let detach_rc = handle.detach_kernel_driver(0);
        let permission = detach_rc == LIBUSB_ERROR_ACCESS;
        if detach_rc < 0 {
            debug!("kernel driver detach returned {detach_rc}");
        }

        let cfg = handle.get_configuration().map_err(|_| UpvError::OpenFailed {
            permission: false,
            detail: "unable to read active usb configuration",
        })?;
        // Needed especially on Windows; tolerate an already-active config.
        if desc.bNumConfigurations > 0 && cfg != cfg0 {
            handle.set_configuration(cfg0).map_err(|_| {
                if permission {
                    UpvError::OpenFailed {
                        permission: true,
                        detail: "unable to set usb configuration, make sure the default driver is not in use",
                    }
                } else {
                    UpvError::SetConfigurationFailed
                }
            })?;
        }

        handle
            .claim_interface(0)
            .map_err(|_| UpvError::ClaimFailed { permission })?;

        handle
            .control_out_blocking(request_type_out(), UPV_REQ_RESET, 0, 0, &[], USB_WRITE_TIMEOUT)
            .map_err(|_| UpvError::ResetFailed)?;

        info!(
            "opened analyzer serial={} bcdUSB={:#06x}",
            if serial.is_empty() { "(any)" } else { serial },
            desc.bcdUSB
        );
        return Ok(OpenedDevice {
            handle,
            bcd_usb: desc.bcdUSB,
        });
    }

    Err(UpvError::DeviceNotFound)
}
