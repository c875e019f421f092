use std::time::Duration;

use libusb1_sys::constants::{
    LIBUSB_ENDPOINT_IN, LIBUSB_ENDPOINT_OUT, LIBUSB_RECIPIENT_DEVICE, LIBUSB_REQUEST_TYPE_VENDOR,
};

/// Vendor and product id the analyzer enumerates with.
pub const UPV_VID: u16 = 0x16C0;
pub const UPV_PID: u16 = 0x05DC;
/// Manufacturer string descriptor the device must report.
pub const UPV_MANUFACTURER: &str = "tusb.org";

//
// Vendor control requests (bRequest values)
//
pub const UPV_REQ_RESET: u8 = 0x73;
pub const UPV_REQ_START: u8 = 0x74;
pub const UPV_REQ_STATUS: u8 = 0x75;

/// Firmware, config-write frames and session commands go out on 0x01;
/// config echoes and the capture stream come back on 0x81.
pub const UPV_OUT_EP: u8 = 0x01;
pub const UPV_IN_EP: u8 = 0x81;

/// Session sentinels framing the capture stream, as 32-bit little-endian words.
pub const UPV_START_CMD: u32 = 0x5701_0155;
pub const UPV_STOP_CMD: u32 = 0x5600_0155;

//
// Config registers reached through the 4-byte config-write frames.
//
pub const REG_CAPTURE_SPEED: u8 = 8;
pub const REG_EVENT_MASK: u8 = 31;
/// First of the eight filter-bank registers (32..=39).
pub const REG_FILTER_BASE: u8 = 32;

//
// Event-mask bits. The wire value written to REG_EVENT_MASK is the complement.
//
pub const UPV_FLAG_ACK: u8 = 0x01;
pub const UPV_FLAG_ISO: u8 = 0x02;
pub const UPV_FLAG_NAK: u8 = 0x04;
pub const UPV_FLAG_STALL: u8 = 0x08;
pub const UPV_FLAG_SOF: u8 = 0x10;
pub const UPV_FLAG_PING: u8 = 0x20;
pub const UPV_FLAG_INCOMP: u8 = 0x40;
pub const UPV_FLAG_ERROR: u8 = 0x80;
pub const UPV_FLAG_ALL: u8 = 0xff;

/// Frequency of the 24-bit packet tick counter.
pub const UPV_TICK_HZ: u32 = 60_000_000;

/// Largest payload length accepted by the framing parser. A length word above
/// this sends the parser into recovery.
pub const UPV_MAX_PACKET_LEN: usize = 1024;

/// Transfer buffer geometry: 32 buffers of 8 MiB.
pub const POOL_BUF_SIZE: usize = 8 * 1024 * 1024;
pub const POOL_BUF_COUNT: usize = 32;

/// Bulk-OUT transfers are chunked at the device's 4 KiB limit.
pub const WRITE_CHUNK_SIZE: usize = 4096;

/// Timeout for blocking control and bulk transfers during open.
pub const USB_WRITE_TIMEOUT: Duration = Duration::from_millis(5000);
/// Timeout on the streaming bulk-IN transfer; expiry just resubmits.
pub const BULK_IN_TIMEOUT: Duration = Duration::from_millis(1000);
/// Granularity of the reader thread's event-loop polling.
pub const EVENT_LOOP_TICK: Duration = Duration::from_millis(100);

/// Low nibble of a header word selects the bus speed, remapped so the status
/// reports high=3, full=2, low=1.
pub const SPEED_MAP: [u8; 16] = [3, 2, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

/// Vendor OUT request type
pub fn request_type_out() -> u8 {
    (LIBUSB_REQUEST_TYPE_VENDOR | LIBUSB_RECIPIENT_DEVICE | LIBUSB_ENDPOINT_OUT) as u8
}

/// Vendor IN request type
pub fn request_type_in() -> u8 {
    (LIBUSB_REQUEST_TYPE_VENDOR | LIBUSB_RECIPIENT_DEVICE | LIBUSB_ENDPOINT_IN) as u8
}

/// Convert Duration into libusb timeout (ms)
pub fn duration_to_timeout(duration: Duration) -> u32 {
    use std::os::raw::c_uint;
    if duration.is_zero() {
        return 0;
    }
    let millis = duration.as_millis();
    if millis == 0 {
        1
    } else if millis > c_uint::MAX as u128 {
        c_uint::MAX as u32
    } else {
        millis as u32
    }
}
