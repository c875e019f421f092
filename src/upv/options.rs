use super::constants::UPV_FLAG_ALL;

/// Capture speed selector written to the speed register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureSpeed {
    High = 0,
    Full = 1,
    Low = 2,
    Auto = 3,
}

impl CaptureSpeed {
    /// Only the low two bits of the option byte are significant.
    pub fn from_byte(byte: u8) -> Self {
        match byte & 0x03 {
            0 => CaptureSpeed::High,
            1 => CaptureSpeed::Full,
            2 => CaptureSpeed::Low,
            _ => CaptureSpeed::Auto,
        }
    }
}

/// One slot of the four-entry address/endpoint filter bank. `None` leaves the
/// corresponding match field disabled (0xff in the option blob).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterEntry {
    pub addr: Option<u8>,
    pub ep: Option<u8>,
}

/// Parsed form of the option blob handed to [`super::UpvDriver::open`].
///
/// Blob layout: the serial number terminated by NUL, then positional bytes
/// `speed`, `event_mask`, `accept_mode` and up to four `(addr, ep)` pairs.
/// Trailing fields may be omitted and take defaults; bytes beyond the last
/// recognized field are ignored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureOptions {
    pub serial: String,
    pub speed: CaptureSpeed,
    pub event_mask: u8,
    /// true: forward transactions matching the filter bank; false: drop them.
    pub accept: bool,
    pub filters: [FilterEntry; 4],
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            serial: String::new(),
            speed: CaptureSpeed::Auto,
            event_mask: UPV_FLAG_ALL,
            accept: true,
            filters: [FilterEntry::default(); 4],
        }
    }
}

const SERIAL_MAX: usize = 128;

impl CaptureOptions {
    /// Parse the positional option blob.
    pub fn parse(blob: &[u8]) -> Self {
        let serial_len = blob
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(blob.len())
            .min(SERIAL_MAX);
        let serial = String::from_utf8_lossy(&blob[..serial_len]).into_owned();

        let mut opts = CaptureOptions {
            serial,
            ..CaptureOptions::default()
        };

        let mut idx = serial_len + 1;
        if let Some(&b) = blob.get(idx) {
            opts.speed = CaptureSpeed::from_byte(b);
        }
        idx += 1;
        if let Some(&b) = blob.get(idx) {
            opts.event_mask = b;
        }
        idx += 1;
        if let Some(&b) = blob.get(idx) {
            opts.accept = b != 0;
        }
        for (i, entry) in opts.filters.iter_mut().enumerate() {
            if let Some(&addr) = blob.get(idx + 1 + i * 2) {
                if addr <= 127 {
                    entry.addr = Some(addr);
                }
            }
            if let Some(&ep) = blob.get(idx + 2 + i * 2) {
                if ep <= 15 {
                    entry.ep = Some(ep);
                }
            }
        }
        opts
    }

    /// Serialize back to the blob layout. Unused filter fields encode as 0xff.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(SERIAL_MAX);
        blob.extend_from_slice(self.serial.as_bytes());
        blob.push(0);
        blob.push(self.speed as u8);
        blob.push(self.event_mask);
        blob.push(self.accept as u8);
        for entry in &self.filters {
            blob.push(entry.addr.unwrap_or(0xff));
            blob.push(entry.ep.unwrap_or(0xff));
        }
        blob
    }

    /// Value for the capture-speed register.
    pub(crate) fn speed_register(&self) -> u8 {
        0x0c | (self.speed as u8 & 0x03)
    }

    /// Value for the event-mask register. The device wants the complement of
    /// the user-facing bitmap.
    pub(crate) fn event_mask_register(&self) -> u8 {
        self.event_mask ^ 0xff
    }

    /// Eight-byte filter-bank image written to the filter registers.
    ///
    /// Each 16-bit entry packs, LSB first: `addr:7, addr_valid:1` in the low
    /// byte and `ep:4, reserved:1, accept:1, valid:1, ep_valid:1` in the high
    /// byte. With no usable entries the bank is all zeroes, except that reject
    /// mode sets entry 0's accept bit to build a drop-everything filter.
    pub(crate) fn filter_bank(&self) -> [u8; 8] {
        let mut bank = [0u8; 8];
        let mut has_valid = false;
        for (i, entry) in self.filters.iter().enumerate() {
            let mut lo = 0u8;
            let mut hi = 0u8;
            let mut valid = false;
            if let Some(addr) = entry.addr {
                if addr <= 127 {
                    lo = addr | 0x80;
                    valid = true;
                }
            }
            if let Some(ep) = entry.ep {
                if ep <= 15 {
                    hi |= ep | 0x80;
                    valid = true;
                }
            }
            if valid {
                hi |= 0x40;
                has_valid = true;
            }
            bank[i * 2] = lo;
            bank[i * 2 + 1] = hi;
        }

        if has_valid {
            if self.accept {
                for i in 0..4 {
                    bank[i * 2 + 1] |= 0x20;
                }
            }
        } else {
            bank = [0u8; 8];
            if !self.accept {
                bank[1] |= 0x20;
            }
        }
        bank
    }
}
