use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use super::capture::{CaptureShared, parser_thread, reader_thread};
use super::constants::{
    POOL_BUF_COUNT, POOL_BUF_SIZE, REG_CAPTURE_SPEED, REG_EVENT_MASK, REG_FILTER_BASE,
    USB_WRITE_TIMEOUT, UPV_IN_EP, UPV_REQ_RESET, UPV_REQ_START, UPV_REQ_STATUS, UPV_START_CMD,
    UPV_STOP_CMD, request_type_in, request_type_out,
};
use super::context::{LibusbContext, LibusbDeviceHandle};
use super::device::open_by_serial;
use super::error::UpvError;
use super::options::CaptureOptions;
use super::parser::FrameParser;
use super::sink::{DeliveryMode, PacketSink, RecordSink};
use super::timestamp::Delivery;

const STATUS_RETRIES: u32 = 3;
const STOP_RETRIES: u32 = 3;

/// Handle to one open analyzer.
///
/// Owns the USB context and device exclusively together with the capture
/// machinery. Dropping the handle closes everything; [`UpvDriver::close`] is
/// the explicit, idempotent form.
pub struct UpvDriver {
    context: Arc<LibusbContext>,
    handle: Option<LibusbDeviceHandle>,
    bcd_usb: u16,
    shared: Option<Arc<CaptureShared>>,
    reader: Option<JoinHandle<()>>,
    parser: Option<JoinHandle<()>>,
}

impl UpvDriver {
    /// Open the analyzer described by the positional option blob and push
    /// `firmware` to it. See [`CaptureOptions::parse`] for the blob layout.
    pub fn open(option: &[u8], firmware: &[u8]) -> Result<Self, UpvError> {
        Self::open_with(&CaptureOptions::parse(option), firmware)
    }

    /// Open an analyzer from parsed options: locate it by serial, run the
    /// reset/status handshake, push the firmware, start the engine and write
    /// the capture-speed, event-mask and filter registers.
    pub fn open_with(options: &CaptureOptions, firmware: &[u8]) -> Result<Self, UpvError> {
        let context = LibusbContext::new()
            .map_err(|err| UpvError::ContextInit(err.to_string()))?;
        let opened = open_by_serial(&context, &options.serial)?;
        let handle = opened.handle;

        // The engine reports busy in the status high nibble until the reset
        // lands. Nudge it a couple of times before giving up.
        let mut retry = STATUS_RETRIES;
        loop {
            let status = read_status(&handle)?;
            if status & 0x00f0 == 0 {
                break;
            }
            retry -= 1;
            if retry == 0 {
                return Err(UpvError::Load);
            }
            thread::sleep(Duration::from_millis(1));
            send_reset(&handle).map_err(|_| UpvError::Load)?;
        }

        handle
            .bulk_write_chunked(firmware)
            .map_err(|_| UpvError::Load)?;
        debug!("pushed {} bytes of firmware", firmware.len());

        // Low nibble 3 means the firmware is loaded and running.
        let mut retry = STATUS_RETRIES;
        loop {
            let status = read_status(&handle)?;
            if status & 0x000f == 3 {
                break;
            }
            retry -= 1;
            if retry == 0 {
                return Err(UpvError::Load);
            }
        }

        handle
            .control_out_blocking(request_type_out(), UPV_REQ_START, 0, 0, &[], USB_WRITE_TIMEOUT)
            .map_err(|_| UpvError::Load)?;

        write_config(&handle, REG_CAPTURE_SPEED, options.speed_register())?;
        write_config(&handle, REG_EVENT_MASK, options.event_mask_register())?;
        for (i, value) in options.filter_bank().iter().enumerate() {
            write_config(&handle, REG_FILTER_BASE + i as u8, *value)?;
        }

        info!("analyzer configured: speed={:?} mask={:#04x}", options.speed, options.event_mask);
        Ok(Self {
            context,
            handle: Some(handle),
            bcd_usb: opened.bcd_usb,
            shared: None,
            reader: None,
            parser: None,
        })
    }

    /// `bcdUSB` of the analyzer's upstream port.
    pub fn bcd_usb(&self) -> u16 {
        self.bcd_usb
    }

    /// 1 when the monitor port enumerated as USB 3.x, else 0.
    pub fn monitor_speed(&self) -> i32 {
        if self.bcd_usb >= 0x300 { 1 } else { 0 }
    }

    /// Spawn the capture threads and send the start command. Packets reach
    /// `sink` according to `mode`; `record` receives every raw bulk buffer.
    pub fn start_capture(
        &mut self,
        sink: Box<dyn PacketSink>,
        mode: DeliveryMode,
        record: Option<Box<dyn RecordSink>>,
    ) -> Result<(), UpvError> {
        let Some(handle) = self.handle.clone() else {
            return Err(UpvError::DeviceNotOpen);
        };
        if self.shared.is_some() {
            return Err(UpvError::DeviceNotOpen);
        }

        let shared = CaptureShared::new(POOL_BUF_SIZE, POOL_BUF_COUNT);

        let reader = thread::Builder::new()
            .name("upv-reader".into())
            .spawn({
                let shared = shared.clone();
                let context = self.context.clone();
                let handle = handle.clone();
                move || reader_thread(shared, context, handle)
            })
            .map_err(UpvError::Thread)?;

        let spawned = thread::Builder::new().name("upv-parser".into()).spawn({
            let shared = shared.clone();
            let delivery = Delivery::new(sink, mode);
            move || parser_thread(shared, FrameParser::new(), delivery, record)
        });
        let parser = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                // Unwind the reader before reporting: it exits on the finish
                // flag and its done token is consumed with the join.
                shared.finish.store(true, Ordering::SeqCst);
                let _ = shared
                    .reader_done
                    .dequeue_with_timeout(Duration::from_secs(1));
                let _ = reader.join();
                return Err(UpvError::Thread(err));
            }
        };

        self.shared = Some(shared);
        self.reader = Some(reader);
        self.parser = Some(parser);

        handle
            .bulk_write_chunked(&UPV_START_CMD.to_le_bytes())
            .map_err(|_| UpvError::WriteConfig)?;
        info!("capture started");
        Ok(())
    }

    /// Stop a running capture: send the stop command, then collect both
    /// threads, waiting up to `timeout` per attempt. A thread that misses
    /// every deadline is logged and abandoned rather than joined.
    ///
    /// A no-op when no capture is running.
    pub fn stop_capture(&mut self, timeout: Duration) -> Result<(), UpvError> {
        let Some(shared) = self.shared.take() else {
            return Ok(());
        };
        shared.stopping.store(true, Ordering::SeqCst);

        let mut stop_error = None;
        if !shared.finish.load(Ordering::SeqCst) {
            if let Err(err) = self.write_stop() {
                // Keep winding down anyway; the finish flag stops the reader
                // on its next timeout.
                shared.finish.store(true, Ordering::SeqCst);
                stop_error = Some(err);
            }
        }

        let mut acknowledged = false;
        for attempt in 0..STOP_RETRIES {
            if shared.reader_done.dequeue_with_timeout(timeout).is_some() {
                acknowledged = true;
                break;
            }
            warn!(
                "reader thread still running, {} attempts left",
                STOP_RETRIES - 1 - attempt
            );
            shared.finish.store(true, Ordering::SeqCst);
            if let Err(err) = self.write_stop() {
                stop_error.get_or_insert(err);
            }
        }
        match self.reader.take() {
            Some(handle) if acknowledged => {
                let _ = handle.join();
            }
            Some(_) => error!("reader thread did not acknowledge stop, abandoning it"),
            None => {}
        }

        let parser_ok = shared.parser_done.dequeue_with_timeout(timeout).is_some();
        match self.parser.take() {
            Some(handle) if parser_ok => {
                let _ = handle.join();
            }
            Some(_) => error!("parser thread did not acknowledge stop, abandoning it"),
            None => {}
        }

        match stop_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop any capture and release the device. Safe to call repeatedly; the
    /// device is released even when the stop handshake fails.
    pub fn close(&mut self) -> Result<(), UpvError> {
        let stopped = self.stop_capture(Duration::from_millis(1000));
        self.handle = None;
        stopped
    }

    fn write_stop(&self) -> Result<(), UpvError> {
        let Some(handle) = self.handle.as_ref() else {
            return Err(UpvError::DeviceNotOpen);
        };
        handle
            .bulk_write_chunked(&UPV_STOP_CMD.to_le_bytes())
            .map(|_| ())
            .map_err(|_| UpvError::WriteConfig)
    }
}

impl Drop for UpvDriver {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("close on drop failed: {err}");
        }
    }
}

/// Open and immediately start capturing with wall-clock timestamps.
pub fn open_device(
    option: &[u8],
    firmware: &[u8],
    sink: Box<dyn PacketSink>,
) -> Result<UpvDriver, UpvError> {
    let mut driver = UpvDriver::open(option, firmware)?;
    driver.start_capture(sink, DeliveryMode::WallClock, None)?;
    Ok(driver)
}

/// Open and immediately start capturing with raw-tick delivery.
pub fn open_device_fast(
    option: &[u8],
    firmware: &[u8],
    sink: Box<dyn PacketSink>,
) -> Result<UpvDriver, UpvError> {
    let mut driver = UpvDriver::open(option, firmware)?;
    driver.start_capture(sink, DeliveryMode::RawTick, None)?;
    Ok(driver)
}

fn read_status(handle: &LibusbDeviceHandle) -> Result<u16, UpvError> {
    let mut buf = [0u8; 2];
    handle
        .control_in_blocking(
            request_type_in(),
            UPV_REQ_STATUS,
            0,
            0,
            &mut buf,
            USB_WRITE_TIMEOUT,
        )
        .map_err(|_| UpvError::DeviceStatus)?;
    Ok(u16::from_le_bytes(buf))
}

fn send_reset(handle: &LibusbDeviceHandle) -> Result<(), UpvError> {
    handle
        .control_out_blocking(request_type_out(), UPV_REQ_RESET, 0, 0, &[], USB_WRITE_TIMEOUT)
        .map(|_| ())
        .map_err(|_| UpvError::ResetFailed)
}

/// One config-write exchange: a 4-byte checksummed frame on the bulk-OUT
/// endpoint, echoed back verbatim on the bulk-IN endpoint on success.
fn write_config(handle: &LibusbDeviceHandle, id: u8, value: u8) -> Result<(), UpvError> {
    let frame = [
        0x55,
        id,
        value,
        0x55u8.wrapping_add(id).wrapping_add(value),
    ];
    handle
        .bulk_write_chunked(&frame)
        .map_err(|_| UpvError::WriteConfig)?;

    let mut echo = [0u8; 4];
    let n = handle
        .bulk_read_blocking(UPV_IN_EP, &mut echo, USB_WRITE_TIMEOUT)
        .map_err(|_| UpvError::WriteConfig)?;
    if n == 0 || echo != frame {
        return Err(UpvError::WriteConfig);
    }
    Ok(())
}
