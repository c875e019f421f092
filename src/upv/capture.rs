use std::os::raw::{c_int, c_void};
use std::ptr;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use libusb1_sys as libusb;
use libusb1_sys::constants::{
    LIBUSB_TRANSFER_CANCELLED, LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_TIMED_OUT,
    LIBUSB_TRANSFER_TYPE_BULK,
};
use log::{debug, error, warn};

use super::constants::{BULK_IN_TIMEOUT, EVENT_LOOP_TICK, UPV_IN_EP, duration_to_timeout};
use super::context::{LibusbContext, LibusbDeviceHandle};
use super::parser::{FrameParser, ParseOutcome};
use super::pool::BufferPool;
use super::queue::UpvQueue;
use super::sink::RecordSink;
use super::timestamp::Delivery;

/// Descriptor of a filled pool buffer traveling reader to parser. A null
/// pointer or zero length is the shutdown sentinel.
pub(crate) struct BufData {
    pub(crate) ptr: *mut u8,
    pub(crate) len: usize,
}

unsafe impl Send for BufData {}

impl BufData {
    fn sentinel() -> Self {
        Self {
            ptr: ptr::null_mut(),
            len: 0,
        }
    }

    fn is_sentinel(&self) -> bool {
        self.ptr.is_null() || self.len == 0
    }
}

/// State shared by the controller and both capture threads for the lifetime
/// of one capture session.
pub(crate) struct CaptureShared {
    pub(crate) pool: BufferPool,
    pub(crate) filled: UpvQueue<BufData>,
    pub(crate) reader_done: UpvQueue<i32>,
    pub(crate) parser_done: UpvQueue<i32>,
    pub(crate) finish: AtomicBool,
    pub(crate) stopping: AtomicBool,
}

impl CaptureShared {
    pub(crate) fn new(buf_size: usize, buf_count: usize) -> Arc<Self> {
        Arc::new(Self {
            pool: BufferPool::new(buf_size, buf_count),
            filled: UpvQueue::new(),
            reader_done: UpvQueue::new(),
            parser_done: UpvQueue::new(),
            finish: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        })
    }
}

/// Completion-callback state for the streaming transfer. Lives on the heap
/// behind a raw pointer in the transfer's user data; only the reader thread
/// touches it, from the event loop.
struct ReaderCtx {
    shared: Arc<CaptureShared>,
    in_flight: bool,
}

/// Bounded number of event-loop spins waiting for a cancelled transfer to
/// come back before the reader gives up and leaks it.
const CANCEL_DRAIN_SPINS: u32 = 50;

extern "system" fn capture_read_cb(transfer: *mut libusb::libusb_transfer) {
    unsafe {
        let ctx = &mut *((*transfer).user_data as *mut ReaderCtx);
        let status = (*transfer).status;
        if status == LIBUSB_TRANSFER_COMPLETED {
            if ctx.shared.finish.load(Ordering::SeqCst) {
                // Shutdown already under way; the sentinel may be queued, so
                // the data cannot be handed off any more. Leave the buffer on
                // the transfer for the reader to give back.
                ctx.in_flight = false;
                return;
            }
            if (*transfer).actual_length > 0 {
                ctx.shared.filled.enqueue(BufData {
                    ptr: (*transfer).buffer,
                    len: (*transfer).actual_length as usize,
                });
                // Blocks while all buffers are checked out; the parser is
                // draining them on the other side.
                (*transfer).buffer = ctx.shared.pool.acquire();
            }
            if libusb::libusb_submit_transfer(transfer) < 0 {
                ctx.in_flight = false;
                ctx.shared.finish.store(true, Ordering::SeqCst);
            }
        } else if status == LIBUSB_TRANSFER_TIMED_OUT {
            if ctx.shared.finish.load(Ordering::SeqCst) {
                ctx.in_flight = false;
            } else if libusb::libusb_submit_transfer(transfer) < 0 {
                ctx.in_flight = false;
                ctx.shared.finish.store(true, Ordering::SeqCst);
            }
        } else {
            // CANCELLED, ERROR, STALL, NO_DEVICE, OVERFLOW
            if status != LIBUSB_TRANSFER_CANCELLED {
                warn!("bulk-in transfer failed with status {status}");
            }
            ctx.in_flight = false;
            ctx.shared.finish.store(true, Ordering::SeqCst);
        }
    }
}

/// Reader thread: owns the single streaming bulk-IN transfer and pumps the
/// libusb event loop until the finish flag is raised. On exit it wakes the
/// parser with the sentinel, reels the in-flight transfer back in and posts
/// its done token.
pub(crate) fn reader_thread(
    shared: Arc<CaptureShared>,
    context: Arc<LibusbContext>,
    handle: LibusbDeviceHandle,
) {
    unsafe {
        let transfer = libusb::libusb_alloc_transfer(0);
        if transfer.is_null() {
            error!("failed to allocate the streaming transfer");
            shared.finish.store(true, Ordering::SeqCst);
            shared.filled.enqueue(BufData::sentinel());
            shared.reader_done.enqueue(0);
            return;
        }

        let buffer = shared.pool.acquire();
        let ctx = Box::into_raw(Box::new(ReaderCtx {
            shared: shared.clone(),
            in_flight: true,
        }));

        (*transfer).dev_handle = handle.raw();
        (*transfer).endpoint = UPV_IN_EP;
        (*transfer).transfer_type = LIBUSB_TRANSFER_TYPE_BULK;
        (*transfer).timeout = duration_to_timeout(BULK_IN_TIMEOUT);
        (*transfer).buffer = buffer;
        (*transfer).length = shared.pool.buf_size() as c_int;
        (*transfer).callback = capture_read_cb;
        (*transfer).user_data = ctx as *mut c_void;

        if libusb::libusb_submit_transfer(transfer) < 0 {
            error!("failed to submit the streaming transfer");
            shared.pool.unget(buffer);
            libusb::libusb_free_transfer(transfer);
            drop(Box::from_raw(ctx));
            shared.finish.store(true, Ordering::SeqCst);
            shared.filled.enqueue(BufData::sentinel());
            shared.reader_done.enqueue(0);
            return;
        }

        while !shared.finish.load(Ordering::SeqCst) {
            if let Err(err) = context.handle_events(EVENT_LOOP_TICK) {
                error!("usb event loop failed: {err}");
                shared.finish.store(true, Ordering::SeqCst);
            }
        }

        shared.filled.enqueue(BufData::sentinel());

        // Reel the in-flight transfer back in so its pool buffer can be
        // returned. The cancel completes through the event loop.
        if (*ctx).in_flight {
            libusb::libusb_cancel_transfer(transfer);
            let mut spins = 0;
            while (*ctx).in_flight && spins < CANCEL_DRAIN_SPINS {
                if context.handle_events(EVENT_LOOP_TICK).is_err() {
                    break;
                }
                spins += 1;
            }
        }

        if (*ctx).in_flight {
            // The device never completed the cancel. Freeing the transfer now
            // would hand libusb a dangling callback, so leak it instead.
            warn!("streaming transfer did not acknowledge cancel, leaking it");
        } else {
            let attached = (*transfer).buffer;
            if !attached.is_null() {
                shared.pool.unget(attached);
            }
            libusb::libusb_free_transfer(transfer);
            drop(Box::from_raw(ctx));
        }

        debug!("reader thread exiting");
        shared.reader_done.enqueue(0);
    }
}

/// Parser thread: drains filled buffers into the framing state machine,
/// forwards each raw buffer to the optional record tap, and recycles the
/// buffer. Keeps draining to the sentinel after a stop so every loaned
/// buffer is back in the pool before the thread exits.
pub(crate) fn parser_thread(
    shared: Arc<CaptureShared>,
    mut parser: FrameParser,
    mut delivery: Delivery,
    mut record: Option<Box<dyn RecordSink>>,
) {
    let mut draining = false;
    loop {
        let msg = shared.filled.dequeue();
        if msg.is_sentinel() {
            shared.finish.store(true, Ordering::SeqCst);
            break;
        }
        if draining {
            shared.pool.release(msg.ptr);
            continue;
        }
        if shared.stopping.load(Ordering::SeqCst) {
            parser.enter_stopping();
        }

        let data = unsafe { slice::from_raw_parts(msg.ptr, msg.len) };
        let outcome = parser.process(data, &mut delivery);
        if let Some(tap) = record.as_mut() {
            tap.record_raw(data);
        }
        shared.pool.release(msg.ptr);

        if outcome == ParseOutcome::Stop {
            shared.finish.store(true, Ordering::SeqCst);
            draining = true;
        }
    }
    debug!("parser thread exiting");
    shared.parser_done.enqueue(0);
}
