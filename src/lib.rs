/// User-space capture driver for the tusb.org USB protocol analyzer.
pub mod upv;
pub use upv::{
    CaptureOptions, CaptureSpeed, DeliveryMode, EventType, FilterEntry, FrameHandler, FrameParser,
    PacketSink, ParseOutcome, RecordSink, TickClock, UpvDriver, UpvError, WallTime, list_devices,
    open_device, open_device_fast, speed_bits,
};
