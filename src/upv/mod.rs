/// Driver implementation for the tusb.org USB protocol analyzer.
mod capture;
pub mod constants;
mod context;
mod device;
mod driver;
mod error;
pub mod options;
pub mod parser;
mod pool;
mod queue;
pub mod sink;
pub mod timestamp;

pub use device::list_devices;
pub use driver::{UpvDriver, open_device, open_device_fast};
pub use error::UpvError;
pub use options::{CaptureOptions, CaptureSpeed, FilterEntry};
pub use parser::{EventType, FrameHandler, FrameParser, ParseOutcome, speed_bits};
pub use sink::{DeliveryMode, PacketSink, RecordSink};
pub use timestamp::{TickClock, WallTime};
