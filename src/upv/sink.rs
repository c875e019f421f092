/// Per-packet consumer callback. Invocations happen on the parser thread, in
/// wire order, so implementations see packets serialized.
pub trait PacketSink: Send {
    /// `status` packs the bus speed in its low two bits and the event type in
    /// bits 4..8. A negative return is reserved for future flow control and
    /// is currently ignored.
    fn on_packet(&mut self, sec: u64, nsec: u32, payload: &[u8], status: u32) -> i32;
}

/// Optional tap receiving every filled bulk buffer verbatim, in arrival
/// order, before the buffer returns to the pool.
pub trait RecordSink: Send {
    fn record_raw(&mut self, data: &[u8]);
}

/// How capture timestamps reach the packet sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Reconstruct wall-clock (sec, nsec) from the 24-bit device tick.
    WallClock,
    /// Pass the raw 60 MHz tick through the seconds slot with nsec 0. Zero
    /// overhead for consumers doing their own clock handling.
    RawTick,
}
