use std::time::{SystemTime, UNIX_EPOCH};

use super::constants::UPV_TICK_HZ;
use super::parser::FrameHandler;
use super::sink::{DeliveryMode, PacketSink};

/// Inter-packet wall gap beyond which the tick stream can no longer be
/// trusted: just over one full wrap of the 24-bit counter at 60 MHz.
const DRIFT_RESYNC_NSEC: i64 = 280_179_507;

/// Wall-clock sample in seconds and nanoseconds since the epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WallTime {
    pub sec: u64,
    pub nsec: u32,
}

impl WallTime {
    /// Current real time. A clock before the epoch reads as zero.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        WallTime {
            sec: elapsed.as_secs(),
            nsec: elapsed.subsec_nanos(),
        }
    }
}

/// Lifts the wrapping 24-bit 60 MHz packet tick into wall-clock seconds and
/// nanoseconds.
///
/// Ticks accumulate into an offset that carries across counter wraps; each
/// time the accumulated count crosses one second's worth of clocks the UTC
/// second advances. Nanoseconds use `total*17 - total/3`, within 1 ns of the
/// exact `total / 0.06`. Whenever the wall clock jumps further than a tick
/// wrap can explain, the state snaps to the wall sample and resumes from
/// there, so long capture pauses cannot smear the timeline.
pub struct TickClock {
    utc_sec: u64,
    last_tick: u32,
    /// Accumulated tick offset. Goes transiently negative when a second is
    /// carried before its ticks have fully arrived.
    tick_offset: i64,
    last_wall: WallTime,
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickClock {
    /// The first packet always resyncs: the zeroed wall sample is far behind
    /// any real clock.
    pub fn new() -> Self {
        Self {
            utc_sec: 0,
            last_tick: 0,
            tick_offset: 0,
            last_wall: WallTime::default(),
        }
    }

    /// Fold one 24-bit tick into (sec, nsec) against the supplied wall-clock
    /// sample.
    pub fn reconstruct(&mut self, tick: u32, wall: WallTime) -> (u64, u32) {
        if tick < self.last_tick {
            self.tick_offset += 1 << 24;
        }
        self.last_tick = tick;
        let mut total = self.tick_offset + i64::from(tick);
        if total >= i64::from(UPV_TICK_HZ) {
            self.utc_sec += 1;
            self.tick_offset -= i64::from(UPV_TICK_HZ);
            total -= i64::from(UPV_TICK_HZ);
        }
        let mut nsec = (total * 17 - total / 3) as u32;

        let mut dsec = wall.sec as i64 - self.last_wall.sec as i64;
        let mut dnsec = i64::from(wall.nsec) - i64::from(self.last_wall.nsec);
        if dnsec < 0 {
            dnsec += 1_000_000_000;
            dsec -= 1;
        }
        self.last_wall = wall;
        if dnsec > DRIFT_RESYNC_NSEC || dsec > 0 {
            self.utc_sec = wall.sec;
            self.last_tick = 0;
            // Inverse of the nanosecond formula, back into 60 MHz clocks.
            self.tick_offset = i64::from(wall.nsec / 17 + wall.nsec / 850);
            nsec = wall.nsec;
        }

        (self.utc_sec, nsec)
    }
}

/// Bridges the framing parser to the consumer, stamping each packet according
/// to the configured delivery mode.
pub(crate) struct Delivery {
    mode: DeliveryMode,
    clock: TickClock,
    sink: Box<dyn PacketSink>,
}

impl Delivery {
    pub(crate) fn new(sink: Box<dyn PacketSink>, mode: DeliveryMode) -> Self {
        Self {
            mode,
            clock: TickClock::new(),
            sink,
        }
    }
}

impl FrameHandler for Delivery {
    fn on_frame(&mut self, tick: u32, payload: &[u8], status: u32) -> i32 {
        match self.mode {
            DeliveryMode::WallClock => {
                let (sec, nsec) = self.clock.reconstruct(tick, WallTime::now());
                self.sink.on_packet(sec, nsec, payload, status)
            }
            DeliveryMode::RawTick => self.sink.on_packet(u64::from(tick), 0, payload, status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{TickClock, WallTime};

    const WALL: WallTime = WallTime { sec: 1000, nsec: 0 };

    /// Prime a fresh clock so the initial resync lands on a known sample.
    fn synced_clock() -> TickClock {
        let mut clock = TickClock::new();
        assert_eq!(clock.reconstruct(0, WALL), (1000, 0));
        clock
    }

    #[test]
    fn nanoseconds_track_ticks() {
        let mut clock = synced_clock();
        // 512 clocks at 60 MHz is 8533.3 ns.
        assert_eq!(clock.reconstruct(512, WALL), (1000, 512 * 17 - 512 / 3));
    }

    #[test]
    fn wrap_keeps_timestamps_monotonic() {
        let mut clock = synced_clock();
        let ticks = [0x000100u32, 0x000200, 0xFFFFF0, 0x000010];
        let mut last = (1000u64, 0u32);
        for &t in &ticks {
            let stamp = clock.reconstruct(t, WALL);
            assert!(stamp > last, "tick {t:#x} went backwards: {stamp:?} <= {last:?}");
            last = stamp;
        }
    }

    #[test]
    fn second_advances_when_ticks_accumulate() {
        let mut clock = synced_clock();
        // Saw back and forth so the offset grows by 2^24 per wrap; after four
        // wraps the accumulated clocks cross 60 MHz and the second carries.
        let mut sec = 1000;
        for wrap in 1..=4u64 {
            let _ = clock.reconstruct(0xFFFFF0, WALL);
            let (s, _) = clock.reconstruct(0x000010 + wrap as u32, WALL);
            sec = s;
        }
        assert_eq!(sec, 1001);
    }

    #[test]
    fn long_wall_gap_resyncs_to_wall_clock() {
        let mut clock = synced_clock();
        let _ = clock.reconstruct(600, WALL);
        // 500 ms later in wall time: tick arithmetic is abandoned.
        let wall = WallTime { sec: 1000, nsec: 500_000_000 };
        assert_eq!(clock.reconstruct(1200, wall), (1000, 500_000_000));
        // And the offset picks up from the wall sample: the next tick stays
        // near the resynced point instead of the stale tick timeline.
        let wall = WallTime { sec: 1000, nsec: 500_000_100 };
        let (sec, nsec) = clock.reconstruct(1300, wall);
        assert_eq!(sec, 1000);
        assert!(nsec >= 500_000_000, "nsec {nsec} fell behind the resync point");
    }

    #[test]
    fn whole_second_gap_resyncs() {
        let mut clock = synced_clock();
        let wall = WallTime { sec: 1002, nsec: 123 };
        assert_eq!(clock.reconstruct(42, wall), (1002, 123));
    }

    #[test]
    fn small_gaps_do_not_resync() {
        let mut clock = synced_clock();
        let wall = WallTime { sec: 1000, nsec: 200_000_000 };
        let (sec, nsec) = clock.reconstruct(12_000_000, wall);
        assert_eq!(sec, 1000);
        // Tick-derived, not the wall sample.
        assert_eq!(nsec, 12_000_000 * 17 - 12_000_000 / 3);
    }
}
