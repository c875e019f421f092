use super::constants::{SPEED_MAP, UPV_MAX_PACKET_LEN, UPV_START_CMD, UPV_STOP_CMD};

/// Bus event carried in bits 4..8 of a packet status word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Data,
    ResetBegin,
    ResetEnd,
    SuspendBegin,
    SuspendEnd,
    Overflow,
}

impl EventType {
    /// Decode the event nibble of `status`, when it is a defined value.
    pub fn from_status(status: u32) -> Option<Self> {
        match (status >> 4) & 0x0f {
            0x0 => Some(EventType::Data),
            0x1 => Some(EventType::ResetBegin),
            0x2 => Some(EventType::ResetEnd),
            0x3 => Some(EventType::SuspendBegin),
            0x4 => Some(EventType::SuspendEnd),
            0xf => Some(EventType::Overflow),
            _ => None,
        }
    }
}

/// Bus speed from the low two status bits: 3=high, 2=full, 1=low.
pub fn speed_bits(status: u32) -> u8 {
    (status & 0x03) as u8
}

/// Receives framed packets in wire order. The timestamp layer sits behind
/// this seam during capture; tests plug in recorders directly.
pub trait FrameHandler {
    /// `tick` is the raw 24-bit 60 MHz counter sample from the header word.
    /// The return value is reserved for future flow control.
    fn on_frame(&mut self, tick: u32, payload: &[u8], status: u32) -> i32;
}

/// Whether the word stream may continue after a `process` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum ParseOutcome {
    Continue,
    /// A stop word was seen in a running state; the capture session is over.
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParseState {
    Idle,
    ExpectHeader,
    ExpectLen,
    Collect,
    Stopping,
    Recover,
}

/// Word-aligned payload accumulator, sized well past the length guard.
const SCRATCH_BYTES: usize = (1024 + 16) * 4;

/// Recovers packet boundaries from the 32-bit word stream of the bulk-IN
/// endpoint.
///
/// A capture session opens with a start word. Each packet is a header word
/// carrying tick, speed and event nibbles; headers flagged 0x60 are followed
/// by a length word whose high half already holds the first two payload
/// bytes, then enough words to cover the announced length. Any other header
/// is a zero-length bus event. Malformed lengths divert to a recovery state
/// that waits for the next plausible header/length word.
pub struct FrameParser {
    state: ParseState,
    scratch: [u8; SCRATCH_BYTES],
    scratch_len: usize,
    pkt_len: usize,
    pkt_status: u32,
    pkt_tick: u32,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::Idle,
            scratch: [0u8; SCRATCH_BYTES],
            scratch_len: 0,
            pkt_len: 0,
            pkt_status: 0,
            pkt_tick: 0,
        }
    }

    /// Drop everything except the stop word. Entered once a stop has been
    /// requested so no further packets reach the consumer.
    pub(crate) fn enter_stopping(&mut self) {
        self.state = ParseState::Stopping;
    }

    /// Feed one filled transfer buffer. Trailing bytes short of a full word
    /// are discarded, matching the device's word-aligned stream.
    pub fn process(&mut self, data: &[u8], handler: &mut dyn FrameHandler) -> ParseOutcome {
        for chunk in data.chunks_exact(4) {
            let word = u32::from_le_bytes(chunk.try_into().unwrap());
            if self.step(word, handler) == ParseOutcome::Stop {
                return ParseOutcome::Stop;
            }
        }
        ParseOutcome::Continue
    }

    fn step(&mut self, word: u32, handler: &mut dyn FrameHandler) -> ParseOutcome {
        match self.state {
            ParseState::Idle => {
                if word == UPV_START_CMD {
                    self.state = ParseState::ExpectHeader;
                }
            }
            ParseState::ExpectHeader => {
                if word == UPV_STOP_CMD {
                    return ParseOutcome::Stop;
                }
                self.pkt_tick = word >> 8;
                self.pkt_status = SPEED_MAP[(word & 0x0f) as usize] as u32 | (word & 0xf0);
                self.scratch_len = 0;
                if word & 0xf0 == 0x60 {
                    // Data packets report event type 0.
                    self.pkt_status &= 0xffff_ff0f;
                    self.state = ParseState::ExpectLen;
                } else {
                    handler.on_frame(self.pkt_tick, &[], self.pkt_status);
                }
            }
            ParseState::ExpectLen => {
                let len = (word & 0xffff) as usize;
                if len > UPV_MAX_PACKET_LEN {
                    self.state = ParseState::Recover;
                } else {
                    self.begin_payload(len, word, handler);
                }
            }
            ParseState::Collect => {
                self.push_word(word);
                if self.scratch_len >= self.pkt_len + 2 {
                    self.emit(handler);
                    self.state = ParseState::ExpectHeader;
                }
            }
            ParseState::Stopping => {
                if word == UPV_STOP_CMD {
                    return ParseOutcome::Stop;
                }
            }
            ParseState::Recover => {
                let len = (word & 0xffff) as usize;
                if word & 0xf0 == 0x60 && len <= UPV_MAX_PACKET_LEN {
                    self.begin_payload(len, word, handler);
                }
            }
        }
        ParseOutcome::Continue
    }

    /// Store the length word and either finish a short packet immediately or
    /// start collecting payload words.
    fn begin_payload(&mut self, len: usize, word: u32, handler: &mut dyn FrameHandler) {
        self.pkt_len = len;
        self.scratch_len = 0;
        self.push_word(word);
        if len <= 2 {
            self.emit(handler);
            self.state = ParseState::ExpectHeader;
        } else {
            self.state = ParseState::Collect;
        }
    }

    fn push_word(&mut self, word: u32) {
        self.scratch[self.scratch_len..self.scratch_len + 4].copy_from_slice(&word.to_le_bytes());
        self.scratch_len += 4;
    }

    /// The payload starts at byte offset 2 of the accumulator: the high half
    /// of the length word carries the first two payload bytes.
    fn emit(&mut self, handler: &mut dyn FrameHandler) {
        let payload = &self.scratch[2..2 + self.pkt_len];
        handler.on_frame(self.pkt_tick, payload, self.pkt_status);
    }
}

#[cfg(test)]
mod tests {
    use super::{EventType, FrameHandler, FrameParser, ParseOutcome, speed_bits};
    use crate::upv::constants::{UPV_START_CMD, UPV_STOP_CMD};

    #[derive(Default)]
    struct FrameRecorder {
        frames: Vec<(u32, Vec<u8>, u32)>,
    }

    impl FrameHandler for FrameRecorder {
        fn on_frame(&mut self, tick: u32, payload: &[u8], status: u32) -> i32 {
            self.frames.push((tick, payload.to_vec(), status));
            0
        }
    }

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Encode one data packet as header word plus length/payload words.
    fn encode_data(tick: u32, speed: u8, payload: &[u8]) -> Vec<u32> {
        let header = (tick << 8) | 0x60 | u32::from(speed & 0x0f);
        let mut block = Vec::from((payload.len() as u16).to_le_bytes());
        block.extend_from_slice(payload);
        while block.len() % 4 != 0 {
            block.push(0);
        }
        let mut words = vec![header];
        words.extend(
            block
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap())),
        );
        words
    }

    fn run(words: &[u32]) -> (FrameRecorder, ParseOutcome) {
        let mut parser = FrameParser::new();
        let mut rec = FrameRecorder::default();
        let outcome = parser.process(&words_to_bytes(words), &mut rec);
        (rec, outcome)
    }

    #[test]
    fn data_packet_payload_and_status() {
        let words = [UPV_START_CMD, 0x0012_3460, 0x5500_0005, 0xAABB_CCDD];
        let (rec, outcome) = run(&words);
        assert_eq!(outcome, ParseOutcome::Continue);
        assert_eq!(rec.frames.len(), 1);
        let (tick, payload, status) = &rec.frames[0];
        assert_eq!(*tick, 0x001234);
        assert_eq!(payload, &[0x00, 0x55, 0xDD, 0xCC, 0xBB]);
        // Speed nibble 0 remaps to high speed; the event nibble is data.
        assert_eq!(speed_bits(*status), 3);
        assert_eq!(EventType::from_status(*status), Some(EventType::Data));
    }

    #[test]
    fn bus_event_has_empty_payload() {
        let words = [UPV_START_CMD, 0x0000_4010];
        let (rec, _) = run(&words);
        assert_eq!(rec.frames.len(), 1);
        let (tick, payload, status) = &rec.frames[0];
        assert_eq!(*tick, 0x000040);
        assert!(payload.is_empty());
        assert_eq!(EventType::from_status(*status), Some(EventType::ResetBegin));
        assert_eq!(speed_bits(*status), 3);
    }

    #[test]
    fn words_before_start_are_discarded() {
        let words = [0xDEAD_BEEF, 0x0000_4010, UPV_START_CMD, 0x0000_4020];
        let (rec, _) = run(&words);
        assert_eq!(rec.frames.len(), 1);
        assert_eq!(EventType::from_status(rec.frames[0].2), Some(EventType::ResetEnd));
    }

    #[test]
    fn stop_word_ends_the_session() {
        let words = [UPV_START_CMD, 0x0000_4010, UPV_STOP_CMD, 0x0000_4010];
        let (rec, outcome) = run(&words);
        assert_eq!(outcome, ParseOutcome::Stop);
        // Nothing after the stop word is parsed.
        assert_eq!(rec.frames.len(), 1);
    }

    #[test]
    fn garbage_header_emits_zero_length_event() {
        // 0xDEADBEEF is not a data header (event nibble 0xE), so it becomes a
        // zero-length event and parsing continues with the next packet.
        let mut words = vec![UPV_START_CMD, 0xDEAD_BEEF];
        words.extend(encode_data(0x000033, 0, &[0x11; 8]));
        let (rec, _) = run(&words);
        assert_eq!(rec.frames.len(), 2);
        assert!(rec.frames[0].1.is_empty());
        assert_eq!(rec.frames[1].1, vec![0x11; 8]);
    }

    #[test]
    fn oversized_length_enters_recovery() {
        // len=2000 on the length word is out of range. Neither the all-ones
        // word nor the event header qualifies as a resume point, so nothing
        // is emitted.
        let words = [UPV_START_CMD, 0x0000_1160, 2000, 0xFFFF_FFFF, 0x0000_4010];
        let (rec, _) = run(&words);
        assert!(rec.frames.is_empty());
    }

    #[test]
    fn recovery_resumes_on_plausible_length_word() {
        let mut words = vec![UPV_START_CMD, 0x0000_1160, 2000, 0xFFFF_FFFF];
        // Resume point: length 0x60 = 96 with the data flag in bits 4..8.
        words.push(0x0000_0060);
        // 96+2 bytes means 25 stored words; 24 payload words follow.
        for i in 1..=24u32 {
            words.push(i);
        }
        let (rec, _) = run(&words);
        assert_eq!(rec.frames.len(), 1);
        let (tick, payload, _) = &rec.frames[0];
        // The tick comes from the corrupted packet's header.
        assert_eq!(*tick, 0x000011);
        assert_eq!(payload.len(), 96);
        // First two payload bytes are the resume word's high half.
        assert_eq!(&payload[..2], &[0x00, 0x00]);
        // Then the collected words, little-endian.
        assert_eq!(payload[2], 1);
        assert_eq!(payload[6], 2);
    }

    #[test]
    fn length_just_past_limit_is_recover_worthy() {
        let words = [UPV_START_CMD, 0x0000_1160, 1025];
        let (rec, _) = run(&words);
        assert!(rec.frames.is_empty());
    }

    #[test]
    fn recovery_waits_for_plausible_word() {
        // Recovery ignores words without the data flag or with an oversized
        // length, then replays the first plausible one as a length word.
        let mut parser = FrameParser::new();
        let mut rec = FrameRecorder::default();
        let mut words = vec![UPV_START_CMD, 0x0000_1160, 5000, 0x0000_00E0, 0x2000_0060];
        words.push(0x1111_1111);
        let outcome = parser.process(&words_to_bytes(&words), &mut rec);
        assert_eq!(outcome, ParseOutcome::Continue);
        // 0x2000_0060 reads as len=0x60=96: collect continues into the next
        // words without emitting yet.
        assert!(rec.frames.is_empty());
    }

    #[test]
    fn short_packet_lengths() {
        for len in 0..=2usize {
            let payload = vec![0x42; len];
            let mut words = vec![UPV_START_CMD];
            words.extend(encode_data(0x000001, 2, &payload));
            let (rec, _) = run(&words);
            assert_eq!(rec.frames.len(), 1, "len {len}");
            assert_eq!(rec.frames[0].1, payload);
        }
    }

    #[test]
    fn max_length_packet_is_accepted() {
        let payload: Vec<u8> = (0..1024).map(|i| (i * 7) as u8).collect();
        let mut words = vec![UPV_START_CMD];
        words.extend(encode_data(0x00ffff, 0, &payload));
        let (rec, _) = run(&words);
        assert_eq!(rec.frames.len(), 1);
        assert_eq!(rec.frames[0].1, payload);
    }

    #[test]
    fn packets_are_delivered_in_wire_order() {
        let mut words = vec![UPV_START_CMD];
        for i in 0..16u32 {
            words.extend(encode_data(i, 0, &[i as u8; 3]));
            words.push((i << 8) | 0x10 | 0x03);
        }
        let (rec, _) = run(&words);
        assert_eq!(rec.frames.len(), 32);
        for i in 0..16 {
            assert_eq!(rec.frames[i * 2].0, i as u32);
            assert_eq!(rec.frames[i * 2].1, vec![i as u8; 3]);
            assert_eq!(rec.frames[i * 2 + 1].0, i as u32);
            assert!(rec.frames[i * 2 + 1].1.is_empty());
        }
    }

    #[test]
    fn stopping_state_discards_until_stop() {
        let mut parser = FrameParser::new();
        let mut rec = FrameRecorder::default();
        let mut words = vec![UPV_START_CMD];
        words.extend(encode_data(1, 0, &[1, 2, 3]));
        assert_eq!(
            parser.process(&words_to_bytes(&words), &mut rec),
            ParseOutcome::Continue
        );
        parser.enter_stopping();
        let tail = [0x0000_4010, 0x0000_3360, UPV_STOP_CMD];
        assert_eq!(
            parser.process(&words_to_bytes(&tail), &mut rec),
            ParseOutcome::Stop
        );
        // Only the packet from before the stop request was delivered.
        assert_eq!(rec.frames.len(), 1);
    }
}
