use arrayvec::ArrayVec;
use thiserror::Error;

/// 2 base bytes + 8 extended length bytes + 4 mask bytes.
pub const MAX_HEADER_LEN: usize = 14;

/// Frames this small carry no real payload once encrypted; they are either a
/// close code or a client error.
pub const SHORT_FRAME_LEN: usize = 8;

/// Reads tolerated after the first one before a logical message is
/// considered an attack on memory.
pub const MAX_EXTRA_READS: u8 = 3;

const CLOSE_NORMAL: [u8; 2] = [0x03, 0xE8];
const CLOSE_GOING_AWAY: [u8; 2] = [0x03, 0xE9];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    /// Already unmasked.
    pub payload: Vec<u8>,
}

/// Outcomes of a read that end the connection instead of yielding data.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolSignal {
    /// Explicit close: a close frame, or a short buffer unmasking to 1000/1001.
    #[error("close signal")]
    Close,
    /// A data frame of at most [`SHORT_FRAME_LEN`] bytes that is not a close code.
    #[error("message too short")]
    TooShort,
    /// The logical message outgrew the extra-read allowance.
    #[error("suspected attack")]
    SuspectedAttack,
    /// Reserved opcode or broken fragment sequence.
    #[error("malformed frame")]
    Malformed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Frame { frame: Frame, consumed: usize },
    /// More bytes are needed before the frame at the head of the buffer is complete.
    Incomplete,
    Signal(ProtocolSignal),
}

/// Largest payload a single logical message may reach: whatever fits, header
/// included, in the first read plus the extra-read allowance.
pub fn max_message_len(max_buffer_size: usize) -> usize {
    max_buffer_size
        .saturating_mul(usize::from(MAX_EXTRA_READS) + 1)
        .saturating_sub(MAX_HEADER_LEN)
}

/// Decodes the frame at the head of `raw`.
///
/// Pure: no I/O, no state. The payload length follows the three tiers
/// (7-bit inline, 126 => u16, 127 => u64, both big-endian) and the mask is
/// XORed over the payload when the mask bit is set.
pub fn decode(raw: &[u8], max_buffer_size: usize) -> Decoded {
    if raw.len() < 2 {
        return Decoded::Incomplete;
    }

    let first_byte = raw[0];
    let second_byte = raw[1];

    let fin = (first_byte & 0x80) != 0;
    let opcode = match Opcode::from_bits(first_byte & 0x0F) {
        Some(op) => op,
        None => return Decoded::Signal(ProtocolSignal::Malformed),
    };
    let masked = (second_byte & 0x80) != 0;

    let (payload_len, mut offset) = match second_byte & 0x7F {
        126 => {
            if raw.len() < 4 {
                return Decoded::Incomplete;
            }
            (u64::from(u16::from_be_bytes([raw[2], raw[3]])), 4)
        }
        127 => {
            if raw.len() < 10 {
                return Decoded::Incomplete;
            }
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&raw[2..10]);
            (u64::from_be_bytes(len_bytes), 10)
        }
        inline => (u64::from(inline), 2),
    };

    if payload_len > max_message_len(max_buffer_size) as u64 {
        return Decoded::Signal(ProtocolSignal::SuspectedAttack);
    }
    let payload_len = payload_len as usize;

    let mask = if masked {
        if raw.len() < offset + 4 {
            return Decoded::Incomplete;
        }
        let key = [raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let total_len = offset + payload_len;
    if raw.len() < total_len {
        return Decoded::Incomplete;
    }

    let mut payload = raw[offset..total_len].to_vec();
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    if opcode == Opcode::Close || (total_len <= SHORT_FRAME_LEN && is_close_code(&payload)) {
        return Decoded::Signal(ProtocolSignal::Close);
    }

    Decoded::Frame {
        frame: Frame {
            fin,
            opcode,
            payload,
        },
        consumed: total_len,
    }
}

/// Encodes one frame. FIN is set unless `continuation` says more frames of
/// the same message follow.
///
/// When `mask` is given the payload is XORed with it and the mask bit is set.
/// Browsers expect unmasked server frames; masking is kept for the clients
/// this server was built against.
pub fn encode(payload: &[u8], opcode: Opcode, continuation: bool, mask: Option<[u8; 4]>) -> Vec<u8> {
    let payload_len = payload.len();
    let mut header: ArrayVec<u8, MAX_HEADER_LEN> = ArrayVec::new();

    let fin = if continuation { 0x00 } else { 0x80 };
    header.push(fin | opcode.bits());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if payload_len < 126 {
        header.push(mask_bit | payload_len as u8);
    } else if payload_len <= usize::from(u16::MAX) {
        header.push(mask_bit | 126);
        header.extend((payload_len as u16).to_be_bytes());
    } else {
        header.push(mask_bit | 127);
        header.extend((payload_len as u64).to_be_bytes());
    }

    if let Some(key) = mask {
        header.extend(key);
    }

    let mut out = Vec::with_capacity(header.len() + payload_len);
    out.extend_from_slice(&header);
    let body_start = out.len();
    out.extend_from_slice(payload);
    if let Some(key) = mask {
        apply_mask(&mut out[body_start..], key);
    }
    out
}

/// XOR masking; applying it twice restores the input.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

fn is_close_code(payload: &[u8]) -> bool {
    payload == CLOSE_NORMAL || payload == CLOSE_GOING_AWAY
}

/// A complete inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Data(Vec<u8>),
    Ping(Vec<u8>),
    Pong,
}

/// Accumulates raw reads from one socket and classifies them into messages
/// or a terminating [`ProtocolSignal`].
#[derive(Debug)]
pub struct FrameReader {
    buf: Vec<u8>,
    /// Opcode and payload gathered so far for a fragmented message.
    fragments: Option<(Opcode, Vec<u8>)>,
    extra_reads: u8,
    max_buffer_size: usize,
}

impl FrameReader {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_buffer_size),
            fragments: None,
            extra_reads: 0,
            max_buffer_size,
        }
    }

    /// Feeds the bytes of one read. Every read that continues an unfinished
    /// message counts against [`MAX_EXTRA_READS`].
    ///
    /// Messages completed before a terminating signal are still returned, in
    /// arrival order. Once a signal is returned the reader is spent.
    pub fn push(&mut self, chunk: &[u8]) -> (Vec<Message>, Option<ProtocolSignal>) {
        let mut messages = Vec::new();
        let signal = self.drain(chunk, &mut messages).err();
        (messages, signal)
    }

    fn drain(&mut self, chunk: &[u8], messages: &mut Vec<Message>) -> Result<(), ProtocolSignal> {
        if self.is_mid_message() {
            self.extra_reads += 1;
            if self.extra_reads > MAX_EXTRA_READS {
                return Err(ProtocolSignal::SuspectedAttack);
            }
        }
        self.buf.extend_from_slice(chunk);

        loop {
            let (frame, consumed) = match decode(&self.buf, self.max_buffer_size) {
                Decoded::Incomplete => break,
                Decoded::Signal(signal) => return Err(signal),
                Decoded::Frame { frame, consumed } => (frame, consumed),
            };
            let _ = self.buf.drain(..consumed);

            // only a whole message can be too short; fragments may be tiny
            let unfragmented = frame.fin
                && self.fragments.is_none()
                && matches!(frame.opcode, Opcode::Text | Opcode::Binary);
            if unfragmented && consumed <= SHORT_FRAME_LEN {
                return Err(ProtocolSignal::TooShort);
            }

            if let Some(message) = self.assemble(frame)? {
                messages.push(message);
                self.extra_reads = 0;
            }
        }

        if !self.is_mid_message() {
            self.extra_reads = 0;
        }
        Ok(())
    }

    fn assemble(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolSignal> {
        match frame.opcode {
            Opcode::Text | Opcode::Binary => {
                if self.fragments.is_some() {
                    return Err(ProtocolSignal::Malformed);
                }
                if frame.fin {
                    return Ok(Some(Message::Data(frame.payload)));
                }
                self.fragments = Some((frame.opcode, frame.payload));
                Ok(None)
            }
            Opcode::Continuation => {
                let Some((_, mut gathered)) = self.fragments.take() else {
                    return Err(ProtocolSignal::Malformed);
                };
                gathered.extend_from_slice(&frame.payload);
                if gathered.len() > max_message_len(self.max_buffer_size) {
                    return Err(ProtocolSignal::SuspectedAttack);
                }
                if frame.fin {
                    Ok(Some(Message::Data(gathered)))
                } else {
                    self.fragments = Some((Opcode::Text, gathered));
                    Ok(None)
                }
            }
            Opcode::Ping => Ok(Some(Message::Ping(frame.payload))),
            Opcode::Pong => Ok(Some(Message::Pong)),
            // decode() turns close frames into a signal
            Opcode::Close => Err(ProtocolSignal::Close),
        }
    }

    fn is_mid_message(&self) -> bool {
        !self.buf.is_empty() || self.fragments.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    fn client_frame(payload: &[u8], opcode: Opcode, continuation: bool) -> Vec<u8> {
        encode(payload, opcode, continuation, Some(KEY))
    }

    #[test]
    fn round_trips_across_length_tiers() {
        for len in [0usize, 1, 125, 126, 65535, 65537] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            for mask in [None, Some(KEY)] {
                let raw = encode(&payload, Opcode::Text, false, mask);
                match decode(&raw, usize::MAX / 8) {
                    Decoded::Frame { frame, consumed } => {
                        assert_eq!(consumed, raw.len());
                        assert!(frame.fin);
                        assert_eq!(frame.opcode, Opcode::Text);
                        assert_eq!(frame.payload, payload, "len {len}");
                    }
                    other => panic!("len {len}: unexpected {other:?}"),
                }
            }
        }
    }

    #[test]
    fn header_uses_the_expected_length_tier() {
        assert_eq!(encode(&[0; 125], Opcode::Text, false, None)[1], 125);
        let mid = encode(&[0; 126], Opcode::Text, false, None);
        assert_eq!(&mid[1..4], &[126, 0, 126]);
        let big = encode(&[0; 65536], Opcode::Text, false, Some(KEY));
        assert_eq!(big[1], 0x80 | 127);
        assert_eq!(&big[2..10], &65536u64.to_be_bytes());
        assert_eq!(big.len(), 14 + 65536);
    }

    #[test]
    fn continuation_clears_fin() {
        let raw = encode(b"abc", Opcode::Text, true, None);
        assert_eq!(raw[0], 0x01);
        let raw = encode(b"abc", Opcode::Continuation, false, None);
        assert_eq!(raw[0], 0x80);
    }

    #[test]
    fn rfc_sample_masked_hello() {
        let raw = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        match decode(&raw, 2048) {
            Decoded::Frame { frame, .. } => assert_eq!(frame.payload, b"Hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn partial_headers_and_bodies_are_incomplete() {
        let raw = client_frame(&[7; 300], Opcode::Text, false);
        for cut in [1, 3, 7, raw.len() - 1] {
            assert_eq!(decode(&raw[..cut], 2048), Decoded::Incomplete);
        }
    }

    #[test]
    fn close_codes_in_short_buffer_are_close_signals() {
        for code in [[0x03, 0xE8], [0x03, 0xE9]] {
            let raw = client_frame(&code, Opcode::Text, false);
            assert_eq!(raw.len(), 8);
            assert_eq!(decode(&raw, 2048), Decoded::Signal(ProtocolSignal::Close));
        }
        let raw = client_frame(b"", Opcode::Close, false);
        assert_eq!(decode(&raw, 2048), Decoded::Signal(ProtocolSignal::Close));
    }

    #[test]
    fn oversized_declared_length_is_an_attack() {
        let raw = client_frame(&[0; 9000], Opcode::Text, false);
        assert_eq!(
            decode(&raw[..14], 2048),
            Decoded::Signal(ProtocolSignal::SuspectedAttack)
        );
    }

    #[test]
    fn reserved_opcode_is_malformed() {
        assert_eq!(
            decode(&[0x83, 0x00], 2048),
            Decoded::Signal(ProtocolSignal::Malformed)
        );
    }

    #[test]
    fn reader_splits_coalesced_frames() {
        let mut raw = client_frame(b"first message", Opcode::Text, false);
        raw.extend(client_frame(b"second message", Opcode::Text, false));
        let mut reader = FrameReader::new(2048);
        let (messages, signal) = reader.push(&raw);
        assert_eq!(signal, None);
        assert_eq!(
            messages,
            vec![
                Message::Data(b"first message".to_vec()),
                Message::Data(b"second message".to_vec()),
            ]
        );
    }

    #[test]
    fn reader_waits_for_the_rest_of_a_frame() {
        let raw = client_frame(&[b'x'; 3000], Opcode::Text, false);
        let mut reader = FrameReader::new(2048);
        assert_eq!(reader.push(&raw[..2048]), (Vec::new(), None));
        let (messages, _) = reader.push(&raw[2048..]);
        assert_eq!(messages, vec![Message::Data(vec![b'x'; 3000])]);
    }

    #[test]
    fn reader_reassembles_fragments() {
        let mut raw = client_frame(b"{\"action\":", Opcode::Text, true);
        raw.extend(client_frame(b"\"ping\",", Opcode::Continuation, true));
        raw.extend(client_frame(b"\"sid\":1}", Opcode::Continuation, false));
        let mut reader = FrameReader::new(2048);
        let (messages, signal) = reader.push(&raw);
        assert_eq!(signal, None);
        assert_eq!(
            messages,
            vec![Message::Data(b"{\"action\":\"ping\",\"sid\":1}".to_vec())]
        );
    }

    #[test]
    fn short_final_fragment_is_not_too_short() {
        let mut raw = client_frame(b"{\"action\":\"ping\",\"sid\":1", Opcode::Text, true);
        let last = client_frame(b"}", Opcode::Continuation, false);
        assert!(last.len() <= SHORT_FRAME_LEN);
        raw.extend(last);
        let mut reader = FrameReader::new(2048);
        assert_eq!(
            reader.push(&raw),
            (vec![Message::Data(b"{\"action\":\"ping\",\"sid\":1}".to_vec())], None)
        );
    }

    #[test]
    fn fourth_extra_read_is_an_attack() {
        let raw = client_frame(&[b'y'; 8000], Opcode::Text, false);
        let mut reader = FrameReader::new(2048);
        let mut chunks = raw.chunks(1000);
        for _ in 0..4 {
            assert_eq!(reader.push(chunks.next().unwrap()), (Vec::new(), None));
        }
        assert_eq!(
            reader.push(chunks.next().unwrap()),
            (Vec::new(), Some(ProtocolSignal::SuspectedAttack))
        );
    }

    #[test]
    fn largest_single_frame_fits_the_read_allowance() {
        let max = 64;
        let limit = max_message_len(max);
        let raw = client_frame(&vec![b'w'; limit], Opcode::Text, false);
        let mut reader = FrameReader::new(max);
        let mut delivered = Vec::new();
        for chunk in raw.chunks(max) {
            let (messages, signal) = reader.push(chunk);
            assert_eq!(signal, None);
            delivered.extend(messages);
        }
        assert_eq!(delivered, vec![Message::Data(vec![b'w'; limit])]);

        let raw = client_frame(&vec![b'w'; limit + 1], Opcode::Text, false);
        let mut reader = FrameReader::new(max);
        assert_eq!(
            reader.push(&raw[..max]),
            (Vec::new(), Some(ProtocolSignal::SuspectedAttack))
        );
    }

    #[test]
    fn allowance_resets_after_each_message() {
        let raw = client_frame(&[b'z'; 1500], Opcode::Text, false);
        let mut reader = FrameReader::new(2048);
        for _ in 0..3 {
            let mut delivered = Vec::new();
            for chunk in raw.chunks(500) {
                let (messages, signal) = reader.push(chunk);
                assert_eq!(signal, None);
                delivered.extend(messages);
            }
            assert_eq!(delivered.len(), 1);
        }
    }

    #[test]
    fn tiny_data_frame_is_too_short() {
        let raw = client_frame(b"ab", Opcode::Text, false);
        let mut reader = FrameReader::new(2048);
        assert_eq!(reader.push(&raw), (Vec::new(), Some(ProtocolSignal::TooShort)));
    }

    #[test]
    fn data_ahead_of_a_close_is_delivered() {
        let mut raw = client_frame(b"before the close", Opcode::Text, false);
        raw.extend(client_frame(&[0x03, 0xE8], Opcode::Close, false));
        let mut reader = FrameReader::new(2048);
        assert_eq!(
            reader.push(&raw),
            (
                vec![Message::Data(b"before the close".to_vec())],
                Some(ProtocolSignal::Close)
            )
        );
    }

    #[test]
    fn ping_control_frame_is_surfaced() {
        let raw = client_frame(b"", Opcode::Ping, false);
        let mut reader = FrameReader::new(2048);
        assert_eq!(reader.push(&raw), (vec![Message::Ping(Vec::new())], None));
    }

    #[test]
    fn stray_continuation_is_malformed() {
        let raw = client_frame(b"orphaned piece", Opcode::Continuation, false);
        let mut reader = FrameReader::new(2048);
        assert_eq!(reader.push(&raw), (Vec::new(), Some(ProtocolSignal::Malformed)));
    }
}
