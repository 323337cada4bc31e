use std::fmt::{Display, Formatter};
use std::fmt::Write as _;

use bytes::{Bytes, BytesMut};

use crate::seq_number::SeqNumber;

/// A single wire transmission attempt. Immutable once constructed - a
/// retransmission is a fresh `Packet` with a higher `retransmit_count`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Packet {
    pub seq: SeqNumber,
    /// The sender's window size at the time of transmission.
    pub window_hint: u32,
    pub retransmit_count: u32,
}

/// A wire frame that could not be decoded. The caller is expected to skip
/// the frame and keep consuming the stream.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ParseError(pub String);

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed wire frame: {}", self.0)
    }
}

impl std::error::Error for ParseError {}

/// The canonical text codec: one delimiter-terminated line per message.
///
/// * data packet: `"<seq>,<window_hint>,<retransmit_count>"`
/// * acknowledgment: `"ACK <seq>"`
///
/// The text form is chosen for human debuggability; all three packet fields
/// round-trip exactly.
#[derive(Debug, Clone, Copy)]
pub struct WireCodec {
    modulus: u32,
    delimiter: u8,
}

impl WireCodec {
    const ACK_PREFIX: &'static str = "ACK ";

    pub fn new(modulus: u32, delimiter: u8) -> WireCodec {
        WireCodec { modulus, delimiter }
    }

    pub fn encode_packet(&self, packet: &Packet, buf: &mut BytesMut) {
        let mut line = String::with_capacity(24);
        write!(
            line,
            "{},{},{}",
            packet.seq, packet.window_hint, packet.retransmit_count
        )
        .expect("writing to a String cannot fail");
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(&[self.delimiter]);
    }

    /// Decodes a single frame (without its trailing delimiter).
    pub fn decode_packet(&self, frame: &[u8]) -> Result<Packet, ParseError> {
        let line = frame_str(frame)?;

        let mut fields = line.split(',');
        let seq = self.parse_seq(fields.next())?;
        let window_hint = parse_uint(fields.next(), "window hint")?;
        let retransmit_count = parse_uint(fields.next(), "retransmit count")?;
        if fields.next().is_some() {
            return Err(ParseError(format!("trailing fields in {:?}", line)));
        }

        Ok(Packet {
            seq,
            window_hint,
            retransmit_count,
        })
    }

    pub fn encode_ack(&self, ack: SeqNumber, buf: &mut BytesMut) {
        let mut line = String::with_capacity(12);
        write!(line, "{}{}", Self::ACK_PREFIX, ack).expect("writing to a String cannot fail");
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(&[self.delimiter]);
    }

    pub fn decode_ack(&self, frame: &[u8]) -> Result<SeqNumber, ParseError> {
        let line = frame_str(frame)?;
        let rest = line
            .strip_prefix(Self::ACK_PREFIX)
            .ok_or_else(|| ParseError(format!("not an acknowledgment: {:?}", line)))?;
        self.parse_seq(Some(rest))
    }

    fn parse_seq(&self, field: Option<&str>) -> Result<SeqNumber, ParseError> {
        let raw = parse_uint(field, "sequence number")?;
        if raw >= self.modulus {
            return Err(ParseError(format!(
                "sequence number {} outside [0, {})",
                raw, self.modulus
            )));
        }
        Ok(SeqNumber::from_raw(raw))
    }
}

fn frame_str(frame: &[u8]) -> Result<&str, ParseError> {
    std::str::from_utf8(frame)
        .map(str::trim)
        .map_err(|_| ParseError("frame is not valid UTF-8".to_string()))
}

fn parse_uint(field: Option<&str>, what: &str) -> Result<u32, ParseError> {
    let field = field.ok_or_else(|| ParseError(format!("missing {}", what)))?;
    field
        .trim()
        .parse::<u32>()
        .map_err(|_| ParseError(format!("{} is not an integer: {:?}", what, field)))
}

/// Reassembles delimiter-terminated frames from a byte stream.
///
/// Stream transports split and coalesce writes arbitrarily, so a single read
/// may carry half a message or several. Chunks are buffered and complete
/// frames yielded in arrival order; an incomplete trailing fragment is held
/// back until more bytes arrive.
pub struct StreamFramer {
    buf: BytesMut,
    delimiter: u8,
}

impl StreamFramer {
    pub fn new(delimiter: u8) -> StreamFramer {
        StreamFramer {
            buf: BytesMut::with_capacity(4096),
            delimiter,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// The next complete frame, without its delimiter, or `None` if the
    /// buffer holds no complete frame yet.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        let pos = self.buf.iter().position(|&b| b == self.delimiter)?;
        let mut frame = self.buf.split_to(pos + 1);
        frame.truncate(pos);
        Some(frame.freeze())
    }
}
