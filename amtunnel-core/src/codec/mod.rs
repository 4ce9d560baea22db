//! Line codec shared by both transfer directions.
//!
//! # Wire format
//!
//! ```text
//! #<command>:<base64 payload>:<hex digest>\n
//!  │         │                │
//!  │         │                └─ 64 hex chars (download) / 20 (upload)
//!  │         └─ at most 3072 raw bytes (download) / 720 (upload)
//!  └─ M metadata, D data, E end, A abort
//! ```
//!
//! `\n` is emitted; either `\n` or `\r` terminates a line on decode. A line
//! with no terminator is cut at [`Direction::max_line_len`], so a peer can
//! never make us buffer an unbounded line.
//!
//! The command character and both colons sit at fixed offsets; only the
//! payload and digest lengths vary, which is what [`decode_frame`] checks.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TunnelError;

/// Raw payload budget of one download line.
pub const DOWNLOAD_MAX_PAYLOAD: usize = 3 * 1024;

/// Raw payload budget of one upload line.
pub const UPLOAD_MAX_PAYLOAD: usize = 3 * 240;

/// Hex digest length carried by download frames.
pub const DOWNLOAD_HASH_LEN: usize = 64;

/// Hex digest length carried by upload frames.
pub const UPLOAD_HASH_LEN: usize = 20;

/// `#`, the command char and the two colons.
const FIXED_OVERHEAD: usize = 4;

// ── Command ──────────────────────────────────────────────────────

/// The single-character command of a protocol line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// JSON metadata block (upload direction).
    Metadata,
    /// A chunk of file bytes.
    Data,
    /// Stream ended normally.
    End,
    /// Sender gave up; the file is incomplete.
    Abort,
}

impl Command {
    pub fn as_char(self) -> char {
        match self {
            Command::Metadata => 'M',
            Command::Data => 'D',
            Command::End => 'E',
            Command::Abort => 'A',
        }
    }

    /// `End` and `Abort` close the stream; exactly one of them is sent.
    pub fn is_terminal(self) -> bool {
        matches!(self, Command::End | Command::Abort)
    }
}

impl TryFrom<char> for Command {
    type Error = TunnelError;

    fn try_from(value: char) -> Result<Self, Self::Error> {
        match value {
            'M' => Ok(Command::Metadata),
            'D' => Ok(Command::Data),
            'E' => Ok(Command::End),
            'A' => Ok(Command::Abort),
            _ => Err(TunnelError::Framing("unknown command")),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

// ── Direction ────────────────────────────────────────────────────

/// Transfer direction. The two directions grew their constants
/// independently and real peers depend on both, so they stay distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Remote process → local terminal.
    Download,
    /// Local terminal → remote process.
    Upload,
}

impl Direction {
    pub const fn hash_len(self) -> usize {
        match self {
            Direction::Download => DOWNLOAD_HASH_LEN,
            Direction::Upload => UPLOAD_HASH_LEN,
        }
    }

    pub const fn max_payload(self) -> usize {
        match self {
            Direction::Download => DOWNLOAD_MAX_PAYLOAD,
            Direction::Upload => UPLOAD_MAX_PAYLOAD,
        }
    }

    /// Longest line this direction can produce, terminator excluded.
    pub const fn max_line_len(self) -> usize {
        FIXED_OVERHEAD + base64_len(self.max_payload()) + self.hash_len()
    }

    /// Commands a receiver accepts in the frame stream.
    ///
    /// Download metadata arrives as a raw JSON block before any frame, so
    /// only `D` and `E` are valid in the download body.
    pub fn accepts(self, command: Command) -> bool {
        match self {
            Direction::Download => matches!(command, Command::Data | Command::End),
            Direction::Upload => true,
        }
    }
}

/// Encoded length of `n` raw bytes under padded base64.
pub const fn base64_len(n: usize) -> usize {
    n.div_ceil(3) * 4
}

// ── Frame ────────────────────────────────────────────────────────

/// A decoded protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Decoded payload bytes.
    pub payload: Bytes,
    /// Hex digest as carried on the wire.
    pub hash: String,
}

impl Frame {
    pub fn new(command: Command, payload: impl Into<Bytes>, hash: impl Into<String>) -> Self {
        Self {
            command,
            payload: payload.into(),
            hash: hash.into(),
        }
    }
}

// ── Encoding ─────────────────────────────────────────────────────

/// Format one line from an already-encoded payload. The payload is not
/// validated.
pub fn encode_line(command: Command, payload_b64: &str, hash_hex: &str) -> String {
    let mut line =
        String::with_capacity(FIXED_OVERHEAD + payload_b64.len() + hash_hex.len() + 1);
    line.push('#');
    line.push(command.as_char());
    line.push(':');
    line.push_str(payload_b64);
    line.push(':');
    line.push_str(hash_hex);
    line.push('\n');
    line
}

/// Base64-encode `raw` and format it as one line.
pub fn encode_frame(command: Command, raw: &[u8], hash_hex: &str) -> String {
    encode_line(command, &STANDARD.encode(raw), hash_hex)
}

// ── Decoding ─────────────────────────────────────────────────────

fn is_protocol_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | ':' | '#')
}

/// First character of `line` outside the protocol alphabet, with its
/// byte offset.
pub fn find_illegal_char(line: &str) -> Option<(usize, char)> {
    line.char_indices().find(|&(_, c)| !is_protocol_char(c))
}

/// Byte-level variant of [`find_illegal_char`] for buffers that may
/// hold a partial UTF-8 sequence. Non-ASCII bytes are always illegal.
pub fn find_illegal_byte(line: &[u8]) -> Option<usize> {
    line.iter().position(|&b| !is_protocol_char(b as char))
}

/// Parse one line (terminator already stripped).
pub fn decode_frame(line: &str, direction: Direction) -> Result<Frame, TunnelError> {
    let body = line
        .strip_prefix('#')
        .ok_or(TunnelError::Framing("missing '#' prefix"))?;
    if !body.is_ascii() {
        return Err(TunnelError::Framing("non-ascii frame"));
    }

    let hash_len = direction.hash_len();
    let bytes = body.as_bytes();
    if bytes.len() < hash_len + 3 {
        return Err(TunnelError::Framing("frame too short"));
    }
    if bytes[1] != b':' {
        return Err(TunnelError::Framing("missing ':' after command"));
    }
    let digest_sep = bytes.len() - hash_len - 1;
    if bytes[digest_sep] != b':' {
        return Err(TunnelError::Framing("missing ':' before digest"));
    }

    let command = Command::try_from(bytes[0] as char)?;
    if !direction.accepts(command) {
        return Err(TunnelError::Framing("command not valid in this direction"));
    }

    let hash = &body[digest_sep + 1..];
    if !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(TunnelError::Framing("digest is not hex"));
    }

    let payload = STANDARD
        .decode(&body[2..digest_sep])
        .map_err(|_| TunnelError::Framing("payload is not base64"))?;

    Ok(Frame::new(command, payload, hash))
}

/// Locate the next frame in `buf`: `(frame_len, consumed)`.
///
/// A terminator ends the frame and is consumed with it; without one, a
/// buffer already at `max_line_len` is cut there. `None` means wait for
/// more input.
pub fn next_frame_boundary(buf: &[u8], max_line_len: usize) -> Option<(usize, usize)> {
    let window = &buf[..buf.len().min(max_line_len + 1)];
    match window.iter().position(|&b| b == b'\n' || b == b'\r') {
        Some(pos) => Some((pos, pos + 1)),
        None if buf.len() >= max_line_len => Some((max_line_len, max_line_len)),
        None => None,
    }
}

// ── tokio-util codec ─────────────────────────────────────────────

/// Framed line codec for `tokio_util::codec::{FramedRead, FramedWrite}`.
///
/// Decoding validates the alphabet and the line shape; the hash chain is
/// the caller's business since it spans frames.
#[derive(Debug, Clone, Copy)]
pub struct LineCodec {
    direction: Direction,
}

impl LineCodec {
    pub fn new(direction: Direction) -> Self {
        Self { direction }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn parse(&self, raw: &[u8]) -> Result<Frame, TunnelError> {
        let line = std::str::from_utf8(raw)
            .map_err(|e| TunnelError::Encoding(e.to_string()))?;
        if let Some((offset, ch)) = find_illegal_char(line) {
            return Err(TunnelError::IllegalCharacter { ch, offset });
        }
        decode_frame(line, self.direction)
    }
}

impl Decoder for LineCodec {
    type Item = Frame;
    type Error = TunnelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some((len, consumed)) = next_frame_boundary(src, self.direction.max_line_len())
            else {
                return Ok(None);
            };
            let line = src.split_to(len);
            src.advance(consumed - len);
            if line.is_empty() {
                // "\r\n" leaves an empty line between the two terminators
                continue;
            }
            return self.parse(&line).map(Some);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let line = src.split();
        self.parse(&line).map(Some)
    }
}

impl Encoder<Frame> for LineCodec {
    type Error = TunnelError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > self.direction.max_payload() {
            return Err(TunnelError::Encoding(format!(
                "payload of {} bytes exceeds line budget of {}",
                item.payload.len(),
                self.direction.max_payload()
            )));
        }
        let line = encode_frame(item.command, &item.payload, &item.hash);
        dst.extend_from_slice(line.as_bytes());
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(len: usize) -> String {
        "ab".repeat(len / 2)
    }

    #[test]
    fn line_lengths() {
        assert_eq!(Direction::Download.max_line_len(), 4 + 4096 + 64);
        assert_eq!(Direction::Upload.max_line_len(), 4 + 960 + 20);
    }

    #[test]
    fn encode_shape() {
        let line = encode_frame(Command::Data, &[1, 2, 3, 4], "00ff");
        assert_eq!(line, "#D:AQIDBA==:00ff\n");
        assert_eq!(encode_line(Command::End, "", "aa"), "#E::aa\n");
    }

    #[test]
    fn decode_download_data() {
        let h = hash(64);
        let line = format!("#D:AQIDBA==:{h}");
        let frame = decode_frame(&line, Direction::Download).unwrap();
        assert_eq!(frame.command, Command::Data);
        assert_eq!(&frame.payload[..], &[1, 2, 3, 4]);
        assert_eq!(frame.hash, h);
    }

    #[test]
    fn decode_empty_end() {
        let line = format!("#E::{}", hash(64));
        let frame = decode_frame(&line, Direction::Download).unwrap();
        assert_eq!(frame.command, Command::End);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn decode_rejects_bad_shapes() {
        let h = hash(64);
        for line in [
            format!("D:AQID:{h}"),
            format!("#DX:AQID:{h}"),
            format!("#D:AQID{h}"),
            format!("#M:AQID:{h}"),
            format!("#D:AQID:{}", hash(20)),
            "#D::".to_string(),
        ] {
            let err = decode_frame(&line, Direction::Download).unwrap_err();
            assert!(matches!(err, TunnelError::Framing(_)), "{line}: {err}");
        }
    }

    #[test]
    fn upload_accepts_metadata_and_abort() {
        let h = hash(20);
        assert!(decode_frame(&format!("#M:e30=:{h}"), Direction::Upload).is_ok());
        assert!(decode_frame(&format!("#A::{h}"), Direction::Upload).is_ok());
    }

    #[test]
    fn illegal_chars() {
        assert_eq!(find_illegal_char("#D:AQID:00"), None);
        assert_eq!(find_illegal_char("#D:AQ ID:00"), Some((5, ' ')));
        assert_eq!(find_illegal_char("#D:\u{1b}"), Some((3, '\u{1b}')));
        assert_eq!(find_illegal_byte("#D:é".as_bytes()), Some(3));
        assert_eq!(find_illegal_byte(b"#E::00"), None);
    }

    #[test]
    fn boundary_prefers_terminator() {
        assert_eq!(next_frame_boundary(b"abc\ndef", 10), Some((3, 4)));
        assert_eq!(next_frame_boundary(b"abc\rdef", 10), Some((3, 4)));
        assert_eq!(next_frame_boundary(b"abcdef", 10), None);
        assert_eq!(next_frame_boundary(b"abcdef", 4), Some((4, 4)));
        assert_eq!(next_frame_boundary(b"abcdef\n", 4), Some((4, 4)));
    }

    #[test]
    fn codec_decodes_crlf_stream() {
        let h = hash(20);
        let mut codec = LineCodec::new(Direction::Upload);
        let mut buf = BytesMut::from(format!("#D:AQ==:{h}\r\n#E::{h}\r\n").as_str());

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.command, Command::Data);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.command, Command::End);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_waits_for_terminator() {
        let mut codec = LineCodec::new(Direction::Upload);
        let mut buf = BytesMut::from("#D:AQ==:ab");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn codec_reports_illegal_char() {
        let mut codec = LineCodec::new(Direction::Upload);
        let mut buf = BytesMut::from("#D:A!Q==:ab\n");
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, TunnelError::IllegalCharacter { ch: '!', offset: 4 }));
    }

    #[test]
    fn codec_encode_rejects_oversize_payload() {
        let mut codec = LineCodec::new(Direction::Upload);
        let mut dst = BytesMut::new();
        let frame = Frame::new(Command::Data, vec![0u8; UPLOAD_MAX_PAYLOAD + 1], hash(20));
        assert!(codec.encode(frame, &mut dst).is_err());

        let frame = Frame::new(Command::Data, vec![0u8; UPLOAD_MAX_PAYLOAD], hash(20));
        codec.encode(frame, &mut dst).unwrap();
        assert_eq!(dst.len(), Direction::Upload.max_line_len() + 1);
    }
}
