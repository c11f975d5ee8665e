//! Incremental parser and encoder for the line-oriented `data: ` framing.
//!
//! A frame on the wire looks like:
//!
//! ```text
//! data: T\r\n
//! data: first line\r\n
//! data: second line\r\n
//! \r\n
//! ```
//!
//! The first line carries a one-letter [`MessageKind`], every following
//! `data: ` line is one payload segment, and a bare `\r\n` terminates the
//! frame. Segments are joined with `\n`. Binary payloads travel as a single
//! standard (padded) base64 segment so the stream stays textual.
//!
//! [`FrameCodec`] is a per-connection state machine: it consumes complete
//! lines from the front of a [`BytesMut`] and leaves any partial line in
//! place, so callers simply append newly read bytes and parse again.
//!
//! ## Example
//! ```
//! use bytes::BytesMut;
//! use relayhub::codec::{encode, FrameCodec, Message};
//!
//! let mut codec = FrameCodec::new();
//! let mut buf = BytesMut::from(&encode(&Message::text("Hello\nWorld"))[..]);
//! let msg = codec.parse(&mut buf).unwrap().unwrap();
//! assert_eq!(msg.payload_str(), Some("Hello\nWorld"));
//! ```

use crate::error::FrameError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const DATA_PREFIX: &[u8] = b"data: ";
const CRLF: &[u8] = b"\r\n";
const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Default upper bound on the wire size of a single frame (64 KB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Type of a framed message, encoded as a single character on the type line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
  Text,
  Binary,
  Close,
  Error,
}

impl MessageKind {
  pub fn as_char(self) -> char {
    match self {
      MessageKind::Text => 'T',
      MessageKind::Binary => 'B',
      MessageKind::Close => 'C',
      MessageKind::Error => 'E',
    }
  }

  pub fn from_char(c: char) -> Option<Self> {
    match c {
      'T' => Some(MessageKind::Text),
      'B' => Some(MessageKind::Binary),
      'C' => Some(MessageKind::Close),
      'E' => Some(MessageKind::Error),
      _ => None,
    }
  }
}

/// A complete, immutable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
  kind: MessageKind,
  payload: Bytes,
}

impl Message {
  pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
    Self {
      kind,
      payload: payload.into(),
    }
  }

  pub fn text(payload: impl Into<String>) -> Self {
    Self::new(MessageKind::Text, payload.into())
  }

  pub fn binary(payload: impl Into<Bytes>) -> Self {
    Self::new(MessageKind::Binary, payload)
  }

  pub fn close(reason: impl Into<String>) -> Self {
    Self::new(MessageKind::Close, reason.into())
  }

  pub fn error(reason: impl Into<String>) -> Self {
    Self::new(MessageKind::Error, reason.into())
  }

  pub fn kind(&self) -> MessageKind {
    self.kind
  }

  pub fn payload(&self) -> &Bytes {
    &self.payload
  }

  pub fn into_payload(self) -> Bytes {
    self.payload
  }

  /// Payload as UTF-8, if it is valid UTF-8.
  pub fn payload_str(&self) -> Option<&str> {
    std::str::from_utf8(&self.payload).ok()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParsePhase {
  AwaitType,
  AwaitPayloadLine,
  AwaitTerminator,
}

/// Stateful frame parser and encoder for one connection.
///
/// The parser never errors on a line it has not fully received; it only
/// rejects lines that are complete but malformed. On error the offending
/// bytes have already been consumed from the buffer, so after [`reset`]
/// parsing can resume with whatever follows.
///
/// [`reset`]: FrameCodec::reset
#[derive(Debug)]
pub struct FrameCodec {
  phase: ParsePhase,
  kind: MessageKind,
  segments: Vec<Bytes>,
  consumed: usize,
  max_message_size: usize,
}

impl FrameCodec {
  /// Create a parser with the default 64 KB frame limit.
  pub fn new() -> Self {
    Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
  }

  /// Create a parser that rejects frames larger than `max_message_size` bytes on the wire.
  ///
  /// Minimum size is the length of an empty frame.
  pub fn with_max_message_size(max_message_size: usize) -> Self {
    Self {
      phase: ParsePhase::AwaitType,
      kind: MessageKind::Text,
      segments: Vec::new(),
      consumed: 0,
      max_message_size: max_message_size.max(DATA_PREFIX.len() + 1 + 2 * CRLF.len()),
    }
  }

  /// Drop any partially parsed frame and wait for a new type line.
  pub fn reset(&mut self) {
    self.phase = ParsePhase::AwaitType;
    self.kind = MessageKind::Text;
    self.segments.clear();
    self.consumed = 0;
  }

  /// Whether a frame has been started but not yet terminated.
  pub fn is_mid_message(&self) -> bool {
    self.phase != ParsePhase::AwaitType || self.consumed > 0
  }

  /// Parse the next message out of `buf`.
  ///
  /// ## Returns
  /// - `Ok(Some(message))` when a frame was completed; its bytes are consumed.
  /// - `Ok(None)` when more bytes are needed; unparsed bytes stay in `buf`.
  /// - `Err(FrameError)` when a complete line is malformed.
  pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, FrameError> {
    loop {
      match self.phase {
        ParsePhase::AwaitType => {
          let Some(line) = self.take_line(buf)? else {
            return Ok(None);
          };
          self.kind = parse_type_line(&line)?;
          self.phase = ParsePhase::AwaitPayloadLine;
        }
        ParsePhase::AwaitPayloadLine => match buf.first() {
          None => return Ok(None),
          Some(&CR) => self.phase = ParsePhase::AwaitTerminator,
          Some(_) => {
            let Some(line) = self.take_line(buf)? else {
              return Ok(None);
            };
            if !line.ends_with(CRLF) {
              return Err(FrameError::BareLineFeed);
            }
            if !line.starts_with(DATA_PREFIX) {
              return Err(FrameError::MissingDataPrefix);
            }
            self
              .segments
              .push(line.slice(DATA_PREFIX.len()..line.len() - CRLF.len()));
          }
        },
        ParsePhase::AwaitTerminator => {
          if buf.len() < CRLF.len() {
            return Ok(None);
          }
          if buf[1] != LF {
            buf.advance(1);
            return Err(FrameError::UnexpectedDataAfterLineEnding);
          }
          buf.advance(CRLF.len());
          return self.complete().map(Some);
        }
      }
    }
  }

  /// Split one `\n`-terminated line off the front of `buf`.
  fn take_line(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
    let Some(pos) = buf.iter().position(|b| *b == LF) else {
      if self.consumed + buf.len() > self.max_message_size {
        buf.clear();
        return Err(FrameError::MessageTooLarge(self.max_message_size));
      }
      return Ok(None);
    };

    let line = buf.split_to(pos + 1).freeze();
    self.consumed += line.len();
    if self.consumed > self.max_message_size {
      return Err(FrameError::MessageTooLarge(self.max_message_size));
    }
    Ok(Some(line))
  }

  fn complete(&mut self) -> Result<Message, FrameError> {
    let kind = self.kind;
    let payload = join_segments(&self.segments);
    self.reset();

    let payload = match kind {
      MessageKind::Binary => Bytes::from(STANDARD.decode(&payload)?),
      _ => payload,
    };
    Ok(Message { kind, payload })
  }
}

impl Default for FrameCodec {
  fn default() -> Self {
    Self::new()
  }
}

impl Decoder for FrameCodec {
  type Item = Message;
  type Error = FrameError;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
    self.parse(src)
  }
}

impl Encoder<Message> for FrameCodec {
  type Error = FrameError;

  fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), FrameError> {
    encode_into(&item, dst);
    Ok(())
  }
}

/// Encode a message into a fresh buffer.
pub fn encode(message: &Message) -> Bytes {
  let mut dst = BytesMut::with_capacity(message.payload.len() + 16);
  encode_into(message, &mut dst);
  dst.freeze()
}

/// Append the wire form of `message` to `dst`.
pub fn encode_into(message: &Message, dst: &mut BytesMut) {
  dst.put_slice(DATA_PREFIX);
  dst.put_u8(message.kind.as_char() as u8);
  dst.put_slice(CRLF);

  if !message.payload.is_empty() {
    match message.kind {
      MessageKind::Binary => put_line(dst, STANDARD.encode(&message.payload).as_bytes()),
      _ => {
        for segment in message.payload.split(|b| *b == LF) {
          put_line(dst, segment);
        }
      }
    }
  }

  dst.put_slice(CRLF);
}

fn put_line(dst: &mut BytesMut, segment: &[u8]) {
  dst.reserve(DATA_PREFIX.len() + segment.len() + CRLF.len());
  dst.put_slice(DATA_PREFIX);
  dst.put_slice(segment);
  dst.put_slice(CRLF);
}

fn parse_type_line(line: &[u8]) -> Result<MessageKind, FrameError> {
  if line.len() == 1 && line[0] == LF {
    return Err(FrameError::UnexpectedDataAfterLineEnding);
  }
  let content = line
    .strip_suffix(CRLF)
    .ok_or(FrameError::InvalidTypeLine)?;
  if content.len() != DATA_PREFIX.len() + 1 || !content.starts_with(DATA_PREFIX) {
    return Err(FrameError::InvalidTypeLine);
  }

  let c = content[DATA_PREFIX.len()] as char;
  MessageKind::from_char(c).ok_or(FrameError::UnknownMessageType(c))
}

fn join_segments(segments: &[Bytes]) -> Bytes {
  match segments {
    [] => Bytes::new(),
    [single] => single.clone(),
    many => {
      let len = many.iter().map(Bytes::len).sum::<usize>() + many.len() - 1;
      let mut out = BytesMut::with_capacity(len);
      for (i, segment) in many.iter().enumerate() {
        if i > 0 {
          out.put_u8(LF);
        }
        out.put_slice(segment);
      }
      out.freeze()
    }
  }
}
