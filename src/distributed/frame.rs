//! Wire format of the coordination protocol.
//!
//! Frames are single UTF-8 lines: `<stream>:<TAG>[:<field>]*`. The stream id multiplexes many
//! logical channels over one TCP connection; stream `0` carries the `HELLO` handshake. Fields
//! are percent-escaped so bucket keys may contain `:`.
//!
//! | direction       | frame                                   |
//! |-----------------|-----------------------------------------|
//! | worker → leader | `HELLO:<version>`                       |
//! | worker → leader | `REQUEST:<bucket>:<request>`            |
//! | worker → leader | `DONE:<bucket>:<request>`               |
//! | worker → leader | `LIMIT:<bucket>:<delay millis>`         |
//! | worker → leader | `ACQUIRE:<request>`                     |
//! | worker → leader | `RELEASE:<request>`                     |
//! | worker → leader | `LIMIT:global:<delay nanos>:<sent at>`  |
//! | worker → leader | `QUERY:global`                          |
//! | leader → worker | `HELLO:<version>`                       |
//! | leader → worker | `READY`                                 |
//! | leader → worker | `PERMIT`                                |
//! | leader → worker | `OK:<at>`                               |
//! | leader → worker | `QUERY:global:<remaining nanos>:<at>`   |
//! | leader → worker | `ERROR:<message>`                       |
//!
//! Timestamps are nanoseconds since the Unix epoch.

use crate::bucket::BucketKey;
use crate::request::RequestId;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Version exchanged in the `HELLO` handshake.
pub const PROTOCOL_VERSION: u32 = 1;
/// Default upper bound on a frame, excluding the newline.
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024;
/// Stream carrying the handshake.
pub const HANDSHAKE_STREAM: StreamId = 0;

/// Logical channel within a connection.
pub type StreamId = u64;

/// Malformed or misplaced frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Nothing but whitespace.
    #[error("empty frame")]
    Empty,
    /// The stream prefix is not a number.
    #[error("invalid stream id {0:?}")]
    InvalidStreamId(String),
    /// Unrecognized message tag.
    #[error("unknown frame {0:?}")]
    UnknownTag(String),
    /// Wrong number of fields for the tag.
    #[error("{tag} expects {expected} fields, got {got}")]
    Arity {
        /// Tag of the frame.
        tag: &'static str,
        /// Fields required.
        expected: usize,
        /// Fields present.
        got: usize,
    },
    /// A field failed to parse.
    #[error("invalid {field}: {value:?}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Offending text.
        value: String,
    },
    /// A `%` escape was truncated or not hex.
    #[error("bad escape in {0:?}")]
    BadEscape(String),
    /// Frame exceeded the configured maximum.
    #[error("frame longer than {0} bytes")]
    FrameTooLong(usize),
    /// Frame was not valid UTF-8.
    #[error("frame is not valid utf-8")]
    NotUtf8,
    /// Peer speaks another protocol version.
    #[error("unsupported protocol version {got} (expected {expected})")]
    UnsupportedVersion {
        /// Version this side speaks.
        expected: u32,
        /// Version the peer announced.
        got: u32,
    },
    /// A frame arrived that the channel's state does not allow.
    #[error("expected {expected}, got {got}")]
    Unexpected {
        /// What the channel was waiting for.
        expected: &'static str,
        /// What arrived.
        got: String,
    },
    /// The leader refused the channel.
    #[error("rejected by leader: {0}")]
    Rejected(String),
    /// Reading or writing the socket failed.
    #[error("connection error: {0}")]
    Io(String),
}

/// Frames sent by workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    /// Opening handshake.
    Hello {
        /// Protocol version spoken.
        version: u32,
    },
    /// Ask for admission on a bucket; opens a router channel.
    Request {
        /// Bucket to admit on.
        bucket: BucketKey,
        /// Request being admitted.
        request: RequestId,
    },
    /// The admitted request finished; closes the router channel.
    Done {
        /// Bucket to release.
        bucket: BucketKey,
        /// Request that finished.
        request: RequestId,
    },
    /// Delay the bucket's next admission.
    Limit {
        /// Bucket to delay.
        bucket: BucketKey,
        /// Delay, millisecond precision on the wire.
        delay: Duration,
    },
    /// Ask for the global slot; opens a limiter channel.
    Acquire {
        /// Request acquiring.
        request: RequestId,
    },
    /// Give the global slot back; closes the limiter channel.
    Release {
        /// Request releasing.
        request: RequestId,
    },
    /// Engage the global cooldown.
    LimitGlobal {
        /// Cooldown length.
        delay: Duration,
        /// Epoch nanos when the worker sent this frame.
        sent_at: u64,
    },
    /// Ask for the cooldown remaining.
    QueryGlobal,
}

/// Frames sent by the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderMessage {
    /// Handshake accepted.
    Hello {
        /// Protocol version spoken.
        version: u32,
    },
    /// The bucket is yours.
    Ready,
    /// The global slot is yours.
    Permit,
    /// Acknowledges a limit update.
    Ok {
        /// Epoch nanos when the leader applied it.
        at: u64,
    },
    /// Answer to [`WorkerMessage::QueryGlobal`].
    QueryGlobal {
        /// Cooldown remaining when the leader answered.
        remaining: Duration,
        /// Epoch nanos of the answer.
        at: u64,
    },
    /// Protocol violation; the channel is torn down.
    Error {
        /// Reason.
        message: String,
    },
}

impl WorkerMessage {
    /// Frame tag, for logs.
    pub fn tag(&self) -> &'static str {
        match self {
            WorkerMessage::Hello { .. } => "HELLO",
            WorkerMessage::Request { .. } => "REQUEST",
            WorkerMessage::Done { .. } => "DONE",
            WorkerMessage::Limit { .. } => "LIMIT",
            WorkerMessage::Acquire { .. } => "ACQUIRE",
            WorkerMessage::Release { .. } => "RELEASE",
            WorkerMessage::LimitGlobal { .. } => "LIMIT:global",
            WorkerMessage::QueryGlobal => "QUERY:global",
        }
    }

    /// Encode onto `stream`, without the trailing newline.
    pub fn encode(&self, stream: StreamId) -> String {
        let mut out = FrameBuilder::new(stream);
        match self {
            WorkerMessage::Hello { version } => out.tag("HELLO").field(version),
            WorkerMessage::Request { bucket, request } => {
                out.tag("REQUEST").field(bucket).field(request)
            }
            WorkerMessage::Done { bucket, request } => out.tag("DONE").field(bucket).field(request),
            WorkerMessage::Limit { bucket, delay } => {
                out.tag("LIMIT").field(bucket).field(delay.as_millis())
            }
            WorkerMessage::Acquire { request } => out.tag("ACQUIRE").field(request),
            WorkerMessage::Release { request } => out.tag("RELEASE").field(request),
            WorkerMessage::LimitGlobal { delay, sent_at } => {
                out.tag("LIMIT").field("global").field(delay.as_nanos()).field(sent_at)
            }
            WorkerMessage::QueryGlobal => out.tag("QUERY").field("global"),
        }
        .finish()
    }

    /// Decode one line.
    pub fn decode(line: &str) -> Result<(StreamId, Self), ProtocolError> {
        let frame = ParsedFrame::parse(line)?;
        let message = match frame.tag.as_str() {
            "HELLO" => {
                frame.arity("HELLO", 1)?;
                WorkerMessage::Hello { version: frame.number("version", 0)? }
            }
            "REQUEST" => {
                frame.arity("REQUEST", 2)?;
                WorkerMessage::Request { bucket: frame.bucket(0), request: frame.request_id(1)? }
            }
            "DONE" => {
                frame.arity("DONE", 2)?;
                WorkerMessage::Done { bucket: frame.bucket(0), request: frame.request_id(1)? }
            }
            "LIMIT" if frame.fields.len() == 3 && frame.fields[0] == BucketKey::GLOBAL => {
                WorkerMessage::LimitGlobal {
                    delay: Duration::from_nanos(frame.number("delay", 1)?),
                    sent_at: frame.number("sent_at", 2)?,
                }
            }
            "LIMIT" => {
                frame.arity("LIMIT", 2)?;
                WorkerMessage::Limit {
                    bucket: frame.bucket(0),
                    delay: Duration::from_millis(frame.number("delay", 1)?),
                }
            }
            "ACQUIRE" => {
                frame.arity("ACQUIRE", 1)?;
                WorkerMessage::Acquire { request: frame.request_id(0)? }
            }
            "RELEASE" => {
                frame.arity("RELEASE", 1)?;
                WorkerMessage::Release { request: frame.request_id(0)? }
            }
            "QUERY" => {
                frame.arity("QUERY", 1)?;
                frame.expect_global(0)?;
                WorkerMessage::QueryGlobal
            }
            other => return Err(ProtocolError::UnknownTag(other.to_string())),
        };
        Ok((frame.stream, message))
    }
}

impl LeaderMessage {
    /// Frame tag, for logs.
    pub fn tag(&self) -> &'static str {
        match self {
            LeaderMessage::Hello { .. } => "HELLO",
            LeaderMessage::Ready => "READY",
            LeaderMessage::Permit => "PERMIT",
            LeaderMessage::Ok { .. } => "OK",
            LeaderMessage::QueryGlobal { .. } => "QUERY:global",
            LeaderMessage::Error { .. } => "ERROR",
        }
    }

    /// Encode onto `stream`, without the trailing newline.
    pub fn encode(&self, stream: StreamId) -> String {
        let mut out = FrameBuilder::new(stream);
        match self {
            LeaderMessage::Hello { version } => out.tag("HELLO").field(version),
            LeaderMessage::Ready => out.tag("READY"),
            LeaderMessage::Permit => out.tag("PERMIT"),
            LeaderMessage::Ok { at } => out.tag("OK").field(at),
            LeaderMessage::QueryGlobal { remaining, at } => {
                out.tag("QUERY").field("global").field(remaining.as_nanos()).field(at)
            }
            LeaderMessage::Error { message } => out.tag("ERROR").field(message),
        }
        .finish()
    }

    /// Decode one line.
    pub fn decode(line: &str) -> Result<(StreamId, Self), ProtocolError> {
        let frame = ParsedFrame::parse(line)?;
        let message = match frame.tag.as_str() {
            "HELLO" => {
                frame.arity("HELLO", 1)?;
                LeaderMessage::Hello { version: frame.number("version", 0)? }
            }
            "READY" => {
                frame.arity("READY", 0)?;
                LeaderMessage::Ready
            }
            "PERMIT" => {
                frame.arity("PERMIT", 0)?;
                LeaderMessage::Permit
            }
            "OK" => {
                frame.arity("OK", 1)?;
                LeaderMessage::Ok { at: frame.number("at", 0)? }
            }
            "QUERY" => {
                frame.arity("QUERY", 3)?;
                frame.expect_global(0)?;
                LeaderMessage::QueryGlobal {
                    remaining: Duration::from_nanos(frame.number("remaining", 1)?),
                    at: frame.number("at", 2)?,
                }
            }
            "ERROR" => {
                frame.arity("ERROR", 1)?;
                LeaderMessage::Error { message: frame.fields[0].clone() }
            }
            other => return Err(ProtocolError::UnknownTag(other.to_string())),
        };
        Ok((frame.stream, message))
    }
}

/// Stream id of `line`, if its prefix parses.
pub fn peek_stream(line: &str) -> Option<StreamId> {
    line.trim().split(':').next().and_then(|s| s.parse().ok())
}

struct FrameBuilder {
    out: String,
}

impl FrameBuilder {
    fn new(stream: StreamId) -> Self {
        Self { out: stream.to_string() }
    }

    fn tag(&mut self, tag: &str) -> &mut Self {
        self.out.push(':');
        self.out.push_str(tag);
        self
    }

    fn field(&mut self, value: impl ToString) -> &mut Self {
        self.out.push(':');
        escape_into(&mut self.out, &value.to_string());
        self
    }

    fn finish(&mut self) -> String {
        std::mem::take(&mut self.out)
    }
}

struct ParsedFrame {
    stream: StreamId,
    tag: String,
    fields: Vec<String>,
}

impl ParsedFrame {
    fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(ProtocolError::Empty);
        }
        let mut parts = line.split(':');
        let stream_text = parts.next().unwrap_or_default();
        let stream = stream_text
            .parse()
            .map_err(|_| ProtocolError::InvalidStreamId(stream_text.to_string()))?;
        let tag = parts.next().ok_or(ProtocolError::Empty)?.to_string();
        let fields = parts.map(unescape).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { stream, tag, fields })
    }

    fn arity(&self, tag: &'static str, expected: usize) -> Result<(), ProtocolError> {
        if self.fields.len() != expected {
            return Err(ProtocolError::Arity { tag, expected, got: self.fields.len() });
        }
        Ok(())
    }

    fn number<T: std::str::FromStr>(&self, field: &'static str, idx: usize) -> Result<T, ProtocolError> {
        let value = &self.fields[idx];
        value.parse().map_err(|_| ProtocolError::InvalidField { field, value: value.clone() })
    }

    fn bucket(&self, idx: usize) -> BucketKey {
        BucketKey::from(self.fields[idx].as_str())
    }

    fn request_id(&self, idx: usize) -> Result<RequestId, ProtocolError> {
        self.number("request", idx)
    }

    fn expect_global(&self, idx: usize) -> Result<(), ProtocolError> {
        if self.fields[idx] != BucketKey::GLOBAL {
            return Err(ProtocolError::InvalidField { field: "scope", value: self.fields[idx].clone() });
        }
        Ok(())
    }
}

fn escape_into(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            c => out.push(c),
        }
    }
}

fn unescape(field: &str) -> Result<String, ProtocolError> {
    if !field.contains('%') {
        return Ok(field.to_string());
    }
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = field.get(i + 1..i + 3).ok_or_else(|| ProtocolError::BadEscape(field.into()))?;
            let byte =
                u8::from_str_radix(hex, 16).map_err(|_| ProtocolError::BadEscape(field.into()))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| ProtocolError::NotUtf8)
}

/// Reads newline-delimited frames, refusing any longer than `max_len`.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: BufReader<R>,
    max_len: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap `inner`.
    pub fn new(inner: R, max_len: usize) -> Self {
        Self { inner: BufReader::new(inner), max_len, buf: Vec::with_capacity(256) }
    }

    /// Next frame, or `None` at a clean end of stream.
    pub async fn next_line(&mut self) -> Result<Option<String>, ProtocolError> {
        self.buf.clear();
        // room for the frame plus "\r\n"
        let limit = self.max_len as u64 + 2;
        let read = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(|e| ProtocolError::Io(e.to_string()))?;
        if read == 0 {
            return Ok(None);
        }
        if self.buf.last() != Some(&b'\n') {
            if read as u64 >= limit {
                return Err(ProtocolError::FrameTooLong(self.max_len));
            }
            return Err(ProtocolError::Io("connection closed mid-frame".into()));
        }
        self.buf.pop();
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        if self.buf.len() > self.max_len {
            return Err(ProtocolError::FrameTooLong(self.max_len));
        }
        String::from_utf8(std::mem::take(&mut self.buf)).map(Some).map_err(|_| ProtocolError::NotUtf8)
    }
}

/// Write frames from `frames` until the channel closes or the socket fails.
pub(crate) async fn write_frames<W>(mut writer: W, mut frames: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut frame) = frames.recv().await {
        frame.push('\n');
        if let Err(e) = writer.write_all(frame.as_bytes()).await {
            tracing::debug!(error = %e, "frame writer stopped");
            break;
        }
        if frames.is_empty() {
            if let Err(e) = writer.flush().await {
                tracing::debug!(error = %e, "frame writer stopped");
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}
