// src/core/protocol/resp_frame.rs

//! The RESP frame type and its `Encoder`/`Decoder`. The client encodes commands as
//! arrays of bulk strings and decodes whatever reply frames the server sends back.

use crate::core::ClientError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

// Limits applied to replies so a misbehaving server cannot make us allocate without bound.
const MAX_FRAME_ELEMENTS: usize = 1_024 * 1_024;
const MAX_BULK_STRING_SIZE: usize = 512 * 1024 * 1024;
const MAX_RECURSION_DEPTH: usize = 256;

/// A single frame of the RESP protocol, as exchanged on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    NullArray,
    Array(Vec<RespFrame>),
}

impl RespFrame {
    /// Builds the array-of-bulk-strings frame used for every client command.
    pub fn command<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        RespFrame::Array(
            args.into_iter()
                .map(|arg| RespFrame::BulkString(Bytes::copy_from_slice(arg.as_ref())))
                .collect(),
        )
    }
}

/// Encodes a command (name followed by its arguments) into the formatted bytes that
/// `ClientConnection::send` hands to the protocol engine.
pub fn format_command<I, A>(args: I) -> Bytes
where
    I: IntoIterator<Item = A>,
    A: AsRef<[u8]>,
{
    let mut buf = BytesMut::new();
    encode_frame(&RespFrame::command(args), &mut buf);
    buf.freeze()
}

/// A `tokio_util::codec` implementation for `RespFrame`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespFrameCodec;

impl Encoder<RespFrame> for RespFrameCodec {
    type Error = ClientError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, dst);
        Ok(())
    }
}

fn encode_frame(frame: &RespFrame, dst: &mut BytesMut) {
    match frame {
        RespFrame::SimpleString(s) => put_line(dst, b'+', s.as_bytes()),
        RespFrame::Error(s) => put_line(dst, b'-', s.as_bytes()),
        RespFrame::Integer(i) => put_line(dst, b':', itoa::Buffer::new().format(*i).as_bytes()),
        RespFrame::BulkString(b) => {
            put_line(dst, b'$', itoa::Buffer::new().format(b.len()).as_bytes());
            dst.extend_from_slice(b);
            dst.extend_from_slice(CRLF);
        }
        RespFrame::Null => dst.extend_from_slice(b"$-1\r\n"),
        RespFrame::NullArray => dst.extend_from_slice(b"*-1\r\n"),
        RespFrame::Array(items) => {
            put_line(dst, b'*', itoa::Buffer::new().format(items.len()).as_bytes());
            for item in items {
                encode_frame(item, dst);
            }
        }
    }
}

fn put_line(dst: &mut BytesMut, prefix: u8, body: &[u8]) {
    dst.reserve(body.len() + 3);
    dst.extend_from_slice(&[prefix]);
    dst.extend_from_slice(body);
    dst.extend_from_slice(CRLF);
}

impl Decoder for RespFrameCodec {
    type Item = RespFrame;
    type Error = ClientError;

    /// Decodes one frame from the front of `src`, consuming its bytes. Returns `Ok(None)`
    /// and leaves `src` untouched when the frame is not complete yet.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut bytes = &src[..];
        match decode_recursive(&mut bytes, 0) {
            Ok(frame) => {
                let consumed = src.len() - bytes.len();
                src.advance(consumed);
                Ok(Some(frame))
            }
            Err(ClientError::IncompleteData) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn decode_recursive(bytes: &mut &[u8], depth: usize) -> Result<RespFrame, ClientError> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(ClientError::Protocol(
            "reply nesting depth limit exceeded".to_string(),
        ));
    }
    let Some(&prefix) = bytes.first() else {
        return Err(ClientError::IncompleteData);
    };
    *bytes = &bytes[1..];

    match prefix {
        b'+' => Ok(RespFrame::SimpleString(lossy(next_line(bytes)?))),
        b'-' => Ok(RespFrame::Error(lossy(next_line(bytes)?))),
        b':' => Ok(RespFrame::Integer(parse_number(next_line(bytes)?)?)),
        b'$' => {
            let len = parse_number(next_line(bytes)?)?;
            if len == -1 {
                return Ok(RespFrame::Null);
            }
            let len = checked_len(len, MAX_BULK_STRING_SIZE, "bulk string")?;
            if bytes.len() < len + CRLF_LEN {
                return Err(ClientError::IncompleteData);
            }
            if &bytes[len..len + CRLF_LEN] != CRLF {
                return Err(ClientError::Protocol(
                    "bulk string is not terminated by CRLF".to_string(),
                ));
            }
            let data = Bytes::copy_from_slice(&bytes[..len]);
            *bytes = &bytes[len + CRLF_LEN..];
            Ok(RespFrame::BulkString(data))
        }
        b'*' => {
            let len = parse_number(next_line(bytes)?)?;
            if len == -1 {
                return Ok(RespFrame::NullArray);
            }
            let len = checked_len(len, MAX_FRAME_ELEMENTS, "array")?;
            let mut items = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                items.push(decode_recursive(bytes, depth + 1)?);
            }
            Ok(RespFrame::Array(items))
        }
        other => Err(ClientError::Protocol(format!(
            "unexpected reply type byte 0x{other:02x}"
        ))),
    }
}

/// Splits off the next CRLF-terminated line, advancing `bytes` past the terminator.
fn next_line<'a>(bytes: &mut &'a [u8]) -> Result<&'a [u8], ClientError> {
    let pos = bytes
        .windows(CRLF_LEN)
        .position(|window| window == CRLF)
        .ok_or(ClientError::IncompleteData)?;
    let line = &bytes[..pos];
    *bytes = &bytes[pos + CRLF_LEN..];
    Ok(line)
}

fn parse_number(line: &[u8]) -> Result<i64, ClientError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ClientError::Protocol(format!("invalid integer '{}'", lossy(line))))
}

fn checked_len(len: i64, max: usize, what: &str) -> Result<usize, ClientError> {
    usize::try_from(len)
        .ok()
        .filter(|len| *len <= max)
        .ok_or_else(|| ClientError::Protocol(format!("invalid {what} length {len}")))
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}
