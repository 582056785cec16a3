//! Bus wire protocol.
//! - 16-byte little-endian message header
//! - OP_SEND: cstring address followed by a JSON object
//! - OP_REPLY: a JSON object answering `response_to`

use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const HEADER_LEN: usize = 16;

pub const OP_SEND: i32 = 2101;
pub const OP_REPLY: i32 = 2102;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let message_length = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let request_id = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let response_to = i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let op_code = i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);

        Some((
            Self {
                message_length,
                request_id,
                response_to,
                op_code,
            },
            HEADER_LEN,
        ))
    }

    fn put(&self, out: &mut BytesMut) {
        out.put_i32_le(self.message_length);
        out.put_i32_le(self.request_id);
        out.put_i32_le(self.response_to);
        out.put_i32_le(self.op_code);
    }
}

/// One message off the wire: header plus the body bytes that follow it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: MessageHeader,
    pub body: Vec<u8>,
}

/// Read one frame. `Ok(None)` on a clean end of stream before a header.
/// A declared length outside `HEADER_LEN..=max_len` is an error; the
/// stream cannot be resynchronised after it.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_len: usize) -> Result<Option<Frame>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let Some((hdr, _)) = MessageHeader::parse(&header) else {
        return Err(Error::Msg("invalid message header".into()));
    };
    let total = usize::try_from(hdr.message_length).unwrap_or(0);
    if total < HEADER_LEN || total > max_len {
        return Err(Error::Msg(format!("invalid message length {}", hdr.message_length)));
    }
    let mut body = vec![0u8; total - HEADER_LEN];
    reader.read_exact(&mut body).await?;
    Ok(Some(Frame { header: hdr, body }))
}

/// Split an OP_SEND body into its address and the JSON bytes after it.
pub fn decode_send(body: &[u8]) -> Option<(&str, &[u8])> {
    let end = body.iter().position(|b| *b == 0)?;
    let address = std::str::from_utf8(&body[..end]).ok()?;
    Some((address, &body[end + 1..]))
}

/// Parse a JSON object body; anything else is rejected.
pub fn decode_json_object(bytes: &[u8]) -> Option<Value> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

fn frame(op_code: i32, request_id: i32, response_to: i32, body: &[u8]) -> Vec<u8> {
    let message_length = (HEADER_LEN + body.len()) as i32;
    let mut out = BytesMut::with_capacity(message_length as usize);
    MessageHeader { message_length, request_id, response_to, op_code }.put(&mut out);
    out.put_slice(body);
    out.to_vec()
}

/// Encode an OP_SEND to `address`. `response_to` is 0 for a new request or
/// the request id of the reply being continued.
pub fn encode_send(address: &str, payload: &Value, request_id: i32, response_to: i32) -> Result<Vec<u8>> {
    if address.as_bytes().contains(&0) {
        return Err(Error::Msg("address contains a NUL byte".into()));
    }
    let json = serde_json::to_vec(payload)?;
    let mut body = BytesMut::with_capacity(address.len() + 1 + json.len());
    body.put_slice(address.as_bytes());
    body.put_u8(0);
    body.put_slice(&json);
    Ok(frame(OP_SEND, request_id, response_to, &body))
}

pub fn encode_reply(payload: &Value, response_to: i32, request_id: i32) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(payload)?;
    Ok(frame(OP_REPLY, request_id, response_to, &json))
}
