//! Bus client: sends request envelopes to an address and drives streaming
//! continuations.

use crate::error::{Error, Result};
use crate::protocol::{OP_REPLY, decode_json_object, encode_send, read_frame};
use crate::reply::Status;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};

const MAX_REPLY_BYTES: usize = 48_000_000;

/// A reply as received: its own request id (the handle for a continuation)
/// and the JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyFrame {
    pub request_id: i32,
    pub response_to: i32,
    pub body: Value,
}

impl ReplyFrame {
    pub fn status(&self) -> Option<Status> {
        self.body.get("status").and_then(Value::as_str).and_then(Status::parse)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn results(&self) -> &[Value] {
        self.body.get("results").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
    }
}

pub struct BusClient {
    stream: TcpStream,
    address: String,
    next_id: i32,
}

impl BusClient {
    pub async fn connect(addr: impl ToSocketAddrs, address: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, address: address.into(), next_id: 1 })
    }

    fn request_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = if self.next_id == i32::MAX { 1 } else { self.next_id + 1 };
        id
    }

    /// Send a request envelope to the client's address and wait for its reply.
    pub async fn send(&mut self, payload: &Value) -> Result<ReplyFrame> {
        let address = self.address.clone();
        self.send_to(&address, payload).await
    }

    pub async fn send_to(&mut self, address: &str, payload: &Value) -> Result<ReplyFrame> {
        let id = self.request_id();
        let bytes = encode_send(address, payload, id, 0)?;
        self.stream.write_all(&bytes).await?;
        self.read_reply(id).await
    }

    /// Ask for the next batch of the session that produced `previous`.
    pub async fn continue_stream(&mut self, previous: &ReplyFrame) -> Result<ReplyFrame> {
        let id = self.request_id();
        let bytes = encode_send(&self.address, &json!({}), id, previous.request_id)?;
        self.stream.write_all(&bytes).await?;
        self.read_reply(id).await
    }

    /// Run a find and follow every continuation, collecting all results.
    pub async fn find_all(&mut self, query: &Value) -> Result<Vec<Value>> {
        let mut reply = self.send(query).await?;
        let mut docs = Vec::new();
        loop {
            docs.extend(reply.results().iter().cloned());
            match reply.status() {
                Some(Status::MoreExist) => reply = self.continue_stream(&reply).await?,
                Some(Status::Ok) => return Ok(docs),
                _ => {
                    let msg = reply.get("message").and_then(Value::as_str).unwrap_or("find failed");
                    return Err(Error::Backend(msg.to_string()));
                }
            }
        }
    }

    async fn read_reply(&mut self, request_id: i32) -> Result<ReplyFrame> {
        loop {
            let frame = read_frame(&mut self.stream, MAX_REPLY_BYTES)
                .await?
                .ok_or_else(|| Error::Msg("connection closed".into()))?;
            if frame.header.op_code != OP_REPLY || frame.header.response_to != request_id {
                tracing::debug!(op_code = frame.header.op_code, response_to = frame.header.response_to, "skipping unexpected frame");
                continue;
            }
            let body = decode_json_object(&frame.body).ok_or_else(|| Error::Msg("malformed reply body".into()))?;
            return Ok(ReplyFrame { request_id: frame.header.request_id, response_to: request_id, body });
        }
    }
}
