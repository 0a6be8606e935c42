//! Framing for the command channel.
//!
//! Every frame is a single JSON object terminated by `\r\n`. Requests look like
//! `{"id":1,"method":"set_power","params":["on","smooth",500]}`, replies carry
//! the same id with either a `result` list or an `error` object, and the bulb
//! pushes `{"method":"props","params":{...}}` notifications whenever its state
//! changes. This is version 1 of the wire contract.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::control_interface::command::Payload;
use crate::error::{BulbError, Result};

/// Longest frame accepted before the stream is considered unrecoverable.
pub const MAX_FRAME_LEN: usize = 16 * 1024;

const FRAME_DELIMITER: &[u8] = b"\r\n";

#[derive(Serialize)]
struct RequestFrame<'a> {
    id: u32,
    #[serde(flatten)]
    payload: &'a Payload,
}

/// Error object returned by the device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceError {
    pub code: i64,
    pub message: String,
}

/// A reply to a request we sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u32,
    pub result: Option<Vec<Value>>,
    pub error: Option<DeviceError>,
}

impl Response {
    /// The device accepted the command.
    ///
    /// Setters answer `["ok"]`, getters answer with the requested values, so
    /// anything that is not an error counts.
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.result.is_some()
    }

    pub fn is_error(&self) -> bool {
        !self.is_ok()
    }
}

/// State pushed by the device without being asked.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Response(Response),
    Notification(Notification),
}

#[derive(Deserialize)]
struct InboundFrame {
    id: Option<u32>,
    result: Option<Vec<Value>>,
    error: Option<DeviceError>,
    method: Option<String>,
    params: Option<Value>,
}

/// Serializes one request frame, delimiter included.
pub fn encode(id: u32, payload: &Payload) -> Result<Bytes> {
    let json = serde_json::to_vec(&RequestFrame { id, payload })?;
    let mut frame = BytesMut::with_capacity(json.len() + FRAME_DELIMITER.len());
    frame.put_slice(&json);
    frame.put_slice(FRAME_DELIMITER);
    Ok(frame.freeze())
}

/// Parses a single frame, without its delimiter.
pub fn decode_frame(line: &[u8]) -> Result<Message> {
    let frame: InboundFrame = serde_json::from_slice(line)?;
    match frame {
        InboundFrame { id: Some(id), result, error, .. } if result.is_some() || error.is_some() => {
            Ok(Message::Response(Response { id, result, error }))
        }
        InboundFrame {
            method: Some(method),
            params: Some(Value::Object(params)),
            ..
        } => Ok(Message::Notification(Notification { method, params })),
        _ => Err(BulbError::Codec(format!(
            "frame is neither a reply nor a notification: {}",
            String::from_utf8_lossy(line)
        ))),
    }
}

/// Splits an inbound byte stream into messages, keeping partial frames
/// across reads.
#[derive(Debug, Default)]
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            buffer: BytesMut::with_capacity(1024),
        }
    }

    /// Buffer the decoder reads into directly.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns every complete message currently buffered.
    ///
    /// Malformed frames are skipped. Fails only when the buffer holds more
    /// than [`MAX_FRAME_LEN`] bytes without a delimiter.
    pub fn drain_messages(&mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match decode_frame(&line) {
                Ok(message) => messages.push(message),
                Err(e) => debug!("Dropping malformed frame: {}", e),
            }
        }
        if self.buffer.len() > MAX_FRAME_LEN {
            let len = self.buffer.len();
            self.buffer.advance(len);
            return Err(BulbError::FramingLost(len));
        }
        Ok(messages)
    }
}
