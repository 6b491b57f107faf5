//! The wire format: msgpack-encoded frames, each wrapped in a
//! `(correlation_id, payload)` envelope.
//!
//! `correlation_id` is `nil` for out-of-band messages (currently only
//! [`Frame::Log`]) and a UUID string for everything else. `payload` is
//! itself an array whose first element is the [`MessageTag`] and whose
//! remaining elements depend on the tag — this mirrors the original
//! `(msgid, (Message.CALL, name, args, kwargs))` shape field-for-field,
//! `kwargs` included: it travels as a msgpack map, empty when a call passes
//! none.
//!
//! Values flow through this module as `rmpv::Value` rather than a
//! hand-rolled primitive enum: `rmpv::Utf8String` already keeps invalid-UTF-8
//! byte sequences intact across a decode/encode round trip, which is exactly
//! the "surrogate-escape tolerant" string handling the protocol needs.

use bytes::{Buf, BytesMut};
use rmpv::Value;
use std::io::{self, Cursor};
use uuid::Uuid;

use crate::error::PrivsepError;

/// Tag identifying the shape of a frame's payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTag {
    Ping = 1,
    Pong = 2,
    Call = 3,
    Ret = 4,
    Err = 5,
    Log = 6,
}

impl MessageTag {
    fn from_u64(tag: u64) -> Result<Self, PrivsepError> {
        Ok(match tag {
            1 => MessageTag::Ping,
            2 => MessageTag::Pong,
            3 => MessageTag::Call,
            4 => MessageTag::Ret,
            5 => MessageTag::Err,
            6 => MessageTag::Log,
            other => {
                return Err(PrivsepError::Protocol {
                    detail: format!("unknown message tag {other}"),
                });
            }
        })
    }
}

/// A decoded frame body, one variant per [`MessageTag`].
#[derive(Clone, Debug)]
pub enum Frame {
    /// Handshake probe sent by the client immediately after connecting.
    Ping,
    /// Handshake response sent by the server.
    Pong,
    /// Invoke the named entry-point with the given positional and keyword
    /// arguments. `kwargs` is always a msgpack map, empty when the call
    /// passes none.
    Call {
        name: String,
        args: Vec<Value>,
        kwargs: Value,
    },
    /// Successful call result.
    Ret { value: Value },
    /// Call failed; `type_identifier` names a [`crate::context::RemoteError`]
    /// registration and `args` are its reconstruction arguments.
    Err {
        type_identifier: String,
        args: Vec<Value>,
    },
    /// A forwarded log record, see [`crate::logbridge`].
    Log { record: crate::logbridge::LogRecord },
}

impl Frame {
    fn tag(&self) -> MessageTag {
        match self {
            Frame::Ping => MessageTag::Ping,
            Frame::Pong => MessageTag::Pong,
            Frame::Call { .. } => MessageTag::Call,
            Frame::Ret { .. } => MessageTag::Ret,
            Frame::Err { .. } => MessageTag::Err,
            Frame::Log { .. } => MessageTag::Log,
        }
    }

    fn to_value(&self) -> Value {
        let tag = Value::from(self.tag() as u8);
        let rest: Vec<Value> = match self {
            Frame::Ping | Frame::Pong => vec![],
            Frame::Call { name, args, kwargs } => vec![
                Value::from(name.as_str()),
                Value::Array(args.clone()),
                kwargs.clone(),
            ],
            Frame::Ret { value } => vec![value.clone()],
            Frame::Err {
                type_identifier,
                args,
            } => vec![
                Value::from(type_identifier.as_str()),
                Value::Array(args.clone()),
            ],
            Frame::Log { record } => vec![record.to_value()],
        };
        let mut elems = Vec::with_capacity(1 + rest.len());
        elems.push(tag);
        elems.extend(rest);
        Value::Array(elems)
    }

    fn from_value(value: Value) -> Result<Self, PrivsepError> {
        let mut elems = match value {
            Value::Array(elems) => elems,
            other => {
                return Err(PrivsepError::Protocol {
                    detail: format!("frame payload must be an array, got {other:?}"),
                });
            }
        };
        if elems.is_empty() {
            return Err(PrivsepError::Protocol {
                detail: "frame payload array is empty".to_owned(),
            });
        }
        let tag_value = elems.remove(0);
        let tag_int = tag_value.as_u64().ok_or_else(|| PrivsepError::Protocol {
            detail: format!("frame tag is not an integer: {tag_value:?}"),
        })?;
        let tag = MessageTag::from_u64(tag_int)?;

        Ok(match tag {
            MessageTag::Ping => Frame::Ping,
            MessageTag::Pong => Frame::Pong,
            MessageTag::Call => {
                let mut it = elems.into_iter();
                let name = take_string(&mut it, "CALL.name")?;
                let args = take_array(&mut it, "CALL.args")?;
                let kwargs = take_map(&mut it, "CALL.kwargs")?;
                Frame::Call { name, args, kwargs }
            }
            MessageTag::Ret => {
                let mut it = elems.into_iter();
                let value = it.next().ok_or_else(|| PrivsepError::Protocol {
                    detail: "RET frame missing value".to_owned(),
                })?;
                Frame::Ret { value }
            }
            MessageTag::Err => {
                let mut it = elems.into_iter();
                let type_identifier = take_string(&mut it, "ERR.type_identifier")?;
                let args = take_array(&mut it, "ERR.args")?;
                Frame::Err {
                    type_identifier,
                    args,
                }
            }
            MessageTag::Log => {
                let mut it = elems.into_iter();
                let record_value = it.next().ok_or_else(|| PrivsepError::Protocol {
                    detail: "LOG frame missing record".to_owned(),
                })?;
                let record = crate::logbridge::LogRecord::from_value(record_value)?;
                Frame::Log { record }
            }
        })
    }
}

fn take_string(
    it: &mut std::vec::IntoIter<Value>,
    field: &'static str,
) -> Result<String, PrivsepError> {
    let value = it.next().ok_or_else(|| PrivsepError::Protocol {
        detail: format!("missing field {field}"),
    })?;
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| PrivsepError::Protocol {
            detail: format!("field {field} is not a UTF-8 string"),
        })
}

fn take_array(
    it: &mut std::vec::IntoIter<Value>,
    field: &'static str,
) -> Result<Vec<Value>, PrivsepError> {
    let value = it.next().ok_or_else(|| PrivsepError::Protocol {
        detail: format!("missing field {field}"),
    })?;
    match value {
        Value::Array(items) => Ok(items),
        other => Err(PrivsepError::Protocol {
            detail: format!("field {field} is not an array, got {other:?}"),
        }),
    }
}

fn take_map(it: &mut std::vec::IntoIter<Value>, field: &'static str) -> Result<Value, PrivsepError> {
    let value = it.next().ok_or_else(|| PrivsepError::Protocol {
        detail: format!("missing field {field}"),
    })?;
    match value {
        Value::Map(pairs) => Ok(Value::Map(pairs)),
        other => Err(PrivsepError::Protocol {
            detail: format!("field {field} is not a map, got {other:?}"),
        }),
    }
}

/// An empty keyword-argument map, for calls that pass none.
pub fn empty_kwargs() -> Value {
    Value::Map(Vec::new())
}

/// Top-level `(correlation_id, frame)` envelope. `id` is `None` for
/// out-of-band frames (presently only [`Frame::Log`]).
#[derive(Clone, Debug)]
pub struct Envelope {
    pub id: Option<Uuid>,
    pub frame: Frame,
}

impl Envelope {
    pub fn call(id: Uuid, frame: Frame) -> Self {
        Envelope { id: Some(id), frame }
    }

    pub fn out_of_band(frame: Frame) -> Self {
        Envelope { id: None, frame }
    }

    fn to_value(&self) -> Value {
        let id = match &self.id {
            Some(id) => Value::from(id.to_string()),
            None => Value::Nil,
        };
        Value::Array(vec![id, self.frame.to_value()])
    }

    fn from_value(value: Value) -> Result<Self, PrivsepError> {
        let mut elems = match value {
            Value::Array(elems) if elems.len() == 2 => elems,
            other => {
                return Err(PrivsepError::Protocol {
                    detail: format!("envelope must be a 2-element array, got {other:?}"),
                });
            }
        };
        let frame_value = elems.pop().unwrap();
        let id_value = elems.pop().unwrap();
        let id = match id_value {
            Value::Nil => None,
            Value::String(s) => {
                let text = s.as_str().ok_or_else(|| PrivsepError::Protocol {
                    detail: "correlation id is not valid UTF-8".to_owned(),
                })?;
                Some(Uuid::parse_str(text).map_err(|e| PrivsepError::Protocol {
                    detail: format!("correlation id is not a UUID: {e}"),
                })?)
            }
            other => {
                return Err(PrivsepError::Protocol {
                    detail: format!("correlation id must be nil or a string, got {other:?}"),
                });
            }
        };
        Ok(Envelope {
            id,
            frame: Frame::from_value(frame_value)?,
        })
    }
}

/// Encodes one envelope to msgpack bytes, appending to `out`.
pub fn encode(envelope: &Envelope, out: &mut BytesMut) -> Result<(), PrivsepError> {
    let value = envelope.to_value();
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &value).map_err(|e| PrivsepError::Protocol {
        detail: format!("failed to encode frame: {e}"),
    })?;
    out.extend_from_slice(&buf);
    Ok(())
}

/// Incremental msgpack frame reader, fed raw bytes off a socket and yielding
/// complete [`Envelope`]s, mirroring `msgpack.Unpacker`'s feed/iterate model.
#[derive(Default)]
pub struct FrameReader {
    buffer: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Attempts to decode one complete envelope from the buffered bytes.
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn try_decode(&mut self) -> Result<Option<Envelope>, PrivsepError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&self.buffer[..]);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                self.buffer.advance(consumed);
                Envelope::from_value(value).map(Some)
            }
            Err(rmpv::decode::Error::InvalidMarkerRead(e))
            | Err(rmpv::decode::Error::InvalidDataRead(e))
                if e.kind() == io::ErrorKind::UnexpectedEof =>
            {
                Ok(None)
            }
            Err(e) => Err(PrivsepError::Protocol {
                detail: format!("malformed msgpack frame: {e}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(envelope: Envelope) -> Envelope {
        let mut buf = BytesMut::new();
        encode(&envelope, &mut buf).unwrap();
        let mut reader = FrameReader::new();
        reader.feed(&buf);
        reader.try_decode().unwrap().expect("one complete frame")
    }

    #[test]
    fn ping_pong_round_trip() {
        let id = Uuid::new_v4();
        let env = Envelope::call(id, Frame::Ping);
        let back = round_trip(env);
        assert_eq!(back.id, Some(id));
        assert!(matches!(back.frame, Frame::Ping));
    }

    #[test]
    fn call_with_args_round_trips() {
        let id = Uuid::new_v4();
        let env = Envelope::call(
            id,
            Frame::Call {
                name: "demo.add1".to_owned(),
                args: vec![Value::from(41)],
                kwargs: empty_kwargs(),
            },
        );
        let back = round_trip(env);
        match back.frame {
            Frame::Call { name, args, kwargs } => {
                assert_eq!(name, "demo.add1");
                assert_eq!(args, vec![Value::from(41)]);
                assert_eq!(kwargs, empty_kwargs());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn call_with_kwargs_round_trips() {
        let id = Uuid::new_v4();
        let kwargs = Value::Map(vec![(Value::from("retries"), Value::from(3))]);
        let env = Envelope::call(
            id,
            Frame::Call {
                name: "demo.configure".to_owned(),
                args: vec![],
                kwargs: kwargs.clone(),
            },
        );
        let back = round_trip(env);
        match back.frame {
            Frame::Call { kwargs: back_kwargs, .. } => assert_eq!(back_kwargs, kwargs),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn out_of_band_has_no_correlation_id() {
        let env = Envelope::out_of_band(Frame::Log {
            record: crate::logbridge::LogRecord::new(tracing::Level::INFO, "demo", "hello"),
        });
        let back = round_trip(env);
        assert_eq!(back.id, None);
    }

    #[test]
    fn incremental_feed_across_two_chunks() {
        let env = Envelope::call(
            Uuid::new_v4(),
            Frame::Call {
                name: "demo.sleep".to_owned(),
                args: vec![],
                kwargs: empty_kwargs(),
            },
        );
        let mut buf = BytesMut::new();
        encode(&env, &mut buf).unwrap();
        let (first, second) = buf.split_at(buf.len() / 2);

        let mut reader = FrameReader::new();
        reader.feed(first);
        assert!(reader.try_decode().unwrap().is_none());
        reader.feed(second);
        assert!(reader.try_decode().unwrap().is_some());
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let value = Value::Array(vec![Value::Nil, Value::Array(vec![Value::from(99)])]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        let mut reader = FrameReader::new();
        reader.feed(&buf);
        let err = reader.try_decode().unwrap_err();
        assert!(matches!(err, PrivsepError::Protocol { .. }));
    }
}
