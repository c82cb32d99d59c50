//! RPC message codec.
//!
//! RPC traffic rides control messages (`Command`-terminated). The first
//! two bytes of the payload are the handler id (always [`HANDLER_RPC`])
//! and the action:
//!
//! | action | body |
//! |---|---|
//! | `MethodCall` (1) | `u16 return_id, string service, string method, u8 argc, argc fields` |
//! | `MethodCallNoReturn` (2) | `string service, string method, u8 argc, argc fields` |
//! | `MethodReturn` (3) | `u16 return_id, field` |
//! | `MethodException` (4) | `u16 return_id, string type, string message, string stack` |
//! | `MethodCancel` (5) | `u16 return_id` |
//!
//! Strings are u16 little-endian length-prefixed UTF-8; integers are
//! little-endian; argument fields carry their own framing (see
//! [`FieldCodec`](super::FieldCodec)).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::codec::FieldCodec;
use crate::error::{RemoteException, Result, WireError};

/// Handler id of the RPC channel (first payload byte).
pub const HANDLER_RPC: u8 = 1;

/// Handler id of the handshake channel.
pub const HANDLER_HANDSHAKE: u8 = 2;

/// RPC action discriminator (second payload byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcAction {
    MethodCall = 1,
    MethodCallNoReturn = 2,
    MethodReturn = 3,
    MethodException = 4,
    MethodCancel = 5,
}

impl RpcAction {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RpcAction::MethodCall),
            2 => Some(RpcAction::MethodCallNoReturn),
            3 => Some(RpcAction::MethodReturn),
            4 => Some(RpcAction::MethodException),
            5 => Some(RpcAction::MethodCancel),
            _ => None,
        }
    }
}

/// A decoded RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Call {
        return_id: u16,
        service: String,
        method: String,
        args: Vec<Bytes>,
    },
    CallNoReturn {
        service: String,
        method: String,
        args: Vec<Bytes>,
    },
    Return {
        return_id: u16,
        value: Bytes,
    },
    Exception {
        return_id: u16,
        exception: RemoteException,
    },
    Cancel {
        return_id: u16,
    },
}

impl RpcMessage {
    fn action(&self) -> RpcAction {
        match self {
            RpcMessage::Call { .. } => RpcAction::MethodCall,
            RpcMessage::CallNoReturn { .. } => RpcAction::MethodCallNoReturn,
            RpcMessage::Return { .. } => RpcAction::MethodReturn,
            RpcMessage::Exception { .. } => RpcAction::MethodException,
            RpcMessage::Cancel { .. } => RpcAction::MethodCancel,
        }
    }

    /// Encode to a message payload, handler and action bytes included.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(HANDLER_RPC);
        buf.put_u8(self.action() as u8);

        match self {
            RpcMessage::Call {
                return_id,
                service,
                method,
                args,
            } => {
                buf.put_u16_le(*return_id);
                put_string(&mut buf, service);
                put_string(&mut buf, method);
                put_args(&mut buf, args);
            }
            RpcMessage::CallNoReturn {
                service,
                method,
                args,
            } => {
                put_string(&mut buf, service);
                put_string(&mut buf, method);
                put_args(&mut buf, args);
            }
            RpcMessage::Return { return_id, value } => {
                buf.put_u16_le(*return_id);
                buf.extend_from_slice(value);
            }
            RpcMessage::Exception {
                return_id,
                exception,
            } => {
                buf.put_u16_le(*return_id);
                put_string(&mut buf, &exception.type_name);
                put_string(&mut buf, &exception.message);
                put_string(&mut buf, &exception.stack);
            }
            RpcMessage::Cancel { return_id } => {
                buf.put_u16_le(*return_id);
            }
        }
        buf.freeze()
    }

    /// Decode from a message payload.
    pub fn decode(payload: &Bytes) -> Result<Self> {
        let mut cursor = payload.clone();
        let handler = read_u8(&mut cursor)?;
        if handler != HANDLER_RPC {
            return Err(WireError::Protocol(format!(
                "unknown handler id {handler}"
            )));
        }
        let action_byte = read_u8(&mut cursor)?;
        let action = RpcAction::from_u8(action_byte).ok_or_else(|| {
            WireError::Protocol(format!("unknown RPC action {action_byte}"))
        })?;

        let message = match action {
            RpcAction::MethodCall => {
                let return_id = read_u16(&mut cursor)?;
                let service = read_string(&mut cursor)?;
                let method = read_string(&mut cursor)?;
                let args = read_args(&mut cursor)?;
                RpcMessage::Call {
                    return_id,
                    service,
                    method,
                    args,
                }
            }
            RpcAction::MethodCallNoReturn => {
                let service = read_string(&mut cursor)?;
                let method = read_string(&mut cursor)?;
                let args = read_args(&mut cursor)?;
                RpcMessage::CallNoReturn {
                    service,
                    method,
                    args,
                }
            }
            RpcAction::MethodReturn => {
                let return_id = read_u16(&mut cursor)?;
                let value = cursor.split_to(cursor.len());
                FieldCodec::body(&value, 0)?;
                RpcMessage::Return { return_id, value }
            }
            RpcAction::MethodException => {
                let return_id = read_u16(&mut cursor)?;
                let type_name = read_string(&mut cursor)?;
                let message = read_string(&mut cursor)?;
                let stack = read_string(&mut cursor)?;
                RpcMessage::Exception {
                    return_id,
                    exception: RemoteException {
                        type_name,
                        message,
                        stack,
                    },
                }
            }
            RpcAction::MethodCancel => RpcMessage::Cancel {
                return_id: read_u16(&mut cursor)?,
            },
        };

        if !cursor.is_empty() {
            return Err(WireError::Protocol(format!(
                "{} trailing bytes after RPC body",
                cursor.len()
            )));
        }
        Ok(message)
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.put_u16_le(s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}

fn put_args(buf: &mut BytesMut, args: &[Bytes]) {
    debug_assert!(args.len() <= u8::MAX as usize);
    buf.put_u8(args.len() as u8);
    for arg in args {
        buf.extend_from_slice(arg);
    }
}

fn read_u8(cursor: &mut Bytes) -> Result<u8> {
    if cursor.is_empty() {
        return Err(WireError::Protocol("truncated RPC message".to_string()));
    }
    Ok(cursor.get_u8())
}

fn read_u16(cursor: &mut Bytes) -> Result<u16> {
    if cursor.len() < 2 {
        return Err(WireError::Protocol("truncated RPC message".to_string()));
    }
    Ok(cursor.get_u16_le())
}

fn read_string(cursor: &mut Bytes) -> Result<String> {
    let len = read_u16(cursor)? as usize;
    if cursor.len() < len {
        return Err(WireError::Protocol("truncated string".to_string()));
    }
    let raw = cursor.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| WireError::Protocol("string is not valid UTF-8".to_string()))
}

fn read_args(cursor: &mut Bytes) -> Result<Vec<Bytes>> {
    let argc = read_u8(cursor)? as usize;
    let mut args = Vec::with_capacity(argc);
    for index in 0..argc {
        let total = FieldCodec::field_len(cursor)
            .ok_or_else(|| WireError::Protocol("truncated argument field".to_string()))?;
        if cursor.len() < total {
            return Err(WireError::Protocol("truncated argument field".to_string()));
        }
        let field = cursor.split_to(total);
        FieldCodec::body(&field, index as u8)?;
        args.push(field);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &RpcMessage) -> RpcMessage {
        RpcMessage::decode(&msg.encode()).unwrap()
    }

    fn args_of(values: &[i64]) -> Vec<Bytes> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| FieldCodec::encode(v, i as u8).unwrap())
            .collect()
    }

    #[test]
    fn test_call_roundtrip() {
        let msg = RpcMessage::Call {
            return_id: 42,
            service: "Calculator".to_string(),
            method: "Add".to_string(),
            args: args_of(&[100, 200]),
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_call_no_return_roundtrip() {
        let msg = RpcMessage::CallNoReturn {
            service: "Audit".to_string(),
            method: "Record".to_string(),
            args: args_of(&[7]),
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_return_roundtrip() {
        let msg = RpcMessage::Return {
            return_id: 9,
            value: FieldCodec::encode(&300i64, 0).unwrap(),
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_exception_roundtrip() {
        let msg = RpcMessage::Exception {
            return_id: 3,
            exception: RemoteException {
                type_name: "DivideByZero".to_string(),
                message: "denominator was zero".to_string(),
                stack: "at Calculator.Divide".to_string(),
            },
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_cancel_roundtrip() {
        let msg = RpcMessage::Cancel { return_id: 0xBEEF };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_wire_prefix_bytes() {
        let bytes = RpcMessage::Cancel { return_id: 0x0102 }.encode();
        assert_eq!(bytes[0], HANDLER_RPC);
        assert_eq!(bytes[1], RpcAction::MethodCancel as u8);
        // Little-endian return id.
        assert_eq!(bytes[2], 0x02);
        assert_eq!(bytes[3], 0x01);
    }

    #[test]
    fn test_zero_arg_call() {
        let msg = RpcMessage::Call {
            return_id: 1,
            service: "S".to_string(),
            method: "M".to_string(),
            args: Vec::new(),
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_unknown_handler_rejected() {
        let err = RpcMessage::decode(&Bytes::from_static(&[0x77, 1])).unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let err = RpcMessage::decode(&Bytes::from_static(&[HANDLER_RPC, 9])).unwrap_err();
        assert!(matches!(err, WireError::Protocol(_)));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let full = RpcMessage::Call {
            return_id: 1,
            service: "Calculator".to_string(),
            method: "Add".to_string(),
            args: args_of(&[1, 2]),
        }
        .encode();
        let truncated = full.slice(..full.len() - 3);
        assert!(RpcMessage::decode(&truncated).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = BytesMut::from(&RpcMessage::Cancel { return_id: 1 }.encode()[..]);
        bytes.put_u8(0);
        assert!(RpcMessage::decode(&bytes.freeze()).is_err());
    }

    #[test]
    fn test_arg_with_wrong_index_rejected() {
        // Single argument framed as field 5 instead of field 0.
        let msg = RpcMessage::CallNoReturn {
            service: "S".to_string(),
            method: "M".to_string(),
            args: vec![FieldCodec::encode(&1i32, 5).unwrap()],
        };
        assert!(RpcMessage::decode(&msg.encode()).is_err());
    }
}
