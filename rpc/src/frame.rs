//! Length-prefixed call framing.
//!
//! Every frame is a big-endian `u32` body length followed by the body:
//!
//! ```text
//! request:  kind=0  call_id:u32  method_len:u16  method  payload
//! response: kind=1  call_id:u32  ok:u8           payload-or-error-message
//! ```
//!
//! Decode is incremental: a partial frame leaves the buffer untouched.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RpcError};

/// Frames larger than this are treated as a protocol violation.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;

const RESPONSE_OK: u8 = 1;
const RESPONSE_ERR: u8 = 0;

/// A decoded frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    Request {
        call_id: u32,
        method: String,
        payload: Bytes,
    },
    Response {
        call_id: u32,
        result: std::result::Result<Bytes, String>,
    },
}

pub(crate) fn encode_request(buf: &mut BytesMut, call_id: u32, method: &str, payload: &[u8]) {
    debug_assert!(method.len() <= u16::MAX as usize);
    let body_len = 1 + 4 + 2 + method.len() + payload.len();
    buf.reserve(4 + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u8(KIND_REQUEST);
    buf.put_u32(call_id);
    buf.put_u16(method.len() as u16);
    buf.put_slice(method.as_bytes());
    buf.put_slice(payload);
}

pub(crate) fn encode_response(
    buf: &mut BytesMut,
    call_id: u32,
    result: &std::result::Result<Bytes, String>,
) {
    let body = match result {
        Ok(payload) => payload.as_ref(),
        Err(msg) => msg.as_bytes(),
    };
    let body_len = 1 + 4 + 1 + body.len();
    buf.reserve(4 + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u8(KIND_RESPONSE);
    buf.put_u32(call_id);
    buf.put_u8(if result.is_ok() { RESPONSE_OK } else { RESPONSE_ERR });
    buf.put_slice(body);
}

/// Decode one frame from the front of `buf`, if a complete one is present.
pub(crate) fn try_decode(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if body_len > MAX_FRAME_LEN {
        return Err(RpcError::network(format!(
            "frame length {body_len} exceeds maximum of {MAX_FRAME_LEN}"
        )));
    }
    if buf.len() < 4 + body_len {
        return Ok(None);
    }
    buf.advance(4);
    let mut body = buf.split_to(body_len).freeze();
    decode_body(&mut body).map(Some)
}

fn decode_body(body: &mut Bytes) -> Result<Frame> {
    if body.remaining() < 5 {
        return Err(malformed("truncated header"));
    }
    let kind = body.get_u8();
    let call_id = body.get_u32();
    match kind {
        KIND_REQUEST => {
            if body.remaining() < 2 {
                return Err(malformed("truncated method length"));
            }
            let method_len = body.get_u16() as usize;
            if body.remaining() < method_len {
                return Err(malformed("truncated method name"));
            }
            let method = std::str::from_utf8(&body[..method_len])
                .map_err(|_| malformed("method name is not UTF-8"))?
                .to_string();
            body.advance(method_len);
            Ok(Frame::Request {
                call_id,
                method,
                payload: body.clone(),
            })
        }
        KIND_RESPONSE => {
            if body.remaining() < 1 {
                return Err(malformed("truncated response flag"));
            }
            let ok = body.get_u8();
            let result = if ok == RESPONSE_OK {
                Ok(body.clone())
            } else {
                Err(String::from_utf8_lossy(body).into_owned())
            };
            Ok(Frame::Response { call_id, result })
        }
        other => Err(malformed(format!("unknown frame kind {other}"))),
    }
}

fn malformed(detail: impl std::fmt::Display) -> RpcError {
    RpcError::network(format!("malformed frame from remote: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let mut buf = BytesMut::new();
        encode_request(&mut buf, 7, "echo", b"hello");
        let frame = try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Request {
                call_id: 7,
                method: "echo".to_string(),
                payload: Bytes::from_static(b"hello"),
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_error_response() {
        let mut buf = BytesMut::new();
        encode_response(&mut buf, 3, &Err("service queue is full".to_string()));
        let frame = try_decode(&mut buf).unwrap().unwrap();
        match frame {
            Frame::Response { call_id, result } => {
                assert_eq!(call_id, 3);
                assert_eq!(result.unwrap_err(), "service queue is full");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_partial_frame_not_consumed() {
        let mut buf = BytesMut::new();
        encode_request(&mut buf, 1, "echo", b"0123456789");
        let full = buf.clone();

        // Feed the bytes one at a time; nothing decodes until the last one.
        let mut partial = BytesMut::new();
        for (i, b) in full.iter().enumerate() {
            partial.put_u8(*b);
            let decoded = try_decode(&mut partial).unwrap();
            if i + 1 < full.len() {
                assert!(decoded.is_none());
                assert_eq!(partial.len(), i + 1);
            } else {
                assert!(decoded.is_some());
            }
        }
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        encode_request(&mut buf, 1, "a", b"x");
        encode_request(&mut buf, 2, "b", b"y");
        let first = try_decode(&mut buf).unwrap().unwrap();
        let second = try_decode(&mut buf).unwrap().unwrap();
        match (first, second) {
            (Frame::Request { call_id: 1, .. }, Frame::Request { call_id: 2, .. }) => {}
            other => panic!("unexpected frames: {other:?}"),
        }
        assert!(try_decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        buf.put_slice(b"junk");
        let err = try_decode(&mut buf).unwrap_err();
        assert!(err.is_network_error());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(9);
        buf.put_u32(1);
        let err = try_decode(&mut buf).unwrap_err();
        assert!(err.to_string().contains("unknown frame kind"));
    }
}
