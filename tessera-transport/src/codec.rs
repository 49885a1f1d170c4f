//! Binary encoding of collective payloads.
//!
//! Values are bincode. When several payloads share one buffer each is
//! preceded by an 8-byte little-endian size frame:
//! - 8 bytes: payload length as u64
//! - N bytes: payload

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub const FRAME_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("Failed to encode payload: {0}")]
    Encode(bincode::Error),

    #[error("Failed to decode payload: {0}")]
    Decode(bincode::Error),

    #[error("Truncated frame: expected {expected} bytes, {actual} available")]
    Truncated { expected: usize, actual: usize },
}

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, SerializationError> {
    bincode::serialize(value).map_err(SerializationError::Encode)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SerializationError> {
    bincode::deserialize(bytes).map_err(SerializationError::Decode)
}

/// Size frame announcing a payload of `len` bytes.
pub fn size_frame(len: usize) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(FRAME_LEN);
    buf.put_u64_le(len as u64);
    buf.to_vec()
}

pub fn read_size(frame: &[u8]) -> Result<usize, SerializationError> {
    if frame.len() < FRAME_LEN {
        return Err(SerializationError::Truncated {
            expected: FRAME_LEN,
            actual: frame.len(),
        });
    }
    let mut buf = frame;
    Ok(buf.get_u64_le() as usize)
}

/// Concatenates payloads, each behind its size frame.
pub fn pack_frames<B: AsRef<[u8]>>(payloads: &[B]) -> Vec<u8> {
    let total: usize = payloads.iter().map(|p| FRAME_LEN + p.as_ref().len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for payload in payloads {
        let payload = payload.as_ref();
        buf.put_u64_le(payload.len() as u64);
        buf.put_slice(payload);
    }
    buf.to_vec()
}

/// Splits a buffer built by `pack_frames` back into its payloads.
pub fn unpack_frames(mut buf: &[u8]) -> Result<Vec<Vec<u8>>, SerializationError> {
    let mut out = Vec::new();
    while buf.has_remaining() {
        let len = read_size(buf)?;
        buf.advance(FRAME_LEN);
        if buf.remaining() < len {
            return Err(SerializationError::Truncated {
                expected: len,
                actual: buf.remaining(),
            });
        }
        out.push(buf[..len].to_vec());
        buf.advance(len);
    }
    Ok(out)
}
