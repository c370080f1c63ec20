use bytes::Bytes;

use crate::{Envelope, Result};

pub fn encode_frame(envelope: &Envelope) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(envelope)?))
}

pub fn decode_frame(frame: &[u8]) -> Result<Envelope> {
    Ok(serde_json::from_slice(frame)?)
}
