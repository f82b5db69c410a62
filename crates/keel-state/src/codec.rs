//! Length-checked binary helpers shared by the block and state codecs.

use crate::{Result, StateError};
use bytes::{Buf, BufMut, BytesMut};
use keel_types::{HashValue, OutputId};

pub(crate) fn malformed(what: &'static str, reason: impl Into<String>) -> StateError {
    StateError::Malformed {
        what,
        reason: reason.into(),
    }
}

pub(crate) fn get_u8(buf: &mut &[u8], what: &'static str) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(malformed(what, "truncated u8"));
    }
    Ok(buf.get_u8())
}

pub(crate) fn get_u32(buf: &mut &[u8], what: &'static str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(malformed(what, "truncated u32"));
    }
    Ok(buf.get_u32())
}

pub(crate) fn get_u64(buf: &mut &[u8], what: &'static str) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(malformed(what, "truncated u64"));
    }
    Ok(buf.get_u64())
}

pub(crate) fn get_hash(buf: &mut &[u8], what: &'static str) -> Result<HashValue> {
    if buf.remaining() < HashValue::LEN {
        return Err(malformed(what, "truncated hash"));
    }
    let mut bytes = [0u8; HashValue::LEN];
    buf.copy_to_slice(&mut bytes);
    Ok(HashValue::from_array(bytes))
}

pub(crate) fn get_output_id(buf: &mut &[u8], what: &'static str) -> Result<OutputId> {
    if buf.remaining() < OutputId::LEN {
        return Err(malformed(what, "truncated output id"));
    }
    let id = OutputId::from_bytes(&buf[..OutputId::LEN]).map_err(|e| malformed(what, e.to_string()))?;
    buf.advance(OutputId::LEN);
    Ok(id)
}

/// Reads a `u32` length prefix followed by that many bytes.
pub(crate) fn get_bytes(buf: &mut &[u8], what: &'static str) -> Result<Vec<u8>> {
    let len = get_u32(buf, what)? as usize;
    if buf.remaining() < len {
        return Err(malformed(what, format!("truncated data: want {len} bytes")));
    }
    let data = buf[..len].to_vec();
    buf.advance(len);
    Ok(data)
}

pub(crate) fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Reads a collection count, bounded by what the remaining input could hold.
pub(crate) fn get_count(buf: &mut &[u8], min_item_len: usize, what: &'static str) -> Result<usize> {
    let count = get_u32(buf, what)? as usize;
    if count.saturating_mul(min_item_len) > buf.remaining() {
        return Err(malformed(what, format!("count {count} exceeds input")));
    }
    Ok(count)
}
