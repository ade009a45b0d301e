//! Byte-order helpers and bounds-checked decoding
//!
//! The wire is little-endian. The `swap_bytes_if_big_endian_*` helpers turn a
//! value read in host order into wire order (and back); they are the identity
//! on little-endian hosts.

use cadence_core::{CadenceError, CadenceResult, FederateId, Tag, TAG_SIZE};

#[inline]
pub fn swap_bytes_if_big_endian_u16(value: u16) -> u16 {
    if cfg!(target_endian = "big") {
        value.swap_bytes()
    } else {
        value
    }
}

#[inline]
pub fn swap_bytes_if_big_endian_u32(value: u32) -> u32 {
    if cfg!(target_endian = "big") {
        value.swap_bytes()
    } else {
        value
    }
}

#[inline]
pub fn swap_bytes_if_big_endian_i32(value: i32) -> i32 {
    if cfg!(target_endian = "big") {
        value.swap_bytes()
    } else {
        value
    }
}

#[inline]
pub fn swap_bytes_if_big_endian_i64(value: i64) -> i64 {
    if cfg!(target_endian = "big") {
        value.swap_bytes()
    } else {
        value
    }
}

/// Bounds-checked cursor over a received payload
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        WireReader { buf, pos: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take<const N: usize>(&mut self) -> CadenceResult<[u8; N]> {
        let bytes = self.bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Borrow the next `len` bytes
    pub fn bytes(&mut self, len: usize) -> CadenceResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(CadenceError::BufferTooShort {
                expected: self.pos + len,
                actual: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn u8(&mut self) -> CadenceResult<u8> {
        Ok(self.take::<1>()?[0])
    }

    pub fn u16(&mut self) -> CadenceResult<u16> {
        Ok(swap_bytes_if_big_endian_u16(u16::from_ne_bytes(self.take()?)))
    }

    pub fn u32(&mut self) -> CadenceResult<u32> {
        Ok(swap_bytes_if_big_endian_u32(u32::from_ne_bytes(self.take()?)))
    }

    pub fn i32(&mut self) -> CadenceResult<i32> {
        Ok(swap_bytes_if_big_endian_i32(i32::from_ne_bytes(self.take()?)))
    }

    pub fn i64(&mut self) -> CadenceResult<i64> {
        Ok(swap_bytes_if_big_endian_i64(i64::from_ne_bytes(self.take()?)))
    }

    pub fn federate(&mut self) -> CadenceResult<FederateId> {
        Ok(FederateId::new(self.u16()?))
    }

    pub fn tag(&mut self) -> CadenceResult<Tag> {
        Ok(Tag::from_bytes(self.take::<TAG_SIZE>()?))
    }
}

/// Peek a little-endian u16 at `offset` without consuming
pub fn extract_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Peek a little-endian u32 at `offset` without consuming
pub fn extract_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
