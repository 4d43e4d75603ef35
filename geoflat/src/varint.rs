//! Variable length integers and a bounds-checked cursor over encoded bytes.
//!
//! Unsigned integers use the protobuf base-128 varint encoding, signed ones
//! are zigzag mapped first so that small negative deltas stay small.

use crate::error::{Error, Result};

use byteorder::{ByteOrder, LittleEndian};

/// Largest number of bytes a `u64` varint can occupy.
pub const MAX_VARINT_LEN: usize = 10;

#[inline]
pub fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
pub fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

#[inline]
pub fn put_uvarint(buffer: &mut Vec<u8>, v: u64) {
    prost::encoding::encode_varint(v, buffer);
}

#[inline]
pub fn put_varint(buffer: &mut Vec<u8>, v: i64) {
    put_uvarint(buffer, zigzag_encode(v));
}

#[inline]
pub fn uvarint_len(v: u64) -> usize {
    prost::encoding::encoded_len_varint(v)
}

/// Number of bytes needed to represent `v`, at least one.
#[inline]
pub fn uint64_len(v: u64) -> usize {
    (((64 - v.leading_zeros()) as usize + 7) / 8).max(1)
}

/// Appends `values` as zigzag coded deltas, starting from zero.
pub fn put_delta_coded(buffer: &mut Vec<u8>, values: &[u64]) {
    let mut last = 0u64;
    for &v in values {
        put_varint(buffer, v.wrapping_sub(last) as i64);
        last = v;
    }
}

/// Forward-only reader over a byte slice.
///
/// Every accessor checks bounds and reports `Error::Truncated` rather than
/// panicking, so a reader can be pointed at untrusted bytes.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn uvarint(&mut self) -> Result<u64> {
        let mut rest = self.remaining();
        if rest.is_empty() {
            return Err(Error::Truncated("varint"));
        }
        let before = rest.len();
        let v = prost::encoding::decode_varint(&mut rest)
            .map_err(|_| Error::corrupt(format!("invalid varint at {}", self.pos)))?;
        self.pos += before - rest.len();
        Ok(v)
    }

    #[inline]
    pub fn varint(&mut self) -> Result<i64> {
        self.uvarint().map(zigzag_decode)
    }

    /// Reads a varint that is used as a length or count, bounded by the
    /// number of remaining bytes to stop absurd allocations on bad input.
    pub fn len_prefix(&mut self) -> Result<usize> {
        let v = self.uvarint()?;
        if v > self.data.len() as u64 {
            return Err(Error::corrupt(format!("length {} exceeds input", v)));
        }
        Ok(v as usize)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(Error::Truncated("bytes"));
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.bytes(2)?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.bytes(4)?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.bytes(8)?))
    }

    /// Reads `n` zigzag coded deltas, the inverse of `put_delta_coded`.
    pub fn delta_coded(&mut self, n: usize) -> Result<Vec<u64>> {
        let mut values = Vec::with_capacity(n.min(self.data.len()));
        let mut last = 0u64;
        for _ in 0..n {
            last = last.wrapping_add(self.varint()? as u64);
            values.push(last);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zigzag() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        assert_eq!(zigzag_encode(i64::MIN), u64::MAX);
        assert_eq!(zigzag_decode(u64::MAX), i64::MIN);
    }

    #[test]
    fn test_uint64_len() {
        assert_eq!(uint64_len(0), 1);
        assert_eq!(uint64_len(255), 1);
        assert_eq!(uint64_len(256), 2);
        assert_eq!(uint64_len(u64::MAX), 8);
    }

    #[test]
    fn test_truncated_varint() {
        let mut reader = Reader::new(&[]);
        assert!(matches!(reader.uvarint(), Err(Error::Truncated(_))));
        let mut reader = Reader::new(&[0x80]);
        assert!(reader.uvarint().is_err());
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_fixed_width() {
        let data = [1, 2, 0, 3, 0, 0, 0, 0xff];
        let mut reader = Reader::new(&data);
        assert_eq!(reader.u8().unwrap(), 1);
        assert_eq!(reader.u16().unwrap(), 2);
        assert_eq!(reader.u32().unwrap(), 3);
        assert_eq!(reader.u8().unwrap(), 0xff);
        assert!(reader.is_empty());
        assert!(matches!(reader.u8(), Err(Error::Truncated(_))));
    }

    proptest! {
        #[test]
        fn signed_and_unsigned_varints(ref values in prop::collection::vec(any::<i64>(), 0..64)) {
            let mut buffer = Vec::new();
            for v in values {
                put_varint(&mut buffer, *v);
                put_uvarint(&mut buffer, *v as u64);
            }
            let mut reader = Reader::new(&buffer);
            for v in values {
                prop_assert_eq!(reader.varint().unwrap(), *v);
                prop_assert_eq!(reader.uvarint().unwrap(), *v as u64);
            }
            prop_assert!(reader.is_empty());
        }

        #[test]
        fn delta_coded_values(ref values in prop::collection::vec(any::<u64>(), 0..64)) {
            let mut buffer = Vec::new();
            put_delta_coded(&mut buffer, values);
            let mut reader = Reader::new(&buffer);
            prop_assert_eq!(&reader.delta_coded(values.len()).unwrap(), values);
            prop_assert_eq!(reader.position(), buffer.len());
        }
    }
}
