//! Arrays of variable length byte strings behind an offset table.
//!
//! Layout: `items:u32, offset_bytes:u32, max_item_length:u32`, followed by
//! `items + 1` little endian pointers of `offset_bytes` width, followed by the
//! item data. Item `i` spans `pointer[i]..pointer[i + 1]` of the data.

use crate::error::{Error, Result};
use crate::output::WriteAt;
use crate::varint::uint64_len;

use byteorder::{ByteOrder, LittleEndian};

use std::sync::atomic::{AtomicU64, Ordering};

pub const HEADER_LEN: usize = 12;

/// Builds a `ByteArrays` with a fixed number of items in two phases.
///
/// First every item's total length is reserved, possibly concurrently. After
/// `write_header` the items are written, in any order and from any thread,
/// as long as the bytes written per item add up to the reservation.
#[derive(Debug)]
pub struct ByteArraysBuilder {
    lengths: Vec<AtomicU64>,
    // prefix sums of lengths, filled by `write_header`
    pointers: Vec<u64>,
    cursors: Vec<AtomicU64>,
    offset_bytes: usize,
    data_offset: u64,
}

impl ByteArraysBuilder {
    pub fn new(items: usize) -> Self {
        Self {
            lengths: (0..items).map(|_| AtomicU64::new(0)).collect(),
            pointers: Vec::new(),
            cursors: Vec::new(),
            offset_bytes: 0,
            data_offset: 0,
        }
    }

    pub fn items(&self) -> usize {
        self.lengths.len()
    }

    #[inline]
    pub fn reserve(&self, item: usize, length: usize) {
        self.lengths[item].fetch_add(length as u64, Ordering::Relaxed);
    }

    pub fn reserved(&self, item: usize) -> u64 {
        self.lengths[item].load(Ordering::Relaxed)
    }

    fn finish_reservation(&mut self) -> u64 {
        let mut pointers = Vec::with_capacity(self.lengths.len() + 1);
        let mut total = 0;
        pointers.push(0);
        for length in &self.lengths {
            total += length.load(Ordering::Relaxed);
            pointers.push(total);
        }
        self.offset_bytes = uint64_len(total);
        self.cursors = pointers[..self.lengths.len()]
            .iter()
            .map(|&p| AtomicU64::new(p))
            .collect();
        self.pointers = pointers;
        total
    }

    fn max_item_length(&self) -> u64 {
        self.pointers
            .windows(2)
            .map(|w| w[1] - w[0])
            .max()
            .unwrap_or(0)
    }

    /// Total encoded length; only valid after `write_header`.
    pub fn length(&self) -> u64 {
        (HEADER_LEN + self.pointers.len() * self.offset_bytes) as u64
            + self.pointers.last().copied().unwrap_or(0)
    }

    /// Writes header and offset table at `offset`, and returns the offset
    /// just after the (not yet written) item data.
    pub fn write_header<W: WriteAt + ?Sized>(&mut self, w: &W, offset: u64) -> Result<u64> {
        let total = self.finish_reservation();
        let mut buffer = vec![0u8; HEADER_LEN + self.pointers.len() * self.offset_bytes];
        LittleEndian::write_u32(&mut buffer[0..4], self.lengths.len() as u32);
        LittleEndian::write_u32(&mut buffer[4..8], self.offset_bytes as u32);
        LittleEndian::write_u32(&mut buffer[8..12], self.max_item_length() as u32);
        for (i, &pointer) in self.pointers.iter().enumerate() {
            let start = HEADER_LEN + i * self.offset_bytes;
            LittleEndian::write_uint(
                &mut buffer[start..start + self.offset_bytes],
                pointer,
                self.offset_bytes,
            );
        }
        w.write_at(&buffer, offset)?;
        self.data_offset = offset + buffer.len() as u64;
        Ok(self.data_offset + total)
    }

    /// Absolute output range of an item; only valid after `write_header`.
    pub fn item_range(&self, item: usize) -> (u64, u64) {
        (
            self.data_offset + self.pointers[item],
            self.data_offset + self.pointers[item + 1],
        )
    }

    /// Appends the concatenation of `parts` to `item`.
    pub fn write_item<W: WriteAt + ?Sized>(
        &self,
        w: &W,
        item: usize,
        parts: &[&[u8]],
    ) -> Result<()> {
        let length: u64 = parts.iter().map(|p| p.len() as u64).sum();
        let start = self.cursors[item].fetch_add(length, Ordering::Relaxed);
        if start + length > self.pointers[item + 1] {
            return Err(Error::Reservation(format!(
                "item {} overflows its reservation of {} bytes",
                item,
                self.pointers[item + 1] - self.pointers[item]
            )));
        }
        let mut offset = self.data_offset + start;
        for part in parts {
            w.write_at(part, offset)?;
            offset += part.len() as u64;
        }
        Ok(())
    }

    /// Fails unless every item was written up to its reservation.
    pub fn check_written(&self) -> Result<()> {
        for (item, cursor) in self.cursors.iter().enumerate() {
            let written = cursor.load(Ordering::Relaxed) - self.pointers[item];
            let reserved = self.pointers[item + 1] - self.pointers[item];
            if written != reserved {
                return Err(Error::Reservation(format!(
                    "item {} has {} of its {} reserved bytes written",
                    item, written, reserved
                )));
            }
        }
        Ok(())
    }

    /// Writes a complete item in one go, replacing whatever was written.
    pub(crate) fn rewrite_item<W: WriteAt + ?Sized>(
        &self,
        w: &W,
        item: usize,
        data: &[u8],
    ) -> Result<()> {
        let (start, end) = self.item_range(item);
        if data.len() as u64 != end - start {
            return Err(Error::Reservation(format!(
                "item {} rewritten with {} bytes instead of {}",
                item,
                data.len(),
                end - start
            )));
        }
        w.write_at(data, start)?;
        Ok(())
    }
}

/// Read view over an encoded `ByteArrays`.
#[derive(Debug, Clone, Copy)]
pub struct ByteArrays<'a> {
    data: &'a [u8],
    items: usize,
    offset_bytes: usize,
    data_start: usize,
}

impl<'a> ByteArrays<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Truncated("byte arrays header"));
        }
        let items = LittleEndian::read_u32(&data[0..4]) as usize;
        let offset_bytes = LittleEndian::read_u32(&data[4..8]) as usize;
        if offset_bytes == 0 || offset_bytes > 8 {
            return Err(Error::corrupt(format!("offset width {}", offset_bytes)));
        }
        let data_start = (items as u64 + 1)
            .checked_mul(offset_bytes as u64)
            .map(|n| n + HEADER_LEN as u64)
            .filter(|&n| n <= data.len() as u64)
            .ok_or(Error::Truncated("byte arrays offsets"))? as usize;
        let arrays = Self {
            data,
            items,
            offset_bytes,
            data_start,
        };
        if arrays.data_start as u64 + arrays.pointer(items) > data.len() as u64 {
            return Err(Error::Truncated("byte arrays data"));
        }
        Ok(arrays)
    }

    #[inline]
    fn pointer(&self, i: usize) -> u64 {
        let start = HEADER_LEN + i * self.offset_bytes;
        LittleEndian::read_uint(&self.data[start..start + self.offset_bytes], self.offset_bytes)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    /// Number of bytes the encoded arrays occupy.
    pub fn byte_len(&self) -> usize {
        self.data_start + self.pointer(self.items) as usize
    }

    pub fn item(&self, i: usize) -> Result<&'a [u8]> {
        if i >= self.items {
            return Err(Error::corrupt(format!(
                "item {} out of range of {}",
                i, self.items
            )));
        }
        let (start, end) = (self.pointer(i), self.pointer(i + 1));
        if start > end || self.data_start as u64 + end > self.data.len() as u64 {
            return Err(Error::corrupt(format!("item {} has bad bounds", i)));
        }
        Ok(&self.data[self.data_start + start as usize..self.data_start + end as usize])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::output::{MemoryOutput, Output};

    use proptest::prelude::*;

    fn build(items: &[Vec<u8>]) -> Vec<u8> {
        let output = MemoryOutput::new();
        let w = output.write().unwrap();
        let mut builder = ByteArraysBuilder::new(items.len());
        for (i, item) in items.iter().enumerate() {
            builder.reserve(i, item.len());
        }
        let end = builder.write_header(&*w, 3).unwrap();
        assert_eq!(end, 3 + builder.length());
        // write in reverse, and in two halves, to exercise the cursors
        for (i, item) in items.iter().enumerate().rev() {
            let (a, b) = item.split_at(item.len() / 2);
            builder.write_item(&*w, i, &[a]).unwrap();
            builder.write_item(&*w, i, &[b]).unwrap();
        }
        builder.check_written().unwrap();
        output.to_vec()[3..].to_vec()
    }

    #[test]
    fn test_empty_arrays() {
        let data = build(&[]);
        let arrays = ByteArrays::new(&data).unwrap();
        assert!(arrays.is_empty());
        assert_eq!(arrays.byte_len(), HEADER_LEN + 1);
        assert!(arrays.item(0).is_err());
    }

    #[test]
    fn test_overflowing_reservation() {
        let output = MemoryOutput::new();
        let w = output.write().unwrap();
        let mut builder = ByteArraysBuilder::new(2);
        builder.reserve(0, 2);
        builder.reserve(1, 2);
        builder.write_header(&*w, 0).unwrap();
        builder.write_item(&*w, 0, &[b"ab"]).unwrap();
        assert!(matches!(
            builder.write_item(&*w, 0, &[b"c"]),
            Err(Error::Reservation(_))
        ));
    }

    #[test]
    fn test_short_writes_are_detected() {
        let output = MemoryOutput::new();
        let w = output.write().unwrap();
        let mut builder = ByteArraysBuilder::new(3);
        builder.reserve(0, 2);
        builder.reserve(2, 4);
        builder.write_header(&*w, 0).unwrap();
        builder.write_item(&*w, 0, &[b"ab"]).unwrap();
        builder.write_item(&*w, 2, &[b"cd"]).unwrap();
        assert!(matches!(builder.check_written(), Err(Error::Reservation(_))));
        builder.write_item(&*w, 2, &[b"e", b"f"]).unwrap();
        builder.check_written().unwrap();
    }

    #[test]
    fn test_truncated_arrays() {
        let data = build(&[b"hello".to_vec(), b"world".to_vec()]);
        assert!(ByteArrays::new(&data[..data.len() - 1]).is_err());
        assert!(ByteArrays::new(&data[..5]).is_err());
    }

    #[test]
    fn test_wide_offsets() {
        let items = vec![vec![7u8; 300], vec![], vec![1, 2, 3]];
        let data = build(&items);
        let arrays = ByteArrays::new(&data).unwrap();
        assert_eq!(LittleEndian::read_u32(&data[4..8]), 2);
        assert_eq!(LittleEndian::read_u32(&data[8..12]), 300);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(arrays.item(i).unwrap(), &item[..]);
        }
    }

    proptest! {
        #[test]
        fn items_are_preserved(ref items in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 0..50)) {
            let data = build(items);
            let arrays = ByteArrays::new(&data).unwrap();
            prop_assert_eq!(arrays.len(), items.len());
            prop_assert_eq!(arrays.byte_len(), data.len());
            for (i, item) in items.iter().enumerate() {
                prop_assert_eq!(arrays.item(i).unwrap(), &item[..]);
            }
        }
    }
}
