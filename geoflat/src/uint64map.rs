//! Bucketed on-disk map from `u64` keys to tagged byte strings.
//!
//! The low `bucket_bits` of a key select a bucket of a `ByteArrays`. Within a
//! bucket every entry is stored as
//! `uvarint(((key >> bucket_bits) << tag_bits) | tag), uvarint(len), data`.
//! One key may have several entries with different (or equal) tags.
//!
//! Maps are built with the same two phases as `ByteArraysBuilder`: reserve
//! every entry, write the header, then write every entry.

use crate::arrays::{ByteArrays, ByteArraysBuilder};
use crate::error::{Error, Result};
use crate::output::{ReadAt, WriteAt};
use crate::varint::{put_uvarint, uvarint_len, Reader};

use rayon::prelude::*;

/// Number of bucket bits that gives roughly one entry per bucket.
pub fn bucket_bits_for_count(count: u64) -> u8 {
    let bits = if count <= 1 {
        0
    } else {
        64 - (count - 1).leading_zeros()
    };
    bits.max(1) as u8
}

#[derive(Debug)]
pub struct Uint64MapBuilder {
    bucket_bits: u8,
    tag_bits: u8,
    arrays: ByteArraysBuilder,
}

impl Uint64MapBuilder {
    pub fn new(bucket_bits: u8, tag_bits: u8) -> Self {
        // keys must survive the shift in the entry header
        let bucket_bits = bucket_bits.max(tag_bits).max(1);
        Self {
            bucket_bits,
            tag_bits,
            arrays: ByteArraysBuilder::new(1 << bucket_bits),
        }
    }

    #[inline]
    fn bucket(&self, key: u64) -> usize {
        (key & ((1 << self.bucket_bits) - 1)) as usize
    }

    #[inline]
    fn entry_key(&self, key: u64, tag: u64) -> u64 {
        ((key >> self.bucket_bits) << self.tag_bits) | tag
    }

    /// Reserves space for one entry of `length` bytes.
    pub fn reserve(&self, key: u64, tag: u64, length: usize) {
        let header = uvarint_len(self.entry_key(key, tag)) + uvarint_len(length as u64);
        self.arrays.reserve(self.bucket(key), header + length);
    }

    /// Writes the map header at `offset` and returns the offset after the
    /// map's (not yet written) entries.
    pub fn write_header<W: WriteAt + ?Sized>(&mut self, w: &W, offset: u64) -> Result<u64> {
        w.write_at(&[self.bucket_bits, self.tag_bits], offset)?;
        self.arrays.write_header(w, offset + 2)
    }

    /// Total encoded length; only valid after `write_header`.
    pub fn length(&self) -> u64 {
        2 + self.arrays.length()
    }

    pub fn write_item<W: WriteAt + ?Sized>(
        &self,
        w: &W,
        key: u64,
        tag: u64,
        data: &[u8],
    ) -> Result<()> {
        if tag >= 1 << self.tag_bits {
            return Err(Error::Reservation(format!(
                "tag {} doesn't fit into {} bits",
                tag, self.tag_bits
            )));
        }
        let mut header = Vec::with_capacity(20);
        put_uvarint(&mut header, self.entry_key(key, tag));
        put_uvarint(&mut header, data.len() as u64);
        self.arrays.write_item(w, self.bucket(key), &[&header, data])
    }

    /// Sorts the entries of every bucket by key, tag and data.
    ///
    /// Entries are written in whatever order workers finish; sorting them
    /// afterwards makes the encoded map independent of scheduling.
    pub fn canonicalize<RW: ReadAt + WriteAt + ?Sized>(&self, rw: &RW) -> Result<()> {
        self.arrays.check_written()?;
        (0..self.arrays.items())
            .into_par_iter()
            .try_for_each(|bucket| -> Result<()> {
                let (start, end) = self.arrays.item_range(bucket);
                if end - start == 0 {
                    return Ok(());
                }
                let mut data = vec![0u8; (end - start) as usize];
                rw.read_at(&mut data, start)?;
                let mut entries = parse_bucket(bucket, &data, self.bucket_bits, self.tag_bits)?;
                if entries.len() < 2 {
                    return Ok(());
                }
                entries.sort_unstable_by(|a, b| {
                    (a.key, a.tag, a.data).cmp(&(b.key, b.tag, b.data))
                });
                let mut sorted = Vec::with_capacity(data.len());
                for entry in &entries {
                    put_uvarint(&mut sorted, self.entry_key(entry.key, entry.tag));
                    put_uvarint(&mut sorted, entry.data.len() as u64);
                    sorted.extend_from_slice(entry.data);
                }
                self.arrays.rewrite_item(rw, bucket, &sorted)
            })
    }
}

/// One stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<'a> {
    pub key: u64,
    pub tag: u64,
    pub data: &'a [u8],
}

/// Payload of one entry of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tagged<'a> {
    pub tag: u64,
    pub data: &'a [u8],
}

/// All entries of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group<'a> {
    pub key: u64,
    pub items: Vec<Tagged<'a>>,
}

fn parse_bucket(bucket: usize, data: &[u8], bucket_bits: u8, tag_bits: u8) -> Result<Vec<Entry>> {
    let mut reader = Reader::new(data);
    let mut entries = Vec::new();
    while !reader.is_empty() {
        entries.push(read_entry(&mut reader, bucket, bucket_bits, tag_bits)?);
    }
    Ok(entries)
}

#[inline]
fn read_entry<'a>(
    reader: &mut Reader<'a>,
    bucket: usize,
    bucket_bits: u8,
    tag_bits: u8,
) -> Result<Entry<'a>> {
    let v = reader.uvarint()?;
    let length = reader.len_prefix()?;
    let data = reader.bytes(length)?;
    Ok(Entry {
        key: bucket as u64 | ((v >> tag_bits) << bucket_bits),
        tag: v & ((1 << tag_bits) - 1),
        data,
    })
}

/// Read view over an encoded map.
#[derive(Debug, Clone, Copy)]
pub struct Uint64Map<'a> {
    bucket_bits: u8,
    tag_bits: u8,
    arrays: ByteArrays<'a>,
}

impl<'a> Uint64Map<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let bucket_bits = reader.u8()?;
        let tag_bits = reader.u8()?;
        if bucket_bits > 32 || tag_bits > 8 {
            return Err(Error::corrupt(format!(
                "map with {} bucket bits and {} tag bits",
                bucket_bits, tag_bits
            )));
        }
        let arrays = ByteArrays::new(reader.remaining())?;
        if arrays.len() != 1 << bucket_bits {
            return Err(Error::corrupt(format!(
                "map with {} buckets for {} bucket bits",
                arrays.len(),
                bucket_bits
            )));
        }
        Ok(Self {
            bucket_bits,
            tag_bits,
            arrays,
        })
    }

    /// Number of bytes the encoded map occupies.
    pub fn byte_len(&self) -> usize {
        2 + self.arrays.byte_len()
    }

    pub fn buckets(&self) -> usize {
        self.arrays.len()
    }

    fn bucket_entries(&self, key: u64) -> Result<(usize, Reader<'a>)> {
        let bucket = (key & ((1 << self.bucket_bits) - 1)) as usize;
        Ok((bucket, Reader::new(self.arrays.item(bucket)?)))
    }

    fn find_first_by(&self, key: u64, tag: Option<u64>) -> Result<Option<&'a [u8]>> {
        let (bucket, mut reader) = self.bucket_entries(key)?;
        while !reader.is_empty() {
            let entry = read_entry(&mut reader, bucket, self.bucket_bits, self.tag_bits)?;
            if entry.key == key && tag.map_or(true, |tag| tag == entry.tag) {
                return Ok(Some(entry.data));
            }
        }
        Ok(None)
    }

    pub fn find_first(&self, key: u64) -> Result<Option<&'a [u8]>> {
        self.find_first_by(key, None)
    }

    pub fn find_first_with_tag(&self, key: u64, tag: u64) -> Result<Option<&'a [u8]>> {
        self.find_first_by(key, Some(tag))
    }

    /// Returns every entry stored for `key`, in stored order.
    pub fn find_all(&self, key: u64) -> Result<Vec<Tagged<'a>>> {
        let (bucket, mut reader) = self.bucket_entries(key)?;
        let mut found = Vec::new();
        while !reader.is_empty() {
            let entry = read_entry(&mut reader, bucket, self.bucket_bits, self.tag_bits)?;
            if entry.key == key {
                found.push(Tagged {
                    tag: entry.tag,
                    data: entry.data,
                });
            }
        }
        Ok(found)
    }

    pub fn contains(&self, key: u64) -> Result<bool> {
        self.find_first(key).map(|found| found.is_some())
    }

    fn bucket_groups(&self, bucket: usize) -> Result<Vec<Group<'a>>> {
        let mut entries = parse_bucket(
            bucket,
            self.arrays.item(bucket)?,
            self.bucket_bits,
            self.tag_bits,
        )?;
        // stable, so entries of a key keep their stored order
        entries.sort_by_key(|e| e.key);
        let mut groups: Vec<Group> = Vec::new();
        for entry in entries {
            let tagged = Tagged {
                tag: entry.tag,
                data: entry.data,
            };
            match groups.last_mut() {
                Some(group) if group.key == entry.key => group.items.push(tagged),
                _ => groups.push(Group {
                    key: entry.key,
                    items: vec![tagged],
                }),
            }
        }
        Ok(groups)
    }

    /// Iterates all keys bucket by bucket, with their entries grouped.
    pub fn iter(&self) -> Uint64MapIter<'a> {
        Uint64MapIter {
            map: *self,
            bucket: 0,
            groups: Vec::new().into_iter(),
        }
    }

    /// Calls `f` for every key from the rayon pool, stopping at the first
    /// error.
    pub fn par_each_group<F>(&self, f: F) -> Result<()>
    where
        F: Fn(Group<'a>) -> Result<()> + Sync + Send,
    {
        (0..self.buckets()).into_par_iter().try_for_each(|bucket| {
            for group in self.bucket_groups(bucket)? {
                f(group)?;
            }
            Ok(())
        })
    }
}

pub struct Uint64MapIter<'a> {
    map: Uint64Map<'a>,
    bucket: usize,
    groups: std::vec::IntoIter<Group<'a>>,
}

impl<'a> Iterator for Uint64MapIter<'a> {
    type Item = Result<Group<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(group) = self.groups.next() {
                return Some(Ok(group));
            }
            if self.bucket >= self.map.buckets() {
                return None;
            }
            match self.map.bucket_groups(self.bucket) {
                Ok(groups) => self.groups = groups.into_iter(),
                Err(e) => {
                    self.bucket = self.map.buckets();
                    return Some(Err(e));
                }
            }
            self.bucket += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::output::{MemoryOutput, Output};

    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn build(bucket_bits: u8, tag_bits: u8, entries: &[(u64, u64, Vec<u8>)]) -> Vec<u8> {
        let output = MemoryOutput::new();
        let w = output.write().unwrap();
        let mut builder = Uint64MapBuilder::new(bucket_bits, tag_bits);
        entries
            .par_iter()
            .for_each(|(key, tag, data)| builder.reserve(*key, *tag, data.len()));
        let end = builder.write_header(&*w, 0).unwrap();
        assert_eq!(end, builder.length());
        entries
            .par_iter()
            .try_for_each(|(key, tag, data)| builder.write_item(&*w, *key, *tag, data))
            .unwrap();
        builder.canonicalize(&*w).unwrap();
        output.to_vec()
    }

    #[test]
    fn test_bucket_bits_for_count() {
        assert_eq!(bucket_bits_for_count(0), 1);
        assert_eq!(bucket_bits_for_count(1), 1);
        assert_eq!(bucket_bits_for_count(2), 1);
        assert_eq!(bucket_bits_for_count(3), 2);
        assert_eq!(bucket_bits_for_count(1024), 10);
        assert_eq!(bucket_bits_for_count(1025), 11);
    }

    #[test]
    fn test_find_with_tags() {
        let data = build(
            2,
            2,
            &[
                (42, 0, b"point".to_vec()),
                (42, 1, b"path 1".to_vec()),
                (42, 1, b"path 2".to_vec()),
                (46, 2, b"other".to_vec()),
                (u64::MAX, 3, b"max".to_vec()),
            ],
        );
        let map = Uint64Map::new(&data).unwrap();
        assert_eq!(map.byte_len(), data.len());
        assert_eq!(map.find_first(42).unwrap(), Some(&b"point"[..]));
        assert_eq!(map.find_first_with_tag(42, 1).unwrap(), Some(&b"path 1"[..]));
        assert_eq!(map.find_first_with_tag(46, 2).unwrap(), Some(&b"other"[..]));
        assert_eq!(map.find_first_with_tag(46, 1).unwrap(), None);
        assert_eq!(map.find_first(u64::MAX).unwrap(), Some(&b"max"[..]));
        assert_eq!(map.find_first(43).unwrap(), None);
        assert_eq!(map.find_all(42).unwrap().len(), 3);
        assert!(!map.contains(2).unwrap());
    }

    #[test]
    fn test_overflowing_tag() {
        let output = MemoryOutput::new();
        let w = output.write().unwrap();
        let mut builder = Uint64MapBuilder::new(4, 1);
        builder.reserve(1, 0, 1);
        builder.write_header(&*w, 0).unwrap();
        assert!(builder.write_item(&*w, 1, 2, b"x").is_err());
    }

    #[test]
    fn test_unwritten_entry() {
        let output = MemoryOutput::new();
        let w = output.write().unwrap();
        let mut builder = Uint64MapBuilder::new(2, 0);
        builder.reserve(1, 0, 3);
        builder.reserve(5, 0, 3);
        builder.write_header(&*w, 0).unwrap();
        builder.write_item(&*w, 1, 0, b"abc").unwrap();
        assert!(matches!(builder.canonicalize(&*w), Err(Error::Reservation(_))));
    }

    #[test]
    fn test_canonical_order_is_independent_of_writes() {
        let mut entries: Vec<_> = (0..200u64).map(|i| (i % 17, i % 3, vec![i as u8])).collect();
        let first = build(2, 2, &entries);
        entries.reverse();
        assert_eq!(first, build(2, 2, &entries));
    }

    #[test]
    fn test_corrupt_maps() {
        assert!(Uint64Map::new(&[]).is_err());
        assert!(Uint64Map::new(&[40, 0]).is_err());
        let mut data = build(3, 0, &[(1, 0, vec![1])]);
        data[0] = 2;
        assert!(Uint64Map::new(&data).is_err());
    }

    proptest! {
        #[test]
        fn iteration_groups_all_entries(
            ref entries in prop::collection::vec((any::<u64>(), 0..4u64, prop::collection::vec(any::<u8>(), 0..8)), 0..100),
            bucket_bits in 1..6u8,
        ) {
            let data = build(bucket_bits, 2, entries);
            let map = Uint64Map::new(&data).unwrap();
            let mut expected: BTreeMap<u64, Vec<(u64, Vec<u8>)>> = BTreeMap::new();
            for (key, tag, data) in entries {
                expected.entry(*key).or_default().push((*tag, data.clone()));
            }
            let mut found: BTreeMap<u64, Vec<(u64, Vec<u8>)>> = BTreeMap::new();
            for group in map.iter() {
                let group = group.unwrap();
                let items = group.items.iter().map(|t| (t.tag, t.data.to_vec())).collect();
                prop_assert!(found.insert(group.key, items).is_none());
            }
            for items in expected.values_mut() {
                items.sort();
            }
            prop_assert_eq!(found, expected);
        }
    }
}
