use crate::arrays::{ByteArrays, ByteArraysBuilder};
use crate::error::{Error, Result};
use crate::output::WriteAt;

use ahash::AHashMap;
use parking_lot::Mutex;

/// Collects strings with their frequency during the summary pass.
///
/// Strings are numbered by decreasing frequency when the table is written, so
/// the most common keys and values get the shortest varint indices.
#[derive(Debug, Default)]
pub struct StringTableBuilder {
    counts: Mutex<AHashMap<String, u64>>,
}

impl StringTableBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add(&self, s: &str) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(s) {
            *count += 1;
        } else {
            counts.insert(s.to_string(), 1);
        }
    }

    /// Adds all strings counted by `other`.
    pub fn merge(&self, other: AHashMap<String, u64>) {
        let mut counts = self.counts.lock();
        for (s, n) in other {
            *counts.entry(s).or_insert(0) += n;
        }
    }

    pub fn len(&self) -> usize {
        self.counts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Assigns final indices and writes the table at `offset`.
    ///
    /// Returns the index lookup and the offset after the table.
    pub fn write<W: WriteAt + ?Sized>(self, w: &W, offset: u64) -> Result<(StringIndex, u64)> {
        let mut counted: Vec<(String, u64)> = self.counts.into_inner().into_iter().collect();
        // ties are broken by the string itself to keep builds reproducible
        counted.sort_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut arrays = ByteArraysBuilder::new(counted.len());
        for (i, (s, _)) in counted.iter().enumerate() {
            arrays.reserve(i, s.len());
        }
        let end = arrays.write_header(w, offset)?;
        for (i, (s, _)) in counted.iter().enumerate() {
            arrays.write_item(w, i, &[s.as_bytes()])?;
        }
        arrays.check_written()?;

        let indices = counted
            .into_iter()
            .enumerate()
            .map(|(i, (s, _))| (s, i as u64))
            .collect();
        Ok((StringIndex { indices }, end))
    }
}

/// Maps strings to their index in a written string table.
#[derive(Debug, Default, Clone)]
pub struct StringIndex {
    indices: AHashMap<String, u64>,
}

impl StringIndex {
    /// Returns the index of `s`.
    ///
    /// Panics if `s` was never added to the builder, which means the summary
    /// pass missed a string the encoder needs.
    pub fn lookup(&self, s: &str) -> u64 {
        match self.indices.get(s) {
            Some(&i) => i,
            None => panic!("string {:?} missing from string table", s),
        }
    }

    pub fn get(&self, s: &str) -> Option<u64> {
        self.indices.get(s).copied()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// String table of a blob, read directly from its bytes.
#[derive(Debug, Clone, Copy)]
pub struct StringTable<'a> {
    arrays: ByteArrays<'a>,
}

impl<'a> StringTable<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        Ok(Self {
            arrays: ByteArrays::new(data)?,
        })
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    pub fn lookup_bytes(&self, i: u64) -> Result<&'a [u8]> {
        self.arrays.item(i as usize)
    }

    pub fn lookup(&self, i: u64) -> Result<&'a str> {
        std::str::from_utf8(self.lookup_bytes(i)?)
            .map_err(|_| Error::corrupt(format!("string {} is not utf-8", i)))
    }

    /// Compares string `i` with `other` without decoding it.
    pub fn equal(&self, i: u64, other: &str) -> bool {
        self.lookup_bytes(i)
            .map(|s| s == other.as_bytes())
            .unwrap_or(false)
    }

    /// Returns the index of `s` by linear scan, for the rare lookups by key
    /// that don't come with an index.
    pub fn find(&self, s: &str) -> Option<u64> {
        (0..self.len() as u64).find(|&i| self.equal(i, s))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::output::{MemoryOutput, Output};

    use proptest::prelude::*;
    use std::collections::HashMap;

    fn write(builder: StringTableBuilder) -> (StringIndex, Vec<u8>) {
        let output = MemoryOutput::new();
        let w = output.write().unwrap();
        let (index, end) = builder.write(&*w, 0).unwrap();
        let data = output.to_vec();
        assert_eq!(end, data.len() as u64);
        (index, data)
    }

    #[test]
    fn test_frequent_strings_first() {
        let builder = StringTableBuilder::new();
        for s in ["b", "highway", "a", "highway", "building", "highway", "building"] {
            builder.add(s);
        }
        let (index, data) = write(builder);
        let table = StringTable::new(&data).unwrap();
        assert_eq!(index.lookup("highway"), 0);
        assert_eq!(index.lookup("building"), 1);
        assert_eq!(index.lookup("a"), 2);
        assert_eq!(index.lookup("b"), 3);
        assert_eq!(table.lookup(0).unwrap(), "highway");
        assert_eq!(table.lookup(3).unwrap(), "b");
        assert!(table.equal(1, "building"));
        assert!(!table.equal(1, "buildings"));
        assert!(!table.equal(17, "building"));
        assert_eq!(table.find("a"), Some(2));
        assert_eq!(index.get("missing"), None);
    }

    #[test]
    #[should_panic]
    fn test_lookup_missing_string() {
        let builder = StringTableBuilder::new();
        builder.add("present");
        let (index, _) = write(builder);
        index.lookup("absent");
    }

    proptest! {
        #[test]
        fn sequence_of_add(ref seq in prop::collection::vec("[a-z]{0,3}", 1..100)) {
            let builder = StringTableBuilder::new();
            let mut reference: HashMap<&str, usize> = HashMap::new();
            for s in seq {
                builder.add(s);
                *reference.entry(s.as_str()).or_insert(0) += 1;
            }
            let (index, data) = write(builder);
            let table = StringTable::new(&data).unwrap();
            prop_assert_eq!(table.len(), reference.len());
            for (s, _) in reference.iter() {
                prop_assert_eq!(table.lookup(index.lookup(s)).unwrap(), *s);
            }
            for i in 1..table.len() as u64 {
                let previous = reference[table.lookup(i - 1).unwrap()];
                prop_assert!(previous >= reference[table.lookup(i).unwrap()]);
            }
        }
    }
}
