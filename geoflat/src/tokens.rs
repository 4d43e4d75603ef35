//! Search tokens: how features are tokenized, and the hash map from token to
//! posting list.

use crate::arrays::{ByteArrays, ByteArraysBuilder};
use crate::error::Result;
use crate::ids::{FeatureId, FeatureType};
use crate::output::WriteAt;
use crate::tiles::{covering, Bounds};
use crate::varint::{put_uvarint, Reader};

use xxhash_rust::xxh64::xxh64;

use std::collections::BTreeSet;

/// Token shared by every indexed feature.
pub const ALL_TOKEN: &str = "*";

pub const MAX_LOAD_FACTOR: f64 = 0.6;

#[inline]
pub fn hash_token(token: &str) -> u64 {
    xxh64(token.as_bytes(), 0)
}

/// What a tokenizer gets to see of a feature.
#[derive(Debug, Clone)]
pub struct TokenFeature<'a> {
    pub id: &'a FeatureId,
    /// User tags, without the reserved geometry keys.
    pub tags: Vec<(&'a str, &'a str)>,
    pub bounds: Option<Bounds>,
}

/// Turns features into the search tokens they are indexed under.
pub trait Tokenizer: Send + Sync {
    fn tokens(&self, feature: &TokenFeature) -> Vec<String>;
}

/// Tokenizes by tile covering and by prefixed tag keys.
///
/// Tags keyed `#key` yield `key=value`, tags keyed `@key` yield `key`.
/// Points without tags are not indexed at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTokenizer;

impl Tokenizer for DefaultTokenizer {
    fn tokens(&self, feature: &TokenFeature) -> Vec<String> {
        if feature.id.feature_type == FeatureType::Point && feature.tags.is_empty() {
            return Vec::new();
        }
        let mut tokens = BTreeSet::new();
        tokens.insert(ALL_TOKEN.to_string());
        if let Some(bounds) = &feature.bounds {
            for tile in covering(bounds) {
                tokens.insert(tile.token());
                tokens.extend(tile.ancestors().map(|t| t.ancestor_token()));
            }
        }
        for (key, value) in &feature.tags {
            if let Some(key) = key.strip_prefix('#') {
                tokens.insert(format!("{}={}", key, value));
            } else if let Some(key) = key.strip_prefix('@') {
                tokens.insert(key.to_string());
            }
        }
        tokens.into_iter().collect()
    }
}

/// Builds a `TokenMap` from tokens and their posting list index.
#[derive(Debug)]
pub struct TokenMapBuilder {
    buckets: Vec<Vec<(String, usize)>>,
    n: usize,
    arrays: Option<ByteArraysBuilder>,
}

impl Default for TokenMapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenMapBuilder {
    pub fn new() -> Self {
        Self {
            buckets: vec![Vec::new()],
            n: 0,
            arrays: None,
        }
    }

    pub fn add(&mut self, token: impl Into<String>, index: usize) {
        if (self.n + 1) as f64 / self.buckets.len() as f64 > MAX_LOAD_FACTOR {
            let buckets = self.buckets.len() * 2;
            let previous = std::mem::replace(&mut self.buckets, vec![Vec::new(); buckets]);
            for (token, index) in previous.into_iter().flatten() {
                self.insert(token, index);
            }
        }
        self.insert(token.into(), index);
        self.n += 1;
    }

    fn insert(&mut self, token: String, index: usize) {
        let bucket = (hash_token(&token) % self.buckets.len() as u64) as usize;
        self.buckets[bucket].push((token, index));
    }

    pub fn buckets(&self) -> usize {
        self.buckets.len()
    }

    fn encoded_bucket(bucket: &[(String, usize)]) -> Vec<u8> {
        let mut buffer = Vec::new();
        for (_, index) in bucket {
            put_uvarint(&mut buffer, *index as u64);
        }
        buffer
    }

    fn reserve(buckets: &[Vec<(String, usize)>]) -> ByteArraysBuilder {
        let arrays = ByteArraysBuilder::new(buckets.len());
        for (i, bucket) in buckets.iter().enumerate() {
            arrays.reserve(i, Self::encoded_bucket(bucket).len());
        }
        arrays
    }

    /// Writes the map at `offset`, returning the offset after it.
    pub fn write<W: WriteAt + ?Sized>(&mut self, w: &W, offset: u64) -> Result<u64> {
        let buckets = &self.buckets;
        let arrays = self.arrays.get_or_insert_with(|| Self::reserve(buckets));
        let end = arrays.write_header(w, offset)?;
        for (i, bucket) in buckets.iter().enumerate() {
            arrays.write_item(w, i, &[&Self::encoded_bucket(bucket)])?;
        }
        arrays.check_written()?;
        Ok(end)
    }

    /// Encoded length; only valid after `write`.
    pub fn length(&self) -> u64 {
        self.arrays.as_ref().map_or(0, ByteArraysBuilder::length)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenMap<'a> {
    arrays: ByteArrays<'a>,
}

impl<'a> TokenMap<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        Ok(Self {
            arrays: ByteArrays::new(data)?,
        })
    }

    pub fn byte_len(&self) -> usize {
        self.arrays.byte_len()
    }

    /// Posting list indices that may hold `token`. Callers check the token
    /// stored with each candidate.
    pub fn find_possible_indices(&self, token: &str) -> Result<TokenMapIter<'a>> {
        if self.arrays.is_empty() {
            return Ok(TokenMapIter {
                r: Reader::new(&[]),
            });
        }
        let bucket = hash_token(token) % self.arrays.len() as u64;
        Ok(TokenMapIter {
            r: Reader::new(self.arrays.item(bucket as usize)?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TokenMapIter<'a> {
    r: Reader<'a>,
}

impl<'a> Iterator for TokenMapIter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.r.is_empty() {
            return None;
        }
        self.r.uvarint().ok().map(|i| i as usize)
    }
}
