//! Posting lists of feature ids, one per search token.
//!
//! Ids are stored as varints in blocks of `BLOCK_SIZE` bytes. The first id of
//! a block is absolute, later ones are deltas to their predecessor, and the
//! unused tail of a block is filled with `PADDING`, which can never end a
//! varint. Each `(type, namespace)` starts on a fresh block, recorded in the
//! header, so that `advance` can binary search on block starts.

use crate::error::{Error, Result};
use crate::ids::TypeAndNamespace;
use crate::varint::{put_uvarint, Reader};

pub const BLOCK_SIZE: usize = 64;
pub const PADDING: u8 = 0x80;

/// Position of a posting list entry: ids compare by type and namespace code
/// first, which agrees with the order of `FeatureId`s within one blob.
pub type PostingKey = (TypeAndNamespace, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceIndex {
    pub tn: TypeAndNamespace,
    /// Index of the first block holding ids of `tn`.
    pub block: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostingListHeader {
    pub token: String,
    pub features: usize,
    pub namespaces: Vec<NamespaceIndex>,
}

impl PostingListHeader {
    pub fn marshal(&self, buffer: &mut Vec<u8>) {
        put_uvarint(buffer, self.token.len() as u64);
        buffer.extend_from_slice(self.token.as_bytes());
        put_uvarint(buffer, self.features as u64);
        put_uvarint(buffer, self.namespaces.len() as u64);
        for ns in &self.namespaces {
            put_uvarint(buffer, u64::from(ns.tn.0));
            put_uvarint(buffer, ns.block as u64);
        }
    }

    pub fn unmarshal(r: &mut Reader) -> Result<Self> {
        let token = read_token(r)?.to_string();
        let features = r.uvarint()? as usize;
        let n = r.len_prefix()?;
        let namespaces = (0..n)
            .map(|_| {
                let tn = u16::try_from(r.uvarint()?)
                    .map_err(|_| Error::corrupt("posting list namespace"))?;
                Ok(NamespaceIndex {
                    tn: TypeAndNamespace(tn),
                    block: r.uvarint()? as usize,
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            token,
            features,
            namespaces,
        })
    }
}

fn read_token<'a>(r: &mut Reader<'a>) -> Result<&'a str> {
    let n = r.len_prefix()?;
    std::str::from_utf8(r.bytes(n)?).map_err(|_| Error::corrupt("token is not utf-8"))
}

/// Token of an encoded posting list, without decoding the rest.
pub fn posting_list_token(data: &[u8]) -> Result<&str> {
    read_token(&mut Reader::new(data))
}

pub fn posting_list_token_equals(data: &[u8], token: &str) -> bool {
    let mut r = Reader::new(data);
    match r.len_prefix() {
        Ok(n) if n == token.len() => r.bytes(n).map(|b| b == token.as_bytes()).unwrap_or(false),
        _ => false,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostingList {
    pub header: PostingListHeader,
    pub ids: Vec<u8>,
}

impl PostingList {
    /// Encodes `ids`, which must be sorted ascending and unique.
    pub fn from_sorted<I>(token: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = PostingKey>,
    {
        let mut encoder = PostingListEncoder::new(token);
        for (tn, value) in ids {
            encoder.append(tn, value);
        }
        encoder.finish()
    }

    pub fn marshal(&self, buffer: &mut Vec<u8>) {
        self.header.marshal(buffer);
        buffer.extend_from_slice(&self.ids);
    }
}

fn pad_block(ids: &mut Vec<u8>) {
    let rest = ids.len() % BLOCK_SIZE;
    if rest != 0 {
        ids.resize(ids.len() + BLOCK_SIZE - rest, PADDING);
    }
}

#[derive(Debug)]
pub struct PostingListEncoder {
    list: PostingList,
    tn: Option<TypeAndNamespace>,
    start: usize,
    previous: u64,
}

impl PostingListEncoder {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            list: PostingList {
                header: PostingListHeader {
                    token: token.into(),
                    ..Default::default()
                },
                ids: Vec::new(),
            },
            tn: None,
            start: 0,
            previous: 0,
        }
    }

    pub fn append(&mut self, tn: TypeAndNamespace, value: u64) {
        let ids = &mut self.list.ids;
        if self.tn != Some(tn) {
            debug_assert!(self.tn.map_or(true, |last| last < tn), "namespaces out of order");
            self.tn = Some(tn);
            pad_block(ids);
            self.list.header.namespaces.push(NamespaceIndex {
                tn,
                block: ids.len() / BLOCK_SIZE,
            });
        } else {
            debug_assert!(self.previous < value, "ids out of order");
        }
        if ids.len() % BLOCK_SIZE == 0 {
            self.start = ids.len();
            self.previous = 0;
        }
        let mut varint = Vec::with_capacity(crate::varint::MAX_VARINT_LEN);
        put_uvarint(&mut varint, value - self.previous);
        if ids.len() - self.start + varint.len() > BLOCK_SIZE {
            pad_block(ids);
            self.start = ids.len();
            varint.clear();
            put_uvarint(&mut varint, value);
        }
        ids.extend_from_slice(&varint);
        self.previous = value;
        self.list.header.features += 1;
    }

    pub fn finish(self) -> PostingList {
        self.list
    }
}

/// Cursor over an encoded posting list.
#[derive(Debug, Clone)]
pub struct PostingIterator<'a> {
    header: PostingListHeader,
    ids: &'a [u8],
    ns: usize,
    // next byte to read
    pos: usize,
    value: u64,
    current: Option<PostingKey>,
}

impl<'a> PostingIterator<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let header = PostingListHeader::unmarshal(&mut r)?;
        let ids = r.remaining();
        let blocks = (ids.len() + BLOCK_SIZE - 1) / BLOCK_SIZE;
        if header.namespaces.is_empty() != ids.is_empty()
            || header.namespaces.windows(2).any(|w| w[0].block >= w[1].block)
            || header.namespaces.iter().any(|ns| ns.block >= blocks)
        {
            return Err(Error::corrupt(format!(
                "posting list {:?} has bad namespace blocks",
                header.token
            )));
        }
        Ok(Self {
            header,
            ids,
            ns: 0,
            pos: 0,
            value: 0,
            current: None,
        })
    }

    pub fn header(&self) -> &PostingListHeader {
        &self.header
    }

    pub fn token(&self) -> &str {
        &self.header.token
    }

    /// Number of ids in the list.
    pub fn features(&self) -> usize {
        self.header.features
    }

    /// Id the cursor is on, `None` before the first call to `next`.
    pub fn current(&self) -> Option<PostingKey> {
        self.current
    }

    fn block_end(&self, block: usize) -> usize {
        let start = block * BLOCK_SIZE;
        let mut end = (start + BLOCK_SIZE).min(self.ids.len());
        while end > start && self.ids[end - 1] == PADDING {
            end -= 1;
        }
        end
    }

    fn block_start_value(&self, block: usize) -> u64 {
        let mut data = &self.ids[block * BLOCK_SIZE..];
        prost::encoding::decode_varint(&mut data).unwrap_or(u64::MAX)
    }

    fn read(&mut self) -> Option<PostingKey> {
        if self.pos >= self.ids.len() {
            return None;
        }
        let block = self.pos / BLOCK_SIZE;
        if self.pos == self.block_end(block) {
            self.pos = (block + 1) * BLOCK_SIZE;
            if self.pos >= self.ids.len() {
                return None;
            }
        }
        while self.ns + 1 < self.header.namespaces.len()
            && self.pos / BLOCK_SIZE >= self.header.namespaces[self.ns + 1].block
        {
            self.ns += 1;
        }
        let mut data = &self.ids[self.pos..];
        let before = data.len();
        let v = prost::encoding::decode_varint(&mut data).ok()?;
        if self.pos % BLOCK_SIZE == 0 {
            self.value = v;
        } else {
            self.value += v;
        }
        self.pos += before - data.len();
        self.current = Some((self.header.namespaces[self.ns].tn, self.value));
        self.current
    }

    /// Moves to the first id not less than `target`.
    ///
    /// Stays put if the current id already qualifies. Returns false, without
    /// moving, when no such id exists.
    pub fn advance(&mut self, target: PostingKey) -> bool {
        let current = match self.current {
            Some(current) => current,
            None => match self.read() {
                Some(current) => current,
                None => return false,
            },
        };
        if current >= target {
            return true;
        }

        let (tn, value) = target;
        let saved = (self.ns, self.pos, self.value, self.current);
        let namespaces = &self.header.namespaces;
        let ns = match (self.ns..namespaces.len()).find(|&ns| namespaces[ns].tn >= tn) {
            Some(ns) => ns,
            None => return false,
        };

        let block = if namespaces[ns].tn > tn {
            // every id of a later namespace is past the target
            namespaces[ns].block
        } else {
            let start = if ns == self.ns {
                self.pos / BLOCK_SIZE
            } else {
                namespaces[ns].block
            };
            let end = match namespaces.get(ns + 1) {
                Some(next) => next.block,
                None => (self.ids.len() + BLOCK_SIZE - 1) / BLOCK_SIZE,
            };
            // first block starting at or after the target
            let (mut lo, mut hi) = (start, end.max(start));
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                if self.block_start_value(mid) < value {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            // the target may sit in the tail of the block before
            if lo > start {
                lo - 1
            } else {
                lo
            }
        };

        self.ns = ns;
        self.pos = block * BLOCK_SIZE;
        while let Some(key) = self.read() {
            if key >= target {
                return true;
            }
        }
        (self.ns, self.pos, self.value, self.current) = saved;
        false
    }
}

impl<'a> Iterator for PostingIterator<'a> {
    type Item = PostingKey;

    fn next(&mut self) -> Option<PostingKey> {
        self.read()
    }
}
