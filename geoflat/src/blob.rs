//! Top level layout of a blob: header, namespaces, strings and blocks.

use crate::error::{Error, Result};
use crate::ids::{FeatureType, NamespaceTable, Namespaces};
use crate::output::WriteAt;
use crate::varint::{put_uvarint, Reader};

use byteorder::{ByteOrder, LittleEndian};
use prost::Message;

pub const MAGIC: u64 = 0xd05f_ffce_9126_772e;
pub const VERSION: &str = "4.0.0";

pub const HEADER_LEN: usize = 40;
pub const BLOCK_HEADER_LEN: usize = 16;
pub const FEATURE_BLOCK_HEADER_LEN: usize = 9;

/// Serialized with prost right after the version string.
#[derive(Clone, PartialEq, Message)]
pub struct CompactHeaderProto {
    #[prost(string, repeated, tag = "1")]
    pub namespaces: Vec<String>,
}

impl CompactHeaderProto {
    pub fn from_table(table: &NamespaceTable) -> Self {
        Self {
            namespaces: table.to_strings(),
        }
    }

    pub fn to_table(&self) -> Result<NamespaceTable> {
        NamespaceTable::from_strings(self.namespaces.clone())
            .ok_or_else(|| Error::corrupt("namespace table is not sorted"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub magic: u64,
    pub version_offset: u64,
    pub header_proto_offset: u64,
    pub strings_offset: u64,
    pub block_offset: u64,
}

impl Header {
    pub fn marshal(&self) -> [u8; HEADER_LEN] {
        let mut buffer = [0; HEADER_LEN];
        LittleEndian::write_u64_into(
            &[
                self.magic,
                self.version_offset,
                self.header_proto_offset,
                self.strings_offset,
                self.block_offset,
            ],
            &mut buffer,
        );
        buffer
    }

    /// Reads and checks the header, refusing foreign or incompatible blobs.
    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        if data.len() < HEADER_LEN {
            return Err(Error::Truncated("blob header"));
        }
        let header = Self {
            magic: r.u64()?,
            version_offset: r.u64()?,
            header_proto_offset: r.u64()?,
            strings_offset: r.u64()?,
            block_offset: r.u64()?,
        };
        if header.magic != MAGIC {
            return Err(Error::BadMagic {
                found: header.magic,
                expected: MAGIC,
            });
        }
        let offsets = [
            header.version_offset,
            header.header_proto_offset,
            header.strings_offset,
            header.block_offset,
        ];
        if offsets.windows(2).any(|w| w[0] > w[1])
            || header.version_offset < HEADER_LEN as u64
            || header.block_offset > data.len() as u64
        {
            return Err(Error::Truncated("blob sections"));
        }
        let version = read_string(&data[header.version_offset as usize..])?;
        if major(version) != major(VERSION) {
            return Err(Error::VersionMismatch {
                found: version.to_string(),
                expected: VERSION,
            });
        }
        Ok(header)
    }

    pub fn namespaces(&self, data: &[u8]) -> Result<NamespaceTable> {
        let mut r = Reader::new(&data[self.header_proto_offset as usize..]);
        let n = r.len_prefix()?;
        CompactHeaderProto::decode(r.bytes(n)?)?.to_table()
    }
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

fn read_string(data: &[u8]) -> Result<&str> {
    let mut r = Reader::new(data);
    let n = r.len_prefix()?;
    std::str::from_utf8(r.bytes(n)?).map_err(|_| Error::corrupt("version is not utf-8"))
}

/// Writes `s` as a length prefixed string, returning the offset after it.
pub fn write_string<W: WriteAt + ?Sized>(w: &W, s: &str, offset: u64) -> Result<u64> {
    let mut buffer = Vec::with_capacity(s.len() + 2);
    put_uvarint(&mut buffer, s.len() as u64);
    buffer.extend_from_slice(s.as_bytes());
    w.write_at(&buffer, offset)?;
    Ok(offset + buffer.len() as u64)
}

/// Writes a length prefixed message, returning the offset after it.
pub fn write_proto<W: WriteAt + ?Sized, M: Message>(w: &W, m: &M, offset: u64) -> Result<u64> {
    let buffer = m.encode_length_delimited_to_vec();
    w.write_at(&buffer, offset)?;
    Ok(offset + buffer.len() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Features = 0,
    SearchIndex = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub length: u64,
    pub block_type: BlockType,
}

impl BlockHeader {
    pub fn marshal(&self) -> [u8; BLOCK_HEADER_LEN] {
        let mut buffer = [0; BLOCK_HEADER_LEN];
        LittleEndian::write_u64(&mut buffer[0..8], self.length);
        LittleEndian::write_u64(&mut buffer[8..16], self.block_type as u64);
        buffer
    }

    pub fn unmarshal(r: &mut Reader) -> Result<Self> {
        let length = r.u64()?;
        let block_type = match r.u64()? {
            0 => BlockType::Features,
            1 => BlockType::SearchIndex,
            t => return Err(Error::corrupt(format!("unknown block type {}", t))),
        };
        Ok(Self { length, block_type })
    }
}

/// Type of the features in a block, and the primary namespaces their
/// references are coded against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureBlockHeader {
    pub feature_type: FeatureType,
    pub namespaces: Namespaces,
}

impl FeatureBlockHeader {
    /// Namespace of the features in the block.
    pub fn namespace(&self) -> u16 {
        self.namespaces.code(self.feature_type)
    }

    pub fn marshal(&self) -> [u8; FEATURE_BLOCK_HEADER_LEN] {
        let mut buffer = [0; FEATURE_BLOCK_HEADER_LEN];
        buffer[0] = self.feature_type as u8;
        LittleEndian::write_u16_into(&self.namespaces.0, &mut buffer[1..]);
        buffer
    }

    pub fn unmarshal(r: &mut Reader) -> Result<Self> {
        let feature_type = match FeatureType::from_u8(r.u8()?) {
            FeatureType::Invalid => return Err(Error::corrupt("feature block of invalid type")),
            t => t,
        };
        let mut namespaces = [0; 4];
        for ns in namespaces.iter_mut() {
            *ns = r.u16()?;
        }
        Ok(Self {
            feature_type,
            namespaces: Namespaces(namespaces),
        })
    }
}

/// Location of one block's payload within the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub block_type: BlockType,
    pub start: usize,
    pub end: usize,
}

/// Lists the blocks following `block_offset`.
pub fn blocks(data: &[u8], block_offset: u64) -> Result<Vec<Block>> {
    let mut blocks = Vec::new();
    let mut offset = block_offset as usize;
    while offset < data.len() {
        let mut r = Reader::new(&data[offset..]);
        let header = BlockHeader::unmarshal(&mut r)?;
        let start = offset + BLOCK_HEADER_LEN;
        let end = (start as u64)
            .checked_add(header.length)
            .filter(|&end| end <= data.len() as u64)
            .ok_or(Error::Truncated("block"))? as usize;
        blocks.push(Block {
            block_type: header.block_type,
            start,
            end,
        });
        offset = end;
    }
    Ok(blocks)
}
