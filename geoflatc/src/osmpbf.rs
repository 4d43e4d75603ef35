//! Messages of the OSM PBF format and an index of the blocks of a PBF file.

use byteorder::{ByteOrder, NetworkEndian};
use flate2::read::ZlibDecoder;
use log::{info, warn};
use prost::Message;
use rayon::prelude::*;

use std::io::{self, Read};

#[derive(Clone, PartialEq, Message)]
pub struct BlobHeader {
    #[prost(string, required, tag = "1")]
    pub r#type: String,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub indexdata: Option<Vec<u8>>,
    #[prost(int32, required, tag = "3")]
    pub datasize: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct Blob {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub raw: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "2")]
    pub raw_size: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub zlib_data: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct HeaderBBox {
    #[prost(sint64, required, tag = "1")]
    pub left: i64,
    #[prost(sint64, required, tag = "2")]
    pub right: i64,
    #[prost(sint64, required, tag = "3")]
    pub top: i64,
    #[prost(sint64, required, tag = "4")]
    pub bottom: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct HeaderBlock {
    #[prost(message, optional, tag = "1")]
    pub bbox: Option<HeaderBBox>,
    #[prost(string, repeated, tag = "4")]
    pub required_features: Vec<String>,
    #[prost(string, repeated, tag = "5")]
    pub optional_features: Vec<String>,
    #[prost(string, optional, tag = "16")]
    pub writingprogram: Option<String>,
    #[prost(string, optional, tag = "17")]
    pub source: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StringTable {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub s: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PrimitiveBlock {
    #[prost(message, required, tag = "1")]
    pub stringtable: StringTable,
    #[prost(message, repeated, tag = "2")]
    pub primitivegroup: Vec<PrimitiveGroup>,
    /// Nanodegrees per coordinate unit.
    #[prost(int32, optional, tag = "17", default = "100")]
    pub granularity: Option<i32>,
    #[prost(int64, optional, tag = "19", default = "0")]
    pub lat_offset: Option<i64>,
    #[prost(int64, optional, tag = "20", default = "0")]
    pub lon_offset: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PrimitiveGroup {
    #[prost(message, repeated, tag = "1")]
    pub nodes: Vec<Node>,
    #[prost(message, optional, tag = "2")]
    pub dense: Option<DenseNodes>,
    #[prost(message, repeated, tag = "3")]
    pub ways: Vec<Way>,
    #[prost(message, repeated, tag = "4")]
    pub relations: Vec<Relation>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Node {
    #[prost(sint64, required, tag = "1")]
    pub id: i64,
    #[prost(uint32, repeated, packed = "true", tag = "2")]
    pub keys: Vec<u32>,
    #[prost(uint32, repeated, packed = "true", tag = "3")]
    pub vals: Vec<u32>,
    #[prost(sint64, required, tag = "8")]
    pub lat: i64,
    #[prost(sint64, required, tag = "9")]
    pub lon: i64,
}

/// Nodes with delta coded ids and coordinates, and the tags of all nodes
/// in one array, each node's tags terminated by a 0.
#[derive(Clone, PartialEq, Message)]
pub struct DenseNodes {
    #[prost(sint64, repeated, packed = "true", tag = "1")]
    pub id: Vec<i64>,
    #[prost(sint64, repeated, packed = "true", tag = "8")]
    pub lat: Vec<i64>,
    #[prost(sint64, repeated, packed = "true", tag = "9")]
    pub lon: Vec<i64>,
    #[prost(int32, repeated, packed = "true", tag = "10")]
    pub keys_vals: Vec<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Way {
    #[prost(int64, required, tag = "1")]
    pub id: i64,
    #[prost(uint32, repeated, packed = "true", tag = "2")]
    pub keys: Vec<u32>,
    #[prost(uint32, repeated, packed = "true", tag = "3")]
    pub vals: Vec<u32>,
    /// Delta coded node ids.
    #[prost(sint64, repeated, packed = "true", tag = "8")]
    pub refs: Vec<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Relation {
    #[prost(int64, required, tag = "1")]
    pub id: i64,
    #[prost(uint32, repeated, packed = "true", tag = "2")]
    pub keys: Vec<u32>,
    #[prost(uint32, repeated, packed = "true", tag = "3")]
    pub vals: Vec<u32>,
    #[prost(int32, repeated, packed = "true", tag = "8")]
    pub roles_sid: Vec<i32>,
    /// Delta coded member ids.
    #[prost(sint64, repeated, packed = "true", tag = "9")]
    pub memids: Vec<i64>,
    #[prost(enumeration = "relation::MemberType", repeated, packed = "true", tag = "10")]
    pub types: Vec<i32>,
}

pub mod relation {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum MemberType {
        Node = 0,
        Way = 1,
        Relation = 2,
    }
}

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockType {
    Header,
    Nodes,
    DenseNodes,
    Ways,
    Relations,
}

impl BlockType {
    /// Decodes the block type from a PrimitiveBlock without decoding the
    /// block: all groups of a block hold elements of one kind, so the tag of
    /// the first field of the first group decides.
    ///
    /// `blob` is the decompressed data of an OSMData blob.
    pub fn from_osmdata_blob(mut blob: &[u8]) -> io::Result<BlockType> {
        const PRIMITIVE_GROUP_TAG: u32 = 2;
        const NODES_TAG: u32 = 1;
        const DENSE_NODES_TAG: u32 = 2;
        const WAYS_TAG: u32 = 3;
        const RELATIONS_TAG: u32 = 4;
        const CHANGESETS_TAG: u32 = 5;

        while !blob.is_empty() {
            let (key, wire_type) = prost::encoding::decode_key(&mut blob)?;
            if key != PRIMITIVE_GROUP_TAG {
                prost::encoding::skip_field(
                    wire_type,
                    key,
                    &mut blob,
                    prost::encoding::DecodeContext::default(),
                )?;
                continue;
            }

            // length of the group
            let _ = prost::encoding::decode_varint(&mut blob)?;
            let (tag, _wire_type) = prost::encoding::decode_key(&mut blob)?;
            return match tag {
                NODES_TAG => Ok(BlockType::Nodes),
                DENSE_NODES_TAG => Ok(BlockType::DenseNodes),
                WAYS_TAG => Ok(BlockType::Ways),
                RELATIONS_TAG => Ok(BlockType::Relations),
                CHANGESETS_TAG => Err(invalid_data("changesets are not supported")),
                _ => Err(invalid_data("malformed primitive block")),
            };
        }
        Err(invalid_data("primitive block without groups"))
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct BlockIndex {
    pub block_type: BlockType,
    pub blob_start: usize,
    pub blob_len: usize,
}

struct BlockIndexIterator<'a> {
    data: &'a [u8],
    cursor: usize,
}

enum BlobInfo<'a> {
    Header(BlockIndex),
    Data(usize, &'a [u8]),
    Skipped(String),
}

impl<'a> BlockIndexIterator<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, cursor: 0 }
    }

    fn read(&mut self, len: usize) -> io::Result<&'a [u8]> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| invalid_data("truncated pbf file"))?;
        let data = &self.data[self.cursor..end];
        self.cursor = end;
        Ok(data)
    }

    fn next_blob(&mut self) -> io::Result<BlobInfo<'a>> {
        let blob_header_len = NetworkEndian::read_u32(self.read(4)?) as usize;
        let blob_header = BlobHeader::decode(self.read(blob_header_len)?)?;

        let blob_start = self.cursor;
        let blob_len = usize::try_from(blob_header.datasize)
            .map_err(|_| invalid_data("negative blob size"))?;
        let blob = self.read(blob_len)?;

        match blob_header.r#type.as_str() {
            "OSMHeader" => Ok(BlobInfo::Header(BlockIndex {
                block_type: BlockType::Header,
                blob_start,
                blob_len,
            })),
            "OSMData" => Ok(BlobInfo::Data(blob_start, blob)),
            other => Ok(BlobInfo::Skipped(other.to_string())),
        }
    }
}

impl<'a> Iterator for BlockIndexIterator<'a> {
    type Item = io::Result<BlobInfo<'a>>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor < self.data.len() {
            let blob = self.next_blob();
            if blob.is_err() {
                // nothing after a broken blob can be found
                self.cursor = self.data.len();
            }
            Some(blob)
        } else {
            None
        }
    }
}

/// Decompressed contents of `blob`.
fn blob_data(blob: &Blob) -> io::Result<Vec<u8>> {
    let data = if let Some(raw) = &blob.raw {
        raw.clone()
    } else if let Some(zlib_data) = &blob.zlib_data {
        let mut data = Vec::with_capacity(blob.raw_size.unwrap_or(0).max(0) as usize);
        ZlibDecoder::new(&zlib_data[..]).read_to_end(&mut data)?;
        data
    } else {
        return Err(invalid_data("unsupported blob compression"));
    };
    if let Some(raw_size) = blob.raw_size {
        if data.len() != raw_size as usize {
            return Err(invalid_data(format!(
                "blob of {} bytes, expected {}",
                data.len(),
                raw_size
            )));
        }
    }
    Ok(data)
}

pub fn read_block<T: Message + Default>(data: &[u8], idx: &BlockIndex) -> io::Result<T> {
    let blob = Blob::decode(&data[idx.blob_start..idx.blob_start + idx.blob_len])?;
    Ok(T::decode(blob_data(&blob)?.as_slice())?)
}

fn data_block_index(blob_start: usize, blob: &[u8]) -> io::Result<BlockIndex> {
    let data = blob_data(&Blob::decode(blob)?)?;
    Ok(BlockIndex {
        block_type: BlockType::from_osmdata_blob(&data)?,
        blob_start,
        blob_len: blob.len(),
    })
}

/// Lists the blocks of `pbf_data`, ordered by type and position.
pub fn build_block_index(pbf_data: &[u8]) -> io::Result<Vec<BlockIndex>> {
    let mut result = BlockIndexIterator::new(pbf_data)
        .par_bridge()
        .filter_map(|blob| match blob {
            Ok(BlobInfo::Header(b)) => Some(Ok(b)),
            Ok(BlobInfo::Data(start, blob)) => Some(data_block_index(start, blob)),
            Ok(BlobInfo::Skipped(blob_type)) => {
                warn!("Skipping blob of unknown type {}", blob_type);
                None
            }
            Err(e) => Some(Err(e)),
        })
        .collect::<io::Result<Vec<_>>>()?;
    result.par_sort_unstable();
    info!("Found {} blocks", result.len());
    Ok(result)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    use flate2::{write::ZlibEncoder, Compression};

    use std::io::Write;

    /// A PBF blob of `message`, zlib compressed.
    pub(crate) fn blob<M: Message>(blob_type: &str, message: &M) -> Vec<u8> {
        let raw = message.encode_to_vec();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        let blob = Blob {
            raw: None,
            raw_size: Some(raw.len() as i32),
            zlib_data: Some(encoder.finish().unwrap()),
        }
        .encode_to_vec();
        let header = BlobHeader {
            r#type: blob_type.to_string(),
            indexdata: None,
            datasize: blob.len() as i32,
        }
        .encode_to_vec();

        let mut data = (header.len() as u32).to_be_bytes().to_vec();
        data.extend(header);
        data.extend(blob);
        data
    }

    pub(crate) fn header() -> HeaderBlock {
        HeaderBlock {
            bbox: None,
            required_features: vec!["OsmSchema-V0.6".into(), "DenseNodes".into()],
            optional_features: vec![],
            writingprogram: Some("test".into()),
            source: None,
        }
    }

    pub(crate) fn primitive_block(strings: &[&str], group: PrimitiveGroup) -> PrimitiveBlock {
        PrimitiveBlock {
            stringtable: StringTable {
                s: strings.iter().map(|s| s.as_bytes().to_vec()).collect(),
            },
            primitivegroup: vec![group],
            granularity: None,
            lat_offset: None,
            lon_offset: None,
        }
    }

    fn ways_block() -> PrimitiveBlock {
        primitive_block(
            &[""],
            PrimitiveGroup {
                ways: vec![Way {
                    id: 1,
                    keys: vec![],
                    vals: vec![],
                    refs: vec![1, 1],
                }],
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_block_type() {
        let data = ways_block().encode_to_vec();
        assert_eq!(BlockType::from_osmdata_blob(&data).unwrap(), BlockType::Ways);

        let empty = primitive_block(&[""], PrimitiveGroup::default());
        let mut empty = empty.encode_to_vec();
        assert!(BlockType::from_osmdata_blob(&empty).is_err());
        empty.clear();
        assert!(BlockType::from_osmdata_blob(&empty).is_err());
    }

    #[test]
    fn test_block_index() {
        let mut data = blob("OSMHeader", &header());
        data.extend(blob("OSMData", &ways_block()));
        data.extend(blob("OSMUnknown", &header()));

        let index = build_block_index(&data).unwrap();
        let types: Vec<_> = index.iter().map(|b| b.block_type).collect();
        assert_eq!(types, vec![BlockType::Header, BlockType::Ways]);

        let block: PrimitiveBlock = read_block(&data, &index[1]).unwrap();
        assert_eq!(block, ways_block());
        let parsed: HeaderBlock = read_block(&data, &index[0]).unwrap();
        assert_eq!(parsed, header());
    }

    #[test]
    fn test_truncated_file() {
        let data = blob("OSMData", &ways_block());
        assert!(build_block_index(&data[..data.len() - 1]).is_err());
    }
}
