//! Encoding of tag values, references and coordinates.
//!
//! Every value starts with a varint whose two low bits select the value type.
//! For sequences the remaining bits carry the geometry encoding and length,
//! so the concrete variant of a value is known from its first varint alone.

use crate::error::{Error, Result};
use crate::ids::TypeAndNamespace;
use crate::varint::{put_uvarint, put_varint, zigzag_decode, zigzag_encode, Reader};

use byteorder::{ByteOrder, LittleEndian};

pub const VALUE_TYPE_BITS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Index into the string table.
    String = 0,
    LatLng = 1,
    Values = 2,
}

#[inline]
pub fn encode_value_type(value_type: ValueType, v: u64) -> u64 {
    (v << VALUE_TYPE_BITS) | value_type as u64
}

pub fn decode_value_type(v: u64) -> Result<(ValueType, u64)> {
    let value_type = match v & ((1 << VALUE_TYPE_BITS) - 1) {
        0 => ValueType::String,
        1 => ValueType::LatLng,
        2 => ValueType::Values,
        t => return Err(Error::corrupt(format!("unknown value type {}", t))),
    };
    Ok((value_type, v >> VALUE_TYPE_BITS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryEncoding {
    References,
    LatLngs,
    Mixed,
}

#[inline]
pub fn encode_geometry(encoding: GeometryEncoding, len: usize) -> u64 {
    let len = len as u64;
    match encoding {
        GeometryEncoding::References => len << 1,
        GeometryEncoding::LatLngs => (len << 2) | 1,
        GeometryEncoding::Mixed => (len << 2) | 3,
    }
}

#[inline]
pub fn decode_geometry(v: u64) -> (GeometryEncoding, usize) {
    if v & 1 == 0 {
        (GeometryEncoding::References, (v >> 1) as usize)
    } else if v & 2 == 0 {
        (GeometryEncoding::LatLngs, (v >> 2) as usize)
    } else {
        (GeometryEncoding::Mixed, (v >> 2) as usize)
    }
}

/// Coordinate in units of 1e-7 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct LatLng {
    pub lat_e7: i32,
    pub lng_e7: i32,
}

impl LatLng {
    pub fn new(lat_e7: i32, lng_e7: i32) -> Self {
        Self { lat_e7, lng_e7 }
    }

    pub fn from_degrees(lat: f64, lng: f64) -> Self {
        Self {
            lat_e7: (lat * 1e7).round() as i32,
            lng_e7: (lng * 1e7).round() as i32,
        }
    }

    pub fn lat(&self) -> f64 {
        f64::from(self.lat_e7) / 1e7
    }

    pub fn lng(&self) -> f64 {
        f64::from(self.lng_e7) / 1e7
    }

    pub fn marshal(&self, buffer: &mut Vec<u8>) {
        put_uvarint(
            buffer,
            encode_value_type(ValueType::LatLng, zigzag_encode(i64::from(self.lat_e7))),
        );
        let mut lng = [0u8; 4];
        LittleEndian::write_u32(&mut lng, self.lng_e7 as u32);
        buffer.extend_from_slice(&lng);
    }

    pub fn unmarshal(r: &mut Reader) -> Result<Self> {
        match decode_value_type(r.uvarint()?)? {
            (ValueType::LatLng, lat) => Self::unmarshal_after_header(lat, r),
            (t, _) => Err(Error::corrupt(format!("expected latlng, found {:?}", t))),
        }
    }

    fn unmarshal_after_header(lat: u64, r: &mut Reader) -> Result<Self> {
        Ok(Self {
            lat_e7: zigzag_decode(lat) as i32,
            lng_e7: r.u32()? as i32,
        })
    }
}

/// Delta state for a sequence of coordinates.
#[derive(Debug, Default, Clone, Copy)]
struct LatLngDeltas {
    last: LatLng,
}

impl LatLngDeltas {
    #[inline]
    fn put(&mut self, ll: LatLng, buffer: &mut Vec<u8>) {
        put_varint(buffer, i64::from(ll.lat_e7.wrapping_sub(self.last.lat_e7)));
        put_varint(buffer, i64::from(ll.lng_e7.wrapping_sub(self.last.lng_e7)));
        self.last = ll;
    }

    #[inline]
    fn read(&mut self, r: &mut Reader) -> Result<LatLng> {
        let lat = self.last.lat_e7.wrapping_add(r.varint()? as i32);
        let lng = self.last.lng_e7.wrapping_add(r.varint()? as i32);
        self.last = LatLng::new(lat, lng);
        Ok(self.last)
    }
}

pub fn marshal_latlngs(lls: &[LatLng], buffer: &mut Vec<u8>) {
    put_uvarint(
        buffer,
        encode_value_type(
            ValueType::Values,
            encode_geometry(GeometryEncoding::LatLngs, lls.len()),
        ),
    );
    marshal_latlngs_without_length(lls, buffer);
}

pub fn marshal_latlngs_without_length(lls: &[LatLng], buffer: &mut Vec<u8>) {
    let mut deltas = LatLngDeltas::default();
    for ll in lls {
        deltas.put(*ll, buffer);
    }
}

pub fn unmarshal_latlngs_without_length(n: usize, r: &mut Reader) -> Result<Vec<LatLng>> {
    let mut deltas = LatLngDeltas::default();
    let mut lls = Vec::with_capacity(n.min(r.remaining().len()));
    for _ in 0..n {
        lls.push(deltas.read(r)?);
    }
    Ok(lls)
}

/// Reference to a feature, relative to a blob's namespace table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    pub tn: TypeAndNamespace,
    pub value: u64,
}

impl Reference {
    pub fn new(tn: TypeAndNamespace, value: u64) -> Self {
        Self { tn, value }
    }

    /// Writes the reference on its own, without delta coding.
    ///
    /// References in `primary` are stored as `value << 1`, all others as
    /// `tn << 1 | 1` followed by the value.
    pub fn marshal(&self, primary: TypeAndNamespace, buffer: &mut Vec<u8>) {
        if self.tn != primary || self.value & (1 << 63) != 0 {
            put_uvarint(buffer, (u64::from(self.tn.0) << 1) | 1);
            put_uvarint(buffer, self.value);
        } else {
            put_uvarint(buffer, self.value << 1);
        }
    }

    pub fn unmarshal(primary: TypeAndNamespace, r: &mut Reader) -> Result<Self> {
        let v = r.uvarint()?;
        if v & 1 == 1 {
            let tn = u16::try_from(v >> 1)
                .map_err(|_| Error::corrupt(format!("type and namespace {}", v >> 1)))?;
            Ok(Self::new(TypeAndNamespace(tn), r.uvarint()?))
        } else {
            Ok(Self::new(primary, v >> 1))
        }
    }
}

/// Delta state for a sequence of references. Only references in the primary
/// namespace are delta coded.
#[derive(Debug, Default, Clone, Copy)]
struct ReferenceDeltas {
    last: u64,
}

impl ReferenceDeltas {
    #[inline]
    fn put(&mut self, r: Reference, primary: TypeAndNamespace, buffer: &mut Vec<u8>) {
        if r.tn == primary {
            let delta = zigzag_encode(r.value.wrapping_sub(self.last) as i64);
            self.last = r.value;
            Reference::new(r.tn, delta).marshal(primary, buffer);
        } else {
            r.marshal(primary, buffer);
        }
    }

    #[inline]
    fn read(&mut self, primary: TypeAndNamespace, r: &mut Reader) -> Result<Reference> {
        let mut reference = Reference::unmarshal(primary, r)?;
        if reference.tn == primary {
            reference.value = self.last.wrapping_add(zigzag_decode(reference.value) as u64);
            self.last = reference.value;
        }
        Ok(reference)
    }
}

pub fn marshal_references(refs: &[Reference], primary: TypeAndNamespace, buffer: &mut Vec<u8>) {
    put_uvarint(
        buffer,
        encode_value_type(
            ValueType::Values,
            encode_geometry(GeometryEncoding::References, refs.len()),
        ),
    );
    marshal_references_without_length(refs, primary, buffer);
}

pub fn marshal_references_without_length(
    refs: &[Reference],
    primary: TypeAndNamespace,
    buffer: &mut Vec<u8>,
) {
    let mut deltas = ReferenceDeltas::default();
    for r in refs {
        deltas.put(*r, primary, buffer);
    }
}

pub fn unmarshal_references(primary: TypeAndNamespace, r: &mut Reader) -> Result<Vec<Reference>> {
    match decode_value_type(r.uvarint()?)? {
        (ValueType::Values, v) => match decode_geometry(v) {
            (GeometryEncoding::References, n) => unmarshal_references_without_length(n, primary, r),
            (encoding, _) => Err(Error::corrupt(format!(
                "expected references, found {:?}",
                encoding
            ))),
        },
        (t, _) => Err(Error::corrupt(format!("expected references, found {:?}", t))),
    }
}

pub fn unmarshal_references_without_length(
    n: usize,
    primary: TypeAndNamespace,
    r: &mut Reader,
) -> Result<Vec<Reference>> {
    let mut deltas = ReferenceDeltas::default();
    let mut refs = Vec::with_capacity(n.min(r.remaining().len()));
    for _ in 0..n {
        refs.push(deltas.read(primary, r)?);
    }
    Ok(refs)
}

/// Packs booleans, least significant bit first.
pub fn marshal_bits(bits: &[bool], buffer: &mut Vec<u8>) {
    put_uvarint(buffer, bits.len() as u64);
    for chunk in bits.chunks(8) {
        let byte = chunk
            .iter()
            .enumerate()
            .fold(0u8, |byte, (i, &bit)| byte | (u8::from(bit) << i));
        buffer.push(byte);
    }
}

/// A mask of `n` bits takes `n / 8` bytes, rounded up.
pub fn unmarshal_bits(r: &mut Reader) -> Result<Vec<bool>> {
    let n = r.uvarint()?;
    let len = n / 8 + u64::from(n % 8 != 0);
    if len > r.remaining().len() as u64 {
        return Err(Error::Truncated("bit mask"));
    }
    let n = n as usize;
    let bytes = r.bytes((n + 7) / 8)?;
    Ok((0..n)
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect())
}

/// Element of a path that mixes references to points with raw coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vertex {
    Reference(Reference),
    LatLng(LatLng),
}

pub fn marshal_mixed(vertices: &[Vertex], primary: TypeAndNamespace, buffer: &mut Vec<u8>) {
    put_uvarint(
        buffer,
        encode_value_type(
            ValueType::Values,
            encode_geometry(GeometryEncoding::Mixed, vertices.len()),
        ),
    );
    marshal_mixed_without_length(vertices, primary, buffer);
}

fn marshal_mixed_without_length(
    vertices: &[Vertex],
    primary: TypeAndNamespace,
    buffer: &mut Vec<u8>,
) {
    let bits: Vec<bool> = vertices
        .iter()
        .map(|v| matches!(v, Vertex::Reference(_)))
        .collect();
    marshal_bits(&bits, buffer);
    let mut references = ReferenceDeltas::default();
    let mut lls = LatLngDeltas::default();
    for v in vertices {
        match v {
            Vertex::Reference(r) => references.put(*r, primary, buffer),
            Vertex::LatLng(ll) => lls.put(*ll, buffer),
        }
    }
}

fn unmarshal_mixed_without_length(
    n: usize,
    primary: TypeAndNamespace,
    r: &mut Reader,
) -> Result<Vec<Vertex>> {
    let bits = unmarshal_bits(r)?;
    if bits.len() != n {
        return Err(Error::corrupt(format!(
            "mixed geometry of {} with {} bits",
            n,
            bits.len()
        )));
    }
    let mut references = ReferenceDeltas::default();
    let mut lls = LatLngDeltas::default();
    bits.into_iter()
        .map(|is_reference| {
            if is_reference {
                references.read(primary, r).map(Vertex::Reference)
            } else {
                lls.read(r).map(Vertex::LatLng)
            }
        })
        .collect()
}

/// Concrete kind of a value, known from its first varint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    LatLng,
    LatLngs,
    References,
    Mixed,
}

/// Kind of the value at the start of `data`, from its first varint only.
pub fn infer_value_type(data: &[u8]) -> Result<ValueKind> {
    let mut r = Reader::new(data);
    Ok(match decode_value_type(r.uvarint()?)? {
        (ValueType::String, _) => ValueKind::Int,
        (ValueType::LatLng, _) => ValueKind::LatLng,
        (ValueType::Values, v) => match decode_geometry(v).0 {
            GeometryEncoding::References => ValueKind::References,
            GeometryEncoding::LatLngs => ValueKind::LatLngs,
            GeometryEncoding::Mixed => ValueKind::Mixed,
        },
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Index into the blob's string table.
    Int(u64),
    LatLng(LatLng),
    LatLngs(Vec<LatLng>),
    References(Vec<Reference>),
    Mixed(Vec<Vertex>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Int(_) => ValueKind::Int,
            Value::LatLng(_) => ValueKind::LatLng,
            Value::LatLngs(_) => ValueKind::LatLngs,
            Value::References(_) => ValueKind::References,
            Value::Mixed(_) => ValueKind::Mixed,
        }
    }

    pub fn marshal(&self, primary: TypeAndNamespace, buffer: &mut Vec<u8>) {
        match self {
            Value::Int(i) => put_uvarint(buffer, encode_value_type(ValueType::String, *i)),
            Value::LatLng(ll) => ll.marshal(buffer),
            Value::LatLngs(lls) => marshal_latlngs(lls, buffer),
            Value::References(refs) => marshal_references(refs, primary, buffer),
            Value::Mixed(vertices) => marshal_mixed(vertices, primary, buffer),
        }
    }

    pub fn unmarshal(primary: TypeAndNamespace, r: &mut Reader) -> Result<Self> {
        Ok(match decode_value_type(r.uvarint()?)? {
            (ValueType::String, i) => Value::Int(i),
            (ValueType::LatLng, lat) => Value::LatLng(LatLng::unmarshal_after_header(lat, r)?),
            (ValueType::Values, v) => match decode_geometry(v) {
                (GeometryEncoding::References, n) => {
                    Value::References(unmarshal_references_without_length(n, primary, r)?)
                }
                (GeometryEncoding::LatLngs, n) => {
                    Value::LatLngs(unmarshal_latlngs_without_length(n, r)?)
                }
                (GeometryEncoding::Mixed, n) => {
                    Value::Mixed(unmarshal_mixed_without_length(n, primary, r)?)
                }
            },
        })
    }

    /// Advances `r` past one value without materializing it.
    pub fn skip(r: &mut Reader) -> Result<()> {
        match decode_value_type(r.uvarint()?)? {
            (ValueType::String, _) => {}
            (ValueType::LatLng, _) => {
                r.bytes(4)?;
            }
            (ValueType::Values, v) => match decode_geometry(v) {
                (GeometryEncoding::References, n) => {
                    for _ in 0..n {
                        skip_reference(r)?;
                    }
                }
                (GeometryEncoding::LatLngs, n) => {
                    for _ in 0..2 * n {
                        r.uvarint()?;
                    }
                }
                (GeometryEncoding::Mixed, _) => {
                    for is_reference in unmarshal_bits(r)? {
                        if is_reference {
                            skip_reference(r)?;
                        } else {
                            r.uvarint()?;
                            r.uvarint()?;
                        }
                    }
                }
            },
        }
        Ok(())
    }
}

fn skip_reference(r: &mut Reader) -> Result<()> {
    if r.uvarint()? & 1 == 1 {
        r.uvarint()?;
    }
    Ok(())
}

/// Tag with its key as a string table index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: u64,
    pub value: Value,
}

impl Tag {
    pub fn new(key: u64, value: Value) -> Self {
        Self { key, value }
    }

    pub fn marshal(&self, primary: TypeAndNamespace, buffer: &mut Vec<u8>) {
        put_uvarint(buffer, self.key);
        self.value.marshal(primary, buffer);
    }

    pub fn unmarshal(primary: TypeAndNamespace, r: &mut Reader) -> Result<Self> {
        let key = r.uvarint()?;
        Ok(Self::new(key, Value::unmarshal(primary, r)?))
    }
}

pub fn marshal_tags(tags: &[Tag], primary: TypeAndNamespace, buffer: &mut Vec<u8>) {
    put_uvarint(buffer, tags.len() as u64);
    for tag in tags {
        tag.marshal(primary, buffer);
    }
}

pub fn unmarshal_tags(primary: TypeAndNamespace, r: &mut Reader) -> Result<Vec<Tag>> {
    let n = r.len_prefix()?;
    (0..n).map(|_| Tag::unmarshal(primary, r)).collect()
}

/// Encoded tags, decoded one at a time on request.
#[derive(Debug, Clone, Copy)]
pub struct MarshalledTags<'a> {
    data: &'a [u8],
    primary: TypeAndNamespace,
    len: usize,
}

impl<'a> MarshalledTags<'a> {
    /// Takes the tags at the start of `r`, leaving `r` positioned after them.
    pub fn read(primary: TypeAndNamespace, r: &mut Reader<'a>) -> Result<Self> {
        let data = r.remaining();
        let start = r.position();
        let len = r.len_prefix()?;
        for _ in 0..len {
            r.uvarint()?;
            Value::skip(r)?;
        }
        Ok(Self {
            data: &data[..r.position() - start],
            primary,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Keys and string table indices of the string tags. Geometry values are
    /// skipped without being decoded.
    pub fn strings(&self) -> Result<Vec<(u64, u64)>> {
        let mut r = Reader::new(self.data);
        let len = r.len_prefix()?;
        let mut strings = Vec::with_capacity(len);
        for _ in 0..len {
            let key = r.uvarint()?;
            match infer_value_type(r.remaining())? {
                ValueKind::Int => match Value::unmarshal(self.primary, &mut r)? {
                    Value::Int(value) => strings.push((key, value)),
                    v => return Err(Error::corrupt(format!("{:?} inferred as string", v.kind()))),
                },
                _ => Value::skip(&mut r)?,
            }
        }
        Ok(strings)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Decodes only the value of the first tag with key index `key`.
    pub fn find(&self, key: u64) -> Result<Option<Value>> {
        let mut r = Reader::new(self.data);
        let len = r.len_prefix()?;
        for _ in 0..len {
            if r.uvarint()? == key {
                return Value::unmarshal(self.primary, &mut r).map(Some);
            }
            Value::skip(&mut r)?;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ids::FeatureType;

    use proptest::prelude::*;

    fn nodes() -> TypeAndNamespace {
        TypeAndNamespace::new(FeatureType::Point, 3)
    }

    fn round_trip(value: &Value, primary: TypeAndNamespace) {
        let mut buffer = Vec::new();
        value.marshal(primary, &mut buffer);
        let mut r = Reader::new(&buffer);
        assert_eq!(&Value::unmarshal(primary, &mut r).unwrap(), value);
        assert_eq!(r.position(), buffer.len());
        assert_eq!(infer_value_type(&buffer).unwrap(), value.kind());

        let mut r = Reader::new(&buffer);
        Value::skip(&mut r).unwrap();
        assert_eq!(r.position(), buffer.len());
    }

    #[test]
    fn test_geometry_header() {
        for encoding in [
            GeometryEncoding::References,
            GeometryEncoding::LatLngs,
            GeometryEncoding::Mixed,
        ] {
            for len in [0, 1, 7, 1 << 20] {
                assert_eq!(decode_geometry(encode_geometry(encoding, len)), (encoding, len));
            }
        }
    }

    #[test]
    fn test_latlng() {
        let ll = LatLng::from_degrees(51.5354124, -0.1145445);
        assert_eq!(ll, LatLng::new(515354124, -1145445));
        round_trip(&Value::LatLng(ll), TypeAndNamespace::INVALID);
        assert!((ll.lat() - 51.5354124).abs() < 1e-9);
    }

    #[test]
    fn test_primary_reference_is_compact() {
        let mut buffer = Vec::new();
        Reference::new(nodes(), 5).marshal(nodes(), &mut buffer);
        assert_eq!(buffer, vec![10]);

        buffer.clear();
        let other = TypeAndNamespace::new(FeatureType::Path, 4);
        Reference::new(other, 5).marshal(nodes(), &mut buffer);
        let mut r = Reader::new(&buffer);
        assert_eq!(Reference::unmarshal(nodes(), &mut r).unwrap(), Reference::new(other, 5));

        // values with the top bit set can't be shifted, so they escape
        buffer.clear();
        let huge = Reference::new(nodes(), u64::MAX);
        huge.marshal(nodes(), &mut buffer);
        let mut r = Reader::new(&buffer);
        assert_eq!(Reference::unmarshal(nodes(), &mut r).unwrap(), huge);
    }

    #[test]
    fn test_references_mixing_namespaces() {
        let other = TypeAndNamespace::new(FeatureType::Point, 9);
        let refs = vec![
            Reference::new(nodes(), 1000),
            Reference::new(other, 1),
            Reference::new(nodes(), 900),
            Reference::new(nodes(), u64::MAX - 1),
            Reference::new(nodes(), 3),
        ];
        round_trip(&Value::References(refs), nodes());
    }

    #[test]
    fn test_sorted_references_compress() {
        let refs: Vec<_> = (0..1000u64)
            .map(|i| Reference::new(nodes(), 4_000_000_000 + i * 37))
            .collect();
        let mut buffer = Vec::new();
        marshal_references(&refs, nodes(), &mut buffer);
        assert!(buffer.len() < refs.len() * 8);
        let mut r = Reader::new(&buffer);
        assert_eq!(unmarshal_references(nodes(), &mut r).unwrap(), refs);
    }

    #[test]
    fn test_bits() {
        for n in [0usize, 1, 7, 8, 9, 17] {
            let bits: Vec<bool> = (0..n).map(|i| i % 3 == 0).collect();
            let mut buffer = Vec::new();
            marshal_bits(&bits, &mut buffer);
            assert_eq!(buffer.len(), 1 + (n + 7) / 8);
            assert_eq!(unmarshal_bits(&mut Reader::new(&buffer)).unwrap(), bits);
        }
    }

    #[test]
    fn test_bits_longer_than_input() {
        // 17 bits fit in 3 bytes, followed by nothing else
        let bits: Vec<bool> = (0..17).map(|i| i % 2 == 0).collect();
        let mut buffer = Vec::new();
        marshal_bits(&bits, &mut buffer);
        assert_eq!(buffer.len(), 4);
        let mut r = Reader::new(&buffer);
        assert_eq!(unmarshal_bits(&mut r).unwrap(), bits);
        assert_eq!(r.position(), buffer.len());

        buffer.pop();
        assert!(matches!(
            unmarshal_bits(&mut Reader::new(&buffer)),
            Err(Error::Truncated(_))
        ));
        let mut huge = Vec::new();
        put_uvarint(&mut huge, u64::MAX);
        assert!(unmarshal_bits(&mut Reader::new(&huge)).is_err());
    }

    #[test]
    fn test_mixed() {
        let mixed = vec![
            Vertex::Reference(Reference::new(nodes(), 10)),
            Vertex::LatLng(LatLng::new(515354124, -1145445)),
            Vertex::Reference(Reference::new(nodes(), 8)),
            Vertex::LatLng(LatLng::new(515354000, -1145000)),
            Vertex::Reference(Reference::new(TypeAndNamespace::new(FeatureType::Point, 1), 2)),
        ];
        round_trip(&Value::Mixed(mixed), nodes());
    }

    #[test]
    fn test_unknown_value_type() {
        let mut buffer = Vec::new();
        put_uvarint(&mut buffer, 3);
        assert!(Value::unmarshal(nodes(), &mut Reader::new(&buffer)).is_err());
        assert!(infer_value_type(&buffer).is_err());
    }

    #[test]
    fn test_truncated_values() {
        let mut buffer = Vec::new();
        Value::LatLngs(vec![LatLng::new(1, 2), LatLng::new(3, 4)]).marshal(nodes(), &mut buffer);
        for end in 0..buffer.len() {
            assert!(Value::unmarshal(nodes(), &mut Reader::new(&buffer[..end])).is_err());
        }
    }

    #[test]
    fn test_marshalled_tags_find() {
        let tags = vec![
            Tag::new(0, Value::Int(7)),
            Tag::new(3, Value::LatLngs(vec![LatLng::new(1, 1), LatLng::new(-5, 2)])),
            Tag::new(1, Value::References(vec![Reference::new(nodes(), 4)])),
        ];
        let mut buffer = Vec::new();
        marshal_tags(&tags, nodes(), &mut buffer);
        buffer.extend_from_slice(&[0xff, 0xff]);

        let mut r = Reader::new(&buffer);
        let marshalled = MarshalledTags::read(nodes(), &mut r).unwrap();
        assert_eq!(r.remaining(), &[0xff, 0xff]);
        assert_eq!(marshalled.len(), 3);
        for tag in &tags {
            assert_eq!(marshalled.find(tag.key).unwrap(), Some(tag.value.clone()));
        }
        assert_eq!(marshalled.find(2).unwrap(), None);
        assert_eq!(marshalled.strings().unwrap(), vec![(0, 7)]);
    }

    fn latlng() -> impl Strategy<Value = LatLng> {
        (any::<i32>(), any::<i32>()).prop_map(|(lat, lng)| LatLng::new(lat, lng))
    }

    fn reference() -> impl Strategy<Value = Reference> {
        (prop_oneof![Just(3u16), 0..8u16], any::<u64>())
            .prop_map(|(ns, value)| Reference::new(TypeAndNamespace::new(FeatureType::Point, ns), value))
    }

    fn value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<u32>().prop_map(|i| Value::Int(u64::from(i))),
            latlng().prop_map(Value::LatLng),
            prop::collection::vec(latlng(), 0..20).prop_map(Value::LatLngs),
            prop::collection::vec(reference(), 0..20).prop_map(Value::References),
            prop::collection::vec(
                prop_oneof![reference().prop_map(Vertex::Reference), latlng().prop_map(Vertex::LatLng)],
                0..20
            )
            .prop_map(Value::Mixed),
        ]
    }

    proptest! {
        #[test]
        fn values_round_trip(ref value in value()) {
            round_trip(value, nodes());
        }

        #[test]
        fn tags_round_trip(ref tags in prop::collection::vec((0..100u64, value()), 0..10)) {
            let tags: Vec<Tag> = tags.iter().cloned().map(|(k, v)| Tag::new(k, v)).collect();
            let mut buffer = Vec::new();
            marshal_tags(&tags, nodes(), &mut buffer);
            let mut r = Reader::new(&buffer);
            prop_assert_eq!(unmarshal_tags(nodes(), &mut r).unwrap(), tags);
            prop_assert_eq!(r.position(), buffer.len());
        }
    }
}
