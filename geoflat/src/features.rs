//! Encoded forms of points, paths, areas and relations.
//!
//! Every feature starts with its tags, followed by its topology. References
//! inside a feature are coded against the primary namespaces of the block
//! the feature is stored in.

use crate::error::{Error, Result};
use crate::ids::{FeatureType, Namespaces, TypeAndNamespace, FEATURE_TYPE_BITS};
use crate::values::{
    decode_geometry, encode_geometry, marshal_bits, marshal_latlngs, marshal_references,
    marshal_tags, unmarshal_bits, unmarshal_references, unmarshal_tags, GeometryEncoding, LatLng,
    MarshalledTags, Reference, Tag, Value, Vertex,
};
use crate::varint::{put_delta_coded, put_uvarint, Reader};

/// Point stored with its only owning path.
pub const POINT_TAG_COMMON: u64 = 0;
/// Point stored with explicit path and relation lists.
pub const POINT_TAG_FULL: u64 = 1;
/// Point that is only known through references to it.
pub const POINT_TAG_REFERENCES_ONLY: u64 = 2;
pub const POINT_TAG_BITS: u8 = 2;

/// Reserved tag key holding a point's location.
pub const POINT_KEY: &str = "point";
/// Reserved tag key holding a path's geometry.
pub const PATH_KEY: &str = "path";

/// Picks the cheapest encoding able to represent all `vertices`.
pub fn geometry_encoding_for_path<'a, I>(vertices: I) -> GeometryEncoding
where
    I: IntoIterator<Item = &'a Vertex>,
{
    let (mut references, mut latlngs) = (false, false);
    for v in vertices {
        match v {
            Vertex::Reference(_) => references = true,
            Vertex::LatLng(_) => latlngs = true,
        }
        if references && latlngs {
            return GeometryEncoding::Mixed;
        }
    }
    if latlngs {
        GeometryEncoding::LatLngs
    } else {
        GeometryEncoding::References
    }
}

/// Like `geometry_encoding_for_path`, for polygons made of paths or loops.
pub fn geometry_encoding_for_area<'a, I>(polygons: I) -> GeometryEncoding
where
    I: IntoIterator<Item = &'a PolygonGeometry>,
{
    let (mut paths, mut loops) = (false, false);
    for p in polygons {
        match p {
            PolygonGeometry::Paths(_) => paths = true,
            PolygonGeometry::Loops(_) => loops = true,
        }
        if paths && loops {
            return GeometryEncoding::Mixed;
        }
    }
    if loops {
        GeometryEncoding::LatLngs
    } else {
        GeometryEncoding::References
    }
}

/// Builds the geometry value of a path in its cheapest encoding.
pub fn path_geometry_value(vertices: Vec<Vertex>) -> Value {
    match geometry_encoding_for_path(&vertices) {
        GeometryEncoding::Mixed => Value::Mixed(vertices),
        GeometryEncoding::References => Value::References(
            vertices
                .into_iter()
                .filter_map(|v| match v {
                    Vertex::Reference(r) => Some(r),
                    Vertex::LatLng(_) => None,
                })
                .collect(),
        ),
        GeometryEncoding::LatLngs => Value::LatLngs(
            vertices
                .into_iter()
                .filter_map(|v| match v {
                    Vertex::LatLng(ll) => Some(ll),
                    Vertex::Reference(_) => None,
                })
                .collect(),
        ),
    }
}

/// Turns a path geometry value back into vertices.
pub fn path_vertices(value: Value) -> Result<Vec<Vertex>> {
    match value {
        Value::References(refs) => Ok(refs.into_iter().map(Vertex::Reference).collect()),
        Value::LatLngs(lls) => Ok(lls.into_iter().map(Vertex::LatLng).collect()),
        Value::Mixed(vertices) => Ok(vertices),
        v => Err(Error::corrupt(format!("{:?} is not a path geometry", v.kind()))),
    }
}

/// Paths and relations referencing a point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointReferences {
    pub paths: Vec<Reference>,
    pub relations: Vec<Reference>,
}

impl PointReferences {
    pub fn marshal(&self, nss: &Namespaces, buffer: &mut Vec<u8>) {
        marshal_references(&self.paths, nss.primary(FeatureType::Path), buffer);
        marshal_references(&self.relations, nss.primary(FeatureType::Relation), buffer);
    }

    pub fn unmarshal(nss: &Namespaces, r: &mut Reader) -> Result<Self> {
        let paths = unmarshal_references(nss.primary(FeatureType::Path), r)?;
        let relations = unmarshal_references(nss.primary(FeatureType::Relation), r)?;
        Ok(Self { paths, relations })
    }
}

/// Point owned by exactly one path and no relation, the common case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonPoint {
    pub tags: Vec<Tag>,
    pub path: Reference,
}

impl CommonPoint {
    pub fn marshal(&self, nss: &Namespaces, buffer: &mut Vec<u8>) {
        marshal_tags(&self.tags, TypeAndNamespace::INVALID, buffer);
        self.path.marshal(nss.primary(FeatureType::Path), buffer);
    }

    pub fn unmarshal(nss: &Namespaces, r: &mut Reader) -> Result<Self> {
        let tags = unmarshal_tags(TypeAndNamespace::INVALID, r)?;
        let path = Reference::unmarshal(nss.primary(FeatureType::Path), r)?;
        Ok(Self { tags, path })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullPoint {
    pub tags: Vec<Tag>,
    pub references: PointReferences,
}

impl FullPoint {
    pub fn marshal(&self, nss: &Namespaces, buffer: &mut Vec<u8>) {
        marshal_tags(&self.tags, TypeAndNamespace::INVALID, buffer);
        self.references.marshal(nss, buffer);
    }

    pub fn unmarshal(nss: &Namespaces, r: &mut Reader) -> Result<Self> {
        let tags = unmarshal_tags(TypeAndNamespace::INVALID, r)?;
        let references = PointReferences::unmarshal(nss, r)?;
        Ok(Self { tags, references })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    /// Tags, including the geometry under `PATH_KEY`.
    pub tags: Vec<Tag>,
    pub areas: Vec<Reference>,
    pub relations: Vec<Reference>,
}

impl Path {
    pub fn marshal(&self, nss: &Namespaces, buffer: &mut Vec<u8>) {
        marshal_tags(&self.tags, nss.primary(FeatureType::Point), buffer);
        marshal_references(&self.areas, nss.primary(FeatureType::Area), buffer);
        marshal_references(&self.relations, nss.primary(FeatureType::Relation), buffer);
    }

    pub fn unmarshal(nss: &Namespaces, r: &mut Reader) -> Result<Self> {
        let tags = unmarshal_tags(nss.primary(FeatureType::Point), r)?;
        let areas = unmarshal_references(nss.primary(FeatureType::Area), r)?;
        let relations = unmarshal_references(nss.primary(FeatureType::Relation), r)?;
        Ok(Self {
            tags,
            areas,
            relations,
        })
    }
}

/// One polygon of an area: either closed paths or raw loops, outer first.
///
/// Loops don't repeat their first vertex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolygonGeometry {
    Paths(Vec<Reference>),
    Loops(Vec<Vec<LatLng>>),
}

fn marshal_loops(loops: &[Vec<LatLng>], buffer: &mut Vec<u8>) {
    let mut starts = Vec::with_capacity(loops.len());
    let mut points = Vec::new();
    for (i, l) in loops.iter().enumerate() {
        if i > 0 {
            starts.push(points.len() as u64);
        }
        points.extend_from_slice(l);
    }
    put_uvarint(buffer, starts.len() as u64);
    put_delta_coded(buffer, &starts);
    marshal_latlngs(&points, buffer);
}

fn unmarshal_loops(r: &mut Reader) -> Result<Vec<Vec<LatLng>>> {
    let n = r.len_prefix()?;
    let starts = r.delta_coded(n)?;
    let points = match Value::unmarshal(TypeAndNamespace::INVALID, r)? {
        Value::LatLngs(points) => points,
        v => return Err(Error::corrupt(format!("{:?} in polygon loops", v.kind()))),
    };
    split_at_offsets(points, &starts)
}

/// Splits `items` into `offsets.len() + 1` consecutive runs.
fn split_at_offsets<T: Clone>(items: Vec<T>, offsets: &[u64]) -> Result<Vec<Vec<T>>> {
    let mut parts = Vec::with_capacity(offsets.len() + 1);
    let mut start = 0usize;
    for &end in offsets.iter().chain(std::iter::once(&(items.len() as u64))) {
        let end = end as usize;
        if end < start || end > items.len() {
            return Err(Error::corrupt(format!("offset {} out of order", end)));
        }
        parts.push(items[start..end].to_vec());
        start = end;
    }
    Ok(parts)
}

/// Geometry of an area, a list of polygons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AreaGeometry {
    /// Every polygon made of closed paths.
    References(Vec<Vec<Reference>>),
    /// Every polygon made of raw loops.
    LatLngs(Vec<Vec<Vec<LatLng>>>),
    Mixed(Vec<PolygonGeometry>),
}

impl AreaGeometry {
    /// Chooses the cheapest encoding for `polygons`.
    pub fn from_polygons(polygons: Vec<PolygonGeometry>) -> Self {
        match geometry_encoding_for_area(&polygons) {
            GeometryEncoding::Mixed => AreaGeometry::Mixed(polygons),
            GeometryEncoding::References => AreaGeometry::References(
                polygons
                    .into_iter()
                    .filter_map(|p| match p {
                        PolygonGeometry::Paths(paths) => Some(paths),
                        PolygonGeometry::Loops(_) => None,
                    })
                    .collect(),
            ),
            GeometryEncoding::LatLngs => AreaGeometry::LatLngs(
                polygons
                    .into_iter()
                    .filter_map(|p| match p {
                        PolygonGeometry::Loops(loops) => Some(loops),
                        PolygonGeometry::Paths(_) => None,
                    })
                    .collect(),
            ),
        }
    }

    pub fn into_polygons(self) -> Vec<PolygonGeometry> {
        match self {
            AreaGeometry::References(polygons) => {
                polygons.into_iter().map(PolygonGeometry::Paths).collect()
            }
            AreaGeometry::LatLngs(polygons) => {
                polygons.into_iter().map(PolygonGeometry::Loops).collect()
            }
            AreaGeometry::Mixed(polygons) => polygons,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            AreaGeometry::References(polygons) => polygons.len(),
            AreaGeometry::LatLngs(polygons) => polygons.len(),
            AreaGeometry::Mixed(polygons) => polygons.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path references of every polygon, in order.
    pub fn paths(&self) -> Vec<Reference> {
        match self {
            AreaGeometry::References(polygons) => polygons.iter().flatten().copied().collect(),
            AreaGeometry::LatLngs(_) => Vec::new(),
            AreaGeometry::Mixed(polygons) => polygons
                .iter()
                .filter_map(|p| match p {
                    PolygonGeometry::Paths(paths) => Some(paths.iter().copied()),
                    PolygonGeometry::Loops(_) => None,
                })
                .flatten()
                .collect(),
        }
    }

    /// Writes the geometry with references coded against `paths`.
    ///
    /// Polygons made of paths are stored as one flat reference list with
    /// the start offsets of all but the first polygon, so that encoding
    /// can't express zero polygons. A geometry without polygons is written
    /// as zero loops instead.
    pub fn marshal(&self, paths: TypeAndNamespace, buffer: &mut Vec<u8>) {
        match self {
            AreaGeometry::References(polygons) if polygons.is_empty() => {
                put_uvarint(buffer, encode_geometry(GeometryEncoding::LatLngs, 0));
            }
            AreaGeometry::References(polygons) => {
                let mut starts = Vec::with_capacity(polygons.len());
                let mut flat = Vec::new();
                for (i, polygon) in polygons.iter().enumerate() {
                    if i > 0 {
                        starts.push(flat.len() as u64);
                    }
                    flat.extend_from_slice(polygon);
                }
                put_uvarint(buffer, encode_geometry(GeometryEncoding::References, starts.len()));
                put_delta_coded(buffer, &starts);
                marshal_references(&flat, paths, buffer);
            }
            AreaGeometry::LatLngs(polygons) => {
                put_uvarint(buffer, encode_geometry(GeometryEncoding::LatLngs, polygons.len()));
                for loops in polygons {
                    marshal_loops(loops, buffer);
                }
            }
            AreaGeometry::Mixed(polygons) => {
                put_uvarint(buffer, encode_geometry(GeometryEncoding::Mixed, polygons.len()));
                let bits: Vec<bool> = polygons
                    .iter()
                    .map(|p| matches!(p, PolygonGeometry::Paths(_)))
                    .collect();
                marshal_bits(&bits, buffer);
                for polygon in polygons {
                    match polygon {
                        PolygonGeometry::Paths(refs) => marshal_references(refs, paths, buffer),
                        PolygonGeometry::Loops(loops) => marshal_loops(loops, buffer),
                    }
                }
            }
        }
    }

    pub fn unmarshal(paths: TypeAndNamespace, r: &mut Reader) -> Result<Self> {
        let (encoding, n) = decode_geometry(r.uvarint()?);
        if n > r.remaining().len() {
            return Err(Error::Truncated("area geometry"));
        }
        Ok(match encoding {
            GeometryEncoding::References => {
                let starts = r.delta_coded(n)?;
                let flat = unmarshal_references(paths, r)?;
                let polygons = split_at_offsets(flat, &starts)?;
                if polygons.iter().any(|paths| paths.is_empty()) {
                    return Err(Error::corrupt("area polygon without paths"));
                }
                AreaGeometry::References(polygons)
            }
            GeometryEncoding::LatLngs => {
                AreaGeometry::LatLngs((0..n).map(|_| unmarshal_loops(r)).collect::<Result<_>>()?)
            }
            GeometryEncoding::Mixed => {
                let bits = unmarshal_bits(r)?;
                if bits.len() != n {
                    return Err(Error::corrupt("area polygon mask length"));
                }
                AreaGeometry::Mixed(
                    bits.into_iter()
                        .map(|is_paths| {
                            if is_paths {
                                unmarshal_references(paths, r).map(PolygonGeometry::Paths)
                            } else {
                                unmarshal_loops(r).map(PolygonGeometry::Loops)
                            }
                        })
                        .collect::<Result<_>>()?,
                )
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Area {
    pub tags: Vec<Tag>,
    pub geometry: AreaGeometry,
    pub relations: Vec<Reference>,
}

impl Area {
    pub fn marshal(&self, nss: &Namespaces, buffer: &mut Vec<u8>) {
        marshal_tags(&self.tags, TypeAndNamespace::INVALID, buffer);
        self.geometry.marshal(nss.primary(FeatureType::Path), buffer);
        marshal_references(&self.relations, nss.primary(FeatureType::Relation), buffer);
    }

    pub fn unmarshal(nss: &Namespaces, r: &mut Reader) -> Result<Self> {
        let tags = unmarshal_tags(TypeAndNamespace::INVALID, r)?;
        let geometry = AreaGeometry::unmarshal(nss.primary(FeatureType::Path), r)?;
        let relations = unmarshal_references(nss.primary(FeatureType::Relation), r)?;
        Ok(Self {
            tags,
            geometry,
            relations,
        })
    }
}

/// Relation member. The member's feature type is the type of its reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    /// Index of the role in the string table.
    pub role: u64,
    pub id: Reference,
}

impl Member {
    pub fn feature_type(&self) -> FeatureType {
        self.id.tn.feature_type()
    }
}

pub fn marshal_members(members: &[Member], primary: TypeAndNamespace, buffer: &mut Vec<u8>) {
    put_uvarint(buffer, members.len() as u64);
    for member in members {
        debug_assert!(member.role < 1 << (64 - FEATURE_TYPE_BITS));
        put_uvarint(
            buffer,
            (member.role << FEATURE_TYPE_BITS) | member.feature_type() as u64 & 3,
        );
        member.id.marshal(primary, buffer);
    }
}

pub fn unmarshal_members(primary: TypeAndNamespace, r: &mut Reader) -> Result<Vec<Member>> {
    let n = r.len_prefix()?;
    (0..n)
        .map(|_| {
            let role = r.uvarint()?;
            let id = Reference::unmarshal(primary, r)?;
            if id.tn.feature_type() as u64 & 3 != role & 3 {
                return Err(Error::corrupt("member type mismatch"));
            }
            Ok(Member {
                role: role >> FEATURE_TYPE_BITS,
                id,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub tags: Vec<Tag>,
    pub members: Vec<Member>,
    pub relations: Vec<Reference>,
}

impl Relation {
    pub fn marshal(&self, nss: &Namespaces, buffer: &mut Vec<u8>) {
        marshal_tags(&self.tags, TypeAndNamespace::INVALID, buffer);
        marshal_members(&self.members, nss.primary(FeatureType::Path), buffer);
        marshal_references(&self.relations, nss.primary(FeatureType::Relation), buffer);
    }

    pub fn unmarshal(nss: &Namespaces, r: &mut Reader) -> Result<Self> {
        let tags = unmarshal_tags(TypeAndNamespace::INVALID, r)?;
        let members = unmarshal_members(nss.primary(FeatureType::Path), r)?;
        let relations = unmarshal_references(nss.primary(FeatureType::Relation), r)?;
        Ok(Self {
            tags,
            members,
            relations,
        })
    }
}

/// A stored feature decoded completely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFeature {
    CommonPoint(CommonPoint),
    FullPoint(FullPoint),
    ReferencedPoint(PointReferences),
    Path(Path),
    Area(Area),
    Relation(Relation),
}

impl DecodedFeature {
    /// Decodes a payload stored under `tag` in a block of `feature_type`
    /// features. Bytes left over after the feature are an error.
    pub fn unmarshal(
        feature_type: FeatureType,
        tag: u64,
        nss: &Namespaces,
        data: &[u8],
    ) -> Result<Self> {
        let mut r = Reader::new(data);
        let feature = match (feature_type, tag) {
            (FeatureType::Point, POINT_TAG_COMMON) => {
                DecodedFeature::CommonPoint(CommonPoint::unmarshal(nss, &mut r)?)
            }
            (FeatureType::Point, POINT_TAG_FULL) => {
                DecodedFeature::FullPoint(FullPoint::unmarshal(nss, &mut r)?)
            }
            (FeatureType::Point, POINT_TAG_REFERENCES_ONLY) => {
                DecodedFeature::ReferencedPoint(PointReferences::unmarshal(nss, &mut r)?)
            }
            (FeatureType::Path, 0) => DecodedFeature::Path(Path::unmarshal(nss, &mut r)?),
            (FeatureType::Area, 0) => DecodedFeature::Area(Area::unmarshal(nss, &mut r)?),
            (FeatureType::Relation, 0) => {
                DecodedFeature::Relation(Relation::unmarshal(nss, &mut r)?)
            }
            (t, tag) => return Err(Error::corrupt(format!("{:?} stored under tag {}", t, tag))),
        };
        if !r.is_empty() {
            return Err(Error::corrupt(format!(
                "{} bytes after {:?} feature",
                r.remaining().len(),
                feature_type
            )));
        }
        Ok(feature)
    }
}

/// Lazily decoded view of a stored feature: tags are kept encoded, the rest
/// is decoded on request.
#[derive(Debug, Clone, Copy)]
pub struct FeatureView<'a> {
    pub tags: MarshalledTags<'a>,
    data: &'a [u8],
    rest: &'a [u8],
    nss: Namespaces,
}

impl<'a> FeatureView<'a> {
    fn new(data: &'a [u8], tags_primary: TypeAndNamespace, nss: Namespaces) -> Result<Self> {
        let mut r = Reader::new(data);
        let tags = MarshalledTags::read(tags_primary, &mut r)?;
        Ok(Self {
            tags,
            data,
            rest: r.remaining(),
            nss,
        })
    }

    /// View of a point payload stored under a point tag.
    pub fn point(data: &'a [u8], tag: u64, nss: Namespaces) -> Result<Self> {
        if tag == POINT_TAG_REFERENCES_ONLY {
            return Ok(Self {
                tags: MarshalledTags::read(TypeAndNamespace::INVALID, &mut Reader::new(&[0]))?,
                data,
                rest: data,
                nss,
            });
        }
        Self::new(data, TypeAndNamespace::INVALID, nss)
    }

    pub fn path(data: &'a [u8], nss: Namespaces) -> Result<Self> {
        Self::new(data, nss.primary(FeatureType::Point), nss)
    }

    pub fn area(data: &'a [u8], nss: Namespaces) -> Result<Self> {
        Self::new(data, TypeAndNamespace::INVALID, nss)
    }

    pub fn relation(data: &'a [u8], nss: Namespaces) -> Result<Self> {
        Self::new(data, TypeAndNamespace::INVALID, nss)
    }

    pub fn namespaces(&self) -> &Namespaces {
        &self.nss
    }

    /// The whole stored payload, tags included.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    fn reader(&self) -> Reader<'a> {
        Reader::new(self.rest)
    }

    /// Owning path of a point stored with `POINT_TAG_COMMON`.
    pub fn common_point_path(&self) -> Result<Reference> {
        Reference::unmarshal(self.nss.primary(FeatureType::Path), &mut self.reader())
    }

    /// References of a point stored with `POINT_TAG_FULL` or
    /// `POINT_TAG_REFERENCES_ONLY`.
    pub fn point_references(&self) -> Result<PointReferences> {
        PointReferences::unmarshal(&self.nss, &mut self.reader())
    }

    /// Areas and relations of a path.
    pub fn path_references(&self) -> Result<(Vec<Reference>, Vec<Reference>)> {
        let mut r = self.reader();
        let areas = unmarshal_references(self.nss.primary(FeatureType::Area), &mut r)?;
        let relations = unmarshal_references(self.nss.primary(FeatureType::Relation), &mut r)?;
        Ok((areas, relations))
    }

    pub fn area_geometry(&self) -> Result<AreaGeometry> {
        AreaGeometry::unmarshal(self.nss.primary(FeatureType::Path), &mut self.reader())
    }

    pub fn area_relations(&self) -> Result<Vec<Reference>> {
        let mut r = self.reader();
        AreaGeometry::unmarshal(self.nss.primary(FeatureType::Path), &mut r)?;
        unmarshal_references(self.nss.primary(FeatureType::Relation), &mut r)
    }

    pub fn relation_members(&self) -> Result<Vec<Member>> {
        unmarshal_members(self.nss.primary(FeatureType::Path), &mut self.reader())
    }

    pub fn relation_relations(&self) -> Result<Vec<Reference>> {
        let mut r = self.reader();
        unmarshal_members(self.nss.primary(FeatureType::Path), &mut r)?;
        unmarshal_references(self.nss.primary(FeatureType::Relation), &mut r)
    }
}
