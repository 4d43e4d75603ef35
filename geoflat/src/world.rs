//! Read access to built blobs.
//!
//! A `FeaturesById` is one blob, read in place. A `World` stacks blobs on top
//! of each other: a base world and any number of blobs of changes, where the
//! later blobs win for lookups by id and search returns the union.

use crate::arrays::ByteArrays;
use crate::blob::{blocks, BlockType, FeatureBlockHeader, Header};
use crate::error::{Context, Error, Result};
use crate::features::{
    path_vertices, AreaGeometry, DecodedFeature, FeatureView, PolygonGeometry, PATH_KEY,
    POINT_KEY, POINT_TAG_COMMON, POINT_TAG_REFERENCES_ONLY,
};
use crate::geometry::{open_ring, orient_polygon};
use crate::ids::{FeatureId, FeatureType, NamespaceTable, TypeAndNamespace};
use crate::output::Blob;
use crate::posting::{posting_list_token, posting_list_token_equals, PostingIterator, PostingKey};
use crate::source::LocationsById;
use crate::strings::StringTable;
use crate::tiles::Bounds;
use crate::tokens::TokenMap;
use crate::uint64map::Uint64Map;
use crate::values::{LatLng, Reference, Value, Vertex};
use crate::varint::Reader;

use ahash::AHashMap;
use itertools::Itertools;
use log::{debug, warn};
use lru::LruCache;
use parking_lot::Mutex;

use std::num::NonZeroUsize;
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Number of path and area geometries kept decoded.
const CACHE_ENTRIES: NonZeroUsize = match NonZeroUsize::new(4000) {
    Some(n) => n,
    None => unreachable!(),
};

/// Loops of a polygon, the outer boundary first, without closing vertices.
pub type Polygon = Vec<Vec<LatLng>>;

/// Resolved geometry of a path or an area.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Polyline(Vec<LatLng>),
    Polygons(Vec<Polygon>),
}

#[derive(Debug, Clone)]
struct FeatureBlock {
    header: FeatureBlockHeader,
    tn: TypeAndNamespace,
    range: Range<usize>,
}

/// Features of one blob, looked up by id.
#[derive(Debug)]
pub struct FeaturesById {
    blob: Blob,
    table: NamespaceTable,
    strings: Range<usize>,
    blocks: Vec<FeatureBlock>,
    by_tn: AHashMap<TypeAndNamespace, usize>,
    index: Option<Range<usize>>,
}

impl FeaturesById {
    /// Checks the header and lists the blocks of `blob`.
    pub fn from_blob(blob: Blob) -> Result<Self> {
        let header = Header::unmarshal(&blob)?;
        let table = header.namespaces(&blob)?;
        let strings = header.strings_offset as usize..header.block_offset as usize;
        StringTable::new(&blob[strings.clone()])?;

        let mut feature_blocks = Vec::new();
        let mut by_tn = AHashMap::new();
        let mut index = None;
        for block in blocks(&blob, header.block_offset)? {
            match block.block_type {
                BlockType::Features => {
                    let mut r = Reader::new(&blob[block.start..block.end]);
                    let header = FeatureBlockHeader::unmarshal(&mut r)?;
                    let start = block.start + r.position();
                    Uint64Map::new(&blob[start..block.end])?;
                    let tn = TypeAndNamespace::new(header.feature_type, header.namespace());
                    if table.try_decode(tn.namespace()).is_none() {
                        return Err(Error::corrupt(format!(
                            "block of unknown namespace {}",
                            tn.namespace()
                        )));
                    }
                    by_tn.insert(tn, feature_blocks.len());
                    feature_blocks.push(FeatureBlock {
                        header,
                        tn,
                        range: start..block.end,
                    });
                }
                BlockType::SearchIndex => {
                    if index.is_some() {
                        return Err(Error::corrupt("more than one search index"));
                    }
                    index = Some(block.start..block.end);
                }
            }
        }
        debug!(
            "Opened blob of {} bytes with {} feature blocks",
            blob.len(),
            feature_blocks.len()
        );
        Ok(Self {
            blob,
            table,
            strings,
            blocks: feature_blocks,
            by_tn,
            index,
        })
    }

    pub fn namespaces(&self) -> &NamespaceTable {
        &self.table
    }

    pub fn strings(&self) -> Result<StringTable<'_>> {
        StringTable::new(&self.blob[self.strings.clone()])
    }

    /// Id of a posting list entry of this blob.
    pub fn id_for(&self, (tn, value): PostingKey) -> Option<FeatureId> {
        self.table
            .decode_type_and_namespace(tn)
            .map(|(feature_type, ns)| FeatureId::new(feature_type, ns.clone(), value))
    }

    fn map(&self, block: &FeatureBlock) -> Result<Uint64Map<'_>> {
        Uint64Map::new(&self.blob[block.range.clone()])
    }

    fn stored<'a>(
        &'a self,
        block: &FeatureBlock,
        key: u64,
        tag: u64,
        data: &'a [u8],
    ) -> Result<StoredFeature<'a>> {
        let nss = block.header.namespaces;
        let view = match block.header.feature_type {
            FeatureType::Point => FeatureView::point(data, tag, nss)?,
            FeatureType::Path => FeatureView::path(data, nss)?,
            FeatureType::Area => FeatureView::area(data, nss)?,
            FeatureType::Relation => FeatureView::relation(data, nss)?,
            FeatureType::Invalid => return Err(Error::corrupt("feature of invalid type")),
        };
        let ns = self
            .table
            .try_decode(block.tn.namespace())
            .ok_or_else(|| Error::corrupt("feature of unknown namespace"))?;
        Ok(StoredFeature {
            id: FeatureId::new(block.header.feature_type, ns.clone(), key),
            tn: block.tn,
            tag,
            view,
            features: self,
        })
    }

    /// Looks up `id`, including points only known through references.
    pub fn find_feature(&self, id: &FeatureId) -> Result<Option<StoredFeature<'_>>> {
        let block = match self
            .table
            .maybe_encode(&id.namespace)
            .and_then(|ns| self.by_tn.get(&TypeAndNamespace::new(id.feature_type, ns)))
        {
            Some(&i) => &self.blocks[i],
            None => return Ok(None),
        };
        match self.map(block)?.find_all(id.value)?.first() {
            Some(item) => self.stored(block, id.value, item.tag, item.data).map(Some),
            None => Ok(None),
        }
    }

    /// Whether the blob stores `id` as more than a referenced point.
    pub fn has_feature(&self, id: &FeatureId) -> Result<bool> {
        Ok(self
            .find_feature(id)?
            .map_or(false, |f| !f.is_references_only()))
    }

    /// Calls `f` for every stored feature, block by block.
    pub fn each_feature<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(StoredFeature<'_>) -> Result<()>,
    {
        for block in &self.blocks {
            for group in self.map(block)?.iter() {
                let group = group?;
                for item in &group.items {
                    f(self.stored(block, group.key, item.tag, item.data)?)?;
                }
            }
        }
        Ok(())
    }

    /// Like `each_feature`, calling `f` from the rayon pool.
    pub fn par_each_feature<F>(&self, f: F) -> Result<()>
    where
        F: Fn(StoredFeature<'_>) -> Result<()> + Send + Sync,
    {
        for block in &self.blocks {
            self.map(block)?.par_each_group(|group| {
                for item in &group.items {
                    f(self.stored(block, group.key, item.tag, item.data)?)?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    fn index(&self) -> Result<Option<(TokenMap<'_>, ByteArrays<'_>)>> {
        let range = match &self.index {
            Some(range) => range.clone(),
            None => return Ok(None),
        };
        let data = &self.blob[range];
        let tokens = TokenMap::new(data)?;
        let postings = ByteArrays::new(&data[tokens.byte_len()..])?;
        Ok(Some((tokens, postings)))
    }

    /// Posting list of `token`, if the blob has one.
    pub fn postings(&self, token: &str) -> Result<Option<PostingIterator<'_>>> {
        let (tokens, postings) = match self.index()? {
            Some(index) => index,
            None => return Ok(None),
        };
        for i in tokens.find_possible_indices(token)? {
            let data = postings.item(i)?;
            if posting_list_token_equals(data, token) {
                return PostingIterator::new(data).map(Some);
            }
        }
        Ok(None)
    }

    /// Every token of the search index, in stored order.
    pub fn tokens(&self) -> Result<Vec<String>> {
        let postings = match self.index()? {
            Some((_, postings)) => postings,
            None => return Ok(Vec::new()),
        };
        (0..postings.len())
            .map(|i| Ok(posting_list_token(postings.item(i)?)?.to_string()))
            .collect()
    }
}

/// A feature as stored in a blob. Tags and references are decoded on request.
#[derive(Debug, Clone)]
pub struct StoredFeature<'a> {
    pub id: FeatureId,
    tn: TypeAndNamespace,
    tag: u64,
    view: FeatureView<'a>,
    features: &'a FeaturesById,
}

impl<'a> StoredFeature<'a> {
    pub fn feature_type(&self) -> FeatureType {
        self.id.feature_type
    }

    /// Position of the feature in the posting lists of its blob.
    pub fn posting_key(&self) -> PostingKey {
        (self.tn, self.id.value)
    }

    /// Whether this is a point without location or tags of its own, stored
    /// only because paths or relations reference it.
    pub fn is_references_only(&self) -> bool {
        self.feature_type() == FeatureType::Point && self.tag == POINT_TAG_REFERENCES_ONLY
    }

    /// Decodes all of the feature at once, instead of field by field.
    pub fn decode(&self) -> Result<DecodedFeature> {
        DecodedFeature::unmarshal(
            self.feature_type(),
            self.tag,
            self.view.namespaces(),
            self.view.data(),
        )
    }

    fn reference_id(&self, r: Reference) -> Result<FeatureId> {
        self.features
            .id_for((r.tn, r.value))
            .ok_or_else(|| Error::corrupt(format!("reference to unknown namespace {}", r.tn.0)))
    }

    fn reference_ids(&self, refs: Vec<Reference>) -> Result<Vec<FeatureId>> {
        refs.into_iter().map(|r| self.reference_id(r)).collect()
    }

    /// Value of the tag with string key `key`.
    pub fn tag(&self, key: &str) -> Result<Option<Value>> {
        match self.features.strings()?.find(key) {
            Some(i) => self.view.tags.find(i),
            None => Ok(None),
        }
    }

    /// Value of the string tag `key`.
    pub fn string_tag(&self, key: &str) -> Result<Option<&'a str>> {
        match self.tag(key)? {
            Some(Value::Int(i)) => self.features.strings()?.lookup(i).map(Some),
            _ => Ok(None),
        }
    }

    /// All string tags, without the reserved geometry keys.
    pub fn tags(&self) -> Result<Vec<(&'a str, &'a str)>> {
        let strings = StringTable::new(&self.features.blob[self.features.strings.clone()])?;
        let mut tags = Vec::with_capacity(self.view.tags.len());
        for (key, value) in self.view.tags.strings()? {
            let key = strings.lookup(key)?;
            if key != POINT_KEY && key != PATH_KEY {
                tags.push((key, strings.lookup(value)?));
            }
        }
        Ok(tags)
    }

    /// Location of a point, `None` for other features and referenced points.
    pub fn location(&self) -> Result<Option<LatLng>> {
        if self.feature_type() != FeatureType::Point || self.is_references_only() {
            return Ok(None);
        }
        Ok(match self.tag(POINT_KEY)? {
            Some(Value::LatLng(ll)) => Some(ll),
            _ => None,
        })
    }

    /// Vertices of a path, points as ids.
    pub fn vertices(&self) -> Result<Vec<PathVertex>> {
        if self.feature_type() != FeatureType::Path {
            return Ok(Vec::new());
        }
        let value = self
            .tag(PATH_KEY)?
            .ok_or_else(|| Error::corrupt(format!("{} has no geometry", self.id)))?;
        path_vertices(value)?
            .into_iter()
            .map(|vertex| match vertex {
                Vertex::Reference(r) => self.reference_id(r).map(PathVertex::Point),
                Vertex::LatLng(ll) => Ok(PathVertex::LatLng(ll)),
            })
            .collect()
    }

    /// Polygons of an area, paths as ids.
    pub fn polygons(&self) -> Result<Vec<StoredPolygon>> {
        if self.feature_type() != FeatureType::Area {
            return Ok(Vec::new());
        }
        self.area_geometry()?
            .into_polygons()
            .into_iter()
            .map(|polygon| match polygon {
                PolygonGeometry::Paths(paths) => self.reference_ids(paths).map(StoredPolygon::Paths),
                PolygonGeometry::Loops(loops) => Ok(StoredPolygon::Loops(loops)),
            })
            .collect()
    }

    fn area_geometry(&self) -> Result<AreaGeometry> {
        self.view.area_geometry()
    }

    /// Paths through a point.
    pub fn paths(&self) -> Result<Vec<FeatureId>> {
        match self.feature_type() {
            FeatureType::Point if self.tag == POINT_TAG_COMMON => {
                Ok(vec![self.reference_id(self.view.common_point_path()?)?])
            }
            FeatureType::Point => self.reference_ids(self.view.point_references()?.paths),
            _ => Ok(Vec::new()),
        }
    }

    /// Areas bounded by a path.
    pub fn areas(&self) -> Result<Vec<FeatureId>> {
        match self.feature_type() {
            FeatureType::Path => self.reference_ids(self.view.path_references()?.0),
            _ => Ok(Vec::new()),
        }
    }

    /// Relations the feature is a member of.
    pub fn relations(&self) -> Result<Vec<FeatureId>> {
        let refs = match self.feature_type() {
            FeatureType::Point if self.tag == POINT_TAG_COMMON => Vec::new(),
            FeatureType::Point => self.view.point_references()?.relations,
            FeatureType::Path => self.view.path_references()?.1,
            FeatureType::Area => self.view.area_relations()?,
            FeatureType::Relation => self.view.relation_relations()?,
            FeatureType::Invalid => Vec::new(),
        };
        self.reference_ids(refs)
    }

    /// Members of a relation with their roles.
    pub fn members(&self) -> Result<Vec<(FeatureId, &'a str)>> {
        if self.feature_type() != FeatureType::Relation {
            return Ok(Vec::new());
        }
        let strings = StringTable::new(&self.features.blob[self.features.strings.clone()])?;
        self.view
            .relation_members()?
            .into_iter()
            .map(|member| Ok((self.reference_id(member.id)?, strings.lookup(member.role)?)))
            .collect()
    }
}

/// Vertex of a stored path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathVertex {
    Point(FeatureId),
    LatLng(LatLng),
}

/// Polygon of a stored area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredPolygon {
    Paths(Vec<FeatureId>),
    Loops(Vec<Vec<LatLng>>),
}

/// Blobs stacked on top of each other.
pub struct World {
    blobs: Vec<FeaturesById>,
    cache: Mutex<LruCache<FeatureId, Arc<Geometry>>>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("World").field("blobs", &self.blobs).finish()
    }
}

impl World {
    /// Memory maps the blob at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let blob = Blob::map(path.as_ref()).during("mapping blob")?;
        Self::from_blob(blob)
    }

    pub fn from_blob(blob: Blob) -> Result<Self> {
        Ok(Self {
            blobs: vec![FeaturesById::from_blob(blob)?],
            cache: Mutex::new(LruCache::new(CACHE_ENTRIES)),
        })
    }

    /// Stacks `blob` on top of the blobs so far.
    pub fn merge(&mut self, blob: Blob) -> Result<()> {
        self.blobs.push(FeaturesById::from_blob(blob)?);
        self.cache.lock().clear();
        Ok(())
    }

    pub fn blobs(&self) -> &[FeaturesById] {
        &self.blobs
    }

    /// The feature stored for `id` by the latest blob. Points only referenced
    /// there give way to the point stored by an earlier blob.
    pub fn find_feature_by_id(&self, id: &FeatureId) -> Result<Option<StoredFeature<'_>>> {
        let mut referenced = None;
        for blob in self.blobs.iter().rev() {
            if let Some(feature) = blob.find_feature(id)? {
                if !feature.is_references_only() {
                    return Ok(Some(feature));
                }
                referenced.get_or_insert(feature);
            }
        }
        Ok(referenced)
    }

    pub fn has_feature(&self, id: &FeatureId) -> Result<bool> {
        for blob in self.blobs.iter().rev() {
            if blob.has_feature(id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Location of point `id`.
    pub fn find_location_by_id(&self, id: &FeatureId) -> Result<Option<LatLng>> {
        if id.feature_type != FeatureType::Point {
            return Ok(None);
        }
        for blob in self.blobs.iter().rev() {
            if let Some(feature) = blob.find_feature(id)? {
                if let Some(ll) = feature.location()? {
                    return Ok(Some(ll));
                }
            }
        }
        Ok(None)
    }

    /// Union over all blobs, sorted and without duplicates.
    fn union<F>(&self, id: &FeatureId, f: F) -> Result<Vec<FeatureId>>
    where
        F: Fn(&StoredFeature) -> Result<Vec<FeatureId>>,
    {
        let mut ids = Vec::new();
        for blob in &self.blobs {
            if let Some(feature) = blob.find_feature(id)? {
                ids.extend(f(&feature)?);
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    pub fn find_paths_by_point(&self, id: &FeatureId) -> Result<Vec<FeatureId>> {
        self.union(id, |feature| feature.paths())
    }

    pub fn find_areas_by_path(&self, id: &FeatureId) -> Result<Vec<FeatureId>> {
        self.union(id, |feature| feature.areas())
    }

    pub fn find_relations_by_feature(&self, id: &FeatureId) -> Result<Vec<FeatureId>> {
        self.union(id, |feature| feature.relations())
    }

    /// Calls `f` for every feature, skipping referenced points and features
    /// replaced by a later blob.
    pub fn each_feature<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&StoredFeature) -> Result<()>,
    {
        for (i, blob) in self.blobs.iter().enumerate() {
            let later = &self.blobs[i + 1..];
            blob.each_feature(|feature| {
                if feature.is_references_only() {
                    return Ok(());
                }
                for blob in later {
                    if blob.has_feature(&feature.id)? {
                        return Ok(());
                    }
                }
                f(&feature)
            })?;
        }
        Ok(())
    }

    /// Decodes every feature stored in any blob, and returns their number.
    pub fn verify(&self) -> Result<u64> {
        let count = AtomicU64::new(0);
        for blob in &self.blobs {
            blob.par_each_feature(|feature| {
                feature
                    .decode()
                    .map_err(|e| Error::corrupt(format!("{}: {}", feature.id, e)))?;
                count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })?;
        }
        Ok(count.into_inner())
    }

    /// Distinct tokens of all search indices, sorted.
    pub fn tokens(&self) -> Result<Vec<String>> {
        let mut tokens = Vec::new();
        for blob in &self.blobs {
            tokens.extend(blob.tokens()?);
        }
        tokens.sort_unstable();
        tokens.dedup();
        Ok(tokens)
    }

    /// Posting lists of `token`, one per blob indexing it.
    pub fn postings(&self, token: &str) -> Result<Vec<PostingIterator<'_>>> {
        let mut postings = Vec::new();
        for blob in &self.blobs {
            postings.extend(blob.postings(token)?);
        }
        Ok(postings)
    }

    /// Ids of the features indexed under `token` in any blob, in `compare`
    /// order and without duplicates.
    pub fn search(&self, token: &str) -> Result<impl Iterator<Item = FeatureId> + '_> {
        let mut lists = Vec::new();
        for blob in &self.blobs {
            if let Some(postings) = blob.postings(token)? {
                lists.push(postings.filter_map(move |key| blob.id_for(key)));
            }
        }
        Ok(lists.into_iter().kmerge().dedup())
    }

    /// Geometry of a path or an area, resolved through all blobs.
    pub fn geometry(&self, id: &FeatureId) -> Result<Option<Arc<Geometry>>> {
        if let Some(geometry) = self.cache.lock().get(id) {
            return Ok(Some(geometry.clone()));
        }
        let feature = match self.find_feature_by_id(id)? {
            Some(feature) => feature,
            None => return Ok(None),
        };
        let geometry = match feature.feature_type() {
            FeatureType::Path => self.resolve_polyline(&feature, self)?.map(Geometry::Polyline),
            FeatureType::Area => self.resolve_polygons(&feature, self)?.map(Geometry::Polygons),
            _ => None,
        };
        Ok(geometry.map(|geometry| {
            let geometry = Arc::new(geometry);
            self.cache.lock().put(id.clone(), geometry.clone());
            geometry
        }))
    }

    /// Vertices of path `id`.
    pub fn polyline(&self, id: &FeatureId) -> Result<Option<Vec<LatLng>>> {
        Ok(match self.geometry(id)?.as_deref() {
            Some(Geometry::Polyline(polyline)) => Some(polyline.clone()),
            _ => None,
        })
    }

    /// Polygons of area `id`, outer boundaries counter clockwise.
    pub fn polygons(&self, id: &FeatureId) -> Result<Option<Vec<Polygon>>> {
        Ok(match self.geometry(id)?.as_deref() {
            Some(Geometry::Polygons(polygons)) => Some(polygons.clone()),
            _ => None,
        })
    }

    /// Vertices of `path`, `None` if a point can't be located.
    pub(crate) fn resolve_polyline(
        &self,
        path: &StoredFeature,
        locations: &dyn LocationsById,
    ) -> Result<Option<Vec<LatLng>>> {
        Ok(path
            .vertices()?
            .into_iter()
            .map(|vertex| match vertex {
                PathVertex::Point(id) => locations.find_location_by_id(&id),
                PathVertex::LatLng(ll) => Some(ll),
            })
            .collect())
    }

    /// Polygons of `area`, `None` if a path or point can't be resolved.
    pub(crate) fn resolve_polygons(
        &self,
        area: &StoredFeature,
        locations: &dyn LocationsById,
    ) -> Result<Option<Vec<Polygon>>> {
        let mut polygons = Vec::new();
        for polygon in area.polygons()? {
            let mut loops = match polygon {
                StoredPolygon::Loops(loops) => loops,
                StoredPolygon::Paths(paths) => {
                    let mut loops = Vec::with_capacity(paths.len());
                    for id in &paths {
                        let path = match self.find_feature_by_id(id)? {
                            Some(path) => path,
                            None => return Ok(None),
                        };
                        match self.resolve_polyline(&path, locations)? {
                            Some(polyline) => loops.push(open_ring(polyline)),
                            None => return Ok(None),
                        }
                    }
                    loops
                }
            };
            orient_polygon(&mut loops);
            polygons.push(loops);
        }
        Ok(Some(polygons))
    }

    /// Bounding box of a feature. Relations are bounded by their direct
    /// members.
    pub(crate) fn bounds(
        &self,
        feature: &StoredFeature,
        locations: &dyn LocationsById,
    ) -> Result<Option<Bounds>> {
        Ok(match feature.feature_type() {
            FeatureType::Point => feature
                .location()?
                .or_else(|| locations.find_location_by_id(&feature.id))
                .map(Bounds::from_point),
            FeatureType::Path => self
                .resolve_polyline(feature, locations)?
                .and_then(|polyline| Bounds::from_points(&polyline)),
            FeatureType::Area => self
                .resolve_polygons(feature, locations)?
                .and_then(|polygons| Bounds::from_points(polygons.iter().flatten().flatten())),
            FeatureType::Relation => {
                let mut bounds: Option<Bounds> = None;
                for (id, _) in feature.members()? {
                    if id.feature_type == FeatureType::Relation {
                        continue;
                    }
                    let member = match self.find_feature_by_id(&id)? {
                        Some(member) => self.bounds(&member, locations)?,
                        None if id.feature_type == FeatureType::Point => {
                            locations.find_location_by_id(&id).map(Bounds::from_point)
                        }
                        None => None,
                    };
                    if let Some(member) = member {
                        match &mut bounds {
                            Some(bounds) => {
                                bounds.extend(member.lo);
                                bounds.extend(member.hi);
                            }
                            None => bounds = Some(member),
                        }
                    }
                }
                bounds
            }
            FeatureType::Invalid => None,
        })
    }
}

impl LocationsById for World {
    fn find_location_by_id(&self, id: &FeatureId) -> Option<LatLng> {
        match World::find_location_by_id(self, id) {
            Ok(ll) => ll,
            Err(e) => {
                warn!("Failed to read location of {}: {}", id, e);
                None
            }
        }
    }
}
