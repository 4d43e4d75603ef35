//! Point blocks.
//!
//! Points need to know every path and relation referencing them, but those
//! come later in the source, or never for points missing from it. A scratch
//! map keyed by point id collects the point payload and one record per
//! reference first; combining each key's records then yields the stored
//! point.

use super::{
    encode_tags, write_block_headers, Blocks, BuildContext, BuildStats, FeatureBlockBuilder, Phase,
};
use crate::error::{Context, Error, Result};
use crate::features::{
    CommonPoint, FullPoint, PointReferences, POINT_KEY, POINT_TAG_BITS, POINT_TAG_COMMON,
    POINT_TAG_FULL, POINT_TAG_REFERENCES_ONLY,
};
use crate::ids::{FeatureId, FeatureType, NamespaceCode, Namespaces, TypeAndNamespace};
use crate::output::{Output, ReadWriteAt};
use crate::source::{
    current_worker, Feature, FeatureSource, LocationsById, ReadOptions, SourceTag,
};
use crate::uint64map::{bucket_bits_for_count, Group, Uint64Map, Uint64MapBuilder};
use crate::values::{marshal_tags, unmarshal_tags, LatLng, MarshalledTags, Reference, Tag, Value};
use crate::varint::Reader;

use ahash::AHashMap;
use log::{debug, info};

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

/// Scratch entry tags.
const SCRATCH_POINT: u64 = 0;
const SCRATCH_PATH: u64 = 1;
const SCRATCH_RELATION: u64 = 2;
const SCRATCH_TAG_BITS: u8 = 2;

/// Point namespaces with their number of point entries, in code order.
///
/// Scratch maps are written one after another in this order.
fn point_namespaces(context: &BuildContext) -> BTreeMap<NamespaceCode, u64> {
    context
        .summary
        .counts
        .iter()
        .filter(|(_, counts)| counts.point_entries() > 0)
        .map(|(ns, counts)| (context.table.encode(ns), counts.point_entries()))
        .collect()
}

/// Scratch maps by point namespace code.
struct Scratch {
    maps: BTreeMap<NamespaceCode, Uint64MapBuilder>,
}

impl Scratch {
    fn new(context: &BuildContext) -> Self {
        let maps = point_namespaces(context)
            .into_iter()
            .map(|(ns, entries)| {
                let bits = bucket_bits_for_count(entries);
                (ns, Uint64MapBuilder::new(bits, SCRATCH_TAG_BITS))
            })
            .collect();
        Self { maps }
    }

    fn put(
        &self,
        context: &BuildContext,
        phase: Phase,
        id: &FeatureId,
        tag: u64,
        data: &[u8],
    ) -> Result<()> {
        let ns = context.table.encode(&id.namespace);
        let map = self.maps.get(&ns).ok_or_else(|| {
            Error::Reservation(format!("no scratch map for point {}", id))
        })?;
        match phase {
            Phase::Reserve => {
                map.reserve(id.value, tag, data.len());
                Ok(())
            }
            Phase::Write(w) => map.write_item(w, id.value, tag, data),
        }
    }

    fn emit(
        &self,
        context: &BuildContext,
        phase: Phase,
        feature: &Feature,
        worker: usize,
    ) -> Result<()> {
        match feature {
            Feature::Point(point) => {
                let tags = point_tags(context, point.location, &point.tags);
                context.buffers.with(worker, |buffer| {
                    marshal_tags(&tags, TypeAndNamespace::INVALID, buffer);
                    self.put(context, phase, &point.id, SCRATCH_POINT, buffer)
                })
            }
            Feature::Path(path) => {
                let reference = context.reference(&path.id);
                context.buffers.with(worker, |buffer| {
                    reference.marshal(TypeAndNamespace::INVALID, buffer);
                    for id in path.points() {
                        self.put(context, phase, id, SCRATCH_PATH, buffer)?;
                    }
                    Ok(())
                })
            }
            Feature::Relation(relation) => {
                let reference = context.reference(&relation.id);
                context.buffers.with(worker, |buffer| {
                    reference.marshal(TypeAndNamespace::INVALID, buffer);
                    for member in &relation.members {
                        if member.id.feature_type == FeatureType::Point {
                            self.put(context, phase, &member.id, SCRATCH_RELATION, buffer)?;
                        }
                    }
                    Ok(())
                })
            }
            Feature::Area(_) => Ok(()),
        }
    }

    /// Writes all scratch maps from offset 0, returning their ranges.
    fn write(
        &mut self,
        context: &BuildContext,
        source: &dyn FeatureSource,
        w: &dyn ReadWriteAt,
    ) -> Result<BTreeMap<NamespaceCode, Range<usize>>> {
        let options = ReadOptions {
            skip_areas: true,
            ..Default::default()
        };
        source.read(&options, &|feature, worker| {
            self.emit(context, Phase::Reserve, feature, worker)
        })?;

        let mut ranges = BTreeMap::new();
        let mut offset = 0;
        for (&ns, map) in self.maps.iter_mut() {
            let end = map.write_header(w, offset)?;
            ranges.insert(ns, offset as usize..end as usize);
            offset = end;
        }

        source.read(&options, &|feature, worker| {
            self.emit(context, Phase::Write(w), feature, worker)
        })?;
        for map in self.maps.values() {
            map.canonicalize(w)?;
        }
        Ok(ranges)
    }
}

/// Tags of a point, with its location under `POINT_KEY` first.
fn point_tags(context: &BuildContext, location: LatLng, tags: &[SourceTag]) -> Vec<Tag> {
    let mut encoded = Vec::with_capacity(tags.len() + 1);
    encoded.push(Tag::new(
        context.strings.lookup(POINT_KEY),
        Value::LatLng(location),
    ));
    encoded.extend(encode_tags(tags, context.strings));
    encoded
}

/// Stored form of the scratch records of one point.
fn combine(nss: &Namespaces, group: &Group, buffer: &mut Vec<u8>) -> Result<u64> {
    let mut tags = None;
    let mut references = PointReferences::default();
    for item in &group.items {
        let mut r = Reader::new(item.data);
        match item.tag {
            SCRATCH_POINT => {
                if tags.is_none() {
                    tags = Some(unmarshal_tags(TypeAndNamespace::INVALID, &mut r)?);
                }
            }
            SCRATCH_PATH => references
                .paths
                .push(Reference::unmarshal(TypeAndNamespace::INVALID, &mut r)?),
            SCRATCH_RELATION => references
                .relations
                .push(Reference::unmarshal(TypeAndNamespace::INVALID, &mut r)?),
            tag => return Err(Error::corrupt(format!("scratch tag {}", tag))),
        }
    }
    references.paths.sort_unstable();
    references.paths.dedup();
    references.relations.sort_unstable();
    references.relations.dedup();

    Ok(match tags {
        Some(tags) if references.paths.len() == 1 && references.relations.is_empty() => {
            let point = CommonPoint {
                tags,
                path: references.paths[0],
            };
            point.marshal(nss, buffer);
            POINT_TAG_COMMON
        }
        Some(tags) => {
            FullPoint { tags, references }.marshal(nss, buffer);
            POINT_TAG_FULL
        }
        None => {
            references.marshal(nss, buffer);
            POINT_TAG_REFERENCES_ONLY
        }
    })
}

#[derive(Default)]
struct PointCounts {
    common: AtomicU64,
    full: AtomicU64,
    references_only: AtomicU64,
}

fn emit_combined(
    context: &BuildContext,
    block: &FeatureBlockBuilder,
    phase: Phase,
    group: &Group,
    counts: &PointCounts,
) -> Result<()> {
    let worker = current_worker();
    context.buffers.with(worker, |buffer| {
        let tag = combine(block.namespaces(), group, buffer)?;
        if let Phase::Write(_) = phase {
            let counter = match tag {
                POINT_TAG_COMMON => &counts.common,
                POINT_TAG_FULL => &counts.full,
                _ => &counts.references_only,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        block.put(phase, group.key, tag, buffer)
    })
}

/// Writes the point blocks at `offset`, returning the offset after them.
///
/// The scratch maps are written to `scratch`, which is kept for resolving
/// locations in the following passes.
pub(crate) fn build_points(
    context: &BuildContext,
    source: &dyn FeatureSource,
    scratch: &dyn Output,
    w: &dyn ReadWriteAt,
    offset: u64,
    stats: &mut BuildStats,
) -> Result<u64> {
    let scratch_w = scratch.write().during("opening point scratch")?;
    let mut maps = Scratch::new(context);
    let ranges = maps.write(context, source, &*scratch_w)?;
    drop(scratch_w);
    let scratch_blob = scratch.bytes().during("reading point scratch")?;
    debug!("Point scratch is {} bytes", scratch_blob.len());

    let mut blocks = Blocks::new();
    for (&ns, range) in &ranges {
        let map = Uint64Map::new(&scratch_blob[range.clone()])?;
        let count = context.summary.counts(context.table.decode(ns)).point_entries();
        blocks.insert(
            TypeAndNamespace::new(FeatureType::Point, ns),
            FeatureBlockBuilder::new(
                FeatureType::Point,
                ns,
                context.nss,
                count,
                POINT_TAG_BITS,
            ),
        );
        debug!("Point scratch {}: {} buckets", ns, map.buckets());
    }

    let counts = PointCounts::default();
    let each = |phase: Phase, blocks: &Blocks| -> Result<()> {
        for (&ns, range) in &ranges {
            let map = Uint64Map::new(&scratch_blob[range.clone()])?;
            let block = &blocks[&TypeAndNamespace::new(FeatureType::Point, ns)];
            map.par_each_group(|group| emit_combined(context, block, phase, &group, &counts))?;
        }
        Ok(())
    };
    each(Phase::Reserve, &blocks)?;
    let end = write_block_headers(&mut blocks, w, offset)?;
    each(Phase::Write(w), &blocks)?;
    for block in blocks.values() {
        block.canonicalize(w)?;
    }

    stats.points = counts.common.load(Ordering::Relaxed) + counts.full.load(Ordering::Relaxed);
    stats.referenced_points = counts.references_only.load(Ordering::Relaxed);
    info!(
        "Points: {} common, {} full, {} only referenced",
        counts.common.load(Ordering::Relaxed),
        counts.full.load(Ordering::Relaxed),
        stats.referenced_points
    );
    Ok(end)
}

/// Point locations from the scratch maps, falling back to a base world.
pub(crate) struct ScratchLocations<'a> {
    context: &'a BuildContext<'a>,
    maps: AHashMap<NamespaceCode, Uint64Map<'a>>,
    point_key: Option<u64>,
    base: &'a dyn LocationsById,
}

impl<'a> ScratchLocations<'a> {
    /// Opens the scratch maps written by `build_points` to `scratch`.
    pub fn new(
        context: &'a BuildContext<'a>,
        scratch: &'a [u8],
        base: &'a dyn LocationsById,
    ) -> Result<Self> {
        let mut maps = AHashMap::new();
        let mut offset = 0;
        for ns in point_namespaces(context).into_keys() {
            let map = Uint64Map::new(&scratch[offset..])?;
            offset += map.byte_len();
            maps.insert(ns, map);
        }
        Ok(Self {
            context,
            maps,
            point_key: context.strings.get(POINT_KEY),
            base,
        })
    }

    fn find_scratch(&self, id: &FeatureId) -> Result<Option<LatLng>> {
        let point_key = match self.point_key {
            Some(key) => key,
            None => return Ok(None),
        };
        let map = match self
            .context
            .table
            .maybe_encode(&id.namespace)
            .and_then(|ns| self.maps.get(&ns))
        {
            Some(map) => map,
            None => return Ok(None),
        };
        let data = match map.find_first_with_tag(id.value, SCRATCH_POINT)? {
            Some(data) => data,
            None => return Ok(None),
        };
        let tags = MarshalledTags::read(TypeAndNamespace::INVALID, &mut Reader::new(data))?;
        Ok(match tags.find(point_key)? {
            Some(Value::LatLng(ll)) => Some(ll),
            _ => None,
        })
    }
}

impl<'a> LocationsById for ScratchLocations<'a> {
    fn find_location_by_id(&self, id: &FeatureId) -> Option<LatLng> {
        if id.feature_type != FeatureType::Point {
            return None;
        }
        match self.find_scratch(id) {
            Ok(Some(ll)) => Some(ll),
            Ok(None) => self.base.find_location_by_id(id),
            Err(e) => {
                debug!("Failed to read location of {}: {}", id, e);
                None
            }
        }
    }
}
