//! Path, area and relation blocks.

use super::{
    encode_tags, write_block_headers, Blocks, BuildContext, BuildStats, FeatureBlockBuilder, Phase,
};
use crate::error::{Error, Result};
use crate::features::{
    path_geometry_value, Area, AreaGeometry, Member, Path, PolygonGeometry, Relation, PATH_KEY,
};
use crate::geometry::{is_valid_loop, open_ring, orient_polygon};
use crate::ids::{FeatureId, FeatureType, Namespaces, TypeAndNamespace};
use crate::output::ReadWriteAt;
use crate::source::{
    AreaFeature, Feature, FeatureSource, LocationsById, PathFeature, ReadOptions, RelationFeature,
    SourcePolygon, SourceVertex,
};
use crate::values::{LatLng, Reference, Tag, Vertex};

use ahash::AHashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;

use std::sync::atomic::{AtomicU64, Ordering};

/// Decides which features are stored.
pub trait Validity: Send + Sync {
    /// `vertices` are the resolved locations of the path, including the
    /// closing vertex of closed paths.
    fn path(&self, id: &FeatureId, vertices: &[LatLng], closed: bool) -> bool;

    /// `loops` are the loops of one polygon, outer boundary first, without
    /// their closing vertex.
    fn area(&self, id: &FeatureId, loops: &[Vec<LatLng>]) -> bool;
}

/// Paths need two distinct vertices, loops need to enclose a region.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultValidity;

impl Validity for DefaultValidity {
    fn path(&self, _id: &FeatureId, vertices: &[LatLng], _closed: bool) -> bool {
        vertices.len() >= 2 && vertices.iter().any(|v| *v != vertices[0])
    }

    fn area(&self, _id: &FeatureId, loops: &[Vec<LatLng>]) -> bool {
        !loops.is_empty() && loops.iter().all(|l| is_valid_loop(l))
    }
}

/// What `Validator::area` decided.
#[derive(Debug, PartialEq, Eq)]
enum AreaState {
    Ready,
    Invalid,
    /// Queued until all its paths are known.
    Waiting,
}

#[derive(Debug)]
struct Waiting {
    area: AreaFeature,
    unknown: usize,
}

#[derive(Debug, Default)]
struct ValidatorState {
    /// Whether a path may be used as an area boundary.
    paths: AHashMap<FeatureId, bool>,
    /// Indices into `areas` waiting for a path.
    waiting: AHashMap<FeatureId, Vec<usize>>,
    areas: Vec<Option<Waiting>>,
}

/// Holds back areas made of paths until every one of their paths was seen.
///
/// Paths and areas arrive in any order from concurrent workers. A path is
/// either a usable boundary or not; an area is ready once all its paths are
/// usable, and invalid as soon as one of them isn't.
#[derive(Debug, Default)]
struct Validator {
    state: Mutex<ValidatorState>,
}

impl Validator {
    /// Records whether path `id` is usable, returning the areas that became
    /// ready and the ids of the areas that became invalid.
    fn path_known(&self, id: &FeatureId, usable: bool) -> (Vec<AreaFeature>, Vec<FeatureId>) {
        let mut state = self.state.lock();
        state.paths.insert(id.clone(), usable);
        let (mut ready, mut invalid) = (Vec::new(), Vec::new());
        for i in state.waiting.remove(id).unwrap_or_default() {
            let slot = &mut state.areas[i];
            if !usable {
                if let Some(waiting) = slot.take() {
                    invalid.push(waiting.area.id);
                }
            } else if let Some(waiting) = slot {
                waiting.unknown -= 1;
                if waiting.unknown == 0 {
                    if let Some(waiting) = slot.take() {
                        ready.push(waiting.area);
                    }
                }
            }
        }
        (ready, invalid)
    }

    fn area(&self, area: &AreaFeature) -> AreaState {
        let mut paths: Vec<&FeatureId> = area.paths().collect();
        paths.sort_unstable();
        paths.dedup();

        let mut state = self.state.lock();
        let mut unknown = Vec::new();
        for path in paths {
            match state.paths.get(path) {
                Some(false) => return AreaState::Invalid,
                Some(true) => {}
                None => unknown.push(path),
            }
        }
        if unknown.is_empty() {
            return AreaState::Ready;
        }
        let i = state.areas.len();
        state.areas.push(Some(Waiting {
            area: area.clone(),
            unknown: unknown.len(),
        }));
        for path in unknown {
            state.waiting.entry(path.clone()).or_default().push(i);
        }
        AreaState::Waiting
    }

    /// Number of areas still waiting for a path.
    fn finish(&self) -> usize {
        self.state.lock().areas.iter().flatten().count()
    }
}

#[derive(Default)]
struct Emitted {
    paths: AtomicU64,
    areas: AtomicU64,
    relations: AtomicU64,
}

/// One run of the emission logic, either reserving or writing.
struct Pass<'a> {
    context: &'a BuildContext<'a>,
    locations: &'a dyn LocationsById,
    blocks: &'a Blocks,
    phase: Phase<'a>,
    validator: Validator,
    invalid: Mutex<Vec<FeatureId>>,
    emitted: Emitted,
}

impl<'a> Pass<'a> {
    fn new(
        context: &'a BuildContext<'a>,
        locations: &'a dyn LocationsById,
        blocks: &'a Blocks,
        phase: Phase<'a>,
    ) -> Self {
        Self {
            context,
            locations,
            blocks,
            phase,
            validator: Validator::default(),
            invalid: Mutex::new(Vec::new()),
            emitted: Emitted::default(),
        }
    }

    /// Encodes a feature with `marshal` against the namespaces of its block
    /// and stores it there.
    fn put<F>(&self, id: &FeatureId, worker: usize, marshal: F) -> Result<()>
    where
        F: FnOnce(&Namespaces, &mut Vec<u8>),
    {
        let block = self.blocks.get(&self.context.tn(id)).ok_or_else(|| {
            Error::Reservation(format!("no block for {}", id))
        })?;
        self.context.buffers.with(worker, |buffer| {
            marshal(block.namespaces(), buffer);
            block.put(self.phase, id.value, 0, buffer)
        })
    }

    fn invalid(&self, id: &FeatureId) {
        debug!("Dropping invalid {}", id);
        self.invalid.lock().push(id.clone());
    }

    fn references<'i>(&self, ids: impl Iterator<Item = &'i FeatureId>) -> Vec<Reference> {
        ids.map(|id| self.context.reference(id)).collect()
    }

    fn emit(&self, feature: &Feature, worker: usize) -> Result<()> {
        match feature {
            Feature::Path(path) => self.path(path, worker),
            Feature::Area(area) => match self.validator.area(area) {
                AreaState::Ready => self.area(area, worker),
                AreaState::Invalid => {
                    self.invalid(&area.id);
                    Ok(())
                }
                AreaState::Waiting => Ok(()),
            },
            Feature::Relation(relation) => self.relation(relation, worker),
            Feature::Point(_) => Ok(()),
        }
    }

    fn path(&self, path: &PathFeature, worker: usize) -> Result<()> {
        let context = self.context;
        let mut vertices = Vec::with_capacity(path.vertices.len());
        let mut locations = Vec::with_capacity(path.vertices.len());
        for vertex in &path.vertices {
            match vertex {
                SourceVertex::Point(id) => match self.locations.find_location_by_id(id) {
                    Some(ll) => {
                        vertices.push(Vertex::Reference(context.reference(id)));
                        locations.push(ll);
                    }
                    None => {
                        debug!("{} references missing point {}", path.id, id);
                        locations.clear();
                        break;
                    }
                },
                SourceVertex::LatLng(ll) => {
                    vertices.push(Vertex::LatLng(*ll));
                    locations.push(*ll);
                }
            }
        }
        let closed = path.is_closed();
        let valid = locations.len() == path.vertices.len()
            && context.options.validity.path(&path.id, &locations, closed);

        if valid {
            let mut tags = Vec::with_capacity(path.tags.len() + 1);
            tags.push(Tag::new(
                context.strings.lookup(PATH_KEY),
                path_geometry_value(vertices),
            ));
            tags.extend(encode_tags(&path.tags, context.strings));
            let encoded = Path {
                tags,
                areas: self.references(context.summary.path_areas.targets(&path.id)),
                relations: self.references(context.summary.member_relations.targets(&path.id)),
            };
            self.put(&path.id, worker, |nss, buffer| encoded.marshal(nss, buffer))?;
            self.emitted.paths.fetch_add(1, Ordering::Relaxed);
        } else {
            self.invalid(&path.id);
        }

        if context.summary.path_areas.targets(&path.id).next().is_some() {
            let usable = valid
                && context.summary.closed_paths.contains(&path.id)
                && context
                    .options
                    .validity
                    .area(&path.id, &[open_ring(locations)]);
            let (ready, invalid) = self.validator.path_known(&path.id, usable);
            for area in &ready {
                self.area(area, worker)?;
            }
            for id in &invalid {
                self.invalid(id);
            }
        }
        Ok(())
    }

    fn area(&self, area: &AreaFeature, worker: usize) -> Result<()> {
        let context = self.context;
        let mut polygons = Vec::with_capacity(area.polygons.len());
        for polygon in &area.polygons {
            match polygon {
                SourcePolygon::Paths(paths) if !paths.is_empty() => {
                    polygons.push(PolygonGeometry::Paths(self.references(paths.iter())));
                }
                SourcePolygon::Loops(loops) if !loops.is_empty() => {
                    let mut loops: Vec<Vec<LatLng>> =
                        loops.iter().cloned().map(open_ring).collect();
                    orient_polygon(&mut loops);
                    if !context.options.validity.area(&area.id, &loops) {
                        self.invalid(&area.id);
                        return Ok(());
                    }
                    polygons.push(PolygonGeometry::Loops(loops));
                }
                _ => {
                    self.invalid(&area.id);
                    return Ok(());
                }
            }
        }
        if polygons.is_empty() {
            self.invalid(&area.id);
            return Ok(());
        }

        let encoded = Area {
            tags: encode_tags(&area.tags, context.strings),
            geometry: AreaGeometry::from_polygons(polygons),
            relations: self.references(context.summary.member_relations.targets(&area.id)),
        };
        self.put(&area.id, worker, |nss, buffer| encoded.marshal(nss, buffer))?;
        self.emitted.areas.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn relation(&self, relation: &RelationFeature, worker: usize) -> Result<()> {
        let context = self.context;
        let encoded = Relation {
            tags: encode_tags(&relation.tags, context.strings),
            members: relation
                .members
                .iter()
                .map(|member| Member {
                    role: context.strings.lookup(&member.role),
                    id: context.reference(&member.id),
                })
                .collect(),
            relations: self.references(context.summary.member_relations.targets(&relation.id)),
        };
        self.put(&relation.id, worker, |nss, buffer| encoded.marshal(nss, buffer))?;
        self.emitted.relations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn run(&self, source: &dyn FeatureSource) -> Result<()> {
        let options = ReadOptions {
            skip_points: true,
            ..Default::default()
        };
        source.read(&options, &|feature, worker| self.emit(feature, worker))
    }

    fn into_invalid(self) -> Vec<FeatureId> {
        let mut invalid = self.invalid.into_inner();
        invalid.sort_unstable();
        invalid.dedup();
        invalid
    }
}

/// Writes the path, area and relation blocks at `offset`, returning the
/// offset after them.
pub(crate) fn build_features(
    context: &BuildContext,
    source: &dyn FeatureSource,
    locations: &dyn LocationsById,
    w: &dyn ReadWriteAt,
    offset: u64,
    stats: &mut BuildStats,
) -> Result<u64> {
    let mut blocks = Blocks::new();
    for (ns, counts) in &context.summary.counts {
        let code = context.table.encode(ns);
        for feature_type in [FeatureType::Path, FeatureType::Area, FeatureType::Relation] {
            let count = counts.features(feature_type);
            if count > 0 {
                blocks.insert(
                    TypeAndNamespace::new(feature_type, code),
                    FeatureBlockBuilder::new(feature_type, code, context.nss, count, 0),
                );
            }
        }
    }

    let reserve = Pass::new(context, locations, &blocks, Phase::Reserve);
    reserve.run(source)?;
    let incomplete = reserve.validator.finish();
    let invalid = reserve.into_invalid();
    if !invalid.is_empty() {
        if context.options.fail_invalid_features {
            return Err(Error::InvalidFeatures(invalid));
        }
        warn!("Dropped {} invalid features", invalid.len());
    }
    if incomplete > 0 {
        info!("Dropped {} areas with missing paths", incomplete);
    }

    let end = write_block_headers(&mut blocks, w, offset)?;
    let write = Pass::new(context, locations, &blocks, Phase::Write(w));
    write.run(source)?;
    for block in blocks.values() {
        block.canonicalize(w)?;
    }

    stats.paths = write.emitted.paths.load(Ordering::Relaxed);
    stats.areas = write.emitted.areas.load(Ordering::Relaxed);
    stats.relations = write.emitted.relations.load(Ordering::Relaxed);
    stats.invalid_features = invalid.len() as u64;
    stats.incomplete_areas = incomplete as u64;
    info!(
        "Features: {} paths, {} areas, {} relations",
        stats.paths, stats.areas, stats.relations
    );
    Ok(end)
}
