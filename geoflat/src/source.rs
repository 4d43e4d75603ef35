//! Features as they come from a source, before encoding.

use crate::error::Result;
use crate::ids::{FeatureId, FeatureType};
use crate::values::LatLng;

use rayon::prelude::*;

/// Plain string tag of a source feature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceTag {
    pub key: String,
    pub value: String,
}

impl SourceTag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Vertex of a path: a reference to a point feature, or a bare location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceVertex {
    Point(FeatureId),
    LatLng(LatLng),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointFeature {
    pub id: FeatureId,
    pub location: LatLng,
    pub tags: Vec<SourceTag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFeature {
    pub id: FeatureId,
    pub tags: Vec<SourceTag>,
    pub vertices: Vec<SourceVertex>,
}

impl PathFeature {
    /// Whether the path ends where it starts.
    pub fn is_closed(&self) -> bool {
        self.vertices.len() > 2 && self.vertices.first() == self.vertices.last()
    }

    /// Point features the path passes through, without the duplicated last
    /// vertex of a closed path.
    pub fn points(&self) -> impl Iterator<Item = &FeatureId> {
        let n = if self.is_closed() {
            self.vertices.len() - 1
        } else {
            self.vertices.len()
        };
        self.vertices[..n].iter().filter_map(|v| match v {
            SourceVertex::Point(id) => Some(id),
            SourceVertex::LatLng(_) => None,
        })
    }
}

/// One polygon of an area: an outer boundary followed by holes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcePolygon {
    /// Closed paths, the first one is the outer boundary.
    Paths(Vec<FeatureId>),
    /// Explicit loops, without repeating the first vertex.
    Loops(Vec<Vec<LatLng>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaFeature {
    pub id: FeatureId,
    pub tags: Vec<SourceTag>,
    pub polygons: Vec<SourcePolygon>,
}

impl AreaFeature {
    pub fn paths(&self) -> impl Iterator<Item = &FeatureId> {
        self.polygons.iter().flat_map(|polygon| match polygon {
            SourcePolygon::Paths(paths) => paths.as_slice(),
            SourcePolygon::Loops(_) => &[][..],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMember {
    pub id: FeatureId,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationFeature {
    pub id: FeatureId,
    pub tags: Vec<SourceTag>,
    pub members: Vec<SourceMember>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feature {
    Point(PointFeature),
    Path(PathFeature),
    Area(AreaFeature),
    Relation(RelationFeature),
}

impl Feature {
    pub fn id(&self) -> &FeatureId {
        match self {
            Feature::Point(p) => &p.id,
            Feature::Path(p) => &p.id,
            Feature::Area(a) => &a.id,
            Feature::Relation(r) => &r.id,
        }
    }

    pub fn tags(&self) -> &[SourceTag] {
        match self {
            Feature::Point(p) => &p.tags,
            Feature::Path(p) => &p.tags,
            Feature::Area(a) => &a.tags,
            Feature::Relation(r) => &r.tags,
        }
    }

    pub fn feature_type(&self) -> FeatureType {
        self.id().feature_type
    }

    /// Copy of the feature without its tags.
    pub fn without_tags(&self) -> Feature {
        let mut feature = self.clone();
        match &mut feature {
            Feature::Point(p) => p.tags.clear(),
            Feature::Path(p) => p.tags.clear(),
            Feature::Area(a) => a.tags.clear(),
            Feature::Relation(r) => r.tags.clear(),
        }
        feature
    }
}

/// Restricts what a `FeatureSource` emits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub skip_points: bool,
    pub skip_paths: bool,
    pub skip_areas: bool,
    pub skip_relations: bool,
    /// Emit features with empty tags.
    pub skip_tags: bool,
}

impl ReadOptions {
    pub fn skips(&self, feature_type: FeatureType) -> bool {
        match feature_type {
            FeatureType::Point => self.skip_points,
            FeatureType::Path => self.skip_paths,
            FeatureType::Area => self.skip_areas,
            FeatureType::Relation => self.skip_relations,
            FeatureType::Invalid => true,
        }
    }

    /// Only features of the given types.
    pub fn only(types: &[FeatureType]) -> Self {
        Self {
            skip_points: !types.contains(&FeatureType::Point),
            skip_paths: !types.contains(&FeatureType::Path),
            skip_areas: !types.contains(&FeatureType::Area),
            skip_relations: !types.contains(&FeatureType::Relation),
            skip_tags: false,
        }
    }
}

/// Callback receiving features together with the index of the calling
/// worker thread.
pub type Emit<'a> = dyn Fn(&Feature, usize) -> Result<()> + Send + Sync + 'a;

/// Something features can be read from, any number of times.
///
/// `read` may call `emit` concurrently from several threads, in any order.
/// The first error returned by `emit` aborts the read and is returned.
pub trait FeatureSource: Send + Sync {
    fn read(&self, options: &ReadOptions, emit: &Emit) -> Result<()>;
}

/// Resolves the location of point features.
pub trait LocationsById: Send + Sync {
    fn find_location_by_id(&self, id: &FeatureId) -> Option<LatLng>;
}

/// Resolves nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocations;

impl LocationsById for NoLocations {
    fn find_location_by_id(&self, _id: &FeatureId) -> Option<LatLng> {
        None
    }
}

/// Index of the rayon worker running the current task.
pub fn current_worker() -> usize {
    rayon::current_thread_index().unwrap_or(0)
}

/// Features held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    features: Vec<Feature>,
}

impl MemorySource {
    pub fn new(features: Vec<Feature>) -> Self {
        Self { features }
    }

    pub fn push(&mut self, feature: Feature) {
        self.features.push(feature);
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

impl FeatureSource for MemorySource {
    fn read(&self, options: &ReadOptions, emit: &Emit) -> Result<()> {
        self.features
            .par_iter()
            .filter(|f| !options.skips(f.feature_type()))
            .try_for_each(|f| {
                if options.skip_tags {
                    emit(&f.without_tags(), current_worker())
                } else {
                    emit(f, current_worker())
                }
            })
    }
}

impl LocationsById for MemorySource {
    fn find_location_by_id(&self, id: &FeatureId) -> Option<LatLng> {
        self.features.iter().find_map(|f| match f {
            Feature::Point(p) if &p.id == id => Some(p.location),
            _ => None,
        })
    }
}
