//! Compact store of geospatial features, read in place from memory mapped
//! blobs: lookup by id, reverse references and token search.

mod arrays;
mod blob;
mod build;
mod error;
mod features;
mod geometry;
mod ids;
mod osm;
mod output;
mod parallel;
mod posting;
mod source;
mod strings;
mod tiles;
mod tokens;
mod uint64map;
mod values;
mod varint;
mod world;

pub use crate::blob::{Header, MAGIC, VERSION};
pub use crate::build::{
    build, build_in_memory, BuildOptions, BuildStats, Counts, DefaultValidity, Relationships,
    Summary, Validity,
};
pub use crate::error::{Context, Error, Result};
pub use crate::features::DecodedFeature;
pub use crate::geometry::{is_clockwise, signed_area};
pub use crate::ids::{
    compare, FeatureId, FeatureType, Namespace, PrimaryNamespaces, NAMESPACE_OSM_NODE,
    NAMESPACE_OSM_RELATION, NAMESPACE_OSM_WAY, NAMESPACE_PRIVATE,
};
pub use crate::osm::{
    OsmElementType, OsmMember, OsmNode, OsmRelation, OsmSource, OsmWay, IDENTIFIER_KEYS,
    SEARCHABLE_KEYS,
};
pub use crate::output::{Blob, FileOutput, MemoryOutput, Output};
pub use crate::parallel::parallel_process;
pub use crate::posting::{PostingIterator, PostingKey};
pub use crate::source::{
    AreaFeature, Emit, Feature, FeatureSource, LocationsById, MemorySource, NoLocations,
    PathFeature, PointFeature, ReadOptions, RelationFeature, SourceMember, SourcePolygon,
    SourceTag, SourceVertex,
};
pub use crate::tiles::{Bounds, Tile};
pub use crate::tokens::{DefaultTokenizer, TokenFeature, Tokenizer, ALL_TOKEN};
pub use crate::values::LatLng;
pub use crate::world::{
    FeaturesById, Geometry, PathVertex, Polygon, StoredFeature, StoredPolygon, World,
};
