//! Builds a blob from a `FeatureSource` in a fixed number of passes over the
//! source, without holding the encoded features in memory.
//!
//! 1. Summary: strings, namespaces, counts and reverse relationships.
//! 2. Points: a scratch map of every point with the paths and relations
//!    referencing it, combined into the point blocks.
//! 3. Features: paths, areas and relations, with point locations resolved
//!    from the scratch map over a base world.
//! 4. Index: every written feature is tokenized, and the posting lists are
//!    written into one search index block.
//!
//! Every map is written in two phases that run the same emission logic:
//! first all entries are reserved, then written.

mod features;
mod index;
mod points;
mod summary;

pub use self::features::{DefaultValidity, Validity};
pub use self::summary::{Counts, Relationships, Summary};

use crate::blob::{
    write_proto, write_string, BlockHeader, BlockType, CompactHeaderProto, FeatureBlockHeader,
    Header, BLOCK_HEADER_LEN, FEATURE_BLOCK_HEADER_LEN, HEADER_LEN, MAGIC, VERSION,
};
use crate::error::{Context, Error, Result};
use crate::ids::{
    FeatureId, FeatureType, NamespaceCode, NamespaceTable, Namespaces, PrimaryNamespaces,
    TypeAndNamespace,
};
use crate::output::{FileOutput, MemoryOutput, Output, ReadWriteAt, WriteAt};
use crate::source::{FeatureSource, LocationsById, NoLocations, SourceTag};
use crate::strings::StringIndex;
use crate::tokens::{DefaultTokenizer, Tokenizer};
use crate::uint64map::{bucket_bits_for_count, Uint64MapBuilder};
use crate::values::{Reference, Tag, Value};
use crate::world::World;

use log::{info, warn};
use parking_lot::Mutex;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub struct BuildOptions {
    /// Number of worker threads.
    pub cores: usize,
    /// Fail the build when a feature doesn't validate, instead of dropping it.
    pub fail_invalid_features: bool,
    pub primaries: PrimaryNamespaces,
    /// Directory for the point scratch file; in memory when unset.
    pub scratch_dir: Option<PathBuf>,
    pub tokenizer: Box<dyn Tokenizer>,
    pub validity: Box<dyn Validity>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            cores: std::thread::available_parallelism().map_or(1, |n| n.get()),
            fail_invalid_features: false,
            primaries: PrimaryNamespaces::default(),
            scratch_dir: None,
            tokenizer: Box::new(DefaultTokenizer),
            validity: Box::new(DefaultValidity),
        }
    }
}

impl fmt::Debug for BuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BuildOptions")
            .field("cores", &self.cores)
            .field("fail_invalid_features", &self.fail_invalid_features)
            .field("primaries", &self.primaries)
            .field("scratch_dir", &self.scratch_dir)
            .finish()
    }
}

/// What a build wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub points: u64,
    /// Points only referenced by paths or relations.
    pub referenced_points: u64,
    pub paths: u64,
    pub areas: u64,
    pub relations: u64,
    pub invalid_features: u64,
    /// Areas dropped because some of their paths never appeared.
    pub incomplete_areas: u64,
    pub tokens: u64,
    pub bytes: u64,
}

impl fmt::Display for BuildStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            r#"Features:
  points:       {} ({} only referenced)
  paths:        {}
  areas:        {}
  relations:    {}
Dropped:
  invalid:      {}
  incomplete:   {}
Index:
  tokens:       {}
  bytes:        {}"#,
            self.points,
            self.referenced_points,
            self.paths,
            self.areas,
            self.relations,
            self.invalid_features,
            self.incomplete_areas,
            self.tokens,
            self.bytes
        )
    }
}

/// The two phases every map is built in.
#[derive(Clone, Copy)]
pub(crate) enum Phase<'a> {
    Reserve,
    Write(&'a dyn ReadWriteAt),
}

/// A feature block under construction: block header, feature block header
/// and the map of features.
#[derive(Debug)]
pub(crate) struct FeatureBlockBuilder {
    header: FeatureBlockHeader,
    map: Uint64MapBuilder,
}

impl FeatureBlockBuilder {
    pub fn new(
        feature_type: FeatureType,
        code: NamespaceCode,
        primaries: Namespaces,
        count: u64,
        tag_bits: u8,
    ) -> Self {
        Self {
            header: FeatureBlockHeader {
                feature_type,
                namespaces: primaries.for_block(feature_type, code),
            },
            map: Uint64MapBuilder::new(bucket_bits_for_count(count), tag_bits),
        }
    }

    /// Namespaces the features of the block are encoded against.
    pub fn namespaces(&self) -> &Namespaces {
        &self.header.namespaces
    }

    pub fn put(&self, phase: Phase, key: u64, tag: u64, data: &[u8]) -> Result<()> {
        match phase {
            Phase::Reserve => {
                self.map.reserve(key, tag, data.len());
                Ok(())
            }
            Phase::Write(w) => self.map.write_item(w, key, tag, data),
        }
    }

    /// Writes the headers at `offset` and returns the offset after the block.
    pub fn write_header<W: WriteAt + ?Sized>(&mut self, w: &W, offset: u64) -> Result<u64> {
        let start = offset + BLOCK_HEADER_LEN as u64;
        w.write_at(&self.header.marshal(), start)?;
        let end = self
            .map
            .write_header(w, start + FEATURE_BLOCK_HEADER_LEN as u64)?;
        let header = BlockHeader {
            length: end - start,
            block_type: BlockType::Features,
        };
        w.write_at(&header.marshal(), offset)?;
        Ok(end)
    }

    pub fn canonicalize(&self, rw: &dyn ReadWriteAt) -> Result<()> {
        self.map.canonicalize(rw)
    }
}

/// Feature blocks by the type and namespace of their features.
pub(crate) type Blocks = BTreeMap<TypeAndNamespace, FeatureBlockBuilder>;

/// Writes the headers of all `blocks` one after another from `offset`.
pub(crate) fn write_block_headers(
    blocks: &mut Blocks,
    w: &dyn ReadWriteAt,
    mut offset: u64,
) -> Result<u64> {
    for block in blocks.values_mut() {
        offset = block.write_header(w, offset)?;
    }
    Ok(offset)
}

/// One encode buffer per worker.
pub(crate) struct Buffers(Vec<Mutex<Vec<u8>>>);

impl Buffers {
    pub fn new(workers: usize) -> Self {
        Self((0..workers.max(1)).map(|_| Mutex::new(Vec::new())).collect())
    }

    /// Runs `f` with the cleared buffer of `worker`.
    pub fn with<T>(&self, worker: usize, f: impl FnOnce(&mut Vec<u8>) -> T) -> T {
        let mut buffer = self.0[worker % self.0.len()].lock();
        buffer.clear();
        f(&mut buffer)
    }
}

/// Tags of a source feature as string table indices.
pub(crate) fn encode_tags(tags: &[SourceTag], strings: &StringIndex) -> Vec<Tag> {
    tags.iter()
        .map(|tag| Tag::new(strings.lookup(&tag.key), Value::Int(strings.lookup(&tag.value))))
        .collect()
}

fn thread_pool(cores: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(cores.max(1))
        .build()
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))
}

pub(crate) const SCRATCH_FILE: &str = "points.scratch";

/// Output of the points pass; a scratch file is removed when dropped, also
/// when the build fails.
struct ScratchOutput {
    output: Box<dyn Output>,
    path: Option<PathBuf>,
}

impl ScratchOutput {
    fn new(dir: Option<&Path>) -> Self {
        match dir {
            Some(dir) => {
                let path = dir.join(SCRATCH_FILE);
                Self {
                    output: Box::new(FileOutput::new(path.clone())),
                    path: Some(path),
                }
            }
            None => Self {
                output: Box::new(MemoryOutput::new()),
                path: None,
            },
        }
    }
}

impl Drop for ScratchOutput {
    fn drop(&mut self) {
        let path = match &self.path {
            Some(path) => path,
            None => return,
        };
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove scratch file {}: {}", path.display(), e),
        }
    }
}

/// Builds a blob of the features of `source` into `output`.
///
/// Point locations not found in `source` are looked up in `base`, which
/// allows building a blob of changes on top of an existing world.
pub fn build(
    source: &dyn FeatureSource,
    base: &dyn LocationsById,
    options: &BuildOptions,
    output: &dyn Output,
) -> Result<BuildStats> {
    let pool = thread_pool(options.cores)?;
    pool.install(|| build_with_pool(source, base, options, output))
}

fn build_with_pool(
    source: &dyn FeatureSource,
    base: &dyn LocationsById,
    options: &BuildOptions,
    output: &dyn Output,
) -> Result<BuildStats> {
    let start = Instant::now();
    let workers = rayon::current_num_threads();
    let w = output.write().during("opening output")?;

    let mut summary = Summary::collect(source, workers)?;
    info!("Summary took {:.1}s", start.elapsed().as_secs_f64());

    let mut table = NamespaceTable::new();
    table.fill_from_namespaces(
        summary
            .namespaces()
            .chain(options.primaries.iter())
            .cloned()
            .collect::<Vec<_>>(),
    );
    let nss = options.primaries.encode(&table);

    let version_offset = HEADER_LEN as u64;
    let header_proto_offset = write_string(&*w, VERSION, version_offset)?;
    let strings_offset = write_proto(
        &*w,
        &CompactHeaderProto::from_table(&table),
        header_proto_offset,
    )?;
    let (strings, block_offset) = std::mem::take(&mut summary.strings)
        .write(&*w, strings_offset)
        .during("writing strings")?;
    let header = Header {
        magic: MAGIC,
        version_offset,
        header_proto_offset,
        strings_offset,
        block_offset,
    };
    w.write_at(&header.marshal(), 0).during("writing header")?;

    let context = BuildContext {
        table: &table,
        nss,
        strings: &strings,
        summary: &summary,
        options,
        buffers: Buffers::new(workers),
    };
    let mut stats = BuildStats::default();

    let scratch = ScratchOutput::new(options.scratch_dir.as_deref());
    let mut offset = points::build_points(
        &context,
        source,
        &*scratch.output,
        &*w,
        block_offset,
        &mut stats,
    )?;
    info!("Points took {:.1}s", start.elapsed().as_secs_f64());

    {
        let scratch_blob = scratch.output.bytes().during("reading point scratch")?;
        let locations = points::ScratchLocations::new(&context, &scratch_blob, base)?;
        offset = features::build_features(&context, source, &locations, &*w, offset, &mut stats)?;
    }
    drop(scratch);
    info!("Features took {:.1}s", start.elapsed().as_secs_f64());

    offset = index::build_index(&context, output, base, &*w, offset, &mut stats)?;
    stats.bytes = offset;
    info!(
        "Built {} bytes in {:.1}s",
        offset,
        start.elapsed().as_secs_f64()
    );
    Ok(stats)
}

/// Builds `source` into memory and opens the result.
pub fn build_in_memory(source: &dyn FeatureSource, options: &BuildOptions) -> Result<World> {
    let output = MemoryOutput::new();
    build(source, &NoLocations, options, &output)?;
    World::from_blob(output.bytes()?)
}

/// Shared state of the passes after the summary.
pub(crate) struct BuildContext<'a> {
    pub table: &'a NamespaceTable,
    pub nss: Namespaces,
    pub strings: &'a StringIndex,
    pub summary: &'a Summary,
    pub options: &'a BuildOptions,
    pub buffers: Buffers,
}

impl<'a> BuildContext<'a> {
    pub fn tn(&self, id: &FeatureId) -> TypeAndNamespace {
        self.table
            .encode_type_and_namespace(id.feature_type, &id.namespace)
    }

    pub fn reference(&self, id: &FeatureId) -> Reference {
        Reference::new(self.tn(id), id.value)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::signed_area;
    use crate::ids::{FeatureType, NAMESPACE_PRIVATE};
    use crate::source::{
        AreaFeature, Feature, MemorySource, PathFeature, PointFeature, RelationFeature,
        SourceMember, SourcePolygon, SourceVertex,
    };
    use crate::values::LatLng;

    fn ll(lat: f64, lng: f64) -> LatLng {
        LatLng::from_degrees(lat, lng)
    }

    fn point(id: u64, location: LatLng) -> Feature {
        Feature::Point(PointFeature {
            id: FeatureId::osm_node(id),
            location,
            tags: vec![],
        })
    }

    fn path(id: u64, vertices: Vec<SourceVertex>) -> Feature {
        Feature::Path(PathFeature {
            id: FeatureId::osm_way_path(id),
            tags: vec![SourceTag::new("#highway", "footway")],
            vertices,
        })
    }

    fn nodes(ids: &[u64]) -> Vec<SourceVertex> {
        ids.iter()
            .map(|&id| SourceVertex::Point(FeatureId::osm_node(id)))
            .collect()
    }

    fn area(id: u64, polygons: Vec<SourcePolygon>) -> Feature {
        Feature::Area(AreaFeature {
            id: FeatureId::osm_way_area(id),
            tags: vec![SourceTag::new("#leisure", "park")],
            polygons,
        })
    }

    fn options() -> BuildOptions {
        BuildOptions {
            cores: 2,
            ..Default::default()
        }
    }

    fn source() -> MemorySource {
        MemorySource::new(vec![
            point(1, ll(51.53, -0.12)),
            point(2, ll(51.53, -0.11)),
            point(3, ll(51.54, -0.11)),
            path(10, nodes(&[1, 2, 3, 1])),
            path(11, nodes(&[1, 2])),
            area(10, vec![SourcePolygon::Paths(vec![FeatureId::osm_way_path(10)])]),
            // open boundary
            area(11, vec![SourcePolygon::Paths(vec![FeatureId::osm_way_path(11)])]),
            // boundary never appears
            area(12, vec![SourcePolygon::Paths(vec![FeatureId::osm_way_path(12)])]),
            // one vertex
            path(13, vec![SourceVertex::LatLng(ll(51.53, -0.12))]),
        ])
    }

    #[test]
    fn test_stats() {
        let output = MemoryOutput::new();
        let stats = build(&source(), &NoLocations, &options(), &output).unwrap();
        assert_eq!(stats.points, 3);
        assert_eq!(stats.referenced_points, 0);
        assert_eq!(stats.paths, 2);
        assert_eq!(stats.areas, 1);
        assert_eq!(stats.relations, 0);
        assert_eq!(stats.invalid_features, 2);
        assert_eq!(stats.incomplete_areas, 1);
        assert!(stats.tokens > 0);
        assert_eq!(stats.bytes, output.len().unwrap());
    }

    #[test]
    fn test_invalid_features_are_dropped() {
        let world = build_in_memory(&source(), &options()).unwrap();
        assert!(world.has_feature(&FeatureId::osm_way_area(10)).unwrap());
        assert!(world.has_feature(&FeatureId::osm_way_path(11)).unwrap());
        for id in [
            FeatureId::osm_way_area(11),
            FeatureId::osm_way_area(12),
            FeatureId::osm_way_path(13),
        ] {
            assert!(!world.has_feature(&id).unwrap(), "{}", id);
        }
        assert_eq!(
            world.find_areas_by_path(&FeatureId::osm_way_path(10)).unwrap(),
            vec![FeatureId::osm_way_area(10)]
        );
    }

    #[test]
    fn test_fail_invalid_features() {
        let options = BuildOptions {
            fail_invalid_features: true,
            ..options()
        };
        match build(&source(), &NoLocations, &options, &MemoryOutput::new()) {
            Err(Error::InvalidFeatures(ids)) => assert_eq!(
                ids,
                vec![FeatureId::osm_way_path(13), FeatureId::osm_way_area(11)]
            ),
            r => panic!("expected invalid features, got {:?}", r),
        }
    }

    #[test]
    fn test_scratch_file_removed_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let options = BuildOptions {
            fail_invalid_features: true,
            scratch_dir: Some(dir.path().to_path_buf()),
            ..options()
        };
        let result = build(&source(), &NoLocations, &options, &MemoryOutput::new());
        assert!(matches!(result, Err(Error::InvalidFeatures(_))));
        assert!(!dir.path().join(SCRATCH_FILE).exists());
    }

    fn private(feature_type: FeatureType, value: u64) -> FeatureId {
        FeatureId::new(feature_type, NAMESPACE_PRIVATE.into(), value)
    }

    fn relation(id: FeatureId, members: &[(FeatureId, &str)]) -> Feature {
        Feature::Relation(RelationFeature {
            id,
            tags: vec![SourceTag::new("#type", "route")],
            members: members
                .iter()
                .map(|(id, role)| SourceMember {
                    id: id.clone(),
                    role: role.to_string(),
                })
                .collect(),
        })
    }

    #[test]
    fn test_mixed_namespaces() {
        let private_point = private(FeatureType::Point, 9);
        let private_path = private(FeatureType::Path, 7);
        let private_area = private(FeatureType::Area, 3);
        let inner = private(FeatureType::Relation, 6);
        let outer = private(FeatureType::Relation, 8);
        let triangle = vec![ll(51.53, -0.12), ll(51.53, -0.11), ll(51.54, -0.11)];
        let source = MemorySource::new(vec![
            point(1, ll(51.53, -0.12)),
            point(2, ll(51.53, -0.11)),
            Feature::Point(PointFeature {
                id: private_point.clone(),
                location: ll(51.54, -0.13),
                tags: vec![SourceTag::new("#amenity", "bench")],
            }),
            Feature::Path(PathFeature {
                id: FeatureId::osm_way_path(1),
                tags: vec![SourceTag::new("#highway", "a")],
                vertices: nodes(&[1, 2]),
            }),
            Feature::Path(PathFeature {
                id: private_path.clone(),
                tags: vec![SourceTag::new("#highway", "b")],
                vertices: vec![
                    SourceVertex::Point(FeatureId::osm_node(1)),
                    SourceVertex::Point(private_point.clone()),
                ],
            }),
            Feature::Area(AreaFeature {
                id: private_area.clone(),
                tags: vec![SourceTag::new("#leisure", "park")],
                polygons: vec![SourcePolygon::Loops(vec![triangle.clone()])],
            }),
            Feature::Area(AreaFeature {
                id: FeatureId::osm_relation_area(4),
                tags: vec![SourceTag::new("#leisure", "garden")],
                polygons: vec![SourcePolygon::Loops(vec![triangle])],
            }),
            relation(FeatureId::osm_relation(5), &[(private_path.clone(), "")]),
            relation(inner.clone(), &[(private_area.clone(), "park")]),
            relation(
                outer.clone(),
                &[(FeatureId::osm_relation(5), "a"), (inner.clone(), "b")],
            ),
        ]);
        let world = build_in_memory(&source, &options()).unwrap();

        for id in [
            FeatureId::osm_node(1),
            private_point.clone(),
            FeatureId::osm_way_path(1),
            private_path.clone(),
            private_area.clone(),
            FeatureId::osm_relation_area(4),
            FeatureId::osm_relation(5),
            inner.clone(),
            outer.clone(),
        ] {
            let feature = world.find_feature_by_id(&id).unwrap();
            assert_eq!(feature.map(|f| f.id), Some(id.clone()), "{}", id);
        }

        let search = |token: &str| world.search(token).unwrap().collect::<Vec<_>>();
        assert_eq!(search("highway=a"), vec![FeatureId::osm_way_path(1)]);
        assert_eq!(search("highway=b"), vec![private_path.clone()]);
        assert_eq!(search("amenity=bench"), vec![private_point.clone()]);
        assert_eq!(search("leisure=garden"), vec![FeatureId::osm_relation_area(4)]);

        assert_eq!(
            world.find_location_by_id(&private_point).unwrap(),
            Some(ll(51.54, -0.13))
        );
        let mut paths = world.find_paths_by_point(&FeatureId::osm_node(1)).unwrap();
        paths.sort();
        let mut expected = vec![FeatureId::osm_way_path(1), private_path.clone()];
        expected.sort();
        assert_eq!(paths, expected);
        assert_eq!(
            world.find_paths_by_point(&private_point).unwrap(),
            vec![private_path.clone()]
        );
        assert_eq!(
            world.polyline(&private_path).unwrap(),
            Some(vec![ll(51.53, -0.12), ll(51.54, -0.13)])
        );
        assert_eq!(world.polygons(&private_area).unwrap().map(|p| p.len()), Some(1));

        assert_eq!(
            world.find_relations_by_feature(&private_path).unwrap(),
            vec![FeatureId::osm_relation(5)]
        );
        assert_eq!(
            world.find_relations_by_feature(&private_area).unwrap(),
            vec![inner.clone()]
        );
        assert_eq!(
            world.find_relations_by_feature(&inner).unwrap(),
            vec![outer.clone()]
        );
        assert_eq!(
            world.find_relations_by_feature(&FeatureId::osm_relation(5)).unwrap(),
            vec![outer.clone()]
        );
        let members = world
            .find_feature_by_id(&outer)
            .unwrap()
            .unwrap()
            .members()
            .unwrap()
            .into_iter()
            .map(|(id, role)| (id, role.to_string()))
            .collect::<Vec<_>>();
        assert_eq!(
            members,
            vec![
                (FeatureId::osm_relation(5), "a".to_string()),
                (inner, "b".to_string())
            ]
        );
    }

    #[test]
    fn test_loops_are_oriented() {
        let clockwise = vec![ll(51.53, -0.12), ll(51.54, -0.11), ll(51.53, -0.11)];
        let source = MemorySource::new(vec![
            area(1, vec![SourcePolygon::Loops(vec![clockwise.clone()])]),
            area(2, vec![SourcePolygon::Loops(vec![])]),
            area(3, vec![]),
        ]);
        let output = MemoryOutput::new();
        let stats = build(&source, &NoLocations, &options(), &output).unwrap();
        assert_eq!(stats.areas, 1);
        assert_eq!(stats.invalid_features, 2);

        let world = World::from_blob(output.bytes().unwrap()).unwrap();
        let polygons = world
            .polygons(&FeatureId::osm_way_area(1))
            .unwrap()
            .unwrap();
        assert_eq!(polygons.len(), 1);
        assert!(signed_area(&polygons[0][0]) > 0.0);
        let mut expected = clockwise;
        expected.reverse();
        assert_eq!(polygons[0][0], expected);
    }

    #[test]
    fn test_points_only_referenced() {
        let source = MemorySource::new(vec![path(1, nodes(&[1, 2]))]);
        let base = MemorySource::new(vec![point(1, ll(51.53, -0.12)), point(2, ll(51.53, -0.11))]);
        let output = MemoryOutput::new();
        let stats = build(&source, &base, &options(), &output).unwrap();
        assert_eq!(stats.points, 0);
        assert_eq!(stats.referenced_points, 2);
        assert_eq!(stats.paths, 1);

        let world = World::from_blob(output.bytes().unwrap()).unwrap();
        let stub = world
            .find_feature_by_id(&FeatureId::osm_node(1))
            .unwrap()
            .unwrap();
        assert!(stub.is_references_only());
        assert_eq!(stub.feature_type(), FeatureType::Point);
        assert_eq!(stub.paths().unwrap(), vec![FeatureId::osm_way_path(1)]);
        // located through the base only
        assert_eq!(world.polyline(&FeatureId::osm_way_path(1)).unwrap(), None);
    }

    #[test]
    fn test_empty_source() {
        let world = build_in_memory(&MemorySource::default(), &options()).unwrap();
        assert!(world.tokens().unwrap().is_empty());
        assert_eq!(world.search("*").unwrap().count(), 0);
    }
}
